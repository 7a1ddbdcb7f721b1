use std::path::Path;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command, crate_version};
use log::{LevelFilter, error};

use passfs::fs;
use passfs::{FsConfig, PassthroughFs};

fn main() -> ExitCode {
    let matches = Command::new("passfs")
        .version(crate_version!())
        .about("Mirror a host directory tree through a FUSE mount")
        .arg(
            Arg::new("mount-point")
                .required(true)
                .index(1)
                .help("Where to mount the passthrough view"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .action(ArgAction::Append)
                .value_name("OPT[,OPT...]")
                .help("Mount options (source=, cache=, writeback, flock, xattr, shared, norace, timeout=, readdirplus; anything else is passed to the mount)"),
        )
        .arg(
            Arg::new("singlethread")
                .long("singlethread")
                .action(ArgAction::SetTrue)
                .help("Serve requests on a single worker thread"),
        )
        .arg(
            Arg::new("auto-unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount when the process exits"),
        )
        .arg(
            Arg::new("allow-other")
                .long("allow-other")
                .action(ArgAction::SetTrue)
                .help("Allow other users to access the mount"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        )
        .get_matches();

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder().filter_level(log_level).init();

    let opts = matches
        .get_many::<String>("options")
        .map(|values| values.cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let cfg = match FsConfig::parse_opts(&opts) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let filesystem = match PassthroughFs::new(cfg) {
        Ok(filesystem) => filesystem,
        Err(err) => {
            error!("failed to set up passthrough over the source root: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mountpoint = matches.get_one::<String>("mount-point").unwrap();
    match fs::mount(
        filesystem,
        Path::new(mountpoint),
        matches.get_flag("singlethread"),
        matches.get_flag("auto-unmount"),
        matches.get_flag("allow-other"),
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
