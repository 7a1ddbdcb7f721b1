//! Mount-time configuration.
//!
//! Options arrive libfuse-style as `-o name` / `-o name=value` lists. The
//! ones this server understands are parsed into [`FsConfig`]; anything else
//! is passed through to the transport untouched so that plain mount options
//! like `noatime` keep working.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry;

/// Kernel cache policy for file data and attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Bypass the page cache entirely (direct I/O).
    None,
    /// Let the kernel cache, invalidating on changed attributes.
    Auto,
    /// Cache aggressively; suitable for a source nothing else touches.
    Always,
}

#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Host directory tree to mirror.
    pub source: PathBuf,
    /// Ask the kernel for writeback caching.
    pub writeback: bool,
    /// Advertise BSD flock support.
    pub flock: bool,
    /// Serve extended attribute operations.
    pub xattr: bool,
    /// Participate in the shared inode version registry.
    pub shared: bool,
    /// Refuse (EPERM) symlink operations that would need the racy
    /// parent-and-name recovery instead of attempting it.
    pub norace: bool,
    /// Explicit readdirplus override; `None` means "decide from cache mode
    /// and shared mode".
    pub readdirplus: Option<bool>,
    /// Attribute/entry timeout override in seconds.
    pub timeout: Option<f64>,
    pub cache: CacheMode,
    /// Registry socket address (overridable for tests).
    pub registry_socket: PathBuf,
    /// Shared version table path (overridable for tests).
    pub version_table: PathBuf,
    /// Unrecognized `-o` options, forwarded to the mount.
    pub passthrough_opts: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> FsConfig {
        FsConfig {
            source: PathBuf::from("/"),
            writeback: false,
            flock: false,
            xattr: false,
            shared: false,
            norace: false,
            readdirplus: None,
            timeout: None,
            cache: CacheMode::Auto,
            registry_socket: PathBuf::from(registry::REGISTRY_SOCKET),
            version_table: PathBuf::from(registry::VERSION_TABLE),
            passthrough_opts: Vec::new(),
        }
    }
}

impl FsConfig {
    /// Applies a list of comma-separated `-o` option strings.
    pub fn parse_opts<I, S>(opts: I) -> Result<FsConfig, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cfg = FsConfig::default();
        for group in opts {
            for opt in group.as_ref().split(',').filter(|s| !s.is_empty()) {
                cfg.apply(opt)?;
            }
        }
        Ok(cfg)
    }

    fn apply(&mut self, opt: &str) -> Result<(), String> {
        match opt {
            "writeback" => self.writeback = true,
            "no_writeback" => self.writeback = false,
            "flock" => self.flock = true,
            "no_flock" => self.flock = false,
            "xattr" => self.xattr = true,
            "no_xattr" => self.xattr = false,
            "shared" => self.shared = true,
            "no_shared" => self.shared = false,
            "norace" => self.norace = true,
            "readdirplus" => self.readdirplus = Some(true),
            "no_readdirplus" => self.readdirplus = Some(false),
            "cache=none" => self.cache = CacheMode::None,
            "cache=auto" => self.cache = CacheMode::Auto,
            "cache=always" => self.cache = CacheMode::Always,
            _ => {
                if let Some(path) = opt.strip_prefix("source=") {
                    self.source = PathBuf::from(path);
                } else if let Some(value) = opt.strip_prefix("timeout=") {
                    let secs: f64 = value
                        .parse()
                        .map_err(|_| format!("invalid timeout {value:?}"))?;
                    if !secs.is_finite() || secs < 0.0 {
                        return Err(format!("invalid timeout {value:?}"));
                    }
                    self.timeout = Some(secs);
                } else if let Some(mode) = opt.strip_prefix("cache=") {
                    return Err(format!("unknown cache mode {mode:?}"));
                } else {
                    self.passthrough_opts.push(opt.to_owned());
                }
            }
        }
        Ok(())
    }

    /// Entry/attribute cache timeout: the explicit override, or the cache
    /// mode's default (0s / 1s / 1 day).
    pub fn attr_timeout(&self) -> Duration {
        match self.timeout {
            Some(secs) => Duration::from_secs_f64(secs),
            None => match self.cache {
                CacheMode::None => Duration::ZERO,
                CacheMode::Auto => Duration::from_secs(1),
                CacheMode::Always => Duration::from_secs(86400),
            },
        }
    }

    /// Whether to advertise readdirplus. Shared mode always disables it
    /// (peer invalidations would bypass the entry cache it fills);
    /// otherwise an explicit option wins and `cache=none` defaults it off.
    pub fn readdirplus_enabled(&self) -> bool {
        if self.shared {
            return false;
        }
        self.readdirplus
            .unwrap_or(self.cache != CacheMode::None)
    }
}
