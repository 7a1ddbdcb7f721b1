//! End-to-end scenarios against the operation layer, each starting from a
//! fresh source tree. No kernel mount is involved: the tests drive the same
//! internal surface the FUSE glue calls into.

use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use fuser::FileType;
use passfs::fs::SetattrRequest;
use passfs::{Caller, FsConfig, Inode, PassthroughFs};

fn fs_over(source: &std::path::Path) -> PassthroughFs {
    let cfg = FsConfig {
        source: source.to_path_buf(),
        ..FsConfig::default()
    };
    PassthroughFs::new(cfg).unwrap()
}

fn lookup(fs: &PassthroughFs, parent: &Inode, name: &str) -> Arc<Inode> {
    let entry = fs.do_lookup(parent, OsStr::new(name)).unwrap();
    fs.table().get(entry.attr.ino.0).unwrap()
}

#[test]
fn stat_then_read_matches_host_bytes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"hello").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();

    let entry = fs.do_lookup(&root, OsStr::new("a")).unwrap();
    assert_eq!(entry.attr.size, 5);
    assert_eq!(entry.attr.kind, FileType::RegularFile);

    let inode = fs.table().get(entry.attr.ino.0).unwrap();
    let (attr, _) = fs.do_getattr(&inode).unwrap();
    assert_eq!(attr.size, 5);

    let fh = fs.do_open(&inode, libc::O_RDONLY).unwrap();
    assert_eq!(fs.do_read(fh, 0, 5).unwrap(), b"hello");
    fs.do_release(fh).unwrap();
}

#[test]
fn create_write_read_equals_direct_host_read() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let caller = Caller::current();

    let (entry, fh) = fs
        .do_create(caller, &root, OsStr::new("new"), 0o644, libc::O_RDWR)
        .unwrap();
    let inode = fs.table().get(entry.attr.ino.0).unwrap();
    let payload = b"The quick brown fox".repeat(100);
    assert_eq!(
        fs.do_write(&inode, fh, 0, &payload).unwrap(),
        payload.len() as u32
    );
    fs.do_fsync(&inode, Some(fh), false).unwrap();
    assert_eq!(fs.do_read(fh, 0, payload.len() as u32).unwrap(), payload);
    fs.do_flush(fh).unwrap();
    fs.do_release(fh).unwrap();

    assert_eq!(std::fs::read(dir.path().join("new")).unwrap(), payload);
    let meta = std::fs::metadata(dir.path().join("new")).unwrap();
    assert_eq!(meta.uid(), caller.uid);
    assert_eq!(meta.gid(), caller.gid);
}

#[test]
fn hardlink_shares_the_inode_and_takes_a_reference() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"x").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();

    let a = lookup(&fs, &root, "a");
    assert_eq!(a.refcount(), 1);

    let entry = fs.do_link(&a, &root, OsStr::new("b")).unwrap();
    assert_eq!(entry.attr.ino.0, a.handle, "link replies the same inode");
    assert_eq!(a.refcount(), 2);
    assert_eq!(entry.attr.nlink, 2);

    // The new name resolves to the same canonical inode.
    let b = lookup(&fs, &root, "b");
    assert_eq!(b.handle, a.handle);
    assert_eq!(a.refcount(), 3);

    fs.do_forget(a.handle, 3);
    drop((a, b));
    assert_eq!(fs.table().live_inodes(), 0);
}

#[test]
fn symlink_readlink_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();

    let entry = fs
        .do_make_node(
            Caller::current(),
            &root,
            OsStr::new("s"),
            libc::S_IFLNK,
            0,
            Some(std::path::Path::new("some/where/else")),
        )
        .unwrap();
    assert_eq!(entry.attr.kind, FileType::Symlink);
    let inode = fs.table().get(entry.attr.ino.0).unwrap();
    assert_eq!(fs.do_readlink(&inode).unwrap(), b"some/where/else");
}

#[test]
fn truncate_and_chmod_through_setattr() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"0123456789").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let inode = lookup(&fs, &root, "a");

    let (attr, _) = fs
        .do_setattr(
            &inode,
            SetattrRequest {
                size: Some(4),
                mode: Some(0o600),
                ..SetattrRequest::default()
            },
        )
        .unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(attr.perm, 0o600);
    assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"0123");
}

#[test]
fn copy_file_range_copies_between_opens() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("src"), b"abcdefgh").unwrap();
    std::fs::write(dir.path().join("dst"), b"").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();

    let src = lookup(&fs, &root, "src");
    let dst = lookup(&fs, &root, "dst");
    let fh_in = fs.do_open(&src, libc::O_RDONLY).unwrap();
    let fh_out = fs.do_open(&dst, libc::O_RDWR).unwrap();

    let copied = fs
        .do_copy_file_range(fh_in, 2, &dst, fh_out, 0, 4)
        .unwrap();
    assert_eq!(copied, 4);
    assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"cdef");

    fs.do_release(fh_in).unwrap();
    fs.do_release(fh_out).unwrap();
}

#[test]
fn release_invalidates_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"x").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let inode = lookup(&fs, &root, "a");

    let fh = fs.do_open(&inode, libc::O_RDONLY).unwrap();
    fs.do_release(fh).unwrap();
    assert!(fs.do_release(fh).is_err());
    assert!(fs.do_read(fh, 0, 1).is_err());
}

#[test]
fn rmdir_requires_empty_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("d")).unwrap();
    std::fs::write(dir.path().join("d").join("f"), b"").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();

    assert!(fs.do_unlink(&root, OsStr::new("d"), true).is_err());
    let d = lookup(&fs, &root, "d");
    fs.do_unlink(&d, OsStr::new("f"), false).unwrap();
    fs.do_unlink(&root, OsStr::new("d"), true).unwrap();
    assert!(!dir.path().join("d").exists());
}

#[test]
fn statfs_reports_the_underlying_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let vfs = fs.do_statfs(&root).unwrap();
    assert!(vfs.f_bsize > 0);
    assert!(vfs.f_namemax > 0);
}

#[test]
fn flock_on_open_handles() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"x").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let inode = lookup(&fs, &root, "a");

    let fh = fs.do_open(&inode, libc::O_RDWR).unwrap();
    fs.do_flock(fh, libc::F_WRLCK, false).unwrap();

    // A second open of the same file cannot take the exclusive lock
    // without blocking.
    let fh2 = fs.do_open(&inode, libc::O_RDWR).unwrap();
    assert!(fs.do_flock(fh2, libc::F_WRLCK, false).is_err());

    fs.do_flock(fh, libc::F_UNLCK, false).unwrap();
    fs.do_flock(fh2, libc::F_WRLCK, false).unwrap();
    fs.do_flock(fh2, libc::F_UNLCK, false).unwrap();
    fs.do_release(fh).unwrap();
    fs.do_release(fh2).unwrap();
}

#[test]
fn write_only_opens_are_serviced() {
    // The server promotes O_WRONLY to O_RDWR for the kernel's mmap path and
    // falls back to the plain open when the promotion is refused.
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"....").unwrap();
    let fs = fs_over(dir.path());
    let root = fs.root();
    let inode = lookup(&fs, &root, "a");

    let fh = fs.do_open(&inode, libc::O_WRONLY).unwrap();
    assert_eq!(fs.do_write(&inode, fh, 0, b"done").unwrap(), 4);
    fs.do_release(fh).unwrap();
    assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"done");
}
