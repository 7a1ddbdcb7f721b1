//! Parent-and-name recovery.
//!
//! A few host syscalls have no variant that can operate on an `O_PATH`
//! anchor: changing a symlink's timestamps, or hardlinking a symlink
//! without `AT_EMPTY_PATH` privileges. For those the caller needs a real
//! `(parent fd, leaf name)` pair. We recover one by reading the anchor's
//! `/proc/self/fd` symlink and re-verifying that the leaf still names the
//! same host object, retrying a couple of times when a concurrent rename
//! moved the tree underneath us. Once the retries run out the operation
//! surfaces `EIO`; under a permanent rename loop that is the intended
//! outcome.

use std::ffi::CString;
use std::sync::Arc;

use fuser::Errno;

use crate::inode::{Inode, InodeKey, InodeTable};

const RETRIES: u32 = 2;

/// Recovers a `(parent, leaf)` pair for `inode` such that
/// `openat(parent.fd, leaf)` names it with high probability.
///
/// On success the caller owns one reference on the returned parent and must
/// release it through [`InodeTable::unref`] when done.
pub fn parent_and_name(
    table: &InodeTable,
    inode: &Inode,
) -> Result<(Arc<Inode>, CString), Errno> {
    let link = CString::new(format!("/proc/self/fd/{}", inode.raw_fd())).unwrap();
    let mut buf = [0u8; libc::PATH_MAX as usize + 1];

    for attempt in 0..=RETRIES {
        let n = unsafe {
            libc::readlink(
                link.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 || n as usize >= buf.len() {
            log::warn!("resolver: readlink on fd {} failed", inode.raw_fd());
            return Err(Errno::EIO);
        }
        let path = &buf[..n as usize];
        let Some(slash) = path.iter().rposition(|&b| b == b'/') else {
            return Err(Errno::EIO);
        };

        // An entry directly under "/" has an empty dirname; stat "/" then.
        let parent_path = if slash == 0 { &path[..1] } else { &path[..slash] };
        let leaf = &path[slash + 1..];
        let parent_c = CString::new(parent_path).map_err(|_| Errno::EIO)?;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::stat(parent_c.as_ptr(), &mut st) } < 0 {
            if attempt < RETRIES {
                continue;
            }
            return Err(Errno::EIO);
        }
        let Some(parent) = table.find(InodeKey::from_stat(&st)) else {
            if attempt < RETRIES {
                continue;
            }
            return Err(Errno::EIO);
        };

        // Verify the leaf still names our inode; the tree may have moved.
        let leaf_c = CString::new(leaf).map_err(|_| Errno::EIO)?;
        let mut leaf_st: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::fstatat(
                parent.raw_fd(),
                leaf_c.as_ptr(),
                &mut leaf_st,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 || InodeKey::from_stat(&leaf_st) != inode.key {
            table.unref(&parent, 1);
            if attempt < RETRIES {
                continue;
            }
            return Err(Errno::EIO);
        }
        return Ok((parent, leaf_c));
    }
    Err(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeCandidate;
    use std::ffi::CString;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn open_path_fd(path: &Path) -> OwnedFd {
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        assert!(fd >= 0);
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    fn stat_nofollow(path: &Path) -> libc::stat {
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::lstat(cpath.as_ptr(), &mut st) }, 0);
        st
    }

    #[test]
    fn recovers_parent_and_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::os::unix::fs::symlink("target", sub.join("s")).unwrap();

        let root_st = stat_nofollow(dir.path());
        let table = InodeTable::new(
            open_path_fd(dir.path()),
            InodeKey::from_stat(&root_st),
            None,
        );
        let sub_st = stat_nofollow(&sub);
        let (parent, _) = table.intern(InodeCandidate {
            key: InodeKey::from_stat(&sub_st),
            fd: open_path_fd(&sub),
            is_symlink: false,
            shared: None,
        });
        let link_st = stat_nofollow(&sub.join("s"));
        let (link, _) = table.intern(InodeCandidate {
            key: InodeKey::from_stat(&link_st),
            fd: open_path_fd(&sub.join("s")),
            is_symlink: true,
            shared: None,
        });

        let before = parent.refcount();
        let (found_parent, leaf) = parent_and_name(&table, &link).unwrap();
        assert!(Arc::ptr_eq(&found_parent, &parent));
        assert_eq!(leaf.to_bytes(), b"s");
        assert_eq!(parent.refcount(), before + 1);
        table.unref(&found_parent, 1);
        assert_eq!(parent.refcount(), before);
    }

    #[test]
    fn unknown_parent_is_eio() {
        // The symlink's parent directory was never looked up, so the table
        // cannot canonicalize it and the resolver gives up.
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::os::unix::fs::symlink("target", sub.join("s")).unwrap();

        let root_st = stat_nofollow(dir.path());
        let table = InodeTable::new(
            open_path_fd(dir.path()),
            InodeKey::from_stat(&root_st),
            None,
        );
        let link_st = stat_nofollow(&sub.join("s"));
        let (link, _) = table.intern(InodeCandidate {
            key: InodeKey::from_stat(&link_st),
            fd: open_path_fd(&sub.join("s")),
            is_symlink: true,
            shared: None,
        });

        assert!(matches!(
            parent_and_name(&table, &link).err(),
            Some(e) if e.code() == Errno::EIO.code()
        ));
    }
}
