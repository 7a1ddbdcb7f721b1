//! Per-open directory streams.
//!
//! Each `opendir` gets its own kernel directory stream (`fdopendir` over a
//! fresh `O_RDONLY` descriptor opened relative to the inode's anchor). The
//! stream keeps the entry it has read but not yet emitted, so that an entry
//! which did not fit into a reply buffer is offered again on the next
//! `readdir` call, and tracks the continuation offset the client saw last:
//! a mismatching client offset means the client rewound or skipped and the
//! stream seeks before producing anything.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;

/// One directory entry as read from the host, carrying the host inode
/// number, the `d_type` byte and the offset at which the stream continues
/// after this entry.
#[derive(Clone)]
pub struct HostDirent {
    pub ino: u64,
    pub next_offset: i64,
    pub dtype: u8,
    pub name: CString,
}

impl HostDirent {
    pub fn is_dot(&self) -> bool {
        let name = self.name.to_bytes();
        name == b"." || name == b".."
    }
}

/// Offset-seekable iterator over one open directory.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    pending: Option<HostDirent>,
    offset: i64,
}

// The DIR handle is confined to whoever holds the stream's lock; libc does
// not share it behind our back.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Opens a stream over the directory anchored by `anchor_fd`.
    pub fn open(anchor_fd: RawFd) -> io::Result<DirStream> {
        let fd = unsafe {
            libc::openat(
                anchor_fd,
                c".".as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let dir = unsafe { libc::fdopendir(fd) };
        let Some(dir) = NonNull::new(dir) else {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        };
        Ok(DirStream {
            dir,
            pending: None,
            offset: 0,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    /// Repositions the stream when the client's continuation offset does
    /// not match ours, dropping the cached entry.
    pub fn seek(&mut self, offset: i64) {
        if offset != self.offset {
            unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) };
            self.pending = None;
            self.offset = offset;
        }
    }

    /// Returns the next entry without committing to it. Repeated calls
    /// return the same entry until [`DirStream::consume`] is called.
    /// `Ok(None)` is end of stream.
    pub fn peek(&mut self) -> io::Result<Option<&HostDirent>> {
        if self.pending.is_none() {
            unsafe { *libc::__errno_location() = 0 };
            let entry = unsafe { libc::readdir64(self.dir.as_ptr()) };
            if entry.is_null() {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) | None => Ok(None),
                    Some(_) => Err(err),
                };
            }
            let entry = unsafe { &*entry };
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) }.to_owned();
            self.pending = Some(HostDirent {
                ino: entry.d_ino,
                next_offset: entry.d_off,
                dtype: entry.d_type,
                name,
            });
        }
        Ok(self.pending.as_ref())
    }

    /// Commits the cached entry: the stream's continuation offset advances
    /// past it.
    pub fn consume(&mut self) {
        if let Some(entry) = self.pending.take() {
            self.offset = entry.next_offset;
        }
    }

    /// The offset a client would pass to continue after everything
    /// consumed so far.
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn open_path_fd(path: &Path) -> RawFd {
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        assert!(fd >= 0);
        fd
    }

    fn names(stream: &mut DirStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(entry) = stream.peek().unwrap() {
            out.push(entry.name.to_str().unwrap().to_owned());
            stream.consume();
        }
        out
    }

    #[test]
    fn enumerates_every_entry_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = BTreeSet::new();
        for i in 0..100 {
            let name = format!("f{i:03}");
            std::fs::write(dir.path().join(&name), b"").unwrap();
            expected.insert(name);
        }
        let fd = open_path_fd(dir.path());
        let mut stream = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };

        let listed: Vec<_> = names(&mut stream)
            .into_iter()
            .filter(|n| n != "." && n != "..")
            .collect();
        assert_eq!(listed.len(), expected.len());
        assert_eq!(listed.into_iter().collect::<BTreeSet<_>>(), expected);
    }

    #[test]
    fn peek_is_stable_until_consumed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only"), b"").unwrap();
        let fd = open_path_fd(dir.path());
        let mut stream = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };

        let first = stream.peek().unwrap().unwrap().name.clone();
        let second = stream.peek().unwrap().unwrap().name.clone();
        assert_eq!(first, second);
        stream.consume();
        let third = stream.peek().unwrap().unwrap().name.clone();
        assert_ne!(first, third);
    }

    #[test]
    fn resumes_from_reported_offsets() {
        // Walk the directory two entries at a time through a fresh seek each
        // round, the way a client replays `nextoff` continuations.
        let dir = tempfile::tempdir().unwrap();
        let mut expected = BTreeSet::new();
        for i in 0..37 {
            let name = format!("e{i:02}");
            std::fs::write(dir.path().join(&name), b"").unwrap();
            expected.insert(name);
        }
        let fd = open_path_fd(dir.path());
        let mut stream = DirStream::open(fd).unwrap();
        unsafe { libc::close(fd) };

        let mut seen = Vec::new();
        let mut offset = 0i64;
        loop {
            stream.seek(offset);
            let mut took = 0;
            while took < 2 {
                match stream.peek().unwrap() {
                    Some(entry) => {
                        seen.push(entry.name.to_str().unwrap().to_owned());
                        stream.consume();
                        took += 1;
                    }
                    None => break,
                }
            }
            if took == 0 {
                break;
            }
            offset = stream.offset();
        }
        let seen: BTreeSet<_> = seen.into_iter().filter(|n| n != "." && n != "..").collect();
        assert_eq!(seen, expected);
    }
}
