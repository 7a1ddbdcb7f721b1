//! The passthrough filesystem proper.
//!
//! [`PassthroughFs`] owns the inode table, the open-handle maps and the
//! optional registry client, and implements every operation as a thin
//! `fuser::Filesystem` method over an internal `do_*` layer. The internal
//! layer works in terms of [`Caller`] credentials and returns
//! `Result<_, Errno>`, which keeps it drivable from tests without a mounted
//! kernel on the other side.
//!
//! Handles given to the kernel:
//! - inode ids are the table's slab handles (root is `FUSE_ROOT_ID`),
//! - file handles index the `files` map (regular opens) or the `dirs` map
//!   (directory opens); the two spaces share one counter.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    BsdFileFlags, CopyFileRangeFlags, Errno, FileAttr, FileHandle, FileType, FopenFlags,
    Generation, INodeNo, InitFlags, KernelConfig, LockOwner, OpenFlags, RenameFlags,
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow, WriteFlags,
};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::config::{CacheMode, FsConfig};
use crate::cred::CredGuard;
use crate::dirstream::{DirStream, HostDirent};
use crate::inode::{Inode, InodeCandidate, InodeKey, InodeTable, ROOT_HANDLE};
use crate::registry::{RegistryClient, VersionTable};
use crate::resolver;

/// Credentials of the requesting client.
#[derive(Clone, Copy, Debug)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    /// The server's own identity; what a request from the mounting user
    /// looks like. Used by tests.
    pub fn current() -> Caller {
        Caller {
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }
}

impl From<&Request> for Caller {
    fn from(req: &Request) -> Caller {
        Caller {
            uid: req.uid(),
            gid: req.gid(),
        }
    }
}

/// A lookup result ready to be sent as an entry reply.
#[derive(Clone, Copy, Debug)]
pub struct EntryOut {
    pub attr: FileAttr,
    pub ttl: Duration,
}

/// Result of a getxattr/listxattr, mirroring the protocol's two-phase
/// size-then-data convention.
#[derive(Debug)]
pub enum XattrOut {
    Size(u32),
    Data(Vec<u8>),
}

/// Mutable attributes requested by a setattr, already decoded from the
/// protocol's validity mask.
#[derive(Default)]
pub struct SetattrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub fh: Option<u64>,
}

fn last_errno() -> Errno {
    Errno::from_i32(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

fn errno_of(err: &io::Error) -> Errno {
    Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO))
}

fn estale() -> Errno {
    Errno::from_i32(libc::ESTALE)
}

fn cstr(name: &OsStr) -> Result<CString, Errno> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Path form of an fd, used for syscalls that have no fd-relative variant.
fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).unwrap()
}

fn stat_fd(fd: RawFd) -> Result<libc::stat, Errno> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(last_errno());
    }
    Ok(st)
}

fn filetype_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn filetype_from_dtype(dtype: u8) -> FileType {
    match dtype {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

/// Attributes for the synthetic `.`/`..` readdirplus entries: zero inode,
/// directory mode, nothing the kernel would want to cache.
fn synthetic_dir_attr() -> FileAttr {
    FileAttr {
        ino: INodeNo(0),
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        flags: 0,
    }
}

fn attr_from_stat(st: &libc::stat, handle: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(handle),
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: systime(st.st_atime, st.st_atime_nsec),
        mtime: systime(st.st_mtime, st.st_mtime_nsec),
        ctime: systime(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: filetype_from_mode(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn timespec_of(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            },
            Err(before) => libc::timespec {
                tv_sec: -(before.duration().as_secs() as libc::time_t),
                tv_nsec: 0,
            },
        },
    }
}

/// The server. One instance per mount.
pub struct PassthroughFs {
    cfg: FsConfig,
    table: InodeTable,
    registry: Option<Arc<RegistryClient>>,
    files: Mutex<HashMap<u64, File>>,
    dirs: Mutex<HashMap<u64, Arc<Mutex<DirStream>>>>,
    next_fh: AtomicU64,
    // Set during capability negotiation.
    writeback: bool,
    flock_enabled: bool,
}

impl PassthroughFs {
    /// Opens the source root and seeds the inode table. With `shared` set,
    /// a missing version table is fatal while an unreachable registry
    /// socket only disables versioning.
    pub fn new(cfg: FsConfig) -> io::Result<PassthroughFs> {
        let registry = if cfg.shared {
            let table = VersionTable::map(&cfg.version_table)?;
            match RegistryClient::connect(&cfg.registry_socket, table) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(
                        "registry at {:?} unreachable ({err}), versioning disabled",
                        cfg.registry_socket
                    );
                    None
                }
            }
        } else {
            None
        };

        let source = CString::new(cfg.source.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe {
            libc::open(
                source.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let root_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let root_st = stat_fd(root_fd.as_raw_fd())
            .map_err(|_| io::Error::last_os_error())?;
        let root_key = InodeKey::from_stat(&root_st);
        let root_shared = registry.as_ref().and_then(|r| r.register(root_key));

        Ok(PassthroughFs {
            cfg,
            table: InodeTable::new(root_fd, root_key, root_shared),
            registry,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            writeback: false,
            flock_enabled: false,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.cfg
    }

    pub fn table(&self) -> &InodeTable {
        &self.table
    }

    pub fn root(&self) -> Arc<Inode> {
        self.table.root()
    }

    pub fn registry_connected(&self) -> bool {
        self.registry.is_some()
    }

    fn node(&self, ino: INodeNo) -> Result<Arc<Inode>, Errno> {
        self.table.get(ino.0).ok_or_else(estale)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn file_fd(&self, fh: u64) -> Result<RawFd, Errno> {
        self.files
            .lock()
            .get(&fh)
            .map(|f| f.as_raw_fd())
            .ok_or(Errno::EBADF)
    }

    fn dir_stream(&self, fh: u64) -> Result<Arc<Mutex<DirStream>>, Errno> {
        self.dirs.lock().get(&fh).cloned().ok_or(Errno::EBADF)
    }

    fn fopen_flags(&self) -> FopenFlags {
        match self.cfg.cache {
            CacheMode::None => FopenFlags::FOPEN_DIRECT_IO,
            CacheMode::Auto => FopenFlags::empty(),
            CacheMode::Always => FopenFlags::FOPEN_KEEP_CACHE,
        }
    }

    /// Identity key of the entry `name` under `parent`, without following
    /// symlinks. Used to bump versions of unlink/rename victims.
    fn entry_key(&self, parent: &Inode, name: &CString) -> Option<InodeKey> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::fstatat(
                parent.raw_fd(),
                name.as_ptr(),
                &mut st,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 {
            return None;
        }
        Some(InodeKey::from_stat(&st))
    }

    // ------------------------------------------------------------------
    // Internal operation layer
    // ------------------------------------------------------------------

    /// Resolves `name` under `parent` to a canonical inode, taking one
    /// lookup reference, and produces the entry reply parameters.
    pub fn do_lookup(&self, parent: &Inode, name: &OsStr) -> Result<EntryOut, Errno> {
        let name_c = cstr(name)?;
        let fd = unsafe {
            libc::openat(
                parent.raw_fd(),
                name_c.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_errno());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let st = stat_fd(fd.as_raw_fd())?;
        let key = InodeKey::from_stat(&st);

        let inode = match self.table.find(key) {
            Some(existing) => existing,
            None => {
                let shared = self.registry.as_ref().and_then(|r| r.register(key));
                let candidate = InodeCandidate {
                    key,
                    fd,
                    is_symlink: st.st_mode & libc::S_IFMT == libc::S_IFLNK,
                    shared,
                };
                // A lost race hands the candidate back; dropping it closes
                // its fd and returns its registry slot.
                let (inode, _lost) = self.table.intern(candidate);
                inode
            }
        };
        Ok(EntryOut {
            attr: attr_from_stat(&st, inode.handle),
            ttl: self.cfg.attr_timeout(),
        })
    }

    pub fn do_forget(&self, handle: u64, nlookup: u64) {
        if handle == ROOT_HANDLE {
            // The protocol never forgets the root.
            return;
        }
        if let Some(inode) = self.table.get(handle) {
            self.table.unref(&inode, nlookup);
        }
    }

    pub fn do_getattr(&self, inode: &Inode) -> Result<(FileAttr, Duration), Errno> {
        let st = stat_fd(inode.raw_fd())?;
        Ok((
            attr_from_stat(&st, inode.handle),
            self.cfg.attr_timeout(),
        ))
    }

    pub fn do_setattr(
        &self,
        inode: &Inode,
        req: SetattrRequest,
    ) -> Result<(FileAttr, Duration), Errno> {
        if let Some(mode) = req.mode {
            let rc = match req.fh {
                Some(fh) => unsafe { libc::fchmod(self.file_fd(fh)?, mode as libc::mode_t) },
                None => {
                    let path = proc_self_fd(inode.raw_fd());
                    unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) }
                }
            };
            if rc < 0 {
                return Err(last_errno());
            }
        }

        if req.uid.is_some() || req.gid.is_some() {
            let uid = req.uid.map_or(libc::uid_t::MAX, |u| u as libc::uid_t);
            let gid = req.gid.map_or(libc::gid_t::MAX, |g| g as libc::gid_t);
            let rc = unsafe {
                libc::fchownat(
                    inode.raw_fd(),
                    c"".as_ptr(),
                    uid,
                    gid,
                    libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if rc < 0 {
                return Err(last_errno());
            }
        }

        if let Some(size) = req.size {
            let rc = match req.fh {
                Some(fh) => unsafe { libc::ftruncate(self.file_fd(fh)?, size as libc::off_t) },
                None => {
                    let path = proc_self_fd(inode.raw_fd());
                    unsafe { libc::truncate(path.as_ptr(), size as libc::off_t) }
                }
            };
            if rc < 0 {
                return Err(last_errno());
            }
        }

        if req.atime.is_some() || req.mtime.is_some() {
            let times = [timespec_of(req.atime), timespec_of(req.mtime)];
            let rc = if let Some(fh) = req.fh {
                unsafe { libc::futimens(self.file_fd(fh)?, times.as_ptr()) }
            } else if !inode.is_symlink {
                let path = proc_self_fd(inode.raw_fd());
                unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) }
            } else if self.cfg.norace {
                // No race-free way to reach a symlink's timestamps.
                return Err(Errno::EPERM);
            } else {
                let (parent, name) = resolver::parent_and_name(&self.table, inode)?;
                let rc = unsafe {
                    libc::utimensat(
                        parent.raw_fd(),
                        name.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    )
                };
                self.table.unref(&parent, 1);
                rc
            };
            if rc < 0 {
                return Err(last_errno());
            }
        }

        inode.bump_version();
        self.do_getattr(inode)
    }

    pub fn do_readlink(&self, inode: &Inode) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let n = unsafe {
            libc::readlinkat(
                inode.raw_fd(),
                c"".as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(last_errno());
        }
        if n as usize == buf.len() {
            // An exactly-full buffer cannot be told apart from truncation.
            return Err(Errno::ENAMETOOLONG);
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// Shared create path for mknod, mkdir and symlink: host entry creation
    /// under the caller's credentials, then a regular lookup.
    pub fn do_make_node(
        &self,
        caller: Caller,
        parent: &Inode,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        link: Option<&Path>,
    ) -> Result<EntryOut, Errno> {
        let name_c = cstr(name)?;
        let guard = CredGuard::switch(caller.uid, caller.gid).map_err(|e| errno_of(&e))?;
        let rc = if mode & libc::S_IFMT == libc::S_IFDIR {
            unsafe { libc::mkdirat(parent.raw_fd(), name_c.as_ptr(), mode as libc::mode_t) }
        } else if let Some(link) = link {
            let link_c = cstr(link.as_os_str())?;
            unsafe { libc::symlinkat(link_c.as_ptr(), parent.raw_fd(), name_c.as_ptr()) }
        } else {
            unsafe {
                libc::mknodat(
                    parent.raw_fd(),
                    name_c.as_ptr(),
                    mode as libc::mode_t,
                    rdev as libc::dev_t,
                )
            }
        };
        let err = if rc < 0 { Some(last_errno()) } else { None };
        drop(guard);
        if let Some(err) = err {
            return Err(err);
        }
        parent.bump_version();
        self.do_lookup(parent, name)
    }

    pub fn do_link(
        &self,
        inode: &Arc<Inode>,
        newparent: &Inode,
        newname: &OsStr,
    ) -> Result<EntryOut, Errno> {
        let name_c = cstr(newname)?;
        let rc = if !inode.is_symlink {
            let path = proc_self_fd(inode.raw_fd());
            unsafe {
                libc::linkat(
                    libc::AT_FDCWD,
                    path.as_ptr(),
                    newparent.raw_fd(),
                    name_c.as_ptr(),
                    libc::AT_SYMLINK_FOLLOW,
                )
            }
        } else {
            // Empty-path linkat needs CAP_DAC_READ_SEARCH; fall back to the
            // resolver when the host refuses.
            let rc = unsafe {
                libc::linkat(
                    inode.raw_fd(),
                    c"".as_ptr(),
                    newparent.raw_fd(),
                    name_c.as_ptr(),
                    libc::AT_EMPTY_PATH,
                )
            };
            if rc < 0 {
                if self.cfg.norace {
                    return Err(Errno::EPERM);
                }
                let (src_parent, leaf) = resolver::parent_and_name(&self.table, inode)?;
                let rc = unsafe {
                    libc::linkat(
                        src_parent.raw_fd(),
                        leaf.as_ptr(),
                        newparent.raw_fd(),
                        name_c.as_ptr(),
                        0,
                    )
                };
                self.table.unref(&src_parent, 1);
                rc
            } else {
                rc
            }
        };
        if rc < 0 {
            return Err(last_errno());
        }

        let st = stat_fd(inode.raw_fd())?;
        // The new name is another lookup of the same inode.
        self.table.ref_inode(inode, 1);
        inode.bump_version();
        newparent.bump_version();
        Ok(EntryOut {
            attr: attr_from_stat(&st, inode.handle),
            ttl: self.cfg.attr_timeout(),
        })
    }

    pub fn do_unlink(&self, parent: &Inode, name: &OsStr, rmdir: bool) -> Result<(), Errno> {
        let name_c = cstr(name)?;
        // Take a transient reference on the victim so its version slot can
        // be bumped after the entry is gone.
        let child = self
            .entry_key(parent, &name_c)
            .and_then(|key| self.table.find(key));
        let flags = if rmdir { libc::AT_REMOVEDIR } else { 0 };
        let rc = unsafe { libc::unlinkat(parent.raw_fd(), name_c.as_ptr(), flags) };
        let result = if rc < 0 { Err(last_errno()) } else { Ok(()) };
        if result.is_ok() {
            parent.bump_version();
            if let Some(child) = &child {
                child.bump_version();
            }
        }
        if let Some(child) = child {
            self.table.unref(&child, 1);
        }
        result
    }

    pub fn do_rename(
        &self,
        parent: &Inode,
        name: &OsStr,
        newparent: &Inode,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        let name_c = cstr(name)?;
        let newname_c = cstr(newname)?;
        let source = self
            .entry_key(parent, &name_c)
            .and_then(|key| self.table.find(key));
        let target = self
            .entry_key(newparent, &newname_c)
            .and_then(|key| self.table.find(key));

        let rc = if flags != 0 {
            let rc = unsafe {
                libc::renameat2(
                    parent.raw_fd(),
                    name_c.as_ptr(),
                    newparent.raw_fd(),
                    newname_c.as_ptr(),
                    flags,
                )
            };
            if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOSYS) {
                // Kernel without renameat2: the flag semantics cannot be
                // emulated safely.
                for transient in [&source, &target] {
                    if let Some(inode) = transient {
                        self.table.unref(inode, 1);
                    }
                }
                return Err(Errno::EINVAL);
            }
            rc
        } else {
            unsafe {
                libc::renameat(
                    parent.raw_fd(),
                    name_c.as_ptr(),
                    newparent.raw_fd(),
                    newname_c.as_ptr(),
                )
            }
        };

        let result = if rc < 0 { Err(last_errno()) } else { Ok(()) };
        if result.is_ok() {
            parent.bump_version();
            newparent.bump_version();
            for moved in [&source, &target] {
                if let Some(inode) = moved {
                    inode.bump_version();
                }
            }
        }
        for transient in [source, target] {
            if let Some(inode) = transient {
                self.table.unref(&inode, 1);
            }
        }
        result
    }

    /// Open-flag adjustment: write-only opens are promoted to read-write so
    /// that the kernel's mmap write-back path can read, and with writeback
    /// caching the kernel emulates O_APPEND itself. Returns the adjusted
    /// flags and whether a promotion happened.
    fn adjust_open_flags(&self, flags: i32) -> (i32, bool) {
        let mut adj = self.unpromoted_flags(flags);
        let mut promoted = false;
        if adj & libc::O_ACCMODE == libc::O_WRONLY {
            adj = (adj & !libc::O_ACCMODE) | libc::O_RDWR;
            promoted = true;
        }
        (adj, promoted)
    }

    /// The client's own flags with only the transport-mandated edits.
    fn unpromoted_flags(&self, flags: i32) -> i32 {
        let mut adj = flags & !libc::O_NOFOLLOW;
        if self.writeback {
            adj &= !libc::O_APPEND;
        }
        adj
    }

    pub fn do_open(&self, inode: &Inode, flags: i32) -> Result<u64, Errno> {
        let (adj, promoted) = self.adjust_open_flags(flags);
        let path = proc_self_fd(inode.raw_fd());
        let mut fd = unsafe { libc::open(path.as_ptr(), adj) };
        if fd < 0 && promoted && io::Error::last_os_error().raw_os_error() == Some(libc::EACCES) {
            // Read permission may genuinely be missing; retry the open the
            // client actually asked for.
            fd = unsafe { libc::open(path.as_ptr(), self.unpromoted_flags(flags)) };
        }
        if fd < 0 {
            return Err(last_errno());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let fh = self.alloc_fh();
        self.files.lock().insert(fh, file);
        Ok(fh)
    }

    pub fn do_create(
        &self,
        caller: Caller,
        parent: &Inode,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(EntryOut, u64), Errno> {
        let name_c = cstr(name)?;
        let (adj, promoted) = self.adjust_open_flags(flags);
        let guard = CredGuard::switch(caller.uid, caller.gid).map_err(|e| errno_of(&e))?;
        let mut fd = unsafe {
            libc::openat(
                parent.raw_fd(),
                name_c.as_ptr(),
                (adj | libc::O_CREAT) & !libc::O_NOFOLLOW,
                mode as libc::mode_t,
            )
        };
        if fd < 0 && promoted && io::Error::last_os_error().raw_os_error() == Some(libc::EACCES) {
            fd = unsafe {
                libc::openat(
                    parent.raw_fd(),
                    name_c.as_ptr(),
                    self.unpromoted_flags(flags) | libc::O_CREAT,
                    mode as libc::mode_t,
                )
            };
        }
        let err = if fd < 0 { Some(last_errno()) } else { None };
        drop(guard);
        if let Some(err) = err {
            return Err(err);
        }
        let file = unsafe { File::from_raw_fd(fd) };

        parent.bump_version();
        let entry = self.do_lookup(parent, name)?;
        let fh = self.alloc_fh();
        self.files.lock().insert(fh, file);
        Ok((entry, fh))
    }

    pub fn do_read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let fd = self.file_fd(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut done = 0usize;
        while done < buf.len() {
            let n = unsafe {
                libc::pread(
                    fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset as i64) + done as i64,
                )
            };
            if n < 0 {
                if done == 0 {
                    return Err(last_errno());
                }
                break;
            }
            if n == 0 {
                break;
            }
            done += n as usize;
        }
        buf.truncate(done);
        Ok(buf)
    }

    pub fn do_write(
        &self,
        inode: &Inode,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, Errno> {
        let fd = self.file_fd(fh)?;
        let mut done = 0usize;
        while done < data.len() {
            let n = unsafe {
                libc::pwrite(
                    fd,
                    data[done..].as_ptr() as *const libc::c_void,
                    data.len() - done,
                    (offset as i64) + done as i64,
                )
            };
            if n < 0 {
                if done == 0 {
                    return Err(last_errno());
                }
                break;
            }
            done += n as usize;
        }
        if done > 0 {
            inode.bump_version();
        }
        Ok(done as u32)
    }

    /// Flush drains per-open state by closing a duplicate of the open's
    /// descriptor; the open itself stays valid.
    pub fn do_flush(&self, fh: u64) -> Result<(), Errno> {
        let fd = self.file_fd(fh)?;
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(last_errno());
        }
        if unsafe { libc::close(dup) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn do_fsync(&self, inode: &Inode, fh: Option<u64>, datasync: bool) -> Result<(), Errno> {
        let sync = |fd: RawFd| {
            let rc = if datasync {
                unsafe { libc::fdatasync(fd) }
            } else {
                unsafe { libc::fsync(fd) }
            };
            if rc < 0 { Err(last_errno()) } else { Ok(()) }
        };
        match fh.and_then(|fh| self.file_fd(fh).ok()) {
            Some(fd) => sync(fd),
            None => {
                // No open handle supplied; sync through a short-lived open.
                let path = proc_self_fd(inode.raw_fd());
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
                if fd < 0 {
                    return Err(last_errno());
                }
                let result = sync(fd);
                unsafe { libc::close(fd) };
                result
            }
        }
    }

    pub fn do_release(&self, fh: u64) -> Result<(), Errno> {
        self.files.lock().remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    pub fn do_opendir(&self, inode: &Inode) -> Result<u64, Errno> {
        let stream = DirStream::open(inode.raw_fd()).map_err(|e| errno_of(&e))?;
        let fh = self.alloc_fh();
        self.dirs.lock().insert(fh, Arc::new(Mutex::new(stream)));
        Ok(fh)
    }

    pub fn do_releasedir(&self, fh: u64) -> Result<(), Errno> {
        self.dirs.lock().remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    pub fn do_fsyncdir(&self, fh: u64, datasync: bool) -> Result<(), Errno> {
        let stream = self.dir_stream(fh)?;
        let fd = stream.lock().raw_fd();
        let rc = if datasync {
            unsafe { libc::fdatasync(fd) }
        } else {
            unsafe { libc::fsync(fd) }
        };
        if rc < 0 { Err(last_errno()) } else { Ok(()) }
    }

    /// Drives one readdir/readdirplus request. `emit` receives each entry
    /// (with lookup results in plus mode, `None` for `.`/`..` which are
    /// never looked up) and returns `true` when the reply buffer is full.
    ///
    /// Entries are committed only after `emit` accepts them, so an entry
    /// that overflowed the buffer is offered again on the next call, and a
    /// plus-mode lookup taken for an overflowing entry is undone here; the
    /// net refcount change for it is zero. Errors after the first accepted
    /// entry are swallowed: the client gets what was collected, keeping
    /// its lookup counts aligned with ours.
    pub fn stream_dir<F>(
        &self,
        dir_inode: &Inode,
        fh: u64,
        offset: i64,
        plus: bool,
        mut emit: F,
    ) -> Result<(), Errno>
    where
        F: FnMut(&HostDirent, Option<&EntryOut>) -> bool,
    {
        let stream = self.dir_stream(fh)?;
        let mut stream = stream.lock();
        stream.seek(offset);
        let mut emitted = false;
        loop {
            let entry = match stream.peek() {
                Err(err) => {
                    if emitted {
                        return Ok(());
                    }
                    return Err(errno_of(&err));
                }
                Ok(None) => return Ok(()),
                Ok(Some(entry)) => entry.clone(),
            };
            let looked_up = if plus && !entry.is_dot() {
                match self.do_lookup(dir_inode, OsStr::from_bytes(entry.name.to_bytes())) {
                    Ok(extra) => Some(extra),
                    Err(err) => {
                        if emitted {
                            return Ok(());
                        }
                        return Err(err);
                    }
                }
            } else {
                None
            };
            let full = emit(&entry, looked_up.as_ref());
            if full {
                if let Some(extra) = &looked_up {
                    // The entry did not fit; undo its lookup reference.
                    if let Some(inode) = self.table.get(extra.attr.ino.0) {
                        self.table.unref(&inode, 1);
                    }
                }
                return Ok(());
            }
            stream.consume();
            emitted = true;
        }
    }

    pub fn do_statfs(&self, inode: &Inode) -> Result<libc::statvfs, Errno> {
        let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstatvfs(inode.raw_fd(), &mut out) } < 0 {
            return Err(last_errno());
        }
        Ok(out)
    }

    pub fn do_fallocate(
        &self,
        inode: &Inode,
        fh: u64,
        mode: i32,
        offset: i64,
        length: i64,
    ) -> Result<(), Errno> {
        if mode != 0 {
            return Err(Errno::ENOTSUP);
        }
        let fd = self.file_fd(fh)?;
        let rc = unsafe {
            libc::posix_fallocate(fd, offset as libc::off_t, length as libc::off_t)
        };
        if rc != 0 {
            return Err(Errno::from_i32(rc));
        }
        inode.bump_version();
        Ok(())
    }

    /// BSD lock request on an open's descriptor. With flock negotiated the
    /// kernel only sends whole-file flock-style locks (POSIX lock support
    /// is never advertised).
    pub fn do_flock(&self, fh: u64, typ: i32, sleep: bool) -> Result<(), Errno> {
        let fd = self.file_fd(fh)?;
        let mut op = match typ {
            libc::F_RDLCK => libc::LOCK_SH,
            libc::F_WRLCK => libc::LOCK_EX,
            libc::F_UNLCK => libc::LOCK_UN,
            _ => return Err(Errno::EINVAL),
        };
        if !sleep {
            op |= libc::LOCK_NB;
        }
        if unsafe { libc::flock(fd, op) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    fn xattr_target(&self, inode: &Inode) -> Result<CString, Errno> {
        if !self.cfg.xattr {
            return Err(Errno::ENOSYS);
        }
        if inode.is_symlink {
            // No race-free xattr call on the link itself.
            return Err(Errno::EPERM);
        }
        Ok(proc_self_fd(inode.raw_fd()))
    }

    pub fn do_getxattr(
        &self,
        inode: &Inode,
        name: &OsStr,
        size: u32,
    ) -> Result<XattrOut, Errno> {
        let path = self.xattr_target(inode)?;
        let name_c = cstr(name)?;
        if size == 0 {
            let n = unsafe {
                libc::getxattr(path.as_ptr(), name_c.as_ptr(), std::ptr::null_mut(), 0)
            };
            if n < 0 {
                return Err(last_errno());
            }
            Ok(XattrOut::Size(n as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let n = unsafe {
                libc::getxattr(
                    path.as_ptr(),
                    name_c.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(last_errno());
            }
            buf.truncate(n as usize);
            Ok(XattrOut::Data(buf))
        }
    }

    pub fn do_listxattr(&self, inode: &Inode, size: u32) -> Result<XattrOut, Errno> {
        let path = self.xattr_target(inode)?;
        if size == 0 {
            let n = unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
            if n < 0 {
                return Err(last_errno());
            }
            Ok(XattrOut::Size(n as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let n = unsafe {
                libc::listxattr(
                    path.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(last_errno());
            }
            buf.truncate(n as usize);
            Ok(XattrOut::Data(buf))
        }
    }

    pub fn do_setxattr(
        &self,
        inode: &Inode,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        let path = self.xattr_target(inode)?;
        let name_c = cstr(name)?;
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                name_c.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        };
        if rc < 0 {
            return Err(last_errno());
        }
        inode.bump_version();
        Ok(())
    }

    pub fn do_removexattr(&self, inode: &Inode, name: &OsStr) -> Result<(), Errno> {
        let path = self.xattr_target(inode)?;
        let name_c = cstr(name)?;
        if unsafe { libc::removexattr(path.as_ptr(), name_c.as_ptr()) } < 0 {
            return Err(last_errno());
        }
        inode.bump_version();
        Ok(())
    }

    pub fn do_copy_file_range(
        &self,
        fh_in: u64,
        offset_in: i64,
        out_inode: &Inode,
        fh_out: u64,
        offset_out: i64,
        len: u64,
    ) -> Result<u32, Errno> {
        let fd_in = self.file_fd(fh_in)?;
        let fd_out = self.file_fd(fh_out)?;
        let mut off_in = offset_in;
        let mut off_out = offset_out;
        let n = unsafe {
            libc::copy_file_range(fd_in, &mut off_in, fd_out, &mut off_out, len as usize, 0)
        };
        if n < 0 {
            return Err(last_errno());
        }
        if n > 0 {
            out_inode.bump_version();
        }
        Ok(n as u32)
    }
}

// ----------------------------------------------------------------------
// fuser glue
// ----------------------------------------------------------------------

macro_rules! node_or_reply {
    ($self:expr, $ino:expr, $reply:expr) => {
        match $self.node($ino) {
            Ok(inode) => inode,
            Err(err) => {
                $reply.error(err);
                return;
            }
        }
    };
}

impl fuser::Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> io::Result<()> {
        // Export support costs nothing and lets the kernel resolve . and ..
        // through us; take it whenever offered.
        let _ = config.add_capabilities(InitFlags::FUSE_EXPORT_SUPPORT);
        if self.cfg.writeback
            && config
                .add_capabilities(InitFlags::FUSE_WRITEBACK_CACHE)
                .is_ok()
        {
            debug!("writeback cache negotiated");
            self.writeback = true;
        }
        if self.cfg.flock
            && config
                .add_capabilities(InitFlags::FUSE_FLOCK_LOCKS)
                .is_ok()
        {
            debug!("flock support negotiated");
            self.flock_enabled = true;
        }
        if self.cfg.readdirplus_enabled() {
            let _ = config.add_capabilities(InitFlags::FUSE_DO_READDIRPLUS);
            if self.cfg.cache == CacheMode::Auto {
                let _ = config.add_capabilities(InitFlags::FUSE_READDIRPLUS_AUTO);
            }
        }
        if self.cfg.cache == CacheMode::Auto {
            let _ = config.add_capabilities(InitFlags::FUSE_AUTO_INVAL_DATA);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.files.lock().clear();
        self.dirs.lock().clear();
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent = node_or_reply!(self, parent, reply);
        match self.do_lookup(&parent, name) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, Generation(0)),
            Err(err) => reply.error(err),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        self.do_forget(ino.0, nlookup);
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_getattr(&inode) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        let request = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh: fh.map(|fh| fh.0),
        };
        match self.do_setattr(&inode, request) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_readlink(&inode) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod() parent {parent:?} name {name:?} mode {mode:#o}");
        let parent = node_or_reply!(self, parent, reply);
        match self.do_make_node(Caller::from(req), &parent, name, mode, rdev, None) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, Generation(0)),
            Err(err) => reply.error(err),
        }
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir() parent {parent:?} name {name:?} mode {mode:#o}");
        let parent = node_or_reply!(self, parent, reply);
        let mode = (mode & !(libc::S_IFMT)) | libc::S_IFDIR;
        match self.do_make_node(Caller::from(req), &parent, name, mode, 0, None) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, Generation(0)),
            Err(err) => reply.error(err),
        }
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink() parent {parent:?} name {link_name:?} -> {target:?}");
        let parent = node_or_reply!(self, parent, reply);
        match self.do_make_node(
            Caller::from(req),
            &parent,
            link_name,
            libc::S_IFLNK,
            0,
            Some(target),
        ) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, Generation(0)),
            Err(err) => reply.error(err),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink() parent {parent:?} name {name:?}");
        let parent = node_or_reply!(self, parent, reply);
        match self.do_unlink(&parent, name, false) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir() parent {parent:?} name {name:?}");
        let parent = node_or_reply!(self, parent, reply);
        match self.do_unlink(&parent, name, true) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        debug!("rename() {parent:?}/{name:?} -> {newparent:?}/{newname:?} flags {flags}");
        let parent = node_or_reply!(self, parent, reply);
        let newparent = node_or_reply!(self, newparent, reply);
        match self.do_rename(&parent, name, &newparent, newname, flags.bits()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link() {ino:?} -> {newparent:?}/{newname:?}");
        let inode = node_or_reply!(self, ino, reply);
        let newparent = node_or_reply!(self, newparent, reply);
        match self.do_link(&inode, &newparent, newname) {
            Ok(entry) => reply.entry(&entry.ttl, &entry.attr, Generation(0)),
            Err(err) => reply.error(err),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_open(&inode, flags.0) {
            Ok(fh) => reply.opened(FileHandle(fh), self.fopen_flags()),
            Err(err) => reply.error(err),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create() parent {parent:?} name {name:?} mode {mode:#o}");
        let parent = node_or_reply!(self, parent, reply);
        match self.do_create(Caller::from(req), &parent, name, mode, flags) {
            Ok((entry, fh)) => reply.created(
                &entry.ttl,
                &entry.attr,
                Generation(0),
                FileHandle(fh),
                self.fopen_flags(),
            ),
            Err(err) => reply.error(err),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        match self.do_read(fh.0, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_write(&inode, fh.0, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        match self.do_flush(fh.0) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_release(fh.0) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn fsync(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_fsync(&inode, Some(fh.0), datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_opendir(&inode) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(err) => reply.error(err),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        let result = self.stream_dir(&inode, fh.0, offset as i64, false, |entry, _| {
            reply.add(
                INodeNo(entry.ino),
                entry.next_offset as u64,
                filetype_from_dtype(entry.dtype),
                OsStr::from_bytes(entry.name.to_bytes()),
            )
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn readdirplus(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        let ttl = self.cfg.attr_timeout();
        let result = self.stream_dir(&inode, fh.0, offset as i64, true, |entry, looked_up| {
            let name = OsStr::from_bytes(entry.name.to_bytes());
            match looked_up {
                Some(extra) => reply.add(
                    extra.attr.ino,
                    entry.next_offset as u64,
                    name,
                    &extra.ttl,
                    &extra.attr,
                    Generation(0),
                ),
                None => {
                    // . and .. carry a synthetic zero-ino entry; the kernel
                    // does not cache them and we skip the lookup.
                    let attr = synthetic_dir_attr();
                    reply.add(INodeNo(0), entry.next_offset as u64, name, &ttl, &attr, Generation(0))
                }
            }
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        match self.do_releasedir(fh.0) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn fsyncdir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_fsyncdir(fh.0, datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_statfs(&inode) {
            Ok(vfs) => reply.statfs(
                vfs.f_blocks,
                vfs.f_bfree,
                vfs.f_bavail,
                vfs.f_files,
                vfs.f_ffree,
                vfs.f_bsize as u32,
                vfs.f_namemax as u32,
                vfs.f_frsize as u32,
            ),
            Err(err) => reply.error(err),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_setxattr(&inode, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_getxattr(&inode, name, size) {
            Ok(XattrOut::Size(n)) => reply.size(n),
            Ok(XattrOut::Data(data)) => reply.data(&data),
            Err(err) => reply.error(err),
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_listxattr(&inode, size) {
            Ok(XattrOut::Size(n)) => reply.size(n),
            Ok(XattrOut::Data(data)) => reply.data(&data),
            Err(err) => reply.error(err),
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_removexattr(&inode, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn setlk(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        _start: u64,
        _end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        if !self.flock_enabled {
            reply.error(Errno::ENOSYS);
            return;
        }
        match self.do_flock(fh.0, typ, sleep) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn fallocate(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let inode = node_or_reply!(self, ino, reply);
        match self.do_fallocate(&inode, fh.0, mode, offset as i64, length as i64) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn copy_file_range(
        &self,
        _req: &Request,
        _ino_in: INodeNo,
        fh_in: FileHandle,
        offset_in: u64,
        ino_out: INodeNo,
        fh_out: FileHandle,
        offset_out: u64,
        len: u64,
        _flags: CopyFileRangeFlags,
        reply: ReplyWrite,
    ) {
        let out_inode = node_or_reply!(self, ino_out, reply);
        match self.do_copy_file_range(
            fh_in.0,
            offset_in as i64,
            &out_inode,
            fh_out.0,
            offset_out as i64,
            len,
        ) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err),
        }
    }
}

/// Builds the transport configuration and runs the session loop until
/// unmount.
pub fn mount(
    fs: PassthroughFs,
    mountpoint: &Path,
    singlethread: bool,
    auto_unmount: bool,
    allow_other: bool,
) -> io::Result<()> {
    let mut config = fuser::Config::default();
    config
        .mount_options
        .push(fuser::MountOption::FSName("passfs".to_string()));
    config
        .mount_options
        .push(fuser::MountOption::DefaultPermissions);
    if auto_unmount {
        config.mount_options.push(fuser::MountOption::AutoUnmount);
    }
    for opt in &fs.cfg.passthrough_opts {
        config
            .mount_options
            .push(fuser::MountOption::CUSTOM(opt.clone()));
    }
    if allow_other {
        config.acl = fuser::SessionACL::All;
    }
    if singlethread {
        config.n_threads = Some(1);
    }
    fuser::mount2(fs, mountpoint, &config).inspect_err(|err| {
        error!("session loop failed: {err}");
    })
}
