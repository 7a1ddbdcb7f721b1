//! Shared inode version registry client.
//!
//! In `shared` mode several passthrough instances mounted over the same
//! source coordinate cache invalidation through an external registry
//! process. The registry assigns each canonical inode a slot in a shared
//! memory table of signed 64-bit counters; any instance that mutates an
//! inode bumps its slot, and peers compare counters to decide whether their
//! caches are stale.
//!
//! The client side is deliberately small: a sequenced-packet unix socket
//! carrying fixed-size records, one reader thread matching replies to
//! pending requests, and atomic loads/fetch-adds against the mapped table.
//! Every failure degrades to "versioning off": an unreachable registry must
//! never take the filesystem down with it.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread;

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::inode::InodeKey;

/// Well-known registry socket address.
pub const REGISTRY_SOCKET: &str = "/tmp/ireg.sock";
/// Well-known shared version table mapping.
pub const VERSION_TABLE: &str = "/dev/shm/fuse_shared_versions";

const OP_GET: u64 = 1;
const OP_PUT: u64 = 2;
const OP_VERSION: u64 = 3;

/// Fixed-size wire record. `GET` carries `(handle, dev, ino)`, `PUT`
/// carries `(refid, 0, 0)`, `VERSION` replies carry
/// `(handle, offset, refid)`.
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Record {
    op: u64,
    a: u64,
    b: u64,
    c: u64,
}

pub(crate) fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// The memory-mapped array of per-slot version counters.
///
/// The mapping lives for the rest of the process, so the cell slice can be
/// handed out with a `'static` lifetime.
#[derive(Clone, Copy)]
pub struct VersionTable {
    cells: &'static [AtomicI64],
}

impl VersionTable {
    /// Maps `path` read-write shared. The file's size determines the number
    /// of slots; slot 0 is reserved to mean "no versioning".
    pub fn map(path: &Path) -> io::Result<VersionTable> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let slots = len / std::mem::size_of::<AtomicI64>();
        if slots == 0 {
            return Err(io::Error::other("version table is empty"));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                slots * std::mem::size_of::<AtomicI64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let cells = unsafe { std::slice::from_raw_parts(ptr as *const AtomicI64, slots) };
        Ok(VersionTable { cells })
    }

    pub fn slots(&self) -> usize {
        self.cells.len()
    }

    fn cell(&self, offset: u64) -> Option<&'static AtomicI64> {
        if offset == 0 || offset as usize >= self.cells.len() {
            return None;
        }
        Some(&self.cells[offset as usize])
    }
}

struct PendingGet {
    reply: parking_lot::Mutex<Option<Option<(u64, u64)>>>,
    cond: parking_lot::Condvar,
}

impl PendingGet {
    fn new() -> PendingGet {
        PendingGet {
            reply: parking_lot::Mutex::new(None),
            cond: parking_lot::Condvar::new(),
        }
    }

    fn post(&self, value: Option<(u64, u64)>) {
        *self.reply.lock() = Some(value);
        self.cond.notify_one();
    }

    fn wait(&self) -> Option<(u64, u64)> {
        let mut guard = self.reply.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        guard.take().unwrap()
    }
}

/// Client half of the registry protocol.
pub struct RegistryClient {
    sock: OwnedFd,
    table: VersionTable,
    pending: parking_lot::Mutex<HashMap<u64, Arc<PendingGet>>>,
    next_handle: AtomicU64,
    alive: AtomicBool,
}

impl RegistryClient {
    /// Connects to the registry and spawns the reply reader thread. The
    /// caller maps the version table first: table mapping failures are fatal
    /// under `shared` mode, socket failures are not.
    pub fn connect(socket_path: &Path, table: VersionTable) -> io::Result<Arc<RegistryClient>> {
        let fd = unsafe {
            libc::socket(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        let (addr, len) = sockaddr_un(socket_path)?;
        let rc = unsafe {
            libc::connect(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let client = Arc::new(RegistryClient {
            sock,
            table,
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        });
        let reader = client.clone();
        thread::Builder::new()
            .name("ireg-reader".into())
            .spawn(move || reader.read_replies())?;
        Ok(client)
    }

    /// Reader thread body: match VERSION replies to pending GETs until the
    /// registry hangs up, then wake every waiter empty-handed and exit
    /// silently.
    fn read_replies(&self) {
        let mut buf = [0u8; std::mem::size_of::<Record>()];
        loop {
            let n = unsafe {
                libc::recv(
                    self.sock.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n <= 0 {
                break;
            }
            if n as usize != buf.len() {
                warn!("registry: short reply of {n} bytes, ignoring");
                continue;
            }
            let rec = Record::read_from_bytes(&buf).unwrap();
            if rec.op != OP_VERSION {
                warn!("registry: unexpected reply op {}", rec.op);
                continue;
            }
            if let Some(waiter) = self.pending.lock().remove(&rec.a) {
                waiter.post(Some((rec.b, rec.c)));
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in drained {
            waiter.post(None);
        }
        debug!("registry: connection closed, versioning disabled for new inodes");
    }

    fn send(&self, rec: &Record) -> io::Result<()> {
        let bytes = rec.as_bytes();
        let n = unsafe {
            libc::send(
                self.sock.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n as usize != bytes.len() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers `key` and blocks until the registry assigns a slot.
    /// Returns `None` when the registry is unreachable; the inode then runs
    /// with versioning off.
    pub fn register(self: &Arc<Self>, key: InodeKey) -> Option<SharedSlot> {
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let waiter = Arc::new(PendingGet::new());
        self.pending.lock().insert(handle, waiter.clone());
        let rec = Record {
            op: OP_GET,
            a: handle,
            b: key.dev,
            c: key.ino,
        };
        if self.send(&rec).is_err() {
            self.pending.lock().remove(&handle);
            self.alive.store(false, Ordering::SeqCst);
            return None;
        }
        let (offset, refid) = waiter.wait()?;
        Some(SharedSlot {
            cell: self.table.cell(offset),
            offset,
            refid,
            client: self.clone(),
        })
    }

    fn put(&self, refid: u64) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let rec = Record {
            op: OP_PUT,
            a: refid,
            b: 0,
            c: 0,
        };
        if self.send(&rec).is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
    }
}

/// An inode's slot in the shared version table, released back to the
/// registry when the inode is destroyed.
pub struct SharedSlot {
    cell: Option<&'static AtomicI64>,
    offset: u64,
    refid: u64,
    client: Arc<RegistryClient>,
}

impl SharedSlot {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read(&self) -> i64 {
        self.cell.map_or(0, |c| c.load(Ordering::SeqCst))
    }

    pub fn bump(&self) {
        if let Some(cell) = self.cell {
            cell.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SharedSlot {
    fn drop(&mut self) {
        self.client.put(self.refid);
    }
}

/// Creates a zero-filled version table file, for tests and for operators
/// bringing up a registry by hand.
pub fn create_table_file(path: &Path, slots: usize) -> io::Result<()> {
    let file = std::fs::File::create(path)?;
    file.set_len((slots * std::mem::size_of::<AtomicI64>()) as u64)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal in-process registry: binds a seqpacket socket, accepts one
    /// client and answers every GET with a fresh slot offset. Used by the
    /// shared-mode tests.
    pub(crate) struct FakeRegistry {
        pub socket_path: std::path::PathBuf,
        listen_fd: OwnedFd,
    }

    impl FakeRegistry {
        pub fn bind(dir: &Path) -> FakeRegistry {
            let socket_path = dir.join("ireg.sock");
            let fd = unsafe {
                libc::socket(
                    libc::AF_UNIX,
                    libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                    0,
                )
            };
            assert!(fd >= 0);
            let listen_fd = unsafe { OwnedFd::from_raw_fd(fd) };
            let (addr, len) = sockaddr_un(&socket_path).unwrap();
            let rc = unsafe {
                libc::bind(
                    listen_fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                    len,
                )
            };
            assert_eq!(rc, 0, "bind failed: {}", io::Error::last_os_error());
            assert_eq!(unsafe { libc::listen(listen_fd.as_raw_fd(), 4) }, 0);
            FakeRegistry {
                socket_path,
                listen_fd,
            }
        }

        /// Accepts one connection and serves it on a background thread.
        /// Slot offsets start at 1 and increase per GET; the refid echoes
        /// the offset. The server hangs up once it has answered `max_gets`
        /// GETs and seen `max_puts` PUTs, so tests always terminate even
        /// though the client's reader thread keeps its end open.
        pub fn serve_one(&self, max_gets: u64, max_puts: u64) -> thread::JoinHandle<u64> {
            let conn = unsafe {
                libc::accept(self.listen_fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
            };
            assert!(conn >= 0);
            let conn = unsafe { OwnedFd::from_raw_fd(conn) };
            thread::spawn(move || {
                let mut next_offset = 1u64;
                let mut gets = 0u64;
                let mut puts = 0u64;
                let mut buf = [0u8; std::mem::size_of::<Record>()];
                while gets < max_gets || puts < max_puts {
                    let n = unsafe {
                        libc::recv(
                            conn.as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                            0,
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                    let rec = Record::read_from_bytes(&buf).unwrap();
                    match rec.op {
                        OP_GET => {
                            gets += 1;
                            let reply = Record {
                                op: OP_VERSION,
                                a: rec.a,
                                b: next_offset,
                                c: next_offset,
                            };
                            next_offset += 1;
                            let bytes = reply.as_bytes();
                            unsafe {
                                libc::send(
                                    conn.as_raw_fd(),
                                    bytes.as_ptr() as *const libc::c_void,
                                    bytes.len(),
                                    libc::MSG_NOSIGNAL,
                                )
                            };
                        }
                        OP_PUT => puts += 1,
                        other => panic!("unexpected op {other}"),
                    }
                }
                puts
            })
        }
    }

    fn mapped_table(dir: &Path, slots: usize) -> VersionTable {
        let path = dir.join("versions");
        create_table_file(&path, slots).unwrap();
        VersionTable::map(&path).unwrap()
    }

    #[test]
    fn get_assigns_slot_and_put_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let table = mapped_table(dir.path(), 16);
        let registry = FakeRegistry::bind(dir.path());

        let client_path = registry.socket_path.clone();
        let client =
            thread::spawn(move || RegistryClient::connect(&client_path, table).unwrap());
        let server = registry.serve_one(1, 1);
        let client = client.join().unwrap();

        let slot = client
            .register(InodeKey { dev: 1, ino: 42 })
            .expect("registry reachable");
        assert_eq!(slot.offset(), 1);
        assert_eq!(slot.read(), 0);
        slot.bump();
        slot.bump();
        assert_eq!(slot.read(), 2);

        drop(slot);
        assert_eq!(server.join().unwrap(), 1, "PUT should follow slot drop");
    }

    #[test]
    fn version_bumps_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let table = mapped_table(dir.path(), 4);
        let cell = table.cell(2).unwrap();
        let mut last = cell.load(Ordering::SeqCst);
        for _ in 0..100 {
            cell.fetch_add(1, Ordering::SeqCst);
            let now = cell.load(Ordering::SeqCst);
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn unreachable_registry_disables_versioning() {
        let dir = tempfile::tempdir().unwrap();
        let table = mapped_table(dir.path(), 4);
        let missing = dir.path().join("nowhere.sock");
        assert!(RegistryClient::connect(&missing, table).is_err());
    }

    #[test]
    fn disconnect_wakes_pending_and_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let table = mapped_table(dir.path(), 4);
        let registry = FakeRegistry::bind(dir.path());

        let client_path = registry.socket_path.clone();
        let client =
            thread::spawn(move || RegistryClient::connect(&client_path, table).unwrap());
        // Server hangs up right after the first GET.
        let server = registry.serve_one(1, 0);
        let client = client.join().unwrap();

        let slot = client.register(InodeKey { dev: 1, ino: 7 }).unwrap();
        assert_eq!(slot.offset(), 1);
        server.join().unwrap();

        // Reader thread has observed the hangup (or will shortly); new
        // registrations must return None instead of blocking.
        for _ in 0..50 {
            if client.register(InodeKey { dev: 1, ino: 8 }).is_none() {
                return;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("registration kept succeeding after registry disconnect");
    }

    #[test]
    fn socket_path_too_long_is_rejected() {
        let long = "x".repeat(libc::PATH_MAX as usize);
        assert!(sockaddr_un(Path::new(&long)).is_err());
    }
}
