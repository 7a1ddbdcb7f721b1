//! Canonical inode table.
//!
//! Every host object the kernel has looked up is represented by exactly one
//! [`Inode`], keyed by its `(device, inode number)` pair. The table owns the
//! reference-count discipline dictated by the FUSE protocol: `LOOKUP`
//! acquires a reference, `FORGET` drops a client-chosen amount, and internal
//! operations may take transient references of their own. When the count
//! reaches zero the inode leaves the table, its `O_PATH` anchor is closed
//! and its registry slot (if any) is released.
//!
//! Opaque handles handed to the kernel are slab indices: the low 48 bits
//! address a slot, the high 16 bits carry the slot's generation so that a
//! stale handle for a reused slot decodes to nothing instead of to an
//! unrelated inode. Slot 1 is reserved for the root, which makes the root
//! handle equal to `FUSE_ROOT_ID` without any table lookup.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::registry::SharedSlot;

/// The kernel addresses the mount's root with this well-known id.
pub const ROOT_HANDLE: u64 = 1;

const SLOT_BITS: u32 = 48;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

fn encode_handle(slot: usize, generation: u16) -> u64 {
    ((generation as u64) << SLOT_BITS) | slot as u64
}

/// Host identity of a filesystem object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn from_stat(st: &libc::stat) -> InodeKey {
        InodeKey {
            dev: st.st_dev,
            ino: st.st_ino,
        }
    }
}

/// One canonical host inode.
///
/// `fd` is an `O_PATH` descriptor used as an anchor for path-free syscalls;
/// it stays open for the whole lifetime of the object and is closed by drop
/// exactly when the last reference disappears. All fields except the
/// reference count are immutable, which is what makes lock-free reads after
/// a table lookup sound.
pub struct Inode {
    pub key: InodeKey,
    fd: OwnedFd,
    pub is_symlink: bool,
    pub handle: u64,
    refcount: AtomicU64,
    shared: Option<SharedSlot>,
}

impl Inode {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Current lookup count. Only meaningful as a snapshot; mutations happen
    /// under the table lock.
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Offset of this inode's slot in the shared version table, 0 when
    /// versioning is disabled for it.
    pub fn version_offset(&self) -> u64 {
        self.shared.as_ref().map_or(0, SharedSlot::offset)
    }

    pub fn version(&self) -> i64 {
        self.shared.as_ref().map_or(0, SharedSlot::read)
    }

    /// Record one visible mutation of this inode (or of the directory it
    /// represents). No-op without a registry slot.
    pub fn bump_version(&self) {
        if let Some(shared) = &self.shared {
            shared.bump();
        }
    }
}

/// A not-yet-interned inode, built by the lookup path before it knows
/// whether it lost a race against a concurrent lookup of the same key.
pub struct InodeCandidate {
    pub key: InodeKey,
    pub fd: OwnedFd,
    pub is_symlink: bool,
    pub shared: Option<SharedSlot>,
}

struct Slot {
    generation: u16,
    inode: Option<Arc<Inode>>,
}

struct TableInner {
    by_key: HashMap<InodeKey, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// The canonical `(dev, ino)` → inode map.
///
/// A single mutex serializes structural changes and refcount arithmetic.
/// The root inode lives in slot 1; it is addressed by sentinel, never
/// entered into the key map and never evicted.
pub struct InodeTable {
    inner: Mutex<TableInner>,
    root: Arc<Inode>,
    root_key: InodeKey,
}

impl InodeTable {
    /// Seeds the table with the root inode. The root starts with a count of
    /// two so that no balanced forget sequence can ever reach zero on it.
    pub fn new(root_fd: OwnedFd, root_key: InodeKey, root_shared: Option<SharedSlot>) -> InodeTable {
        let root = Arc::new(Inode {
            key: root_key,
            fd: root_fd,
            is_symlink: false,
            handle: ROOT_HANDLE,
            refcount: AtomicU64::new(2),
            shared: root_shared,
        });
        let slots = vec![
            Slot {
                generation: 0,
                inode: None,
            },
            Slot {
                generation: 0,
                inode: Some(root.clone()),
            },
        ];
        InodeTable {
            inner: Mutex::new(TableInner {
                by_key: HashMap::new(),
                slots,
                free: Vec::new(),
            }),
            root,
            root_key,
        }
    }

    pub fn root(&self) -> Arc<Inode> {
        self.root.clone()
    }

    /// Looks up `key` and transfers one reference to the caller.
    ///
    /// The root's own key resolves to the root inode even though the root is
    /// not in the key map; without this, a lookup of `..` ending at the
    /// source root would mint a duplicate inode for it.
    pub fn find(&self, key: InodeKey) -> Option<Arc<Inode>> {
        let inner = self.inner.lock();
        if key == self.root_key {
            self.root.refcount.fetch_add(1, Ordering::Relaxed);
            return Some(self.root.clone());
        }
        let slot = *inner.by_key.get(&key)?;
        let inode = inner.slots[slot].inode.as_ref()?.clone();
        inode.refcount.fetch_add(1, Ordering::Relaxed);
        Some(inode)
    }

    /// Inserts `candidate` with a count of one, unless an entry for its key
    /// appeared since the caller's `find` miss. On that race the existing
    /// inode wins: it is returned with an extra reference and the losing
    /// candidate comes back to the caller, who drops it (closing its fd and
    /// releasing its registry slot).
    pub fn intern(&self, candidate: InodeCandidate) -> (Arc<Inode>, Option<InodeCandidate>) {
        let mut inner = self.inner.lock();
        if candidate.key == self.root_key {
            self.root.refcount.fetch_add(1, Ordering::Relaxed);
            return (self.root.clone(), Some(candidate));
        }
        if let Some(&slot) = inner.by_key.get(&candidate.key) {
            if let Some(existing) = inner.slots[slot].inode.as_ref() {
                existing.refcount.fetch_add(1, Ordering::Relaxed);
                return (existing.clone(), Some(candidate));
            }
        }
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    inode: None,
                });
                inner.slots.len() - 1
            }
        };
        assert!(slot as u64 <= SLOT_MASK, "inode slab exhausted");
        let generation = inner.slots[slot].generation;
        let inode = Arc::new(Inode {
            key: candidate.key,
            fd: candidate.fd,
            is_symlink: candidate.is_symlink,
            handle: encode_handle(slot, generation),
            refcount: AtomicU64::new(1),
            shared: candidate.shared,
        });
        inner.slots[slot].inode = Some(inode.clone());
        inner.by_key.insert(candidate.key, slot);
        (inode, None)
    }

    /// Decodes an opaque handle back to its inode without touching the
    /// reference count. The kernel holds a lookup count for as long as it
    /// may send requests against a handle, which keeps the inode alive for
    /// the duration of the request.
    pub fn get(&self, handle: u64) -> Option<Arc<Inode>> {
        if handle == ROOT_HANDLE {
            return Some(self.root.clone());
        }
        let slot = (handle & SLOT_MASK) as usize;
        let generation = (handle >> SLOT_BITS) as u16;
        let inner = self.inner.lock();
        let entry = inner.slots.get(slot)?;
        if entry.generation != generation {
            return None;
        }
        entry.inode.clone()
    }

    /// Takes `n` additional references on an inode already held by the
    /// caller (hardlink replies and resolver hits use this).
    pub fn ref_inode(&self, inode: &Inode, n: u64) {
        let _inner = self.inner.lock();
        inode.refcount.fetch_add(n, Ordering::Relaxed);
    }

    /// Drops `n` references. At zero the inode leaves the table; its fd and
    /// registry slot are released outside the lock when the last `Arc`
    /// goes away.
    pub fn unref(&self, inode: &Arc<Inode>, n: u64) {
        if n == 0 {
            return;
        }
        let evicted;
        {
            let mut inner = self.inner.lock();
            let current = inode.refcount.load(Ordering::Relaxed);
            assert!(current >= n, "inode refcount underflow");
            inode.refcount.store(current - n, Ordering::Relaxed);
            if current > n || inode.handle == ROOT_HANDLE {
                return;
            }
            let slot = (inode.handle & SLOT_MASK) as usize;
            inner.by_key.remove(&inode.key);
            evicted = inner.slots[slot].inode.take();
            inner.slots[slot].generation = inner.slots[slot].generation.wrapping_add(1);
            inner.free.push(slot);
        }
        drop(evicted);
    }

    /// Number of live non-root inodes, used by balance checks.
    pub fn live_inodes(&self) -> usize {
        self.inner.lock().by_key.len()
    }
}
