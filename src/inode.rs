//! Inode table and lifetime management for the passthrough filesystem.
//!
//! Bridges kernel-facing inode identifiers (opaque `u64`s handed to the
//! kernel in FUSE replies) to host filesystem identity: the `(device,
//! inode-number)` pair of the backing object, plus an owned "path only"
//! descriptor used for every `*at`-relative syscall against it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Host filesystem identity of a source object: `(st_dev, st_ino)`.
pub type HostKey = (u64, u64);

/// A single live inode record.
///
/// Owns the descriptor returned by `openat(..., O_PATH | O_NOFOLLOW)` (or
/// the root mount's own `O_PATH` descriptor, for [`ROOT_INODE`]). The
/// descriptor is path-only: it can be used as the `dirfd`/base for `*at`
/// syscalls and for `/proc/self/fd/<fd>` redirection, but never for `read`
/// or `write` directly.
#[derive(Debug)]
pub struct Inode {
    /// Path-only descriptor to the source object.
    fd: OwnedFd,
    /// Host identity this record was opened against.
    key: HostKey,
    /// Kernel reference count; increments on `lookup`, decrements on `forget`.
    ///
    /// `Relaxed` ordering is sufficient for the increment: it is a simple
    /// counter with no synchronization requirement beyond atomicity.
    nlookup: AtomicU64,
    /// Generation counter, bumped if this identity token is ever recycled.
    generation: u64,
}

impl Inode {
    fn new(fd: OwnedFd, key: HostKey, generation: u64) -> Self {
        Self {
            fd,
            key,
            nlookup: AtomicU64::new(1),
            generation,
        }
    }

    /// The path-only descriptor for this inode.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Host `(device, inode)` identity.
    pub fn key(&self) -> HostKey {
        self.key
    }

    /// Generation counter, exposed for completeness of the kernel inode
    /// identity (not currently recycled — see [`InodeTable`]).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lookup count.
    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }

    fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count`, returning the new value, or
    /// `None` if doing so would underflow. Races between `lookup` and
    /// `forget` can make the kernel "forget" more than it ever looked up;
    /// implementations must tolerate this by ignoring the forget, not by
    /// asserting. Uses `AcqRel` so the decrement is visible to, and ordered
    /// against, whichever thread performs the eviction check immediately
    /// after.
    fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }
}

/// Thread-safe table mapping host filesystem identity to kernel inode
/// identifiers and their owning [`Inode`] records.
///
/// Implements §9's redesign direction directly: a hash map from key to a
/// stable-address container entry (here, two `DashMap`s plus a monotonic
/// `u64` counter), not a linked list of address-stable, pointer-chased
/// records. The counter is the "weak back-reference" the kernel is handed;
/// it never aliases a live pointer.
pub struct InodeTable {
    by_key: DashMap<HostKey, u64>,
    by_id: DashMap<u64, Inode>,
    next_id: AtomicU64,
    root_fd: OwnedFd,
}

impl InodeTable {
    /// Creates a new table with the root inode pre-populated from an
    /// already-open path-only descriptor to the mount source.
    pub fn new(root_fd: OwnedFd, root_key: HostKey) -> Self {
        let by_key = DashMap::new();
        by_key.insert(root_key, ROOT_INODE);
        Self {
            by_key,
            by_id: DashMap::new(),
            next_id: AtomicU64::new(ROOT_INODE + 1),
            root_fd,
        }
    }

    /// The root descriptor, usable directly as a `dirfd` for top-level `*at`
    /// lookups. The root record itself is never inserted into `by_id` and
    /// is never subject to `forget`.
    pub fn root_fd(&self) -> RawFd {
        self.root_fd.as_raw_fd()
    }

    /// Finds or inserts an `Inode` for `key`, taking ownership of `fd` if
    /// inserting. If an entry already exists for `key`, `fd` is dropped
    /// (closing it) and the existing record's lookup count is incremented
    /// instead — this is what `lookup(parent, name)` uses after opening a
    /// candidate descriptor and stat-ing it.
    ///
    /// Returns the resulting inode identifier and its new lookup count.
    pub fn get_or_insert(&self, key: HostKey, fd: OwnedFd) -> (u64, u64) {
        if let Some(existing) = self.by_key.get(&key) {
            let id = *existing;
            drop(existing);
            // fd is closed here; the caller already has a live record.
            drop(fd);
            if id == ROOT_INODE {
                return (ROOT_INODE, 1);
            }
            if let Some(inode) = self.by_id.get(&id) {
                let n = inode.inc_nlookup();
                return (id, n);
            }
            // Raced with an evicting forget; fall through and allocate fresh.
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inode = Inode::new(fd, key, 0);
        self.by_id.insert(id, inode);
        self.by_key.insert(key, id);
        (id, 1)
    }

    /// Resolves a kernel-supplied inode identifier to its descriptor's raw
    /// fd, for use as a `dirfd`/base in a subsequent `*at` syscall. Returns
    /// `None` if the identifier has no live record.
    pub fn resolve(&self, ino: u64) -> Option<RawFd> {
        if ino == ROOT_INODE {
            return Some(self.root_fd.as_raw_fd());
        }
        self.by_id.get(&ino).map(|e| e.fd())
    }

    /// Resolves a kernel-supplied inode identifier to its host key.
    pub fn key_of(&self, ino: u64) -> Option<HostKey> {
        self.by_id.get(&ino).map(|e| e.key())
    }

    /// Decrements `ino`'s lookup count by `n`; if it reaches zero, removes
    /// the record from the table (closing its descriptor via `Drop`).
    /// Returns `true` if the record was evicted. The root inode is never
    /// evicted. Forgets referring to an already-evicted record (a race with
    /// a concurrent `forget`) are silently ignored.
    pub fn forget(&self, ino: u64, n: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }

        let Some(inode) = self.by_id.get(&ino) else {
            return false;
        };
        let Some(remaining) = inode.dec_nlookup(n) else {
            return false;
        };
        drop(inode);

        if remaining == 0 {
            self.evict(ino)
        } else {
            false
        }
    }

    fn evict(&self, ino: u64) -> bool {
        let Some((_, inode)) = self.by_id.remove(&ino) else {
            return false;
        };
        self.by_key.remove(&inode.key());
        true
    }

    /// Number of non-root inodes currently live.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// `true` if no non-root inodes are live.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Walks every live record, closing its descriptor, and clears the
    /// table down to just the root mapping. Called from `destroy`.
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_key.retain(|_, id| *id == ROOT_INODE);
    }
}
