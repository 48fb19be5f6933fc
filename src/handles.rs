//! File and directory handle tables.
//!
//! Kernel requests that operate on an already-open object (`read`, `write`,
//! `readdir`, `release`, …) carry a file-handle slot distinct from the inode
//! identifier. This module hands out opaque, auto-incrementing `u64`
//! handles for both regular file opens and directory opens.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;

/// A single open file's state: its descriptor plus the access mode it was
/// opened with (needed to reject e.g. `write` on a read-only handle before
/// the underlying `pwrite` ever runs).
#[derive(Debug)]
pub struct FileHandle {
    pub fd: OwnedFd,
    pub writeback_cache: bool,
}

impl FileHandle {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A single open directory's state: its descriptor plus a readdir cursor.
#[derive(Debug, Default)]
pub struct DirHandle {
    pub fd: Option<OwnedFd>,
    /// Offset of the last entry returned to the kernel, so a `readdir` call
    /// that restarts at a kernel-supplied offset can reposition the cursor.
    pub last_offset: i64,
}

impl DirHandle {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            last_offset: 0,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Thread-safe table handing out auto-incrementing, non-zero `u64` handles.
///
/// IDs start at 1 — 0 is reserved for "no handle" in the FUSE protocol — and
/// wrap around rather than overflow, skipping 0 on wraparound.
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts `value` under a freshly allocated handle and returns it.
    pub fn insert(&self, value: V) -> u64 {
        let mut value = Some(value);
        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.checked_add(1).unwrap_or(1))
                })
                .expect("fetch_update always succeeds");
            if id == 0 {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.handles.entry(id) {
                entry.insert(value.take().expect("value already inserted"));
                return id;
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<Ref<'_, u64, V>> {
        self.handles.get(&id)
    }

    pub fn get_mut(&self, id: u64) -> Option<RefMut<'_, u64, V>> {
        self.handles.get_mut(&id)
    }

    /// Removes and returns the handle, e.g. on `release`/`releasedir`.
    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drains every handle, e.g. on `destroy`.
    pub fn drain(&self) -> Vec<V> {
        self.handles
            .iter()
            .map(|e| *e.key())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|k| self.handles.remove(&k).map(|(_, v)| v))
            .collect()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increment() {
        let table: HandleTable<&str> = HandleTable::new();
        let id1 = table.insert("a");
        let id2 = table.insert("b");
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn get_and_remove() {
        let table: HandleTable<String> = HandleTable::new();
        let id = table.insert("hello".to_string());
        assert_eq!(*table.get(id).unwrap(), "hello");
        assert_eq!(table.remove(id), Some("hello".to_string()));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn id_zero_never_returned_even_after_wraparound() {
        let table: HandleTable<i32> = HandleTable::new();
        table.next_id.store(u64::MAX, Ordering::Relaxed);
        let last = table.insert(1);
        assert_eq!(last, u64::MAX);
        let wrapped = table.insert(2);
        assert_ne!(wrapped, 0);
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn concurrent_insert_yields_unique_ids() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(HandleTable::<u64>::new());
        let mut handles = vec![];
        for i in 0..10 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                (0..10).map(|j| table.insert(i * 10 + j)).collect::<Vec<_>>()
            }));
        }
        let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn drain_empties_table() {
        let table: HandleTable<i32> = HandleTable::new();
        table.insert(1);
        table.insert(2);
        table.insert(3);
        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert!(table.is_empty());
    }
}
