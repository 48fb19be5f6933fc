//! Per-direction token-bucket throttling.
//!
//! Two independent buckets (read, write) bound sustained throughput without
//! splitting requests or distorting reply semantics: a request simply waits
//! until enough tokens exist, consumes them, then proceeds unchanged.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use fuser::{Filesystem, ReplyData, ReplyWrite, Request};
use parking_lot::{Condvar, Mutex};

/// A fixed-capacity counter replenished at a fixed rate, consumed
/// atomically by I/O operations.
pub struct TokenBucket {
    capacity: u64,
    fill_rate: u64,
    count: AtomicU64,
    gate: Mutex<()>,
    condvar: Condvar,
}

impl TokenBucket {
    pub fn new(capacity: u64, fill_rate: u64) -> Self {
        Self {
            capacity,
            fill_rate,
            count: AtomicU64::new(capacity),
            gate: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until `n` tokens are available, then atomically decrements.
    /// Requests larger than capacity are allowed; they simply wait across
    /// multiple replenishments. No request is ever split.
    pub fn consume(&self, n: u64) {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current >= n {
                if self
                    .count
                    .compare_exchange(current, current - n, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            let mut guard = self.gate.lock();
            // Re-check under the lock: replenishment may have landed
            // between the failed load above and taking the gate.
            if self.count.load(Ordering::Acquire) >= n {
                continue;
            }
            self.condvar.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Advances the count by `fill_rate * interval`, capped at `capacity`,
    /// then wakes every waiter. Thundering herd on wakeup is accepted — no
    /// FIFO ordering is guaranteed (§4.5).
    fn replenish(&self, interval: Duration) {
        let added = (self.fill_rate as f64 * interval.as_secs_f64()) as u64;
        if added == 0 {
            return;
        }
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                Some((current + added).min(self.capacity))
            })
            .ok();
        let _guard = self.gate.lock();
        self.condvar.notify_all();
    }

    #[cfg(test)]
    fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub read_capacity: u64,
    pub read_rate: u64,
    pub write_capacity: u64,
    pub write_rate: u64,
    pub replenish_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            read_capacity: 4096,
            read_rate: 4096,
            write_capacity: 4096,
            write_rate: 4096,
            replenish_interval: Duration::from_millis(100),
        }
    }
}

/// Wraps `inner`, consuming from the read/write buckets before forwarding
/// `read`/`write` calls. A dedicated background thread replenishes both
/// buckets on a fixed timer — no signal handler is involved (§9).
pub struct ThrottlingFs {
    inner: Box<dyn Filesystem + Send + Sync>,
    read_bucket: Arc<TokenBucket>,
    write_bucket: Arc<TokenBucket>,
    replenisher: Option<JoinHandle<()>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl ThrottlingFs {
    pub fn new(inner: Box<dyn Filesystem + Send + Sync>, config: ThrottleConfig) -> Self {
        let read_bucket = Arc::new(TokenBucket::new(config.read_capacity, config.read_rate));
        let write_bucket = Arc::new(TokenBucket::new(config.write_capacity, config.write_rate));
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let replenisher = {
            let read_bucket = Arc::clone(&read_bucket);
            let write_bucket = Arc::clone(&write_bucket);
            let shutdown = Arc::clone(&shutdown);
            let interval = config.replenish_interval;
            std::thread::Builder::new()
                .name("throttle-replenish".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        std::thread::sleep(interval);
                        read_bucket.replenish(interval);
                        write_bucket.replenish(interval);
                    }
                })
                .ok()
        };

        Self {
            inner,
            read_bucket,
            write_bucket,
            replenisher,
            shutdown,
        }
    }
}

impl Drop for ThrottlingFs {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.replenisher.take() {
            let _ = handle.join();
        }
    }
}

impl Filesystem for ThrottlingFs {
    fn init(&mut self, req: &Request<'_>, config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        self.inner.init(req, config)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.read_bucket.consume(u64::from(size));
        self.inner.read(req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.write_bucket.consume(data.len() as u64);
        self.inner.write(req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    // Every other operation passes through unmodified (§4.5).

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEntry) {
        self.inner.lookup(req, parent, name, reply);
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inner.forget(req, ino, nlookup);
    }

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        self.inner.batch_forget(req, nodes);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: fuser::ReplyAttr) {
        self.inner.getattr(req, ino, fh, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        crtime: Option<std::time::SystemTime>,
        chgtime: Option<std::time::SystemTime>,
        bkuptime: Option<std::time::SystemTime>,
        flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.inner.setattr(
            req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime,
            flags, reply,
        );
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.inner.readlink(req, ino, reply);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.inner.mknod(req, parent, name, mode, umask, rdev, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.inner.mkdir(req, parent, name, mode, umask, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        self.inner.unlink(req, parent, name, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        self.inner.rmdir(req, parent, name, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        self.inner.symlink(req, parent, link_name, target, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.inner.rename(req, parent, name, newparent, newname, flags, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.inner.link(req, ino, newparent, newname, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        self.inner.open(req, ino, flags, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: fuser::ReplyEmpty) {
        self.inner.flush(req, ino, fh, lock_owner, reply);
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.inner.release(req, ino, fh, flags, lock_owner, flush, reply);
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty) {
        self.inner.fsync(req, ino, fh, datasync, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        self.inner.opendir(req, ino, flags, reply);
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: fuser::ReplyDirectory) {
        self.inner.readdir(req, ino, fh, offset, reply);
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectoryPlus,
    ) {
        self.inner.readdirplus(req, ino, fh, offset, reply);
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: fuser::ReplyEmpty) {
        self.inner.releasedir(req, ino, fh, flags, reply);
    }

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty) {
        self.inner.fsyncdir(req, ino, fh, datasync, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.inner.access(req, ino, mask, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        self.inner.statfs(req, ino, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.inner.create(req, parent, name, mode, umask, flags, reply);
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.inner.fallocate(req, ino, fh, offset, length, mode, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        self.inner.copy_file_range(
            req, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags, reply,
        );
    }

    fn lseek(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, whence: i32, reply: fuser::ReplyLseek) {
        self.inner.lseek(req, ino, fh, offset, whence, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: fuser::ReplyXattr) {
        self.inner.getxattr(req, ino, name, size, reply);
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.inner.setxattr(req, ino, name, value, flags, position, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        self.inner.listxattr(req, ino, size, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        self.inner.removexattr(req, ino, name, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: fuser::ReplyLock,
    ) {
        self.inner.getlk(req, ino, fh, lock_owner, start, end, typ, pid, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.inner.setlk(req, ino, fh, lock_owner, start, end, typ, pid, sleep, reply);
    }

    fn flock(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, op: i32, reply: fuser::ReplyEmpty) {
        self.inner.flock(req, ino, fh, lock_owner, op, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_within_capacity_does_not_block() {
        let bucket = TokenBucket::new(4096, 4096);
        bucket.consume(1000);
        assert_eq!(bucket.count(), 3096);
    }

    #[test]
    fn replenish_caps_at_capacity() {
        let bucket = TokenBucket::new(100, 1000);
        bucket.consume(100);
        assert_eq!(bucket.count(), 0);
        bucket.replenish(Duration::from_secs(1));
        assert_eq!(bucket.count(), 100);
    }

    #[test]
    fn replenish_partial_interval_scales_down() {
        let bucket = TokenBucket::new(1_000_000, 4096);
        bucket.consume(1_000_000);
        bucket.replenish(Duration::from_millis(100));
        // 4096 bytes/sec * 0.1s = ~409 tokens.
        assert!(bucket.count() > 0 && bucket.count() < 1000);
    }

    #[test]
    fn large_request_waits_across_replenishments() {
        let bucket = Arc::new(TokenBucket::new(10, 10));
        bucket.consume(10);
        let waiter = {
            let bucket = Arc::clone(&bucket);
            std::thread::spawn(move || bucket.consume(25))
        };
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(20));
            bucket.replenish(Duration::from_millis(20));
        }
        waiter.join().unwrap();
    }
}
