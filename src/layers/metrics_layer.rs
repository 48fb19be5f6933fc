//! Ambient per-operation call/byte counters.
//!
//! Unconditionally wraps the stack (alongside [`super::TracingFs`]) so every
//! mount has a baseline counter surface, independent of whether the
//! fault/throttle layers are enabled. A snapshot is logged at `destroy`.
//!
//! `fuser`'s `Reply*` types are consumed on `ok()`/`error()`/etc. without
//! handing the wrapping layer a look at which was called, so this layer
//! counts calls and (for read/write) requested bytes rather than per-call
//! success/failure — the latter would need a reply-sender shim around every
//! method, which no layer here otherwise needs.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};

use fuser::{Filesystem, ReplyEmpty, ReplyWrite, Request};
use tracing::info;

/// Counters for one operation kind: calls, and (for read/write) bytes
/// observed in the forwarded request.
#[derive(Debug, Default)]
struct OpCounters {
    calls: AtomicU64,
    bytes: AtomicU64,
}

impl OpCounters {
    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.calls.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Wraps `inner`, counting calls/errors/bytes per operation kind. Never
/// changes behaviour — like [`super::TracingFs`], this layer is always safe
/// to stack above any combination of the others.
pub struct MetricsFs {
    inner: Box<dyn Filesystem + Send + Sync>,
    read: OpCounters,
    write: OpCounters,
    getattr: OpCounters,
    lookup: OpCounters,
    readdir: OpCounters,
    other: OpCounters,
}

impl MetricsFs {
    pub fn new(inner: Box<dyn Filesystem + Send + Sync>) -> Self {
        Self {
            inner,
            read: OpCounters::default(),
            write: OpCounters::default(),
            getattr: OpCounters::default(),
            lookup: OpCounters::default(),
            readdir: OpCounters::default(),
            other: OpCounters::default(),
        }
    }

    fn log_snapshot(&self) {
        let (rc, rb) = self.read.snapshot();
        let (wc, wb) = self.write.snapshot();
        let (gc, _) = self.getattr.snapshot();
        let (lc, _) = self.lookup.snapshot();
        let (dc, _) = self.readdir.snapshot();
        let (oc, _) = self.other.snapshot();
        info!(
            read.calls = rc, read.bytes = rb,
            write.calls = wc, write.bytes = wb,
            getattr.calls = gc,
            lookup.calls = lc,
            readdir.calls = dc,
            other.calls = oc,
            "filesystem metrics snapshot"
        );
    }
}

impl Filesystem for MetricsFs {
    fn init(&mut self, req: &Request<'_>, config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        self.inner.init(req, config)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
        self.log_snapshot();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEntry) {
        self.lookup.record_call();
        self.inner.lookup(req, parent, name, reply);
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inner.forget(req, ino, nlookup);
    }

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        self.inner.batch_forget(req, nodes);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: fuser::ReplyAttr) {
        self.getattr.record_call();
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
        self.other.record_call();
        self.inner.setattr(
            req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime,
            flags, reply,
        );
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.other.record_call();
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
        self.other.record_call();
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
        self.other.record_call();
        self.inner.mkdir(req, parent, name, mode, umask, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.unlink(req, parent, name, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.other.record_call();
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
        self.other.record_call();
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
        reply: ReplyEmpty,
    ) {
        self.other.record_call();
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
        self.other.record_call();
        self.inner.link(req, ino, newparent, newname, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        self.other.record_call();
        self.inner.open(req, ino, flags, reply);
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
        reply: fuser::ReplyData,
    ) {
        self.read.record_call();
        self.read.record_bytes(u64::from(size));
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
        self.write.record_call();
        self.write.record_bytes(data.len() as u64);
        self.inner.write(req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        self.other.record_call();
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
        reply: ReplyEmpty,
    ) {
        self.other.record_call();
        self.inner.release(req, ino, fh, flags, lock_owner, flush, reply);
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.fsync(req, ino, fh, datasync, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        self.other.record_call();
        self.inner.opendir(req, ino, flags, reply);
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: fuser::ReplyDirectory) {
        self.readdir.record_call();
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
        self.readdir.record_call();
        self.inner.readdirplus(req, ino, fh, offset, reply);
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.releasedir(req, ino, fh, flags, reply);
    }

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.fsyncdir(req, ino, fh, datasync, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.access(req, ino, mask, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        self.other.record_call();
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
        self.other.record_call();
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
        reply: ReplyEmpty,
    ) {
        self.other.record_call();
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
        self.other.record_call();
        self.inner.copy_file_range(
            req, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags, reply,
        );
    }

    fn lseek(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, whence: i32, reply: fuser::ReplyLseek) {
        self.other.record_call();
        self.inner.lseek(req, ino, fh, offset, whence, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: fuser::ReplyXattr) {
        self.other.record_call();
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
        reply: ReplyEmpty,
    ) {
        self.other.record_call();
        self.inner.setxattr(req, ino, name, value, flags, position, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        self.other.record_call();
        self.inner.listxattr(req, ino, size, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        self.other.record_call();
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
        self.other.record_call();
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
        reply: ReplyEmpty,
    ) {
        self.other.record_call();
        self.inner.setlk(req, ino, fh, lock_owner, start, end, typ, pid, sleep, reply);
    }

    fn flock(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, op: i32, reply: ReplyEmpty) {
        self.other.record_call();
        self.inner.flock(req, ino, fh, lock_owner, op, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = OpCounters::default();
        assert_eq!(counters.snapshot(), (0, 0));
    }

    #[test]
    fn record_call_and_bytes_accumulate() {
        let counters = OpCounters::default();
        counters.record_call();
        counters.record_call();
        counters.record_bytes(128);
        assert_eq!(counters.snapshot(), (2, 128));
    }
}
