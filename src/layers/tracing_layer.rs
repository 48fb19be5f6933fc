//! Ambient span-per-operation tracing.
//!
//! Every request opens a `tracing` span carrying the operation name and
//! inode identifier as fields (§3's "operation kind + correlation
//! identifiers" request-context contract), then forwards. This layer never
//! changes behaviour — only observes it — so it is always safe to stack
//! above any combination of the other layers.

use std::ffi::OsStr;
use std::time::SystemTime;

use fuser::{Filesystem, Request};
use tracing::{span, Level};

pub struct TracingFs {
    inner: Box<dyn Filesystem + Send + Sync>,
}

impl TracingFs {
    pub fn new(inner: Box<dyn Filesystem + Send + Sync>) -> Self {
        Self { inner }
    }
}

macro_rules! traced {
    ($self:ident, $op:literal, $ino:expr, $body:expr) => {{
        let _span = span!(Level::DEBUG, $op, inode = $ino).entered();
        $body
    }};
}

impl Filesystem for TracingFs {
    fn init(&mut self, req: &Request<'_>, config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        let _span = span!(Level::INFO, "init").entered();
        self.inner.init(req, config)
    }

    fn destroy(&mut self) {
        let _span = span!(Level::INFO, "destroy").entered();
        self.inner.destroy();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEntry) {
        traced!(self, "lookup", parent, {
            self.inner.lookup(req, parent, name, reply);
        })
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        traced!(self, "forget", ino, {
            self.inner.forget(req, ino, nlookup);
        })
    }

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        let _span = span!(Level::DEBUG, "batch_forget", count = nodes.len()).entered();
        self.inner.batch_forget(req, nodes);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: fuser::ReplyAttr) {
        traced!(self, "getattr", ino, {
            self.inner.getattr(req, ino, fh, reply);
        })
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
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        traced!(self, "setattr", ino, {
            self.inner.setattr(
                req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime,
                bkuptime, flags, reply,
            );
        })
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyData) {
        traced!(self, "readlink", ino, {
            self.inner.readlink(req, ino, reply);
        })
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
        traced!(self, "mknod", parent, {
            self.inner.mknod(req, parent, name, mode, umask, rdev, reply);
        })
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
        traced!(self, "mkdir", parent, {
            self.inner.mkdir(req, parent, name, mode, umask, reply);
        })
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        traced!(self, "unlink", parent, {
            self.inner.unlink(req, parent, name, reply);
        })
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        traced!(self, "rmdir", parent, {
            self.inner.rmdir(req, parent, name, reply);
        })
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        traced!(self, "symlink", parent, {
            self.inner.symlink(req, parent, link_name, target, reply);
        })
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
        traced!(self, "rename", parent, {
            self.inner.rename(req, parent, name, newparent, newname, flags, reply);
        })
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        traced!(self, "link", ino, {
            self.inner.link(req, ino, newparent, newname, reply);
        })
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        traced!(self, "open", ino, {
            self.inner.open(req, ino, flags, reply);
        })
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
        let _span = span!(Level::DEBUG, "read", inode = ino, offset, size).entered();
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
        reply: fuser::ReplyWrite,
    ) {
        let _span = span!(Level::DEBUG, "write", inode = ino, offset, len = data.len()).entered();
        self.inner.write(req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: fuser::ReplyEmpty) {
        traced!(self, "flush", ino, {
            self.inner.flush(req, ino, fh, lock_owner, reply);
        })
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
        traced!(self, "release", ino, {
            self.inner.release(req, ino, fh, flags, lock_owner, flush, reply);
        })
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty) {
        traced!(self, "fsync", ino, {
            self.inner.fsync(req, ino, fh, datasync, reply);
        })
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        traced!(self, "opendir", ino, {
            self.inner.opendir(req, ino, flags, reply);
        })
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: fuser::ReplyDirectory) {
        traced!(self, "readdir", ino, {
            self.inner.readdir(req, ino, fh, offset, reply);
        })
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectoryPlus,
    ) {
        traced!(self, "readdirplus", ino, {
            self.inner.readdirplus(req, ino, fh, offset, reply);
        })
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: fuser::ReplyEmpty) {
        traced!(self, "releasedir", ino, {
            self.inner.releasedir(req, ino, fh, flags, reply);
        })
    }

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty) {
        traced!(self, "fsyncdir", ino, {
            self.inner.fsyncdir(req, ino, fh, datasync, reply);
        })
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        traced!(self, "access", ino, {
            self.inner.access(req, ino, mask, reply);
        })
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        traced!(self, "statfs", ino, {
            self.inner.statfs(req, ino, reply);
        })
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
        traced!(self, "create", parent, {
            self.inner.create(req, parent, name, mode, umask, flags, reply);
        })
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
        traced!(self, "fallocate", ino, {
            self.inner.fallocate(req, ino, fh, offset, length, mode, reply);
        })
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
        reply: fuser::ReplyWrite,
    ) {
        traced!(self, "copy_file_range", ino_in, {
            self.inner.copy_file_range(
                req, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags, reply,
            );
        })
    }

    fn lseek(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, whence: i32, reply: fuser::ReplyLseek) {
        traced!(self, "lseek", ino, {
            self.inner.lseek(req, ino, fh, offset, whence, reply);
        })
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: fuser::ReplyXattr) {
        traced!(self, "getxattr", ino, {
            self.inner.getxattr(req, ino, name, size, reply);
        })
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
        traced!(self, "setxattr", ino, {
            self.inner.setxattr(req, ino, name, value, flags, position, reply);
        })
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        traced!(self, "listxattr", ino, {
            self.inner.listxattr(req, ino, size, reply);
        })
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        traced!(self, "removexattr", ino, {
            self.inner.removexattr(req, ino, name, reply);
        })
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
        traced!(self, "getlk", ino, {
            self.inner.getlk(req, ino, fh, lock_owner, start, end, typ, pid, reply);
        })
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
        traced!(self, "setlk", ino, {
            self.inner.setlk(req, ino, fh, lock_owner, start, end, typ, pid, sleep, reply);
        })
    }

    fn flock(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, op: i32, reply: fuser::ReplyEmpty) {
        traced!(self, "flock", ino, {
            self.inner.flock(req, ino, fh, lock_owner, op, reply);
        })
    }
}
