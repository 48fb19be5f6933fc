//! Interception layers.
//!
//! Each layer wraps an `inner: Box<dyn Filesystem>` and implements
//! `fuser::Filesystem` itself, forwarding most calls to `inner` while
//! hooking the subset it cares about. Layers compose bottom-up: the
//! passthrough filesystem sits at the bottom, wrapped by zero or more
//! fault/throttle layers, wrapped by the always-on tracing and metrics
//! layers.

pub mod fault;
pub mod metrics_layer;
pub mod throttle;
pub mod tracing_layer;

pub use fault::FaultInjectingFs;
pub use metrics_layer::MetricsFs;
pub use throttle::ThrottlingFs;
pub use tracing_layer::TracingFs;

use fuser::Filesystem;

/// Unwraps a runtime-assembled `Box<dyn Filesystem>` stack back into a
/// single concrete [`Filesystem`] implementor, so it can be handed to
/// `fuser::spawn_mount2`'s generic `FS: Filesystem` bound. Every other
/// layer already holds its `inner` this way; this is the same delegation
/// shape applied one more time at the top of the stack, where the caller
/// (not a fixed struct) decides which layers were actually included.
pub struct DynFs(pub Box<dyn Filesystem + Send + Sync>);

macro_rules! forward {
    ($name:ident(&mut self $(, $arg:ident : $ty:ty)* $(,)?)) => {
        fn $name(&mut self $(, $arg: $ty)*) {
            self.0.$name($($arg),*);
        }
    };
}

impl Filesystem for DynFs {
    fn init(&mut self, req: &fuser::Request<'_>, config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        self.0.init(req, config)
    }

    fn destroy(&mut self) {
        self.0.destroy();
    }

    forward!(lookup(&mut self, req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEntry));
    forward!(forget(&mut self, req: &fuser::Request<'_>, ino: u64, nlookup: u64));
    forward!(batch_forget(&mut self, req: &fuser::Request<'_>, nodes: &[fuser::fuse_forget_one]));
    forward!(getattr(&mut self, req: &fuser::Request<'_>, ino: u64, fh: Option<u64>, reply: fuser::ReplyAttr));

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
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
        self.0.setattr(
            req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime,
            flags, reply,
        );
    }

    forward!(readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData));
    forward!(mknod(&mut self, req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, mode: u32, umask: u32, rdev: u32, reply: fuser::ReplyEntry));
    forward!(mkdir(&mut self, req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, mode: u32, umask: u32, reply: fuser::ReplyEntry));
    forward!(unlink(&mut self, req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEmpty));
    forward!(rmdir(&mut self, req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEmpty));
    forward!(symlink(&mut self, req: &fuser::Request<'_>, parent: u64, link_name: &std::ffi::OsStr, target: &std::path::Path, reply: fuser::ReplyEntry));

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.0.rename(req, parent, name, newparent, newname, flags, reply);
    }

    forward!(link(&mut self, req: &fuser::Request<'_>, ino: u64, newparent: u64, newname: &std::ffi::OsStr, reply: fuser::ReplyEntry));
    forward!(open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen));

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.0.read(req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.0.write(req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    forward!(flush(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: fuser::ReplyEmpty));

    #[allow(clippy::too_many_arguments)]
    fn release(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.0.release(req, ino, fh, flags, lock_owner, flush, reply);
    }

    forward!(fsync(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty));
    forward!(opendir(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen));
    forward!(readdir(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, offset: i64, reply: fuser::ReplyDirectory));
    forward!(readdirplus(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, offset: i64, reply: fuser::ReplyDirectoryPlus));
    forward!(releasedir(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, flags: i32, reply: fuser::ReplyEmpty));
    forward!(fsyncdir(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, datasync: bool, reply: fuser::ReplyEmpty));
    forward!(access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty));
    forward!(statfs(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs));

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.0.create(req, parent, name, mode, umask, flags, reply);
    }

    forward!(fallocate(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, offset: i64, length: i64, mode: i32, reply: fuser::ReplyEmpty));

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        req: &fuser::Request<'_>,
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
        self.0.copy_file_range(
            req, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags, reply,
        );
    }

    forward!(lseek(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, offset: i64, whence: i32, reply: fuser::ReplyLseek));
    forward!(getxattr(&mut self, req: &fuser::Request<'_>, ino: u64, name: &std::ffi::OsStr, size: u32, reply: fuser::ReplyXattr));

    #[allow(clippy::too_many_arguments)]
    fn setxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &std::ffi::OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.0.setxattr(req, ino, name, value, flags, position, reply);
    }

    forward!(listxattr(&mut self, req: &fuser::Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr));
    forward!(removexattr(&mut self, req: &fuser::Request<'_>, ino: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEmpty));

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: fuser::ReplyLock,
    ) {
        self.0.getlk(req, ino, fh, lock_owner, start, end, typ, pid, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        req: &fuser::Request<'_>,
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
        self.0.setlk(req, ino, fh, lock_owner, start, end, typ, pid, sleep, reply);
    }

    forward!(flock(&mut self, req: &fuser::Request<'_>, ino: u64, fh: u64, lock_owner: u64, op: i32, reply: fuser::ReplyEmpty));
}
