//! The passthrough layer: implements every low-level filesystem operation
//! against a source directory via descriptor-relative (`*at`) syscalls.
//!
//! No path-string resolution from the mount root is ever performed —
//! every operation resolves its parent/target through the inode table's
//! `O_PATH` descriptors and a `*at` syscall relative to them.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen,
    ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, trace, warn};

use crate::error::ToErrno;
use crate::handles::{DirHandle, FileHandle, HandleTable};
use crate::inode::{InodeTable, ROOT_INODE};

/// How aggressively the kernel may cache attributes/dentries for this mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Direct I/O; nothing is cached across calls.
    Never,
    /// Honour a per-file-handle timeout (the default).
    Auto,
    /// Keep kernel caches alive across closes.
    Always,
}

/// Mount-time options controlling caching, writeback and lock emulation.
#[derive(Debug, Clone)]
pub struct PassthroughOptions {
    pub source: std::path::PathBuf,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
    pub cache: CacheMode,
    pub writeback: bool,
    pub flock: bool,
    pub xattr: bool,
}

impl Default for PassthroughOptions {
    fn default() -> Self {
        Self {
            source: std::path::PathBuf::from("."),
            attr_timeout: Duration::from_secs(1),
            entry_timeout: Duration::from_secs(1),
            cache: CacheMode::Auto,
            writeback: false,
            flock: false,
            xattr: true,
        }
    }
}

/// The bottom layer of the stack: translates FUSE requests into syscalls
/// against `options.source`. Its "next" pointer is null — it never
/// delegates.
pub struct PassthroughFs {
    inodes: InodeTable,
    files: HandleTable<FileHandle>,
    dirs: HandleTable<DirHandle>,
    options: PassthroughOptions,
    writeback_active: bool,
}

/// Converts the thread-local `errno` left by the last failed syscall into
/// the errno a FUSE reply should carry, via the same [`FsError`]/[`ToErrno`]
/// mapping every other `io::Error` in this module goes through.
///
/// [`FsError`]: crate::error::FsError
fn last_errno() -> i32 {
    io::Error::last_os_error().to_errno()
}

fn name_to_cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn stat_at(dirfd: RawFd, name: Option<&CStr>, follow: bool) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let (path, flags) = match name {
        Some(c) => (c.as_ptr(), 0),
        None => (c"".as_ptr(), libc::AT_EMPTY_PATH),
    };
    let flags = flags | if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let rc = unsafe { libc::fstatat(dirfd, path, &mut st, flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn mode_to_file_type(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn systime_from(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0)
    }
}

fn stat_to_attr(ino: u64, st: &libc::stat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: systime_from(st.st_atime, st.st_atime_nsec),
        mtime: systime_from(st.st_mtime, st.st_mtime_nsec),
        ctime: systime_from(st.st_ctime, st.st_ctime_nsec),
        crtime: systime_from(st.st_ctime, st.st_ctime_nsec),
        kind: mode_to_file_type(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

impl PassthroughFs {
    pub fn new(options: PassthroughOptions) -> io::Result<Self> {
        let c_path = CString::new(options.source.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let root_fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if root_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let root_fd = unsafe { OwnedFd::from_raw_fd(root_fd) };
        let st = stat_at(root_fd.as_raw_fd(), None, true)?;
        let root_key = (st.st_dev, st.st_ino);

        Ok(Self {
            inodes: InodeTable::new(root_fd, root_key),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
            options,
            writeback_active: false,
        })
    }

    fn resolve(&self, ino: u64) -> Result<RawFd, i32> {
        self.inodes.resolve(ino).ok_or(libc::ENOENT)
    }

    /// Shared implementation of `lookup`: opens `name` relative to
    /// `parent`'s descriptor with `O_PATH | O_NOFOLLOW`, stats it, and
    /// finds-or-inserts the resulting inode. `bump_lookup` controls whether
    /// a freshly-discovered entry enters the table with `nlookup = 1`
    /// (`lookup`/`create`/`mkdir`/`symlink`/`link`) or `nlookup = 0`
    /// (plain `readdir` entries, per FUSE semantics).
    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<(u64, FileAttr), i32> {
        let parent_fd = self.resolve(parent)?;
        let cname = name_to_cstring(name).map_err(|_| libc::EINVAL)?;

        let open_fd = unsafe {
            libc::openat(
                parent_fd,
                cname.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if open_fd < 0 {
            return Err(last_errno());
        }
        let open_fd = unsafe { OwnedFd::from_raw_fd(open_fd) };

        let st = match stat_at(open_fd.as_raw_fd(), None, false) {
            Ok(st) => st,
            Err(e) => return Err(e.to_errno()),
        };
        let key = (st.st_dev, st.st_ino);
        let attr = stat_to_attr(0, &st);
        let (id, _n) = self.inodes.get_or_insert(key, open_fd);
        Ok((id, FileAttr { ino: id, ..attr }))
    }

    fn entry_reply(&self, reply: ReplyEntry, result: Result<(u64, FileAttr), i32>) {
        match result {
            Ok((_id, attr)) => reply.entry(&self.options.entry_timeout, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }
}

impl Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if self.options.writeback {
            if config.add_capabilities(fuser::consts::FUSE_WRITEBACK_CACHE).is_ok() {
                self.writeback_active = true;
            }
        }
        if self.options.flock {
            let _ = config.add_capabilities(fuser::consts::FUSE_FLOCK_LOCKS);
        }
        debug!(writeback = self.writeback_active, flock = self.options.flock, "mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        for handle in self.files.drain() {
            drop(handle);
        }
        for handle in self.dirs.drain() {
            drop(handle);
        }
        self.inodes.clear();
        debug!("unmounted, all descriptors closed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        let result = self.do_lookup(parent, name);
        self.entry_reply(reply, result);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        match stat_at(fd, None, false) {
            Ok(st) => reply.attr(&self.options.attr_timeout, &stat_to_attr(ino, &st)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let n = unsafe {
            libc::readlinkat(
                fd,
                c"".as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        buf.truncate(n as usize);
        reply.data(&buf);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path_fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{path_fd}\0");
        let open_flags = adjusted_open_flags(flags, self.writeback_active);
        let fd = unsafe {
            libc::open(
                proc_path.as_ptr() as *const libc::c_char,
                open_flags | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return reply.error(last_errno());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let direct_io = matches!(self.options.cache, CacheMode::Never);
        let keep_cache = matches!(self.options.cache, CacheMode::Always);
        let handle = self.files.insert(FileHandle {
            fd,
            writeback_cache: self.writeback_active,
        });
        reply.opened(handle, open_reply_flags(direct_io, keep_cache));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let mut buf = vec![0u8; size as usize];
        let n = unsafe {
            libc::pread(
                handle.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset,
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        buf.truncate(n as usize);
        reply.data(&buf);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let n = unsafe {
            libc::pwrite(
                handle.raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset,
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        reply.written(n as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        // Close a dup of the descriptor to surface any pending writeback
        // error, per the §4.2 file-I/O contract.
        let dup = unsafe { libc::dup(handle.raw_fd()) };
        if dup < 0 {
            return reply.error(last_errno());
        }
        let rc = unsafe { libc::close(dup) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.files.remove(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path_fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{path_fd}\0");
        let fd = unsafe {
            libc::open(
                proc_path.as_ptr() as *const libc::c_char,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return reply.error(last_errno());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let handle = self.dirs.insert(DirHandle::new(fd));
        reply.opened(handle, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(mut handle) = self.dirs.get_mut(fh) else {
            return reply.error(libc::EBADF);
        };
        let Some(raw_fd) = handle.raw_fd() else {
            return reply.error(libc::EBADF);
        };

        let dir = unsafe { libc::fdopendir(libc::dup(raw_fd)) };
        if dir.is_null() {
            return reply.error(last_errno());
        }
        if offset != handle.last_offset {
            unsafe { libc::seekdir(dir, offset) };
        }

        let mut next_offset = offset;
        loop {
            unsafe { *libc::__errno_location() = 0 };
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            let e = unsafe { &*entry };
            let name = unsafe { CStr::from_ptr(e.d_name.as_ptr()) };
            let kind = match e.d_type {
                libc::DT_DIR => FileType::Directory,
                libc::DT_LNK => FileType::Symlink,
                libc::DT_REG => FileType::RegularFile,
                libc::DT_FIFO => FileType::NamedPipe,
                libc::DT_SOCK => FileType::Socket,
                libc::DT_CHR => FileType::CharDevice,
                libc::DT_BLK => FileType::BlockDevice,
                _ => FileType::RegularFile,
            };
            next_offset = unsafe { libc::telldir(dir) };
            let full = reply.add(ino, next_offset, kind, OsStr::from_bytes(name.to_bytes()));
            if full {
                break;
            }
        }
        unsafe { libc::closedir(dir) };
        handle.last_offset = next_offset;
        reply.ok();
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let Some(mut handle) = self.dirs.get_mut(fh) else {
            return reply.error(libc::EBADF);
        };
        let Some(raw_fd) = handle.raw_fd() else {
            return reply.error(libc::EBADF);
        };

        let dir = unsafe { libc::fdopendir(libc::dup(raw_fd)) };
        if dir.is_null() {
            return reply.error(last_errno());
        }
        if offset != handle.last_offset {
            unsafe { libc::seekdir(dir, offset) };
        }
        drop(handle);

        let mut next_offset = offset;
        loop {
            unsafe { *libc::__errno_location() = 0 };
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            let e = unsafe { &*entry };
            let name_c = unsafe { CStr::from_ptr(e.d_name.as_ptr()) };
            let name = OsStr::from_bytes(name_c.to_bytes());
            next_offset = unsafe { libc::telldir(dir) };

            if name == "." || name == ".." {
                continue;
            }

            match self.do_lookup(ino, name) {
                Ok((child_ino, attr)) => {
                    let full = reply.add(
                        child_ino,
                        next_offset,
                        name,
                        &self.options.entry_timeout,
                        &attr,
                        0,
                    );
                    if full {
                        // Entry didn't fit: undo the lookup-count bump this
                        // loop iteration just performed.
                        self.inodes.forget(child_ino, 1);
                        break;
                    }
                }
                Err(_) => continue,
            }
        }
        unsafe { libc::closedir(dir) };
        if let Some(mut handle) = self.dirs.get_mut(fh) {
            handle.last_offset = next_offset;
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dirs.remove(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let rc = unsafe { libc::fsync(fd) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let rc = if datasync {
            unsafe { libc::fdatasync(handle.raw_fd()) }
        } else {
            unsafe { libc::fsync(handle.raw_fd()) }
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let rc = unsafe { libc::access(proc_path.as_ptr() as *const libc::c_char, mask) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");

        if let Some(mode) = mode {
            let rc = unsafe {
                libc::fchmodat(libc::AT_FDCWD, proc_path.as_ptr() as *const libc::c_char, mode, 0)
            };
            if rc != 0 {
                return reply.error(last_errno());
            }
        }

        if uid.is_some() || gid.is_some() {
            let rc = unsafe {
                libc::fchownat(
                    libc::AT_FDCWD,
                    proc_path.as_ptr() as *const libc::c_char,
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                    0,
                )
            };
            if rc != 0 {
                return reply.error(last_errno());
            }
        }

        if let Some(size) = size {
            let target_fd = if let Some(fh) = fh {
                self.files.get(fh).map(|h| h.raw_fd())
            } else {
                None
            };
            let rc = match target_fd {
                Some(raw) => unsafe { libc::ftruncate(raw, size as i64) },
                None => unsafe {
                    let open_fd = libc::open(proc_path.as_ptr() as *const libc::c_char, libc::O_WRONLY);
                    if open_fd < 0 {
                        return reply.error(last_errno());
                    }
                    let rc = libc::ftruncate(open_fd, size as i64);
                    libc::close(open_fd);
                    rc
                },
            };
            if rc != 0 {
                return reply.error(last_errno());
            }
        }

        if atime.is_some() || mtime.is_some() {
            let times = [time_or_now_to_timespec(atime), time_or_now_to_timespec(mtime)];
            let rc = unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    proc_path.as_ptr() as *const libc::c_char,
                    times.as_ptr(),
                    0,
                )
            };
            if rc != 0 {
                return reply.error(last_errno());
            }
        }

        match stat_at(fd, None, false) {
            Ok(st) => reply.attr(&self.options.attr_timeout, &stat_to_attr(ino, &st)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let rc = unsafe { libc::statvfs(proc_path.as_ptr() as *const libc::c_char, &mut st) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.statfs(
            st.f_blocks as u64,
            st.f_bfree as u64,
            st.f_bavail as u64,
            st.f_files as u64,
            st.f_ffree as u64,
            st.f_bsize as u32,
            st.f_namemax as u32,
            st.f_frsize as u32,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let open_flags = adjusted_open_flags(flags, self.writeback_active) | libc::O_CREAT | libc::O_EXCL;
        let fd = unsafe { libc::openat(parent_fd, cname.as_ptr(), open_flags | libc::O_CLOEXEC, mode) };
        if fd < 0 {
            return reply.error(last_errno());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let st = match stat_at(fd.as_raw_fd(), None, false) {
            Ok(st) => st,
            Err(e) => return reply.error(e.to_errno()),
        };
        let key = (st.st_dev, st.st_ino);

        // Obtain a path-only descriptor for the inode table, distinct from
        // the read/write descriptor handed to the caller.
        let path_fd = unsafe {
            libc::openat(parent_fd, cname.as_ptr(), libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC)
        };
        if path_fd < 0 {
            return reply.error(last_errno());
        }
        let path_fd = unsafe { OwnedFd::from_raw_fd(path_fd) };
        let (ino, _n) = self.inodes.get_or_insert(key, path_fd);
        let attr = FileAttr {
            ino,
            ..stat_to_attr(ino, &st)
        };

        let handle = self.files.insert(FileHandle {
            fd,
            writeback_cache: self.writeback_active,
        });
        reply.created(&self.options.entry_timeout, &attr, 0, handle, 0);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };

        let rc = match mode as libc::mode_t & libc::S_IFMT {
            libc::S_IFDIR => unsafe { libc::mkdirat(parent_fd, cname.as_ptr(), mode & 0o7777) },
            libc::S_IFIFO => unsafe { libc::mkfifoat(parent_fd, cname.as_ptr(), mode & 0o7777) },
            _ => unsafe { libc::mknodat(parent_fd, cname.as_ptr(), mode, rdev as libc::dev_t) },
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        let result = self.do_lookup(parent, name);
        self.entry_reply(reply, result);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe { libc::mkdirat(parent_fd, cname.as_ptr(), mode & 0o7777) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        let result = self.do_lookup(parent, name);
        self.entry_reply(reply, result);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe { libc::unlinkat(parent_fd, cname.as_ptr(), 0) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe { libc::unlinkat(parent_fd, cname.as_ptr(), libc::AT_REMOVEDIR) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(link_name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let ctarget = match CString::new(target.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe { libc::symlinkat(ctarget.as_ptr(), parent_fd, cname.as_ptr()) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        let result = self.do_lookup(parent, link_name);
        self.entry_reply(reply, result);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let src_fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let dst_parent_fd = match self.resolve(newparent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(newname) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe {
            libc::linkat(
                src_fd,
                c"".as_ptr(),
                dst_parent_fd,
                cname.as_ptr(),
                libc::AT_EMPTY_PATH,
            )
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        let result = self.do_lookup(newparent, newname);
        self.entry_reply(reply, result);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // §4.2: rename rejects any nonzero flags with EINVAL.
            return reply.error(libc::EINVAL);
        }
        let src_parent_fd = match self.resolve(parent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let dst_parent_fd = match self.resolve(newparent) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let cnewname = match name_to_cstring(newname) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe {
            libc::renameat(
                src_parent_fd,
                cname.as_ptr(),
                dst_parent_fd,
                cnewname.as_ptr(),
            )
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let rc = unsafe { libc::fallocate(handle.raw_fd(), mode, offset, length) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let Some(handle_in) = self.files.get(fh_in) else {
            return reply.error(libc::EBADF);
        };
        let Some(handle_out) = self.files.get(fh_out) else {
            return reply.error(libc::EBADF);
        };
        let mut off_in = offset_in;
        let mut off_out = offset_out;
        let n = unsafe {
            libc::copy_file_range(
                handle_in.raw_fd(),
                &mut off_in,
                handle_out.raw_fd(),
                &mut off_out,
                len as usize,
                0,
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        reply.written(n as u32);
    }

    fn lseek(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, whence: i32, reply: ReplyLseek) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let pos = unsafe { libc::lseek(handle.raw_fd(), offset, whence) };
        if pos < 0 {
            return reply.error(last_errno());
        }
        reply.offset(pos);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        if !self.options.xattr {
            return reply.error(libc::ENOTSUP);
        }
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let mut buf = vec![0u8; size.max(1) as usize];
        let n = unsafe {
            libc::getxattr(
                proc_path.as_ptr() as *const libc::c_char,
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        if size == 0 {
            reply.size(n as u32);
        } else {
            buf.truncate(n as usize);
            reply.data(&buf);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        if !self.options.xattr {
            return reply.error(libc::ENOTSUP);
        }
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe {
            libc::setxattr(
                proc_path.as_ptr() as *const libc::c_char,
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        if !self.options.xattr {
            return reply.error(libc::ENOTSUP);
        }
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let mut buf = vec![0u8; size.max(1) as usize];
        let n = unsafe {
            libc::listxattr(
                proc_path.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return reply.error(last_errno());
        }
        if size == 0 {
            reply.size(n as u32);
        } else {
            buf.truncate(n as usize);
            reply.data(&buf);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        if !self.options.xattr {
            return reply.error(libc::ENOTSUP);
        }
        let fd = match self.resolve(ino) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e),
        };
        let proc_path = format!("/proc/self/fd/{fd}\0");
        let cname = match name_to_cstring(name) {
            Ok(c) => c,
            Err(_) => return reply.error(libc::EINVAL),
        };
        let rc = unsafe {
            libc::removexattr(proc_path.as_ptr() as *const libc::c_char, cname.as_ptr())
        };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let mut fl = posix_flock(start, end, typ, pid);
        let rc = unsafe { libc::fcntl(handle.raw_fd(), libc::F_GETLK, &mut fl) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.locked(
            fl.l_start as u64,
            (fl.l_start + fl.l_len) as u64,
            i32::from(fl.l_type),
            fl.l_pid as u32,
        );
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let mut fl = posix_flock(start, end, typ, pid);
        let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
        let rc = unsafe { libc::fcntl(handle.raw_fd(), cmd, &mut fl) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }

    fn flock(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, op: i32, reply: ReplyEmpty) {
        if !self.options.flock {
            return reply.error(libc::ENOSYS);
        }
        let Some(handle) = self.files.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let rc = unsafe { libc::flock(handle.raw_fd(), op) };
        if rc != 0 {
            return reply.error(last_errno());
        }
        reply.ok();
    }
}

/// Builds a `struct flock` for the `getlk`/`setlk` fcntl calls from the
/// kernel's byte-range lock-request fields.
fn posix_flock(start: u64, end: u64, typ: i32, pid: u32) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    // end == 0 means "to end of file" in the FUSE protocol convention.
    fl.l_len = if end == 0 { 0 } else { (end - start) as libc::off_t };
    fl.l_pid = pid as libc::pid_t;
    fl
}

/// §4.2's "masks the write-only access mode up to read-write" writeback
/// rule: when writeback caching is active, the kernel may need to
/// read-modify-write, so `O_WRONLY` opens are widened to `O_RDWR` and
/// `O_APPEND` is dropped (the kernel itself tracks append semantics under
/// writeback).
fn adjusted_open_flags(flags: i32, writeback_active: bool) -> i32 {
    let mut flags = flags;
    if writeback_active && (flags & libc::O_ACCMODE) == libc::O_WRONLY {
        flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
    }
    if writeback_active {
        flags &= !libc::O_APPEND;
    }
    flags & !libc::O_CREAT & !libc::O_EXCL
}

fn open_reply_flags(direct_io: bool, keep_cache: bool) -> u32 {
    let mut flags = 0u32;
    if direct_io {
        flags |= fuser::consts::FOPEN_DIRECT_IO;
    }
    if keep_cache {
        flags |= fuser::consts::FOPEN_KEEP_CACHE;
    }
    flags
}

fn time_or_now_to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => {
            let dur = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: dur.as_secs() as i64,
                tv_nsec: dur.subsec_nanos() as i64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writeback_widens_write_only_to_read_write() {
        let adjusted = adjusted_open_flags(libc::O_WRONLY, true);
        assert_eq!(adjusted & libc::O_ACCMODE, libc::O_RDWR);
    }

    #[test]
    fn writeback_off_leaves_flags_untouched_besides_creat_excl() {
        let adjusted = adjusted_open_flags(libc::O_RDONLY, false);
        assert_eq!(adjusted & libc::O_ACCMODE, libc::O_RDONLY);
    }

    #[test]
    fn mode_to_file_type_covers_regular_and_dir() {
        assert_eq!(mode_to_file_type(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(mode_to_file_type(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(mode_to_file_type(libc::S_IFLNK), FileType::Symlink);
    }

    #[test]
    fn open_reply_flags_combine() {
        assert_eq!(open_reply_flags(false, false), 0);
        assert_ne!(open_reply_flags(true, false), 0);
        assert_ne!(open_reply_flags(false, true), 0);
    }

    #[test]
    fn passthrough_fs_opens_root_from_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let options = PassthroughOptions {
            source: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fs = PassthroughFs::new(options).unwrap();
        assert!(fs.resolve(ROOT_INODE).is_ok());
    }
}
