//! Randomised, observable fault injection.
//!
//! Each covered operation independently samples an "abrupt exit" die, a
//! "delay" die, and (for read/write) a "truncation" die, per call. A hit on
//! the abrupt-exit die short-circuits the call entirely; the other two dice
//! only perturb the forwarded reply.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEmpty, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

/// Fixed or time-derived seeding, set once at layer construction.
#[derive(Debug, Clone, Copy)]
pub enum SeedPolicy {
    Fixed(u64),
    TimeDerived,
}

#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability of a fault on a file operation is `1 / file_fail_rate`;
    /// zero disables file faults entirely.
    pub file_fail_rate: u32,
    /// Same, for directory operations.
    pub directory_fail_rate: u32,
    pub delay: Duration,
    pub seed: SeedPolicy,
    pub log_path: PathBuf,
}

enum FaultKind {
    AbruptExit { errno: i32, message: &'static str },
    Delay,
    Truncation,
}

impl FaultKind {
    fn label(&self) -> &'static str {
        match self {
            FaultKind::AbruptExit { message, .. } => message,
            FaultKind::Delay => "delay",
            FaultKind::Truncation => "truncation",
        }
    }
}

/// Wraps `inner`, injecting faults into the operations named in §4.4's
/// fault menu before forwarding.
pub struct FaultInjectingFs {
    inner: Box<dyn Filesystem + Send + Sync>,
    config: FaultConfig,
    rng: Mutex<StdRng>,
    log: Mutex<Option<std::fs::File>>,
}

impl FaultInjectingFs {
    pub fn new(inner: Box<dyn Filesystem + Send + Sync>, config: FaultConfig) -> Self {
        let seed = match config.seed {
            SeedPolicy::Fixed(s) => s,
            SeedPolicy::TimeDerived => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        };
        // The fault log is opened lazily and best-effort: a failure to open
        // it must never fail the enclosing request (§7).
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .map_err(|e| warn!(error = %e, path = ?config.log_path, "could not open fault log"))
            .ok();

        Self {
            inner,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            log: Mutex::new(log),
        }
    }

    /// Rolls the "abrupt exit" die for a file-scoped operation.
    fn rolls_file_fault(&self) -> bool {
        self.rolls(self.config.file_fail_rate)
    }

    fn rolls_dir_fault(&self) -> bool {
        self.rolls(self.config.directory_fail_rate)
    }

    fn rolls(&self, rate: u32) -> bool {
        if rate == 0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap();
        rng.gen_range(0..rate) == 0
    }

    /// Rolls the delay die against `rate`, the caller's file- or
    /// directory-scoped fail rate, so delay stays independently
    /// configurable from abrupt exit per the other rate of the same kind.
    fn rolls_delay(&self, rate: u32) -> bool {
        !self.config.delay.is_zero() && self.rolls(rate)
    }

    /// Emits the `tracing` event for every fault kind; only an abrupt exit
    /// also persists a line to the fault log, since only it is actually an
    /// error the operation failed to complete — delay and truncation still
    /// return a (perturbed) successful reply.
    fn record(&self, op: &str, fault: &FaultKind, ino: u64) {
        match fault {
            FaultKind::Truncation => {
                info!(operation = op, fault = fault.label(), inode = ino, "truncated {op} simulated");
            }
            _ => {
                info!(operation = op, fault = fault.label(), inode = ino, "fault injected");
            }
        }

        if !matches!(fault, FaultKind::AbruptExit { .. }) {
            return;
        }
        let Some(log) = self.log.lock().unwrap().as_mut() else {
            return;
        };
        let now = chrono_like_timestamp();
        let _ = writeln!(
            log,
            "[{now}] ERROR: {op}: {}. Inode Number: {ino}",
            fault.label()
        );
    }

    fn maybe_delay(&self, op: &str, ino: u64, rate: u32) {
        if self.rolls_delay(rate) {
            self.record(op, &FaultKind::Delay, ino);
            std::thread::sleep(self.config.delay);
        }
    }
}

/// Renders a `YYYY-MM-DD HH:MM:SS` timestamp using only `libc::localtime_r`,
/// avoiding a dependency on a dedicated time-formatting crate for one log
/// line format.
fn chrono_like_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let secs = now.as_secs() as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&secs, &mut tm) };
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

impl Filesystem for FaultInjectingFs {
    fn init(&mut self, req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.inner.init(req, config)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: fuser::ReplyEntry) {
        self.inner.lookup(req, parent, name, reply);
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inner.forget(req, ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        if self.rolls_file_fault() {
            self.record("getattr", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
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
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.rolls_file_fault() {
            self.record("setattr", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.inner.setattr(
            req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime,
            flags, reply,
        );
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if self.rolls_file_fault() {
            self.record("open", &FaultKind::AbruptExit { errno: libc::ENOENT, message: "no such entry" }, ino);
            return reply.error(libc::ENOENT);
        }
        self.maybe_delay("open", ino, self.config.file_fail_rate);
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
        reply: ReplyData,
    ) {
        if self.rolls_file_fault() {
            self.record("read", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.maybe_delay("read", ino, self.config.file_fail_rate);

        if self.rolls_file_fault() {
            self.record("read", &FaultKind::Truncation, ino);
            let mut rng = self.rng.lock().unwrap();
            let shortened = rng.gen_range(5..=14).min(size);
            let offset_shift = rng.gen_range(0..=9);
            drop(rng);
            return self
                .inner
                .read(req, ino, fh, offset + offset_shift, shortened, flags, lock_owner, reply);
        }

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
        if self.rolls_file_fault() {
            self.record("write", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.maybe_delay("write", ino, self.config.file_fail_rate);

        if self.rolls_file_fault() {
            self.record("write", &FaultKind::Truncation, ino);
            // §9's fixed defect: the teacher lineage halved a result it had
            // not yet read. `ReplyWrite` hands its result straight to the
            // kernel with no way to intercept it after the fact, so instead
            // the fault is applied before forwarding — only half the
            // payload is ever written — which makes the reported count
            // (derived from the real, now-smaller, `pwrite` result) the
            // same halved value without reading anything uninitialised.
            let half = data.len() / 2;
            return self
                .inner
                .write(req, ino, fh, offset, &data[..half], write_flags, flags, lock_owner, reply);
        }

        self.inner.write(req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        if self.rolls_file_fault() {
            self.record("flush", &FaultKind::AbruptExit { errno: libc::ENOSPC, message: "no space" }, ino);
            return reply.error(libc::ENOSPC);
        }
        self.maybe_delay("flush", ino, self.config.file_fail_rate);
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
        self.inner.release(req, ino, fh, flags, lock_owner, flush, reply);
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        if self.rolls_file_fault() {
            self.record("fsync", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.inner.fsync(req, ino, fh, datasync, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if self.rolls_dir_fault() {
            self.record("opendir", &FaultKind::AbruptExit { errno: libc::ENOENT, message: "no such entry" }, ino);
            return reply.error(libc::ENOENT);
        }
        self.maybe_delay("opendir", ino, self.config.directory_fail_rate);
        self.inner.opendir(req, ino, flags, reply);
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        if self.rolls_dir_fault() {
            self.record("readdir", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.inner.readdir(req, ino, fh, offset, reply);
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectoryPlus,
    ) {
        if self.rolls_dir_fault() {
            self.record("readdirplus", &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" }, ino);
            return reply.error(libc::EIO);
        }
        self.inner.readdirplus(req, ino, fh, offset, reply);
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        self.inner.releasedir(req, ino, fh, flags, reply);
    }

    // Every remaining method is pure delegation: fault injection's menu
    // (§4.4) names only the operations overridden above.

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        self.inner.batch_forget(req, nodes);
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

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.inner.unlink(req, parent, name, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
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
        reply: ReplyEmpty,
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

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.inner.fsyncdir(req, ino, fh, datasync, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.inner.access(req, ino, mask, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.inner.statfs(req, ino, reply);
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
        reply: ReplyEmpty,
    ) {
        self.inner.setxattr(req, ino, name, value, flags, position, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        self.inner.listxattr(req, ino, size, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
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
        reply: ReplyEmpty,
    ) {
        self.inner.setlk(req, ino, fh, lock_owner, start, end, typ, pid, sleep, reply);
    }

    fn flock(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, op: i32, reply: ReplyEmpty) {
        self.inner.flock(req, ino, fh, lock_owner, op, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_zero_never_rolls() {
        let config = FaultConfig {
            file_fail_rate: 0,
            directory_fail_rate: 0,
            delay: Duration::ZERO,
            seed: SeedPolicy::Fixed(1),
            log_path: std::env::temp_dir().join("nonexistent-fault-log-test"),
        };
        let fs = FaultInjectingFsProbe::new(config);
        for _ in 0..1000 {
            assert!(!fs.rolls(0));
        }
    }

    #[test]
    fn rate_one_always_rolls() {
        let config = FaultConfig {
            file_fail_rate: 1,
            directory_fail_rate: 1,
            delay: Duration::ZERO,
            seed: SeedPolicy::Fixed(7),
            log_path: std::env::temp_dir().join("nonexistent-fault-log-test2"),
        };
        let fs = FaultInjectingFsProbe::new(config);
        for _ in 0..100 {
            assert!(fs.rolls(1));
        }
    }

    #[test]
    fn timestamp_has_expected_shape() {
        let ts = chrono_like_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(ts.as_bytes()[4], b'-');
        assert_eq!(ts.as_bytes()[13], b':');
    }

    /// Thin test-only wrapper exposing the private RNG-rolling logic
    /// without needing a constructed `Box<dyn Filesystem>` inner layer.
    struct FaultInjectingFsProbe {
        rng: Mutex<StdRng>,
    }

    impl FaultInjectingFsProbe {
        fn new(config: FaultConfig) -> Self {
            let seed = match config.seed {
                SeedPolicy::Fixed(s) => s,
                SeedPolicy::TimeDerived => 0,
            };
            Self {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }
        }

        fn rolls(&self, rate: u32) -> bool {
            if rate == 0 {
                return false;
            }
            let mut rng = self.rng.lock().unwrap();
            rng.gen_range(0..rate) == 0
        }
    }

    /// Forwards nothing; every method falls back to `fuser::Filesystem`'s
    /// defaults, which is all `record()`'s tests below need from `inner`.
    struct StubFs;
    impl Filesystem for StubFs {}

    #[test]
    fn only_abrupt_exit_persists_a_fault_log_line() {
        let log_path = std::env::temp_dir().join(format!("fault-log-test-{}-a", std::process::id()));
        let _ = std::fs::remove_file(&log_path);
        let config = FaultConfig {
            file_fail_rate: 2,
            directory_fail_rate: 2,
            delay: Duration::from_millis(1),
            seed: SeedPolicy::Fixed(3),
            log_path: log_path.clone(),
        };
        let fs = FaultInjectingFs::new(Box::new(StubFs), config);

        fs.record("read", &FaultKind::Delay, 7);
        fs.record("read", &FaultKind::Truncation, 7);
        let contents = std::fs::read_to_string(&log_path).unwrap_or_default();
        assert!(contents.is_empty(), "delay/truncation must not write to the fault log");

        fs.record(
            "read",
            &FaultKind::AbruptExit { errno: libc::EIO, message: "I/O error" },
            7,
        );
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("ERROR: read: I/O error. Inode Number: 7"));

        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn opendir_delay_uses_directory_fail_rate() {
        let config = FaultConfig {
            file_fail_rate: 0,
            directory_fail_rate: 1,
            delay: Duration::from_millis(1),
            seed: SeedPolicy::Fixed(9),
            log_path: std::env::temp_dir().join("nonexistent-fault-log-test-b"),
        };
        let fs = FaultInjectingFs::new(Box::new(StubFs), config);
        // file_fail_rate is 0, so only directory_fail_rate can make this fire.
        assert!(fs.rolls_delay(fs.config.directory_fail_rate));
    }
}
