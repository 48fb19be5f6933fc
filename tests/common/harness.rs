//! Test mount harness for end-to-end FUSE tests.
//!
//! Builds a layer stack the same way `main.rs`'s `build_stack` does, mounts
//! it under a temporary mountpoint backed by a temporary source directory,
//! and unmounts on drop.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fuser::{BackgroundSession, Filesystem, MountOption};
use tempfile::TempDir;

use interposer_fuse::layers::fault::FaultConfig;
use interposer_fuse::layers::throttle::ThrottleConfig;
use interposer_fuse::layers::{DynFs, FaultInjectingFs, ThrottlingFs, TracingFs};
use interposer_fuse::passthrough::{CacheMode, PassthroughFs, PassthroughOptions};

const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// A mounted test filesystem. Unmounts (via `BackgroundSession`'s `Drop`)
/// once this and its temp directories go out of scope.
pub struct TestMount {
    _session: BackgroundSession,
    pub mount_path: PathBuf,
    pub source_path: PathBuf,
    _source_dir: TempDir,
    _mount_dir: TempDir,
}

impl TestMount {
    /// Scenario 1: passthrough only, no interception layers.
    pub fn passthrough() -> Result<Self, String> {
        Self::build(|_source| Ok(()), |passthrough| {
            Box::new(passthrough) as Box<dyn Filesystem + Send + Sync>
        })
    }

    /// Fault-injection directly over passthrough (scenarios 2, 3). `prepare`
    /// runs against the real source directory before the mount is spawned,
    /// so fixture content never has to survive a faulty `write`.
    pub fn with_fault(fault: FaultConfig, prepare: impl FnOnce(&Path) -> io::Result<()>) -> Result<Self, String> {
        Self::build(prepare, move |passthrough| {
            Box::new(FaultInjectingFs::new(Box::new(passthrough), fault)) as Box<dyn Filesystem + Send + Sync>
        })
    }

    /// Throttling directly over passthrough (scenario 4), optionally with a
    /// tracing layer on top (scenario 6's throttling-only composition).
    /// `prepare` runs against the real source directory before the mount is
    /// spawned, so fixture content never has to pass through the bucket
    /// being exercised.
    pub fn with_throttle(
        throttle: ThrottleConfig,
        traced: bool,
        prepare: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<Self, String> {
        Self::build(prepare, move |passthrough| {
            let mut stack: Box<dyn Filesystem + Send + Sync> =
                Box::new(ThrottlingFs::new(Box::new(passthrough), throttle));
            if traced {
                stack = Box::new(TracingFs::new(stack));
            }
            stack
        })
    }

    /// Tracing above fault-injection above passthrough (scenario 6's
    /// fault-layer composition).
    pub fn with_traced_fault(fault: FaultConfig) -> Result<Self, String> {
        Self::build(|_source| Ok(()), move |passthrough| {
            let faulty: Box<dyn Filesystem + Send + Sync> =
                Box::new(FaultInjectingFs::new(Box::new(passthrough), fault));
            Box::new(TracingFs::new(faulty)) as Box<dyn Filesystem + Send + Sync>
        })
    }

    fn build(
        prepare: impl FnOnce(&Path) -> io::Result<()>,
        assemble: impl FnOnce(PassthroughFs) -> Box<dyn Filesystem + Send + Sync>,
    ) -> Result<Self, String> {
        let source_dir = TempDir::new().map_err(|e| format!("creating source dir: {e}"))?;
        let mount_dir = TempDir::new().map_err(|e| format!("creating mount dir: {e}"))?;
        let mount_path = mount_dir.path().to_path_buf();
        let source_path = source_dir.path().to_path_buf();

        prepare(&source_path).map_err(|e| format!("preparing source fixture: {e}"))?;

        let options = PassthroughOptions {
            source: source_path.clone(),
            cache: CacheMode::Never,
            ..PassthroughOptions::default()
        };
        let passthrough = PassthroughFs::new(options).map_err(|e| format!("opening source: {e}"))?;
        let stack = assemble(passthrough);

        let mount_options = vec![
            MountOption::FSName("interposer-test".to_string()),
            MountOption::AutoUnmount,
        ];
        let session = fuser::spawn_mount2(DynFs(stack), &mount_path, &mount_options)
            .map_err(|e| format!("mounting: {e}"))?;

        wait_for_mount(&mount_path)?;

        Ok(Self {
            _session: session,
            mount_path,
            source_path,
            _source_dir: source_dir,
            _mount_dir: mount_dir,
        })
    }

    /// Build a full path under the mountpoint from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Build a full path under the (real, unmounted) source directory.
    pub fn source(&self, relative: &str) -> PathBuf {
        self.source_path.join(relative.trim_start_matches('/'))
    }

    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(path))
    }

    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        fs::write(self.path(path), content)
    }
}

/// Waits for the mountpoint's device id to diverge from its parent's,
/// which is the observable signal that a new filesystem is now mounted
/// there (an empty source directory gives no content to poll for instead).
fn wait_for_mount(mount_path: &Path) -> Result<(), String> {
    use std::os::unix::fs::MetadataExt;

    let parent_dev = fs::metadata(mount_path.parent().ok_or("mount_path has no parent")?)
        .map_err(|e| format!("statting parent: {e}"))?
        .dev();

    let deadline = Instant::now() + MOUNT_READY_TIMEOUT;
    while Instant::now() < deadline {
        if let Ok(meta) = fs::metadata(mount_path) {
            if meta.dev() != parent_dev {
                return Ok(());
            }
        }
        thread::sleep(MOUNT_CHECK_INTERVAL);
    }
    Err("mount did not become ready in time".to_string())
}

/// Whether this system can mount a FUSE filesystem at all.
pub fn fuse_available() -> bool {
    Path::new("/dev/fuse").exists()
}

#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("skipping test: /dev/fuse not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("skipping test: {e}");
                return;
            }
        }
    };
}
