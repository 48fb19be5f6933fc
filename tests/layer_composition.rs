//! End-to-end scenario 6: layer order independence for observation — tracing
//! sees the same underlying behaviour whether it sits above fault-injection
//! or above throttling.

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;
use common::harness::TestMount;
use interposer_fuse::layers::fault::{FaultConfig, SeedPolicy};
use interposer_fuse::layers::throttle::ThrottleConfig;
use std::io::Read;
use std::time::{Duration, Instant};

/// Tracing above fault-injection above passthrough still lets a forced
/// truncation through unchanged: the tracing layer only observes, it never
/// alters the reply it forwards.
#[test]
fn tracing_above_fault_injection_preserves_the_truncated_reply() {
    skip_if_no_fuse!();

    const CONTENT_LEN: usize = 64;
    let fault = FaultConfig {
        file_fail_rate: 1,
        directory_fail_rate: 0,
        delay: Duration::ZERO,
        seed: SeedPolicy::Fixed(5),
        log_path: std::env::temp_dir().join(format!("interposer-layer-comp-{}", std::process::id())),
    };
    let mount = require_mount!(TestMount::with_traced_fault(fault));
    std::fs::write(mount.path("content"), vec![b'z'; CONTENT_LEN]).expect("write fixture");

    let mut file = std::fs::File::open(mount.path("content")).expect("open");
    let mut buf = [0u8; CONTENT_LEN + 16];
    let n = file.read(&mut buf).expect("read");

    assert!((5..=14).contains(&n), "tracing must not change the fault layer's truncated size, got {n}");
}

/// Tracing above throttling above passthrough still pays the bucket's wait:
/// the tracing layer's span duration is not a substitute for actually
/// gating the call.
#[test]
fn tracing_above_throttling_still_pays_the_wait() {
    skip_if_no_fuse!();

    const CHUNK: usize = 4096;
    let content = vec![b'b'; CHUNK * 2];
    let content_for_fixture = content.clone();

    let throttle = ThrottleConfig {
        read_capacity: 4096,
        read_rate: 4096,
        write_capacity: 4096,
        write_rate: 4096,
        ..ThrottleConfig::default()
    };
    let mount = require_mount!(TestMount::with_throttle(throttle, true, move |source| {
        std::fs::write(source.join("bulk"), &content_for_fixture)
    }));

    let mut file = std::fs::File::open(mount.path("bulk")).expect("open");
    let mut buf = [0u8; CHUNK];
    // First read drains the full starting bucket instantly.
    file.read_exact(&mut buf).expect("first read");

    let start = Instant::now();
    file.read_exact(&mut buf).expect("second read");
    let elapsed = start.elapsed();

    assert!(elapsed.as_secs_f64() >= 0.9, "second read should have waited close to a full second, took {:?}", elapsed);
}
