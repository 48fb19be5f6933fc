//! End-to-end scenario 1: passthrough round-trip with every interception
//! layer disabled.

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;
use common::harness::TestMount;

#[test]
fn create_write_flush_then_open_read_round_trips() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::passthrough());

    std::fs::write(mount.path("hello"), b"world").expect("create+write+flush+release");

    let content = std::fs::read(mount.path("hello")).expect("open+read");
    assert_eq!(content, b"world");

    let on_disk = std::fs::read(mount.source("hello")).expect("reading through the source directly");
    assert_eq!(on_disk, b"world");
}

#[test]
fn mkdir_and_nested_file_are_visible_on_the_source() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::passthrough());

    std::fs::create_dir(mount.path("dir")).expect("mkdir");
    std::fs::write(mount.path("dir/nested"), b"abc").expect("write into mkdir'd directory");

    assert!(mount.source("dir").is_dir());
    assert_eq!(std::fs::read(mount.source("dir/nested")).unwrap(), b"abc");
}
