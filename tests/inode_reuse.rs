//! End-to-end scenario 5: repeated lookups of the same path resolve to the
//! same inode number, and removing it is externally observable.

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;
use common::harness::TestMount;
use std::os::unix::fs::MetadataExt;

#[test]
fn repeated_lookups_return_the_same_inode_number() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::passthrough());

    std::fs::write(mount.path("stable"), b"abc").expect("create fixture");

    let first = std::fs::metadata(mount.path("stable")).expect("first lookup").ino();
    let second = std::fs::metadata(mount.path("stable")).expect("second lookup").ino();
    assert_eq!(first, second, "lookup must reuse the same inode number for the same path");

    std::fs::remove_file(mount.path("stable")).expect("unlink");
    assert!(std::fs::metadata(mount.path("stable")).is_err(), "removed file must no longer resolve");
}
