//! Composable FUSE passthrough filesystem.
//!
//! The bottom layer ([`passthrough`]) translates kernel requests into
//! descriptor-relative syscalls against a source directory. Zero or more
//! interception layers ([`layers`]) wrap it: fault injection, throttling,
//! tracing, and metrics, each implementing [`fuser::Filesystem`] over an
//! owned `inner` layer and forwarding whatever it doesn't intercept.

pub mod config;
pub mod error;
pub mod handles;
pub mod inode;
pub mod layers;
pub mod passthrough;

pub use error::FsError;
pub use passthrough::{CacheMode, PassthroughFs, PassthroughOptions};
