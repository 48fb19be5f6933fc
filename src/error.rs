//! Error handling and errno mapping for the interposer filesystem.
//!
//! This module provides the internal error taxonomy and its conversion to the
//! POSIX error codes that get handed back to the kernel in a FUSE reply.

use std::io;
use thiserror::Error;

/// Errors that can occur while servicing a filesystem request.
#[derive(Debug, Error)]
pub enum FsError {
    /// A syscall against the backing source directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A kernel-supplied inode identifier has no live record.
    #[error("invalid inode: {0}")]
    InvalidInode(u64),

    /// A kernel-supplied file/directory handle has no live record.
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    /// A handle was used for an operation it wasn't opened for (e.g. readdir
    /// on a file handle).
    #[error("wrong handle kind for operation")]
    WrongHandleKind,

    /// An operation received arguments the protocol forbids, e.g. nonzero
    /// rename flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A request named an operation this filesystem does not implement.
    #[error("operation not supported")]
    NotSupported,

    /// Inode table insertion failed because the process is out of memory.
    #[error("out of memory")]
    NoMemory,
}

impl FsError {
    /// Converts this error into the libc errno the kernel should see.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FsError::Io(e) => e.to_errno(),
            FsError::InvalidInode(_) => libc::ENOENT,
            FsError::InvalidHandle(_) | FsError::WrongHandleKind => libc::EBADF,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NoMemory => libc::ENOMEM,
        }
    }
}

/// Result type for filesystem operations prior to being turned into a reply.
pub type FsResult<T> = Result<T, FsError>;

/// Extension trait to convert a foreign error type to an errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> libc::c_int;
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> libc::c_int {
        self.raw_os_error().unwrap_or(libc::EIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_with_os_code_passes_through() {
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(e.to_errno(), libc::ENOENT);

        let e = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn io_error_without_os_code_maps_to_eio() {
        let e = io::Error::other("synthetic");
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn fs_error_variants_map_as_expected() {
        assert_eq!(FsError::InvalidInode(42).to_errno(), libc::ENOENT);
        assert_eq!(FsError::InvalidHandle(1).to_errno(), libc::EBADF);
        assert_eq!(FsError::WrongHandleKind.to_errno(), libc::EBADF);
        assert_eq!(
            FsError::InvalidArgument("rename flags").to_errno(),
            libc::EINVAL
        );
        assert_eq!(FsError::NotSupported.to_errno(), libc::ENOTSUP);
        assert_eq!(FsError::NoMemory.to_errno(), libc::ENOMEM);
    }

    #[test]
    fn fs_error_io_passthrough() {
        let io_err = io::Error::from_raw_os_error(libc::EPERM);
        let e = FsError::Io(io_err);
        assert_eq!(e.to_errno(), libc::EPERM);

        let io_err = io::Error::from_raw_os_error(libc::ENOSPC);
        let e = FsError::Io(io_err);
        assert_eq!(e.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn fs_error_display_carries_context() {
        let e = FsError::InvalidInode(42);
        assert!(e.to_string().contains("42"));

        let e = FsError::InvalidArgument("flags must be zero");
        assert!(e.to_string().contains("flags must be zero"));
    }

    #[test]
    fn from_io_error_conversion() {
        let io_err = io::Error::from_raw_os_error(libc::EACCES);
        let fs_err: FsError = io_err.into();
        assert_eq!(fs_err.to_errno(), libc::EACCES);
    }

    #[test]
    fn common_io_error_codes_round_trip() {
        let error_codes = [
            libc::ENOENT,
            libc::EACCES,
            libc::EEXIST,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::EINVAL,
            libc::ENOSPC,
            libc::EROFS,
            libc::ENOTEMPTY,
        ];

        for code in error_codes {
            let e = io::Error::from_raw_os_error(code);
            assert_eq!(e.to_errno(), code, "errno {code} should round-trip");
        }
    }
}
