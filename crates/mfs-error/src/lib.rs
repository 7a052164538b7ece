#![forbid(unsafe_code)]
//! Error types for MFS.
//!
//! Defines `MfsError` and a `Result<T>` alias used throughout the workspace,
//! with errno mappings for the syscall boundary.
//!
//! Only recoverable conditions live here. Invariant violations — double
//! frees, missing identity mappings, malformed journal writes — are panics
//! with a diagnostic and are never caught.

use thiserror::Error;

/// Unified error type for all recoverable MFS failures.
#[derive(Debug, Error)]
pub enum MfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl MfsError {
    /// Convert this error into the negative errno reported to user space.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `MfsError`.
pub type Result<T> = std::result::Result<T, MfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(MfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(MfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(MfsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(MfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(
            MfsError::Corruption {
                block: 7,
                detail: "bad".into()
            }
            .to_errno(),
            libc::EIO
        );
    }
}
