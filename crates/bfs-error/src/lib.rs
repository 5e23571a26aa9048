#![forbid(unsafe_code)]
//! Error types for bootfs.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bfs-types` | On-disk layout violations detected while decoding bytes |
//! | Runtime | `BfsError` | `bfs-error` (this crate) | Errors returned by the public browsing API |
//!
//! `bfs-error` does not depend on `bfs-types`. Backends convert a `ParseError`
//! at their boundary, because only they know the device offset of the
//! structure being decoded:
//!
//! | ParseError | BfsError | When |
//! |------------|----------|------|
//! | `InvalidMagic` | `NotThisFormat` | volume header resolution |
//! | anything else | `CorruptIndex { offset, detail }` | node, record, or header decoding |
//!
//! ## Propagation
//!
//! Every internal failure travels unchanged to the public operation. Nothing
//! retries on its own; a cache miss reads the block once. `NotThisFormat` is
//! the only recoverable variant at `init`: the host moves on to the next
//! backend. Any other error from `init` means "this format, but unusable".
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `CorruptIndex` | `EIO` |
//! | `NotThisFormat` | `EINVAL` |
//! | `InvalidConfig` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |

use thiserror::Error;

/// Unified error type for all bootfs operations.
#[derive(Debug, Error)]
pub enum BfsError {
    /// The underlying block read failed.
    ///
    /// Fatal for the operation in flight; a fresh operation may be retried
    /// because the cache never keeps a line whose read failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The volume header signature does not belong to this format.
    #[error("not this filesystem format: {0}")]
    NotThisFormat(String),

    /// A tree node or record could not be decoded.
    ///
    /// `offset` is the device byte offset of the offending structure.
    #[error("corrupt index at offset {offset:#x}: {detail}")]
    CorruptIndex { offset: u64, detail: String },

    /// Path component or object absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-final path component, or a readdir target, is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// File data was requested from a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Options passed to `init` are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BfsError {
    /// Shorthand for a `CorruptIndex` at `offset`.
    #[must_use]
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        Self::CorruptIndex {
            offset,
            detail: detail.into(),
        }
    }

    /// Whether the host should try the next format back-end.
    #[must_use]
    pub fn is_not_this_format(&self) -> bool {
        matches!(self, Self::NotThisFormat(_))
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so a new variant fails to compile until it
    /// has an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CorruptIndex { .. } => libc::EIO,
            Self::NotThisFormat(_) | Self::InvalidConfig(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
        }
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;
