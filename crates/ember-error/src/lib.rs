#![forbid(unsafe_code)]
//! Error types for emberfs.
//!
//! A single user-facing [`EmberError`] covers every failure the engine can
//! surface. Crate-internal errors (the on-device codec's `LayoutError`, the
//! geometry validator's `GeometryError`) convert into `EmberError` at the
//! `ember-core` boundary so the leaf crates stay cycle-free.
//!
//! Device I/O faults are never retried internally: at the adapter layer no
//! information exists to distinguish a transient fault from a permanent one,
//! so retry policy belongs to the caller.
//!
//! Every variant maps to exactly one POSIX errno via [`EmberError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until its errno is assigned.

use thiserror::Error;

/// Unified error type for all emberfs operations.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Unrecoverable fault reported by the block device.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Both sides of a metadata pair are invalid, or programmed data failed
    /// read-back verification. Fatal for the affected subtree only.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// The root metadata pair is unreadable; the mount aborts entirely.
    #[error("corrupt filesystem: {0}")]
    CorruptFilesystem(String),

    /// Configured geometry violates a divisibility or ordering constraint.
    /// Rejected before any device I/O.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Stored geometry disagrees with the adapter's configuration.
    #[error("geometry mismatch: {field} stored={stored} configured={configured}")]
    GeometryMismatch {
        field: &'static str,
        stored: u32,
        configured: u32,
    },

    /// The allocator scanned the whole device without finding a free block,
    /// or a directory's serialized payload no longer fits its pair.
    #[error("no space left on device")]
    NoSpace,

    /// Named file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Exclusive create of a name that already exists, or a second open of
    /// an already-open file.
    #[error("already exists: {0}")]
    Exists(String),

    /// File operation attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Removal of a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Entry name exceeds the 255-byte limit or is empty.
    #[error("name too long or empty")]
    NameTooLong,

    /// Write attempted through a handle opened read-only.
    #[error("file handle is read-only")]
    ReadOnly,

    /// Handle is closed, stale, or never belonged to this mount.
    #[error("bad file handle")]
    BadHandle,

    /// Seek resolved to a negative logical position.
    #[error("seek to a negative position")]
    InvalidSeek,

    /// Operation would push the file past the maximum supported size.
    #[error("file too large")]
    FileTooLarge,
}

impl EmberError {
    /// Convert this error into a POSIX errno.
    ///
    /// emberfs's public surface mirrors errno numbering so embedded callers
    /// can forward results straight to C consumers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::CorruptFilesystem(_) => libc::EIO,
            Self::InvalidGeometry(_) | Self::GeometryMismatch { .. } | Self::InvalidSeek => {
                libc::EINVAL
            }
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly | Self::BadHandle => libc::EBADF,
            Self::FileTooLarge => libc::EFBIG,
        }
    }
}

/// Result alias using `EmberError`.
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(EmberError, libc::c_int)> = vec![
            (EmberError::Io(std::io::Error::other("test")), libc::EIO),
            (
                EmberError::Corruption {
                    block: 7,
                    detail: "bad checksum".into(),
                },
                libc::EIO,
            ),
            (
                EmberError::CorruptFilesystem("no valid superblock".into()),
                libc::EIO,
            ),
            (
                EmberError::InvalidGeometry("block_size=0".into()),
                libc::EINVAL,
            ),
            (
                EmberError::GeometryMismatch {
                    field: "block_count",
                    stored: 3,
                    configured: 4,
                },
                libc::EINVAL,
            ),
            (EmberError::NoSpace, libc::ENOSPC),
            (EmberError::NotFound("file1.txt".into()), libc::ENOENT),
            (EmberError::Exists("file1.txt".into()), libc::EEXIST),
            (EmberError::IsDirectory, libc::EISDIR),
            (EmberError::NotDirectory, libc::ENOTDIR),
            (EmberError::NotEmpty, libc::ENOTEMPTY),
            (EmberError::NameTooLong, libc::ENAMETOOLONG),
            (EmberError::ReadOnly, libc::EBADF),
            (EmberError::BadHandle, libc::EBADF),
            (EmberError::InvalidSeek, libc::EINVAL),
            (EmberError::FileTooLarge, libc::EFBIG),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(EmberError::Io(raw).to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        let err = EmberError::Corruption {
            block: 42,
            detail: "revision header crc mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: revision header crc mismatch"
        );

        let mismatch = EmberError::GeometryMismatch {
            field: "block_size",
            stored: 320,
            configured: 512,
        };
        assert_eq!(
            mismatch.to_string(),
            "geometry mismatch: block_size stored=320 configured=512"
        );
    }
}
