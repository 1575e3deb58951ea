#![forbid(unsafe_code)]
//! Core types shared across the emberfs crates.
//!
//! Defines the validated device [`Geometry`], the unit-carrying id newtypes,
//! and the little-endian field helpers used by the on-device codecs. This
//! crate is intentionally leaf-level: it depends on nothing else in the
//! workspace so every other crate can use it without cycles.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest logical file size the chain layout supports.
pub const FILE_MAX: u64 = 0x7FFF_FFFF;

/// Longest directory entry name in bytes.
pub const NAME_MAX: usize = 255;

/// Sentinel address meaning "no block" (empty chain head).
pub const BLOCK_NULL: u32 = 0xFFFF_FFFF;

/// Physical block address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u32);

impl BlockAddr {
    /// The "no block" sentinel.
    pub const NULL: Self = Self(BLOCK_NULL);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == BLOCK_NULL
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata pair commit counter (wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub u32);

impl Revision {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Whether `self` is newer than `other` under wraparound.
    ///
    /// The numerically smaller revision only wins when the difference
    /// exceeds half the counter range, which is exactly a signed wrapping
    /// comparison of the two counters.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn is_newer_than(self, other: Self) -> bool {
        self.0.wrapping_sub(other.0) as i32 > 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Device geometry ─────────────────────────────────────────────────────────

/// Immutable per-mount device geometry and tuning knobs.
///
/// All sizes are in bytes except `block_count` (blocks) and
/// `lookahead_size` (blocks covered by the allocator window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Smallest readable unit.
    pub read_size: u32,
    /// Smallest programmable unit.
    pub prog_size: u32,
    /// Erase unit; every program targets a previously erased block.
    pub block_size: u32,
    /// Total blocks on the device.
    pub block_count: u32,
    /// Size of each cache buffer; a multiple of `prog_size`.
    pub cache_size: u32,
    /// Blocks covered by the allocator's lookahead window.
    pub lookahead_size: u32,
    /// Erase-count threshold before a metadata block is relocated.
    /// Zero disables wear leveling.
    pub block_cycles: u32,
    /// Largest file stored inline in its directory entry.
    pub inline_max: u32,
}

/// Geometry constraint violation, reported before any device I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{field} must be nonzero")]
    Zero { field: &'static str },
    #[error("{field} ({value}) must be a multiple of {of_field} ({of_value})")]
    NotMultiple {
        field: &'static str,
        value: u32,
        of_field: &'static str,
        of_value: u32,
    },
    #[error("{field} ({value}) out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        reason: &'static str,
    },
}

impl Geometry {
    /// Check every divisibility and ordering constraint.
    ///
    /// Called by mount and format before the device is touched.
    pub fn validate(&self) -> Result<(), GeometryError> {
        for (field, value) in [
            ("read_size", self.read_size),
            ("prog_size", self.prog_size),
            ("block_size", self.block_size),
            ("block_count", self.block_count),
            ("cache_size", self.cache_size),
            ("lookahead_size", self.lookahead_size),
        ] {
            if value == 0 {
                return Err(GeometryError::Zero { field });
            }
        }

        let multiples = [
            ("prog_size", self.prog_size, "read_size", self.read_size),
            ("block_size", self.block_size, "read_size", self.read_size),
            ("block_size", self.block_size, "prog_size", self.prog_size),
            ("cache_size", self.cache_size, "read_size", self.read_size),
            ("cache_size", self.cache_size, "prog_size", self.prog_size),
        ];
        for (field, value, of_field, of_value) in multiples {
            if value % of_value != 0 {
                return Err(GeometryError::NotMultiple {
                    field,
                    value,
                    of_field,
                    of_value,
                });
            }
        }

        if self.block_size < 128 {
            return Err(GeometryError::OutOfRange {
                field: "block_size",
                value: self.block_size,
                reason: "must be at least 128 bytes",
            });
        }
        if self.block_count < 2 {
            return Err(GeometryError::OutOfRange {
                field: "block_count",
                value: self.block_count,
                reason: "the root metadata pair needs blocks 0 and 1",
            });
        }
        if self.cache_size > self.block_size {
            return Err(GeometryError::OutOfRange {
                field: "cache_size",
                value: self.cache_size,
                reason: "must not exceed block_size",
            });
        }
        if self.lookahead_size % 8 != 0 {
            return Err(GeometryError::NotMultiple {
                field: "lookahead_size",
                value: self.lookahead_size,
                of_field: "8",
                of_value: 8,
            });
        }
        if self.inline_max > self.cache_size {
            return Err(GeometryError::OutOfRange {
                field: "inline_max",
                value: self.inline_max,
                reason: "must not exceed cache_size",
            });
        }

        Ok(())
    }

    /// Device capacity in bytes.
    #[must_use]
    pub fn device_len(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }
}

// ── Little-endian field helpers ─────────────────────────────────────────────

/// Truncation error from the byte-field helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
pub struct ShortBuffer {
    pub needed: usize,
    pub offset: usize,
    pub actual: usize,
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ShortBuffer> {
    let end = offset.checked_add(len).ok_or(ShortBuffer {
        needed: len,
        offset,
        actual: 0,
    })?;
    if end > data.len() {
        return Err(ShortBuffer {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ShortBuffer> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ShortBuffer> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ShortBuffer> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut Vec<u8>, value: u16) {
    data.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut Vec<u8>, value: u32) {
    data.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut Vec<u8>, value: u64) {
    data.extend_from_slice(&value.to_le_bytes());
}
