#![forbid(unsafe_code)]
//! On-device formats.
//!
//! Everything that crosses the device boundary is defined here as explicit
//! little-endian byte layouts: the metadata block framing (revision, erase
//! count, length, crc32c), the superblock record stored in the root pair,
//! the directory entry records, and the closed-form layout math of the
//! file skip-list. The codecs are pure byte-slice transforms; device I/O
//! stays in `ember-block` and policy in `ember-core`.

use ember_types::{
    ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockAddr, Revision,
    ShortBuffer, NAME_MAX,
};
use thiserror::Error;

/// On-device format violation detected while parsing or encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error(transparent)]
    Short(#[from] ShortBuffer),
    #[error("bad superblock magic: {actual:#018x}")]
    BadMagic { actual: u64 },
    #[error("unsupported on-disk version: {actual:#010x}")]
    BadVersion { actual: u32 },
    #[error("metadata checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum { stored: u32, computed: u32 },
    #[error("unknown directory entry kind: {0}")]
    BadEntryKind(u8),
    #[error("invalid entry name: {0}")]
    BadName(&'static str),
    #[error("record too large: {len} bytes exceeds {max}")]
    Oversize { len: usize, max: usize },
}

// ── Metadata block framing ──────────────────────────────────────────────────

/// Bytes of header preceding a metadata block's payload.
pub const META_HEADER_LEN: usize = 16;

/// Parsed metadata block header. The crc is verified, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    pub revision: Revision,
    pub erase_count: u32,
    pub content_len: u32,
}

/// Decode the fixed header fields without verifying the checksum.
///
/// The checksum spans the payload as well, so verification happens in
/// [`verify_meta`] once the payload has been read.
pub fn decode_meta_header(bytes: &[u8]) -> Result<MetaHeader, LayoutError> {
    Ok(MetaHeader {
        revision: Revision(read_le_u32(bytes, 0)?),
        erase_count: read_le_u32(bytes, 4)?,
        content_len: read_le_u32(bytes, 8)?,
    })
}

fn meta_crc(header: &[u8], payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&header[..12]);
    crc32c::crc32c_append(crc, payload)
}

/// Verify a header + payload against the stored crc32c.
pub fn verify_meta(header: &[u8], payload: &[u8]) -> Result<MetaHeader, LayoutError> {
    let parsed = decode_meta_header(header)?;
    let stored = read_le_u32(header, 12)?;
    let computed = meta_crc(header, payload);
    if stored != computed {
        return Err(LayoutError::BadChecksum { stored, computed });
    }
    Ok(parsed)
}

/// Encode a full metadata block image: header, crc, payload.
pub fn encode_meta_block(revision: Revision, erase_count: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(META_HEADER_LEN + payload.len());
    write_le_u32(&mut out, revision.0);
    write_le_u32(&mut out, erase_count);
    write_le_u32(&mut out, payload.len() as u32);
    let crc = meta_crc(&out, payload);
    write_le_u32(&mut out, crc);
    out.extend_from_slice(payload);
    out
}

// ── Superblock record ───────────────────────────────────────────────────────

/// "EMBRFS01" interpreted little-endian.
pub const SUPER_MAGIC: u64 = u64::from_le_bytes(*b"EMBRFS01");

/// On-disk format version (major in the high half).
pub const SUPER_VERSION: u32 = 0x0001_0000;

/// Serialized superblock record length.
pub const SUPER_LEN: usize = 32;

/// Geometry and limits stamped at format time, stored at the head of the
/// root pair's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub inline_max: u32,
    pub name_max: u32,
}

impl Superblock {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_le_u64(out, SUPER_MAGIC);
        write_le_u32(out, self.version);
        write_le_u32(out, self.block_size);
        write_le_u32(out, self.block_count);
        write_le_u32(out, self.inline_max);
        write_le_u32(out, self.name_max);
        write_le_u32(out, 0); // reserved
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let magic = read_le_u64(bytes, 0)?;
        if magic != SUPER_MAGIC {
            return Err(LayoutError::BadMagic { actual: magic });
        }
        let version = read_le_u32(bytes, 8)?;
        if version >> 16 != SUPER_VERSION >> 16 {
            return Err(LayoutError::BadVersion { actual: version });
        }
        ensure_slice(bytes, 0, SUPER_LEN)?;
        Ok(Self {
            version,
            block_size: read_le_u32(bytes, 12)?,
            block_count: read_le_u32(bytes, 16)?,
            inline_max: read_le_u32(bytes, 20)?,
            name_max: read_le_u32(bytes, 24)?,
        })
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

const KIND_INLINE: u8 = 1;
const KIND_FILE: u8 = 2;
const KIND_DIR: u8 = 3;

/// Payload of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    /// Small file stored directly in the entry.
    Inline(Vec<u8>),
    /// Block-structured file: skip-list head and logical size.
    File { head: BlockAddr, size: u32 },
    /// Subdirectory metadata pair.
    Dir { pair: [BlockAddr; 2] },
}

/// One named entry in a directory's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub data: EntryData,
}

impl DirEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.data, EntryData::Dir { .. })
    }

    /// Logical size as reported by `stat` and directory listings.
    #[must_use]
    pub fn size(&self) -> u32 {
        match &self.data {
            EntryData::Inline(data) => data.len() as u32,
            EntryData::File { size, .. } => *size,
            EntryData::Dir { .. } => 0,
        }
    }
}

/// Check an entry name: nonempty, within [`NAME_MAX`], no separators.
pub fn validate_name(name: &str) -> Result<(), LayoutError> {
    if name.is_empty() {
        return Err(LayoutError::BadName("empty name"));
    }
    if name.len() > NAME_MAX {
        return Err(LayoutError::BadName("name exceeds 255 bytes"));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(LayoutError::BadName("name contains '/' or NUL"));
    }
    Ok(())
}

/// Append one entry's serialized form to `out`.
pub fn encode_entry(out: &mut Vec<u8>, entry: &DirEntry) -> Result<(), LayoutError> {
    validate_name(&entry.name)?;
    let (kind, name) = match &entry.data {
        EntryData::Inline(_) => (KIND_INLINE, entry.name.as_bytes()),
        EntryData::File { .. } => (KIND_FILE, entry.name.as_bytes()),
        EntryData::Dir { .. } => (KIND_DIR, entry.name.as_bytes()),
    };
    out.push(kind);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    match &entry.data {
        EntryData::Inline(data) => {
            write_le_u32(out, data.len() as u32);
            out.extend_from_slice(data);
        }
        EntryData::File { head, size } => {
            write_le_u32(out, head.0);
            write_le_u32(out, *size);
        }
        EntryData::Dir { pair } => {
            write_le_u32(out, pair[0].0);
            write_le_u32(out, pair[1].0);
        }
    }
    Ok(())
}

/// Serialize a whole entry list.
pub fn encode_entries(entries: &[DirEntry]) -> Result<Vec<u8>, LayoutError> {
    let mut out = Vec::new();
    for entry in entries {
        encode_entry(&mut out, entry)?;
    }
    Ok(out)
}

/// Parse a directory payload back into its entry list.
pub fn parse_entries(bytes: &[u8]) -> Result<Vec<DirEntry>, LayoutError> {
    let mut entries = Vec::new();
    let mut off = 0usize;
    while off < bytes.len() {
        let head = ensure_slice(bytes, off, 2)?;
        let kind = head[0];
        let name_len = head[1] as usize;
        off += 2;
        if name_len == 0 {
            return Err(LayoutError::BadName("empty name"));
        }
        let name_bytes = ensure_slice(bytes, off, name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| LayoutError::BadName("name is not valid UTF-8"))?
            .to_owned();
        off += name_len;

        let data = match kind {
            KIND_INLINE => {
                let len = read_le_u32(bytes, off)? as usize;
                off += 4;
                let data = ensure_slice(bytes, off, len)?.to_vec();
                off += len;
                EntryData::Inline(data)
            }
            KIND_FILE => {
                let head_block = BlockAddr(read_le_u32(bytes, off)?);
                let size = read_le_u32(bytes, off + 4)?;
                off += 8;
                EntryData::File {
                    head: head_block,
                    size,
                }
            }
            KIND_DIR => {
                let a = BlockAddr(read_le_u32(bytes, off)?);
                let b = BlockAddr(read_le_u32(bytes, off + 4)?);
                off += 8;
                EntryData::Dir { pair: [a, b] }
            }
            other => return Err(LayoutError::BadEntryKind(other)),
        };
        entries.push(DirEntry { name, data });
    }
    Ok(entries)
}

// ── Skip-list layout math ───────────────────────────────────────────────────
//
// A file's data blocks form a singly linked chain keyed by block index.
// Block 0 carries no pointers; block i >= 1 carries ctz(i)+1 backward
// pointers at the start of the block, pointer k addressing block i - 2^k.
// Pointer counts and byte offsets all reduce to closed forms over popcount,
// so no runtime index structure is ever built.

/// Bytes per skip pointer.
pub const POINTER_LEN: u32 = 4;

/// Number of backward pointers stored in the block at chain index `index`.
#[must_use]
pub fn pointer_count(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        index.trailing_zeros() + 1
    }
}

/// Byte offset where data starts inside the block at `index`.
#[must_use]
pub fn data_base(index: u32) -> u32 {
    POINTER_LEN * pointer_count(index)
}

/// Data bytes the block at `index` can hold.
#[must_use]
pub fn block_capacity(block_size: u32, index: u32) -> u32 {
    block_size - data_base(index)
}

/// Total data bytes held by chain blocks `[0, n)`.
///
/// Uses `sum of ctz(i) for i in 1..=m == m - popcount(m)` to fold the
/// per-block pointer overhead into a closed form.
#[must_use]
pub fn chain_capacity(block_size: u32, n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let m = n - 1;
    let overhead = u64::from(POINTER_LEN) * (2 * m - u64::from(m.count_ones()));
    u64::from(block_size) * n - overhead
}

/// Locate the chain block holding logical byte `off`.
///
/// Returns `(index, offset-within-that-block's-data-region)` such that
/// `chain_capacity(index) <= off < chain_capacity(index + 1)`.
/// `off` must be below the engine's file-size limit so the resulting
/// index fits a block address.
#[must_use]
pub fn index_for_offset(block_size: u32, off: u64) -> (u32, u32) {
    // Every block holds at least block_size - 128 bytes (at most 32
    // pointers), which bounds the search range.
    let min_cap = u64::from(block_size.saturating_sub(4 * 32)).max(1);
    let mut lo = 0u64;
    let mut hi = off / min_cap + 1;
    debug_assert!(chain_capacity(block_size, hi) > off);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if chain_capacity(block_size, mid) <= off {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let index = u32::try_from(lo).expect("chain index fits u32");
    let data_off = u32::try_from(off - chain_capacity(block_size, lo)).expect("offset fits block");
    (index, data_off)
}

/// Chain index of the block holding the last byte of a `size`-byte file.
///
/// `size` must be nonzero.
#[must_use]
pub fn last_index(block_size: u32, size: u64) -> u32 {
    index_for_offset(block_size, size - 1).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn meta_block_round_trip() {
        let payload = b"some directory payload";
        let image = encode_meta_block(Revision(7), 3, payload);
        assert_eq!(image.len(), META_HEADER_LEN + payload.len());
        let header = verify_meta(&image[..META_HEADER_LEN], payload).unwrap();
        assert_eq!(header.revision, Revision(7));
        assert_eq!(header.erase_count, 3);
        assert_eq!(header.content_len as usize, payload.len());
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let payload = b"payload";
        let mut image = encode_meta_block(Revision(1), 1, payload);
        image[META_HEADER_LEN] ^= 0x01;
        let err = verify_meta(&image[..META_HEADER_LEN], &image[META_HEADER_LEN..]).unwrap_err();
        assert!(matches!(err, LayoutError::BadChecksum { .. }));
    }

    #[test]
    fn erased_block_fails_checksum() {
        let header = [0xFFu8; META_HEADER_LEN];
        assert!(verify_meta(&header, &[]).is_err());
    }

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            version: SUPER_VERSION,
            block_size: 320,
            block_count: 3,
            inline_max: 32,
            name_max: 255,
        };
        let mut bytes = Vec::new();
        sb.encode(&mut bytes);
        assert_eq!(bytes.len(), SUPER_LEN);
        assert_eq!(Superblock::decode(&bytes).unwrap(), sb);

        bytes[0] ^= 0xFF;
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(LayoutError::BadMagic { .. })
        ));
    }

    #[test]
    fn entries_round_trip() {
        let entries = vec![
            DirEntry {
                name: "file1.txt".into(),
                data: EntryData::Inline(b"1111111111111111111111111".to_vec()),
            },
            DirEntry {
                name: "big.bin".into(),
                data: EntryData::File {
                    head: BlockAddr(42),
                    size: 100_000,
                },
            },
            DirEntry {
                name: "logs".into(),
                data: EntryData::Dir {
                    pair: [BlockAddr(5), BlockAddr(9)],
                },
            },
        ];
        let bytes = encode_entries(&entries).unwrap();
        assert_eq!(parse_entries(&bytes).unwrap(), entries);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("file1.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
        assert!(validate_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn truncated_entry_is_rejected() {
        let entries = vec![DirEntry {
            name: "f".into(),
            data: EntryData::File {
                head: BlockAddr(1),
                size: 10,
            },
        }];
        let bytes = encode_entries(&entries).unwrap();
        assert!(parse_entries(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn pointer_counts_follow_trailing_zeros() {
        let expected = [0, 1, 2, 1, 3, 1, 2, 1, 4, 1, 2, 1, 3];
        for (index, want) in expected.into_iter().enumerate() {
            assert_eq!(pointer_count(index as u32), want, "index {index}");
        }
    }

    fn brute_chain_capacity(block_size: u32, n: u64) -> u64 {
        (0..n)
            .map(|i| u64::from(block_capacity(block_size, i as u32)))
            .sum()
    }

    #[test]
    fn chain_capacity_matches_brute_force() {
        for block_size in [128u32, 320, 4096] {
            for n in 0..64u64 {
                assert_eq!(
                    chain_capacity(block_size, n),
                    brute_chain_capacity(block_size, n),
                    "block_size={block_size} n={n}"
                );
            }
        }
    }

    #[test]
    fn offsets_land_in_the_right_block() {
        let bs = 320u32;
        // First block holds [0, 320), second [320, 320+316), ...
        assert_eq!(index_for_offset(bs, 0), (0, 0));
        assert_eq!(index_for_offset(bs, 319), (0, 319));
        assert_eq!(index_for_offset(bs, 320), (1, 0));
        let c2 = chain_capacity(bs, 2);
        assert_eq!(index_for_offset(bs, c2), (2, 0));
        assert_eq!(index_for_offset(bs, c2 - 1), (1, 315));
    }

    proptest! {
        #[test]
        fn index_for_offset_inverts_chain_capacity(
            off in 0u64..2_000_000,
            bs in prop::sample::select(vec![128u32, 320, 512, 4096]),
        ) {
            let (index, data_off) = index_for_offset(bs, off);
            let base = chain_capacity(bs, u64::from(index));
            prop_assert!(base <= off);
            prop_assert_eq!(base + u64::from(data_off), off);
            prop_assert!(u64::from(data_off) < u64::from(block_capacity(bs, index)));
        }
    }
}
