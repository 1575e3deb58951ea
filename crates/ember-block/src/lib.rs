#![forbid(unsafe_code)]
//! Block device adapter and cache layer.
//!
//! The [`BlockDevice`] trait is the engine's only I/O boundary: fixed-size
//! blocks, reads in `read_size` units, programs in `prog_size` units, and
//! whole-block erases. Every program targets a previously erased block.
//!
//! On top of the adapter sit [`CacheBuf`] buffers and the `bd_*` helpers:
//! read-through on the read side, write-back on the program side. The
//! helpers take their caches as explicit arguments so the per-mount read
//! cache, the per-mount program cache, and each file handle's own cache can
//! all share one code path without global state.

use ember_error::{EmberError, Result};
use ember_types::{BlockAddr, Geometry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Erased flash reads back as all-ones.
pub const ERASED_BYTE: u8 = 0xFF;

/// Block-addressed I/O interface.
///
/// `read` offsets and lengths must be multiples of `read_size`, `program`
/// offsets and lengths multiples of `prog_size`; `erase` always affects a
/// whole block. Implementations use interior mutability so the engine can
/// hold the device behind a shared handle.
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes from `block` starting at `off`.
    fn read(&self, block: BlockAddr, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` into `block` starting at `off`. The target region
    /// must have been erased since it was last programmed.
    fn program(&self, block: BlockAddr, off: u32, data: &[u8]) -> Result<()>;

    /// Erase a whole block; afterwards it reads back as [`ERASED_BYTE`].
    fn erase(&self, block: BlockAddr) -> Result<()>;

    /// Flush pending device-side writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u32;
}

fn check_range(
    block: BlockAddr,
    off: u32,
    len: usize,
    block_size: u32,
    block_count: u32,
) -> Result<()> {
    if block.0 >= block_count {
        return Err(EmberError::Corruption {
            block: block.0,
            detail: format!("block address out of range (block_count={block_count})"),
        });
    }
    let end = u64::from(off) + len as u64;
    if end > u64::from(block_size) {
        return Err(EmberError::Corruption {
            block: block.0,
            detail: format!("access past block end: off={off} len={len} block_size={block_size}"),
        });
    }
    Ok(())
}

// ── RAM-backed device ───────────────────────────────────────────────────────

/// In-memory block device.
///
/// The backing store starts fully erased. Erase counts are tracked per
/// block, which the wear-leveling tests lean on.
#[derive(Debug)]
pub struct RamBlockDevice {
    block_size: u32,
    block_count: u32,
    data: Mutex<Vec<u8>>,
    erase_counts: Mutex<Vec<u32>>,
}

impl RamBlockDevice {
    #[must_use]
    pub fn new(geo: &Geometry) -> Self {
        let len = usize::try_from(geo.device_len()).expect("device length fits host memory");
        Self {
            block_size: geo.block_size,
            block_count: geo.block_count,
            data: Mutex::new(vec![ERASED_BYTE; len]),
            erase_counts: Mutex::new(vec![0; geo.block_count as usize]),
        }
    }

    /// Copy of the raw device image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Replace the raw device image, e.g. to rewind to a snapshot.
    pub fn restore(&self, image: Vec<u8>) {
        let mut data = self.data.lock();
        assert_eq!(data.len(), image.len(), "image length mismatch");
        *data = image;
    }

    /// How many times `block` has been erased.
    #[must_use]
    pub fn erase_count(&self, block: u32) -> u32 {
        self.erase_counts.lock()[block as usize]
    }

    /// Erase counts for every block.
    #[must_use]
    pub fn erase_counts(&self) -> Vec<u32> {
        self.erase_counts.lock().clone()
    }

    fn byte_range(&self, block: BlockAddr, off: u32, len: usize) -> std::ops::Range<usize> {
        let start = block.0 as usize * self.block_size as usize + off as usize;
        start..start + len
    }
}

impl BlockDevice for RamBlockDevice {
    fn read(&self, block: BlockAddr, off: u32, buf: &mut [u8]) -> Result<()> {
        check_range(block, off, buf.len(), self.block_size, self.block_count)?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[self.byte_range(block, off, buf.len())]);
        Ok(())
    }

    fn program(&self, block: BlockAddr, off: u32, data: &[u8]) -> Result<()> {
        check_range(block, off, data.len(), self.block_size, self.block_count)?;
        let mut bytes = self.data.lock();
        let range = self.byte_range(block, off, data.len());
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&self, block: BlockAddr) -> Result<()> {
        check_range(block, 0, self.block_size as usize, self.block_size, self.block_count)?;
        let mut bytes = self.data.lock();
        let range = self.byte_range(block, 0, self.block_size as usize);
        bytes[range].fill(ERASED_BYTE);
        drop(bytes);
        self.erase_counts.lock()[block.0 as usize] += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Host-file-backed block device using positional I/O.
///
/// Byte offset of an access is `block * block_size + off`; erase overwrites
/// the block with [`ERASED_BYTE`] in bounded chunks.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    block_count: u32,
}

impl FileBlockDevice {
    /// Open (creating if missing) a backing file sized to the geometry.
    pub fn open(path: impl AsRef<Path>, geo: &Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(geo.device_len())?;
        Ok(Self {
            file,
            block_size: geo.block_size,
            block_count: geo.block_count,
        })
    }

    fn pos(&self, block: BlockAddr, off: u32) -> u64 {
        u64::from(block.0) * u64::from(self.block_size) + u64::from(off)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&self, block: BlockAddr, off: u32, buf: &mut [u8]) -> Result<()> {
        check_range(block, off, buf.len(), self.block_size, self.block_count)?;
        self.file.read_exact_at(buf, self.pos(block, off))?;
        Ok(())
    }

    fn program(&self, block: BlockAddr, off: u32, data: &[u8]) -> Result<()> {
        check_range(block, off, data.len(), self.block_size, self.block_count)?;
        self.file.write_all_at(data, self.pos(block, off))?;
        Ok(())
    }

    fn erase(&self, block: BlockAddr) -> Result<()> {
        check_range(block, 0, self.block_size as usize, self.block_size, self.block_count)?;
        let chunk = [ERASED_BYTE; 512];
        let mut remaining = self.block_size as usize;
        let mut pos = self.pos(block, 0);
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.file.write_all_at(&chunk[..n], pos)?;
            pos += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }
}

// ── Cache layer ─────────────────────────────────────────────────────────────

/// One cache buffer, addressed by `(block, offset)`.
///
/// Serves either role: as a read cache it holds the most recently loaded
/// `cache_size` window of a block; as a program cache it accumulates
/// write-back bytes until flushed. `len` counts valid bytes from `off`.
#[derive(Debug, Clone)]
pub struct CacheBuf {
    pub block: Option<BlockAddr>,
    pub off: u32,
    pub len: u32,
    pub buf: Vec<u8>,
}

impl CacheBuf {
    #[must_use]
    pub fn new(cache_size: u32) -> Self {
        Self {
            block: None,
            off: 0,
            len: 0,
            buf: vec![ERASED_BYTE; cache_size as usize],
        }
    }

    /// Discard any cached contents.
    pub fn invalidate(&mut self) {
        self.block = None;
        self.off = 0;
        self.len = 0;
        self.buf.fill(ERASED_BYTE);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block.is_none() || self.len == 0
    }
}

/// Read `data.len()` bytes from `(block, off)` through the caches.
///
/// Bytes pending in `pcache` shadow the device; `rcache` is repopulated on
/// miss with a `read_size`-aligned window of up to `cache_size` bytes.
pub fn bd_read(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    pcache: Option<&CacheBuf>,
    rcache: &mut CacheBuf,
    block: BlockAddr,
    off: u32,
    data: &mut [u8],
) -> Result<()> {
    check_range(block, off, data.len(), geo.block_size, geo.block_count)?;

    let mut i = 0usize;
    while i < data.len() {
        let cur = off + i as u32;
        let want = data.len() - i;

        // Pending program bytes win over anything on the device.
        if let Some(pc) = pcache {
            if pc.block == Some(block) && pc.len > 0 && cur >= pc.off && cur < pc.off + pc.len {
                let d = want.min((pc.off + pc.len - cur) as usize);
                let src = (cur - pc.off) as usize;
                data[i..i + d].copy_from_slice(&pc.buf[src..src + d]);
                i += d;
                continue;
            }
        }

        if rcache.block == Some(block) && cur >= rcache.off && cur < rcache.off + rcache.len {
            let mut d = want.min((rcache.off + rcache.len - cur) as usize);
            // Stop short of any pending program region ahead of us.
            if let Some(pc) = pcache {
                if pc.block == Some(block) && pc.len > 0 && pc.off > cur {
                    d = d.min((pc.off - cur) as usize);
                }
            }
            let src = (cur - rcache.off) as usize;
            data[i..i + d].copy_from_slice(&rcache.buf[src..src + d]);
            i += d;
            continue;
        }

        // Miss: load an aligned window around `cur`.
        let aligned = cur - cur % geo.read_size;
        let load = geo.cache_size.min(geo.block_size - aligned);
        dev.read(block, aligned, &mut rcache.buf[..load as usize])?;
        rcache.block = Some(block);
        rcache.off = aligned;
        rcache.len = load;
    }

    Ok(())
}

/// Accumulate `data` into the program cache, flushing whenever it fills.
///
/// The caller maintains the erased-block discipline: a given block is only
/// ever programmed at strictly increasing offsets after an erase.
pub fn bd_prog(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    pcache: &mut CacheBuf,
    rcache: &mut CacheBuf,
    validate: bool,
    block: BlockAddr,
    off: u32,
    data: &[u8],
) -> Result<()> {
    check_range(block, off, data.len(), geo.block_size, geo.block_count)?;

    let mut i = 0usize;
    while i < data.len() {
        let cur = off + i as u32;

        if pcache.block == Some(block) && cur >= pcache.off && cur < pcache.off + geo.cache_size {
            let d = (data.len() - i).min((pcache.off + geo.cache_size - cur) as usize);
            let dst = (cur - pcache.off) as usize;
            pcache.buf[dst..dst + d].copy_from_slice(&data[i..i + d]);
            pcache.len = pcache.len.max(cur - pcache.off + d as u32);
            i += d;
            if pcache.len == geo.cache_size {
                bd_flush(dev, geo, pcache, rcache, validate)?;
            }
            continue;
        }

        // Cache is bound elsewhere; push it out and rebind at `cur`.
        bd_flush(dev, geo, pcache, rcache, validate)?;
        pcache.buf.fill(ERASED_BYTE);
        pcache.block = Some(block);
        pcache.off = cur - cur % geo.prog_size;
        pcache.len = cur - pcache.off;
    }

    Ok(())
}

/// Program out any pending cache contents as one `prog_size`-aligned region.
///
/// With `validate` the programmed region is read back and compared;
/// a mismatch surfaces as corruption at that block.
pub fn bd_flush(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    pcache: &mut CacheBuf,
    rcache: &mut CacheBuf,
    validate: bool,
) -> Result<()> {
    let Some(block) = pcache.block else {
        return Ok(());
    };
    if pcache.len == 0 {
        pcache.invalidate();
        return Ok(());
    }

    let prog_len = pcache.len.next_multiple_of(geo.prog_size);
    // Trailing bytes in the final program unit stay in the erased state.
    pcache.buf[pcache.len as usize..prog_len as usize].fill(ERASED_BYTE);
    dev.program(block, pcache.off, &pcache.buf[..prog_len as usize])?;

    if validate {
        let mut check = vec![0u8; prog_len as usize];
        dev.read(block, pcache.off, &mut check)?;
        if check != pcache.buf[..prog_len as usize] {
            return Err(EmberError::Corruption {
                block: block.0,
                detail: "program verification failed".into(),
            });
        }
    }

    if rcache.block == Some(block) {
        rcache.invalidate();
    }
    pcache.invalidate();
    Ok(())
}

/// Erase a block through the adapter.
pub fn bd_erase(dev: &dyn BlockDevice, block: BlockAddr) -> Result<()> {
    dev.erase(block)
}

/// Flush the program cache and sync the device.
pub fn bd_sync(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    pcache: &mut CacheBuf,
    rcache: &mut CacheBuf,
    validate: bool,
) -> Result<()> {
    bd_flush(dev, geo, pcache, rcache, validate)?;
    dev.sync()
}
