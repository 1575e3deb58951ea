//! File handles and the block skip-list.
//!
//! File data blocks form a backward-linked chain: block index 0 carries no
//! pointers, block `i` carries `ctz(i) + 1` pointers to indices `i - 2^k`.
//! Appending from the tail costs O(log n) pointer reads, and seeking to
//! any earlier offset greedily follows the largest stride that does not
//! overshoot, also O(log n).
//!
//! Files at or below `inline_max` bytes skip the chain entirely: their
//! whole content lives in the directory entry, and while open, in the
//! handle's cache buffer. The first write that pushes the size past the
//! threshold migrates the content into blocks; shrinking never migrates
//! back.
//!
//! Writes stream through the handle's cache onto freshly allocated
//! blocks, copy-on-write: the committed chain is never reprogrammed, a
//! mid-file write copies the touched block's head and, at flush time,
//! re-appends the old tail. The directory entry only moves forward at
//! `file_sync`/`file_close`, so a crash loses at most the unflushed
//! handle data and never another file's metadata.

use crate::Fs;
use ember_block::{bd_flush, bd_prog, bd_read, CacheBuf};
use ember_error::{EmberError, Result};
use ember_ondisk::{
    data_base, index_for_offset, last_index, pointer_count, DirEntry, EntryData,
};
use ember_types::{BlockAddr, FILE_MAX};
use std::io::SeekFrom;
use tracing::{debug, trace};

/// Open-mode and behavior flags for [`Fs::file_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Reads only; writes through this handle fail.
    pub const READ_ONLY: Self = Self(0);
    /// Reads and writes.
    pub const READ_WRITE: Self = Self(1);
    /// Create the file if it does not exist.
    pub const CREATE: Self = Self(1 << 1);
    /// With `CREATE`: fail if the file already exists.
    pub const EXCL: Self = Self(1 << 2);
    /// Discard existing content at open.
    pub const TRUNCATE: Self = Self(1 << 3);
    /// Every write lands at the end of the file.
    pub const APPEND: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn writable(self) -> bool {
        self.contains(Self::READ_WRITE)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque handle to an open file; valid until `file_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

/// Per-open-file state, owned by the mount's file table.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub name: String,
    pub dir_pair: [BlockAddr; 2],
    pub flags: OpenFlags,
    pub gen: u32,
    /// Logical read/write position.
    pub pos: u64,
    /// Content representation: inline (in `cache`) or block chain.
    pub inline: bool,
    /// Last block of the flushed chain; meaningful when `!inline`.
    pub head: BlockAddr,
    /// Logical size of the flushed content (for inline, the live size).
    pub size: u64,
    /// Streaming state: current physical block, its chain index, and the
    /// next byte offset within it.
    pub block: BlockAddr,
    pub index: u32,
    pub off: u32,
    pub cache: CacheBuf,
    pub reading: bool,
    pub writing: bool,
    /// Directory entry needs a commit at the next sync/close.
    pub dirty: bool,
}

impl OpenFile {
    /// Logical size including any in-flight written bytes.
    pub(crate) fn logical_size(&self) -> u64 {
        if self.writing {
            self.pos.max(self.size)
        } else {
            self.size
        }
    }
}

impl Fs {
    // ── Open / close ────────────────────────────────────────────────────

    /// Open a file by path.
    pub fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let (mut dir, name) = self.resolve_parent(path)?;
        ember_ondisk::validate_name(&name).map_err(|_| EmberError::NameTooLong)?;
        if (flags.contains(OpenFlags::TRUNCATE) || flags.contains(OpenFlags::APPEND))
            && !flags.writable()
        {
            return Err(EmberError::ReadOnly);
        }
        if self
            .files
            .iter()
            .flatten()
            .any(|f| f.dir_pair == dir.pair && f.name == name)
        {
            return Err(EmberError::Exists(path.to_owned()));
        }

        let data = match dir.entries.iter().position(|e| e.name == name) {
            Some(i) => {
                if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCL) {
                    return Err(EmberError::Exists(path.to_owned()));
                }
                if dir.entries[i].is_dir() {
                    return Err(EmberError::IsDirectory);
                }
                dir.entries[i].data.clone()
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(EmberError::NotFound(path.to_owned()));
                }
                let data = EntryData::Inline(Vec::new());
                dir.entries.push(DirEntry {
                    name: name.clone(),
                    data: data.clone(),
                });
                self.commit_dir(&mut dir, None)?;
                trace!(path, "created file");
                data
            }
        };

        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);

        let mut file = OpenFile {
            name,
            dir_pair: dir.pair,
            flags,
            gen,
            pos: 0,
            inline: true,
            head: BlockAddr::NULL,
            size: 0,
            block: BlockAddr::NULL,
            index: 0,
            off: 0,
            cache: CacheBuf::new(self.geo.cache_size),
            reading: false,
            writing: false,
            dirty: false,
        };
        match data {
            EntryData::Inline(content) => {
                file.cache.buf[..content.len()].copy_from_slice(&content);
                file.size = content.len() as u64;
            }
            EntryData::File { head, size } => {
                file.inline = false;
                file.head = head;
                file.size = u64::from(size);
            }
            EntryData::Dir { .. } => return Err(EmberError::IsDirectory),
        }

        if flags.contains(OpenFlags::TRUNCATE) && (file.size > 0 || !file.inline) {
            file.inline = true;
            file.head = BlockAddr::NULL;
            file.size = 0;
            file.cache.invalidate();
            file.dirty = true;
        }

        let slot = self.files.iter().position(Option::is_none);
        let index = match slot {
            Some(i) => {
                self.files[i] = Some(file);
                i
            }
            None => {
                self.files.push(Some(file));
                self.files.len() - 1
            }
        };
        trace!(path, handle = index, "opened file");
        Ok(FileHandle {
            index: index as u32,
            gen,
        })
    }

    /// Sync and release a handle. The slot is freed even if the final
    /// sync fails, so the handle is dead either way.
    pub fn file_close(&mut self, fh: FileHandle) -> Result<()> {
        let slot = self
            .files
            .get_mut(fh.index as usize)
            .ok_or(EmberError::BadHandle)?;
        let Some(file) = slot.take() else {
            return Err(EmberError::BadHandle);
        };
        if file.gen != fh.gen {
            *slot = Some(file);
            return Err(EmberError::BadHandle);
        }
        let mut file = file;
        let res = self.sync_file_impl(&mut file);
        trace!(name = %file.name, "closed file");
        res
    }

    fn with_file<T>(
        &mut self,
        fh: FileHandle,
        op: impl FnOnce(&mut Self, &mut OpenFile) -> Result<T>,
    ) -> Result<T> {
        let slot = self
            .files
            .get_mut(fh.index as usize)
            .ok_or(EmberError::BadHandle)?;
        let Some(file) = slot.take() else {
            return Err(EmberError::BadHandle);
        };
        if file.gen != fh.gen {
            *slot = Some(file);
            return Err(EmberError::BadHandle);
        }
        let mut file = file;
        let res = op(self, &mut file);
        self.files[fh.index as usize] = Some(file);
        res
    }

    // ── Public file operations ──────────────────────────────────────────

    /// Read up to `buf.len()` bytes at the current position. Reading past
    /// the end of the file is a short read, never an error.
    pub fn file_read(&mut self, fh: FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.with_file(fh, |fs, file| fs.read_impl(file, buf))
    }

    /// Write `data` at the current position (at the end under `APPEND`).
    pub fn file_write(&mut self, fh: FileHandle, data: &[u8]) -> Result<usize> {
        self.with_file(fh, |fs, file| fs.write_impl(file, data))
    }

    /// Reposition the handle, flushing any in-flight writes first.
    pub fn file_seek(&mut self, fh: FileHandle, whence: SeekFrom) -> Result<u64> {
        self.with_file(fh, |fs, file| fs.seek_impl(file, whence))
    }

    /// Current logical position.
    pub fn file_tell(&mut self, fh: FileHandle) -> Result<u64> {
        self.with_file(fh, |_, file| Ok(file.pos))
    }

    /// Seek back to the start of the file.
    pub fn file_rewind(&mut self, fh: FileHandle) -> Result<()> {
        self.file_seek(fh, SeekFrom::Start(0)).map(|_| ())
    }

    /// Logical file size including unflushed writes.
    pub fn file_size(&mut self, fh: FileHandle) -> Result<u64> {
        self.with_file(fh, |_, file| Ok(file.logical_size()))
    }

    /// Grow (zero-filled) or shrink the file to `size`.
    pub fn file_truncate(&mut self, fh: FileHandle, size: u64) -> Result<()> {
        self.with_file(fh, |fs, file| fs.truncate_impl(file, size))
    }

    /// Flush in-flight data and durably commit the directory entry.
    pub fn file_sync(&mut self, fh: FileHandle) -> Result<()> {
        self.with_file(fh, |fs, file| fs.sync_file_impl(file))
    }

    // ── Implementation ──────────────────────────────────────────────────

    fn read_impl(&mut self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        if file.writing {
            self.flush_chain(file)?;
        }
        if file.pos >= file.size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((file.size - file.pos) as usize);

        if file.inline {
            let pos = file.pos as usize;
            buf[..n].copy_from_slice(&file.cache.buf[pos..pos + n]);
            file.pos += n as u64;
            return Ok(n);
        }

        let bs = self.geo.block_size;
        let head_index = last_index(bs, file.size);
        let mut copied = 0usize;
        while copied < n {
            if !file.reading || file.off == bs {
                let (index, doff) = index_for_offset(bs, file.pos);
                file.block = self.ctz_find(file.head, head_index, index)?;
                file.index = index;
                file.off = data_base(index) + doff;
                file.reading = true;
            }
            let chunk = (n - copied).min((bs - file.off) as usize);
            bd_read(
                &*self.dev,
                &self.geo,
                None,
                &mut file.cache,
                file.block,
                file.off,
                &mut buf[copied..copied + chunk],
            )?;
            file.pos += chunk as u64;
            file.off += chunk as u32;
            copied += chunk;
        }
        Ok(n)
    }

    fn write_impl(&mut self, file: &mut OpenFile, data: &[u8]) -> Result<usize> {
        if !file.flags.writable() {
            return Err(EmberError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if file.flags.contains(OpenFlags::APPEND) {
            file.pos = file.logical_size();
        }
        if file.reading {
            if !file.inline {
                file.cache.invalidate();
            }
            file.reading = false;
        }

        let end = file
            .pos
            .checked_add(data.len() as u64)
            .ok_or(EmberError::FileTooLarge)?;
        if end > FILE_MAX {
            return Err(EmberError::FileTooLarge);
        }

        if file.inline && end.max(file.size) > u64::from(self.geo.inline_max) {
            self.outline(file)?;
        }

        if file.inline {
            let pos = file.pos as usize;
            let size = file.size as usize;
            if pos > size {
                // Gap from a seek past the end reads back as zeros.
                file.cache.buf[size..pos].fill(0);
            }
            file.cache.buf[pos..pos + data.len()].copy_from_slice(data);
            file.size = file.size.max(end);
            file.pos = end;
            file.dirty = true;
            return Ok(data.len());
        }

        if !file.writing && file.pos > file.size {
            let target = file.pos;
            file.pos = file.size;
            self.stream_zeros(file, target - file.size)?;
        }
        self.stream_write(file, data)?;
        file.dirty = true;
        Ok(data.len())
    }

    fn seek_impl(&mut self, file: &mut OpenFile, whence: SeekFrom) -> Result<u64> {
        // Repositioning with writes in flight flushes them first, so the
        // size below is already accurate.
        self.flush_chain(file)?;
        let target = match whence {
            SeekFrom::Start(off) => i128::from(off),
            SeekFrom::Current(off) => i128::from(file.pos) + i128::from(off),
            SeekFrom::End(off) => i128::from(file.size) + i128::from(off),
        };
        if target < 0 {
            return Err(EmberError::InvalidSeek);
        }
        let target = target as u64;
        if target > FILE_MAX {
            return Err(EmberError::FileTooLarge);
        }
        if target != file.pos {
            file.pos = target;
            file.reading = false;
        }
        Ok(target)
    }

    fn truncate_impl(&mut self, file: &mut OpenFile, size: u64) -> Result<()> {
        if !file.flags.writable() {
            return Err(EmberError::ReadOnly);
        }
        if size > FILE_MAX {
            return Err(EmberError::FileTooLarge);
        }
        self.flush_chain(file)?;
        let bs = self.geo.block_size;

        if size < file.size {
            if file.inline {
                file.size = size;
            } else if size == 0 {
                file.head = BlockAddr::NULL;
                file.size = 0;
            } else {
                // Dropping the tail of a backward-linked chain is free:
                // the head just moves to an earlier block.
                let old_index = last_index(bs, file.size);
                file.head = self.ctz_find(file.head, old_index, last_index(bs, size))?;
                file.size = size;
            }
            file.reading = false;
            file.dirty = true;
        } else if size > file.size {
            let saved = file.pos;
            if file.inline && size <= u64::from(self.geo.inline_max) {
                let old = file.size as usize;
                file.cache.buf[old..size as usize].fill(0);
                file.size = size;
            } else {
                if file.inline {
                    self.outline(file)?;
                }
                file.pos = file.size;
                let grow = size - file.size;
                self.stream_zeros(file, grow)?;
                self.flush_chain(file)?;
            }
            file.pos = saved;
            file.reading = false;
            file.dirty = true;
        }
        Ok(())
    }

    fn sync_file_impl(&mut self, file: &mut OpenFile) -> Result<()> {
        self.flush_chain(file)?;
        if !file.dirty {
            return Ok(());
        }
        let data = if file.inline {
            EntryData::Inline(file.cache.buf[..file.size as usize].to_vec())
        } else {
            EntryData::File {
                head: file.head,
                size: file.size as u32,
            }
        };
        let mut dir = self.fetch_dir(file.dir_pair)?;
        match dir.entries.iter_mut().find(|e| e.name == file.name) {
            Some(entry) => entry.data = data,
            None => dir.entries.push(DirEntry {
                name: file.name.clone(),
                data,
            }),
        }
        self.commit_dir(&mut dir, Some(&*file))?;
        file.dir_pair = dir.pair;
        file.dirty = false;
        trace!(name = %file.name, size = file.size, "synced file entry");
        Ok(())
    }

    /// Migrate an inline file's content into the block structure.
    fn outline(&mut self, file: &mut OpenFile) -> Result<()> {
        let content = file.cache.buf[..file.size as usize].to_vec();
        debug!(name = %file.name, size = content.len(), "migrating inline file to blocks");
        file.inline = false;
        file.reading = false;
        file.writing = false;
        file.cache.invalidate();
        file.head = BlockAddr::NULL;
        file.size = 0;
        let saved = file.pos;
        if !content.is_empty() {
            file.pos = 0;
            self.stream_write(file, &content)?;
            self.flush_chain(file)?;
        }
        file.pos = saved;
        file.dirty = true;
        Ok(())
    }

    /// Complete any in-flight write chain: re-append the old tail beyond
    /// the write point, program out the cache, and adopt the new chain as
    /// the handle's flushed content. The directory entry is not touched;
    /// that is `file_sync`'s job.
    pub(crate) fn flush_chain(&mut self, file: &mut OpenFile) -> Result<()> {
        if !file.writing {
            return Ok(());
        }
        let old_head = file.head;
        let old_size = file.size;
        let saved_pos = file.pos;

        if file.pos < old_size {
            // The write landed mid-file: carry the remainder of the old
            // content onto the new chain, one bounded chunk at a time.
            let mut tmp = [0u8; 64];
            while file.pos < old_size {
                let n = (old_size - file.pos).min(tmp.len() as u64) as usize;
                self.chain_read_at(old_head, old_size, file.pos, &mut tmp[..n])?;
                self.stream_write(file, &tmp[..n])?;
            }
        }

        bd_flush(&*self.dev, &self.geo, &mut file.cache, &mut self.rcache, true)?;
        file.head = file.block;
        file.size = file.pos;
        file.pos = saved_pos;
        file.writing = false;
        Ok(())
    }

    /// Stream bytes onto the write chain at `file.pos`, allocating and
    /// linking blocks as boundaries are crossed.
    fn stream_write(&mut self, file: &mut OpenFile, data: &[u8]) -> Result<()> {
        let bs = self.geo.block_size;
        let mut i = 0usize;
        while i < data.len() {
            if !file.writing || file.off == bs {
                if !file.writing && file.pos > 0 {
                    // Resume against the flushed chain: locate the block
                    // holding the byte before the write position.
                    let (index, _) = index_for_offset(bs, file.pos - 1);
                    let head_index = last_index(bs, file.size);
                    file.block = self.ctz_find(file.head, head_index, index)?;
                    file.index = index;
                }
                if !file.writing {
                    file.cache.invalidate();
                    file.writing = true;
                }
                self.ctz_extend(file)?;
            }
            let chunk = (data.len() - i).min((bs - file.off) as usize);
            bd_prog(
                &*self.dev,
                &self.geo,
                &mut file.cache,
                &mut self.rcache,
                true,
                file.block,
                file.off,
                &data[i..i + chunk],
            )?;
            file.pos += chunk as u64;
            file.off += chunk as u32;
            i += chunk;
        }
        Ok(())
    }

    fn stream_zeros(&mut self, file: &mut OpenFile, mut remaining: u64) -> Result<()> {
        let zeros = [0u8; 64];
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            self.stream_write(file, &zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Extend the write chain: allocate a fresh block and position the
    /// streaming state at `file.pos` within it.
    ///
    /// Mid-block positions copy-on-write the head of the current block
    /// (pointers included, since the copy keeps the same chain index);
    /// block boundaries write a fresh pointer set, walking existing
    /// stride pointers to collect the exponentially-spaced predecessors.
    fn ctz_extend(&mut self, file: &mut OpenFile) -> Result<()> {
        let bs = self.geo.block_size;
        let nblock = self.alloc(Some(&*file))?;

        if file.pos == 0 {
            file.block = nblock;
            file.off = 0;
            file.index = 0;
            return Ok(());
        }

        let (index, doff) = index_for_offset(bs, file.pos);
        if doff > 0 {
            let phys_end = data_base(index) + doff;
            let mut tmp = [0u8; 64];
            let mut copied = 0u32;
            while copied < phys_end {
                let n = (phys_end - copied).min(tmp.len() as u32) as usize;
                bd_read(
                    &*self.dev,
                    &self.geo,
                    Some(&file.cache),
                    &mut self.rcache,
                    file.block,
                    copied,
                    &mut tmp[..n],
                )?;
                bd_prog(
                    &*self.dev,
                    &self.geo,
                    &mut file.cache,
                    &mut self.rcache,
                    true,
                    nblock,
                    copied,
                    &tmp[..n],
                )?;
                copied += n as u32;
            }
            file.block = nblock;
            file.off = phys_end;
            file.index = index;
            return Ok(());
        }

        // Fresh block at a boundary: pointer k addresses index - 2^k, and
        // the address of each next predecessor is pointer k of the block
        // we just linked.
        let skips = pointer_count(index);
        let mut ptr = file.block;
        for k in 0..skips {
            bd_prog(
                &*self.dev,
                &self.geo,
                &mut file.cache,
                &mut self.rcache,
                true,
                nblock,
                4 * k,
                &ptr.0.to_le_bytes(),
            )?;
            if k + 1 < skips {
                let mut word = [0u8; 4];
                bd_read(
                    &*self.dev,
                    &self.geo,
                    Some(&file.cache),
                    &mut self.rcache,
                    ptr,
                    4 * k,
                    &mut word,
                )?;
                ptr = BlockAddr(u32::from_le_bytes(word));
            }
        }
        file.block = nblock;
        file.off = 4 * skips;
        file.index = index;
        Ok(())
    }

    /// Follow skip pointers from the chain head (at `head_index`) down to
    /// `target`, greedily taking the largest stride that fits.
    pub(crate) fn ctz_find(
        &mut self,
        head: BlockAddr,
        head_index: u32,
        target: u32,
    ) -> Result<BlockAddr> {
        let mut block = head;
        let mut index = head_index;
        while index > target {
            let gap = index - target;
            let stride = index.trailing_zeros().min(31 - gap.leading_zeros());
            let mut word = [0u8; 4];
            bd_read(
                &*self.dev,
                &self.geo,
                Some(&self.pcache),
                &mut self.rcache,
                block,
                4 * stride,
                &mut word,
            )?;
            block = BlockAddr(u32::from_le_bytes(word));
            index -= 1 << stride;
        }
        Ok(block)
    }

    /// Read from a flushed chain at an arbitrary logical position using
    /// the mount-level caches, leaving any handle cache untouched.
    fn chain_read_at(
        &mut self,
        head: BlockAddr,
        size: u64,
        mut pos: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let bs = self.geo.block_size;
        let head_index = last_index(bs, size);
        let mut i = 0usize;
        while i < buf.len() {
            let (index, doff) = index_for_offset(bs, pos);
            let block = self.ctz_find(head, head_index, index)?;
            let phys = data_base(index) + doff;
            let n = (buf.len() - i).min((bs - phys) as usize);
            bd_read(
                &*self.dev,
                &self.geo,
                Some(&self.pcache),
                &mut self.rcache,
                block,
                phys,
                &mut buf[i..i + n],
            )?;
            i += n;
            pos += n as u64;
        }
        Ok(())
    }
}
