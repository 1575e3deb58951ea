#![forbid(unsafe_code)]
//! The emberfs engine.
//!
//! A power-loss-resilient filesystem for raw erase-before-write block
//! devices. Directory metadata lives in copy-on-write block pairs whose
//! currency is decided by comparing revision counters, file data lives in
//! a backward-linked skip-list keyed by block index, and free space is
//! tracked in a bounded lookahead window rebuilt by traversing live
//! metadata. Every piece of mutable mount state is a field of [`Fs`], so
//! multiple mounts coexist in one process.
//!
//! The engine is single-threaded and synchronous: every operation runs to
//! completion, and a mount assumes exclusive ownership of its device.
//! Structural mutations are ordered so that a crash at any instruction
//! boundary leaves the previous committed state intact; the only data a
//! crash can lose is writes not yet flushed through a handle.

mod file;
mod pair;

pub use ember_error::{EmberError, Result};
pub use file::{FileHandle, OpenFlags};
pub(crate) use file::OpenFile;
pub(crate) use pair::Dir;

use ember_alloc::Lookahead;
use ember_block::{bd_erase, bd_flush, bd_prog, bd_read, bd_sync, BlockDevice, CacheBuf};
use ember_ondisk::{
    encode_meta_block, last_index, EntryData, Superblock, SUPER_VERSION,
};
use ember_types::{BlockAddr, Geometry, Revision, NAME_MAX};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Blocks 0 and 1 always form the root metadata pair.
pub const ROOT_PAIR: [BlockAddr; 2] = [BlockAddr(0), BlockAddr(1)];

/// Entry kind as reported by [`Fs::stat`] and [`Fs::read_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Dir,
}

/// Directory listing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryType,
    pub size: u32,
}

/// Mounted filesystem state.
///
/// Owns the device handle, both mount-level caches, the allocator window,
/// and the open-file table. Dropped without [`Fs::unmount`], any unflushed
/// handle data is lost, which is the documented crash contract anyway.
pub struct Fs {
    geo: Geometry,
    dev: Arc<dyn BlockDevice>,
    rcache: CacheBuf,
    pcache: CacheBuf,
    lookahead: Lookahead,
    files: Vec<Option<OpenFile>>,
    /// Blocks handed out by the allocator that are not yet reachable from
    /// committed metadata; kept marked so a window rebuild cannot hand
    /// them out twice. Cleared whenever a commit lands.
    reserved: Vec<u32>,
    next_gen: u32,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("geo", &self.geo)
            .field("open_files", &self.files.iter().flatten().count())
            .finish_non_exhaustive()
    }
}

fn geometry_error(err: ember_types::GeometryError) -> EmberError {
    EmberError::InvalidGeometry(err.to_string())
}

fn check_device(dev: &dyn BlockDevice, geo: &Geometry) -> Result<()> {
    if dev.block_size() != geo.block_size {
        return Err(EmberError::InvalidGeometry(format!(
            "device block_size {} != configured {}",
            dev.block_size(),
            geo.block_size
        )));
    }
    if dev.block_count() != geo.block_count {
        return Err(EmberError::InvalidGeometry(format!(
            "device block_count {} != configured {}",
            dev.block_count(),
            geo.block_count
        )));
    }
    Ok(())
}

/// Write a fresh, empty filesystem onto the device.
///
/// Programs one side of the root pair with the superblock record and an
/// empty directory; the sibling is left erased so revision comparison
/// settles currency at the next mount.
pub fn format(dev: &dyn BlockDevice, geo: &Geometry) -> Result<()> {
    geo.validate().map_err(geometry_error)?;
    check_device(dev, geo)?;

    let sb = Superblock {
        version: SUPER_VERSION,
        block_size: geo.block_size,
        block_count: geo.block_count,
        inline_max: geo.inline_max,
        name_max: NAME_MAX as u32,
    };
    let mut payload = Vec::new();
    sb.encode(&mut payload);
    let image = encode_meta_block(Revision(1), 1, &payload);

    let mut pcache = CacheBuf::new(geo.cache_size);
    let mut rcache = CacheBuf::new(geo.cache_size);
    bd_erase(dev, ROOT_PAIR[0])?;
    bd_erase(dev, ROOT_PAIR[1])?;
    bd_prog(dev, geo, &mut pcache, &mut rcache, true, ROOT_PAIR[0], 0, &image)?;
    bd_flush(dev, geo, &mut pcache, &mut rcache, true)?;
    dev.sync()?;
    debug!(
        block_size = geo.block_size,
        block_count = geo.block_count,
        "formatted filesystem"
    );
    Ok(())
}

impl Fs {
    /// Mount the filesystem on `dev`.
    ///
    /// Validates the configured geometry before any I/O, then requires a
    /// readable root pair whose stored geometry matches the configuration.
    pub fn mount(dev: Arc<dyn BlockDevice>, geo: Geometry) -> Result<Self> {
        geo.validate().map_err(geometry_error)?;
        check_device(&*dev, &geo)?;

        let mut fs = Self {
            lookahead: Lookahead::new(geo.lookahead_size, geo.block_count, 0),
            rcache: CacheBuf::new(geo.cache_size),
            pcache: CacheBuf::new(geo.cache_size),
            files: Vec::new(),
            reserved: Vec::new(),
            next_gen: 1,
            geo,
            dev,
        };

        let root = fs.fetch_dir(ROOT_PAIR).map_err(|err| match err {
            EmberError::Corruption { detail, .. } => EmberError::CorruptFilesystem(detail),
            other => other,
        })?;
        let Some(sb) = root.superblock else {
            return Err(EmberError::CorruptFilesystem(
                "root pair carries no superblock record".into(),
            ));
        };
        for (field, stored, configured) in [
            ("block_size", sb.block_size, fs.geo.block_size),
            ("block_count", sb.block_count, fs.geo.block_count),
            ("inline_max", sb.inline_max, fs.geo.inline_max),
        ] {
            if stored != configured {
                return Err(EmberError::GeometryMismatch {
                    field,
                    stored,
                    configured,
                });
            }
        }

        // Seed the window from the root revision so consecutive mounts
        // don't all start wearing the low block numbers.
        fs.lookahead.rebase(root.rev.0 % fs.geo.block_count);
        fs.populate_lookahead(None)?;
        debug!(rev = root.rev.0, "mounted filesystem");
        Ok(fs)
    }

    /// Flush mount-level state and release the filesystem.
    ///
    /// Handles still open lose their unflushed writes, per the crash
    /// contract; committed metadata is untouched by that loss.
    pub fn unmount(mut self) -> Result<()> {
        bd_sync(&*self.dev, &self.geo, &mut self.pcache, &mut self.rcache, true)?;
        debug!("unmounted filesystem");
        Ok(())
    }

    /// Configured geometry for this mount.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    // ── Block allocation ────────────────────────────────────────────────

    /// Hand out a freshly erased block.
    ///
    /// Takes the next free bit from the lookahead window; when the window
    /// is exhausted it slides forward and is rebuilt from a traversal of
    /// live metadata (including `scratch`, the open file currently
    /// detached from the table, if any). A full device pass with nothing
    /// free is `NoSpace`.
    pub(crate) fn alloc(&mut self, scratch: Option<&OpenFile>) -> Result<BlockAddr> {
        loop {
            if let Some(block) = self.lookahead.take_free() {
                trace!(block = block.0, "allocated block");
                bd_erase(&*self.dev, block)?;
                if self.rcache.block == Some(block) {
                    self.rcache.invalidate();
                }
                self.lookahead.ack();
                self.reserved.push(block.0);
                return Ok(block);
            }
            if !self.lookahead.slide() {
                return Err(EmberError::NoSpace);
            }
            trace!(start = self.lookahead.start(), "sliding lookahead window");
            self.populate_lookahead(scratch)?;
        }
    }

    fn populate_lookahead(&mut self, scratch: Option<&OpenFile>) -> Result<()> {
        let mut la = std::mem::replace(
            &mut self.lookahead,
            Lookahead::new(8, self.geo.block_count, 0),
        );
        let res = self.traverse(scratch, true, &mut |block| la.mark(block));
        for &block in &self.reserved {
            la.mark(block);
        }
        self.lookahead = la;
        res
    }

    /// Visit every block referenced by live metadata.
    ///
    /// Covers the root pair, every directory pair, and every committed
    /// file chain; with `include_open`, also the in-RAM chains of open
    /// handles (whose pending cache bytes shadow the device during
    /// pointer reads).
    pub(crate) fn traverse(
        &mut self,
        scratch: Option<&OpenFile>,
        include_open: bool,
        f: &mut dyn FnMut(u32),
    ) -> Result<()> {
        f(ROOT_PAIR[0].0);
        f(ROOT_PAIR[1].0);
        let mut queue = vec![ROOT_PAIR];
        while let Some(pair) = queue.pop() {
            let dir = self.fetch_dir(pair)?;
            for entry in &dir.entries {
                match &entry.data {
                    EntryData::Dir { pair } => {
                        f(pair[0].0);
                        f(pair[1].0);
                        queue.push(*pair);
                    }
                    EntryData::File { head, size } if *size > 0 => {
                        let index = last_index(self.geo.block_size, u64::from(*size));
                        walk_chain(
                            &*self.dev,
                            &self.geo,
                            Some(&self.pcache),
                            &mut self.rcache,
                            *head,
                            index,
                            f,
                        )?;
                    }
                    _ => {}
                }
            }
        }

        if include_open {
            for i in 0..self.files.len() {
                let Some(open) = &self.files[i] else { continue };
                if !open.inline && open.size > 0 && !open.head.is_null() {
                    walk_chain(
                        &*self.dev,
                        &self.geo,
                        Some(&self.pcache),
                        &mut self.rcache,
                        open.head,
                        last_index(self.geo.block_size, open.size),
                        f,
                    )?;
                }
                if open.writing && !open.block.is_null() {
                    walk_chain(
                        &*self.dev,
                        &self.geo,
                        Some(&open.cache),
                        &mut self.rcache,
                        open.block,
                        open.index,
                        f,
                    )?;
                }
            }
            if let Some(open) = scratch {
                if !open.inline && open.size > 0 && !open.head.is_null() {
                    walk_chain(
                        &*self.dev,
                        &self.geo,
                        Some(&self.pcache),
                        &mut self.rcache,
                        open.head,
                        last_index(self.geo.block_size, open.size),
                        f,
                    )?;
                }
                if open.writing && !open.block.is_null() {
                    walk_chain(
                        &*self.dev,
                        &self.geo,
                        Some(&open.cache),
                        &mut self.rcache,
                        open.block,
                        open.index,
                        f,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Number of blocks currently referenced by committed metadata.
    pub fn fs_size(&mut self) -> Result<u64> {
        let mut count = 0u64;
        self.traverse(None, false, &mut |_| count += 1)?;
        Ok(count)
    }

    // ── Namespace operations ────────────────────────────────────────────

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (mut dir, name) = self.resolve_parent(path)?;
        ember_ondisk::validate_name(&name).map_err(|_| EmberError::NameTooLong)?;
        if dir.entries.iter().any(|e| e.name == name) {
            return Err(EmberError::Exists(path.to_owned()));
        }

        // The child pair is fully written before the parent commit makes
        // it reachable; a crash in between just leaks two blocks until
        // the next window rebuild.
        let a = self.alloc(None)?;
        let b = self.alloc(None)?;
        let image = encode_meta_block(Revision(1), 1, &[]);
        bd_prog(&*self.dev, &self.geo, &mut self.pcache, &mut self.rcache, true, a, 0, &image)?;
        bd_flush(&*self.dev, &self.geo, &mut self.pcache, &mut self.rcache, true)?;

        dir.entries.push(ember_ondisk::DirEntry {
            name,
            data: EntryData::Dir { pair: [a, b] },
        });
        self.commit_dir(&mut dir, None)?;
        debug!(path, pair0 = a.0, pair1 = b.0, "created directory");
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (mut dir, name) = self.resolve_parent(path)?;
        let Some(pos) = dir.entries.iter().position(|e| e.name == name) else {
            return Err(EmberError::NotFound(path.to_owned()));
        };
        if let EntryData::Dir { pair } = dir.entries[pos].data {
            let child = self.fetch_dir(pair)?;
            if !child.entries.is_empty() {
                return Err(EmberError::NotEmpty);
            }
        }
        dir.entries.remove(pos);
        self.commit_dir(&mut dir, None)?;
        debug!(path, "removed entry");
        Ok(())
    }

    /// List a directory.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<EntryInfo>> {
        let segments = path_segments(path);
        let dir = self.resolve_dir_segments(path, &segments)?;
        Ok(dir.entries.iter().map(entry_info).collect())
    }

    /// Look up one path.
    pub fn stat(&mut self, path: &str) -> Result<EntryInfo> {
        let mut segments = path_segments(path);
        match segments.last().copied() {
            None => Ok(EntryInfo {
                name: "/".into(),
                kind: EntryType::Dir,
                size: 0,
            }),
            Some("..") => {
                self.resolve_dir_segments(path, &segments)?;
                Ok(EntryInfo {
                    name: "..".into(),
                    kind: EntryType::Dir,
                    size: 0,
                })
            }
            Some(last) => {
                let name = last.to_owned();
                segments.pop();
                let dir = self.resolve_dir_segments(path, &segments)?;
                let Some(entry) = dir.entries.iter().find(|e| e.name == name) else {
                    return Err(EmberError::NotFound(path.to_owned()));
                };
                Ok(entry_info(entry))
            }
        }
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Walk `segments` down from the root; every segment must name a
    /// directory. `..` steps back up (saturating at the root).
    pub(crate) fn resolve_dir_segments(&mut self, path: &str, segments: &[&str]) -> Result<Dir> {
        let mut cur = ROOT_PAIR;
        let mut parents: Vec<[BlockAddr; 2]> = Vec::new();
        for &seg in segments {
            if seg == ".." {
                cur = parents.pop().unwrap_or(ROOT_PAIR);
                continue;
            }
            let dir = self.fetch_dir(cur)?;
            match dir.entries.iter().find(|e| e.name == seg) {
                Some(entry) => match entry.data {
                    EntryData::Dir { pair } => {
                        parents.push(cur);
                        cur = pair;
                    }
                    _ => return Err(EmberError::NotDirectory),
                },
                None => return Err(EmberError::NotFound(path.to_owned())),
            }
        }
        self.fetch_dir(cur)
    }

    /// Split `path` into its parent directory and final name.
    pub(crate) fn resolve_parent(&mut self, path: &str) -> Result<(Dir, String)> {
        let mut segments = path_segments(path);
        let Some(last) = segments.pop() else {
            return Err(EmberError::IsDirectory);
        };
        if last == ".." {
            return Err(EmberError::IsDirectory);
        }
        let dir = self.resolve_dir_segments(path, &segments)?;
        Ok((dir, last.to_owned()))
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

fn entry_info(entry: &ember_ondisk::DirEntry) -> EntryInfo {
    EntryInfo {
        name: entry.name.clone(),
        kind: if entry.is_dir() {
            EntryType::Dir
        } else {
            EntryType::File
        },
        size: entry.size(),
    }
}

/// Walk a skip-list chain from `block` (chain index `index`) down to index
/// zero, reporting every block address, following the stride-1 pointers.
fn walk_chain(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    pcache: Option<&CacheBuf>,
    rcache: &mut CacheBuf,
    mut block: BlockAddr,
    mut index: u32,
    f: &mut dyn FnMut(u32),
) -> Result<()> {
    loop {
        f(block.0);
        if index == 0 {
            return Ok(());
        }
        let mut word = [0u8; 4];
        bd_read(dev, geo, pcache, rcache, block, 0, &mut word)?;
        block = BlockAddr(u32::from_le_bytes(word));
        index -= 1;
    }
}
