//! Metadata pair management.
//!
//! Each directory is one logical metadata region stored in a pair of
//! physical blocks. Exactly one side is current at any time, decided
//! purely by comparing the revision counters in the two block headers, so
//! no separate commit flag ever exists on the device. A commit programs
//! the non-current side and verifies it; until that verify succeeds the
//! old side remains the state a remount recovers, which is what makes
//! commits atomic under power loss.
//!
//! Wear leveling: each metadata block header carries the erase count that
//! block has absorbed. When the side about to be rewritten has reached
//! `block_cycles`, that side is relocated to a freshly allocated block and
//! the parent directory entry is rewritten to the new pair. The root pair
//! is pinned to blocks {0, 1} by the on-device contract and only ever
//! alternates between its two sides.

use crate::{Fs, OpenFile, ROOT_PAIR};
use ember_block::{bd_erase, bd_flush, bd_prog, bd_read};
use ember_error::{EmberError, Result};
use ember_ondisk::{
    decode_meta_header, encode_entries, encode_meta_block, parse_entries, verify_meta, DirEntry,
    LayoutError, MetaHeader, Superblock, META_HEADER_LEN, SUPER_LEN,
};
use ember_types::{BlockAddr, Revision};
use tracing::{debug, trace, warn};

/// One fetched directory: the pair's identity plus its decoded state.
#[derive(Debug, Clone)]
pub struct Dir {
    /// Physical blocks of the pair; order is identity, not currency.
    pub pair: [BlockAddr; 2],
    /// Side holding the live revision.
    pub current: usize,
    pub rev: Revision,
    /// Erase counts per side; zero for a side that was unreadable.
    pub erase: [u32; 2],
    /// Present on the root pair only.
    pub superblock: Option<Superblock>,
    pub entries: Vec<DirEntry>,
}

fn layout_corruption(block: BlockAddr, err: &LayoutError) -> EmberError {
    EmberError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

impl Fs {
    /// Read one side of a pair, returning `None` for anything invalid:
    /// unreadable, truncated, or failing its checksum. A pair is usable
    /// as long as either side survives this.
    fn read_meta_side(&mut self, block: BlockAddr) -> Option<(MetaHeader, Vec<u8>)> {
        let mut header = [0u8; META_HEADER_LEN];
        bd_read(
            &*self.dev,
            &self.geo,
            Some(&self.pcache),
            &mut self.rcache,
            block,
            0,
            &mut header,
        )
        .ok()?;
        let parsed = decode_meta_header(&header).ok()?;
        let max = self.geo.block_size - META_HEADER_LEN as u32;
        if parsed.content_len > max {
            return None;
        }
        let mut payload = vec![0u8; parsed.content_len as usize];
        bd_read(
            &*self.dev,
            &self.geo,
            Some(&self.pcache),
            &mut self.rcache,
            block,
            META_HEADER_LEN as u32,
            &mut payload,
        )
        .ok()?;
        verify_meta(&header, &payload).ok()?;
        Some((parsed, payload))
    }

    /// Fetch a pair and decode its current side.
    pub(crate) fn fetch_dir(&mut self, pair: [BlockAddr; 2]) -> Result<Dir> {
        let s0 = self.read_meta_side(pair[0]);
        let s1 = self.read_meta_side(pair[1]);
        let erase = [
            s0.as_ref().map_or(0, |(h, _)| h.erase_count),
            s1.as_ref().map_or(0, |(h, _)| h.erase_count),
        ];
        if s0.is_some() != s1.is_some() {
            // Usable, and the next commit rewrites the stale side anyway.
            debug!(
                pair0 = pair[0].0,
                pair1 = pair[1].0,
                "metadata pair has a single valid side"
            );
        }
        let (current, header, payload) = match (s0, s1) {
            (Some((h0, p0)), Some((h1, p1))) => {
                if h0.revision.is_newer_than(h1.revision) {
                    (0, h0, p0)
                } else {
                    (1, h1, p1)
                }
            }
            (Some((h0, p0)), None) => (0, h0, p0),
            (None, Some((h1, p1))) => (1, h1, p1),
            (None, None) => {
                return Err(EmberError::Corruption {
                    block: pair[0].0,
                    detail: format!(
                        "metadata pair {{{}, {}}} has no valid side",
                        pair[0], pair[1]
                    ),
                });
            }
        };

        let is_root = pair == ROOT_PAIR;
        let (superblock, entry_bytes) = if is_root {
            let sb = Superblock::decode(&payload)
                .map_err(|e| layout_corruption(pair[current], &e))?;
            (Some(sb), &payload[SUPER_LEN..])
        } else {
            (None, &payload[..])
        };
        let entries =
            parse_entries(entry_bytes).map_err(|e| layout_corruption(pair[current], &e))?;

        Ok(Dir {
            pair,
            current,
            rev: header.revision,
            erase,
            superblock,
            entries,
        })
    }

    /// Commit a directory's in-RAM state to its pair.
    ///
    /// Serializes the payload, bumps the revision, and programs the
    /// non-current side with read-back verification; currency flips only
    /// once that succeeds. `scratch` is the open file currently detached
    /// from the table (if any), so a relocation's allocation still sees
    /// its uncommitted chain.
    pub(crate) fn commit_dir(&mut self, dir: &mut Dir, scratch: Option<&OpenFile>) -> Result<()> {
        let mut payload = Vec::new();
        if let Some(sb) = &dir.superblock {
            sb.encode(&mut payload);
        }
        let entry_bytes = encode_entries(&dir.entries).map_err(|e| match e {
            LayoutError::BadName(_) => EmberError::NameTooLong,
            other => layout_corruption(dir.pair[dir.current], &other),
        })?;
        payload.extend_from_slice(&entry_bytes);
        if payload.len() > self.geo.block_size as usize - META_HEADER_LEN {
            return Err(EmberError::NoSpace);
        }

        let prev_pair = dir.pair;
        let target = 1 - dir.current;
        let is_root = dir.pair == ROOT_PAIR;
        let worn = self.geo.block_cycles > 0 && dir.erase[target] >= self.geo.block_cycles;
        if !is_root && worn {
            match self.alloc(scratch) {
                Ok(nblock) => {
                    debug!(
                        old = dir.pair[target].0,
                        new = nblock.0,
                        erases = dir.erase[target],
                        "relocating worn metadata block"
                    );
                    dir.pair[target] = nblock;
                    dir.erase[target] = 1; // the allocation erased it
                }
                // Out of space: keep using the worn block rather than fail
                // the commit.
                Err(EmberError::NoSpace) => {
                    warn!(
                        block = dir.pair[target].0,
                        "no free block for relocation; reusing worn block"
                    );
                    bd_erase(&*self.dev, dir.pair[target])?;
                    if self.rcache.block == Some(dir.pair[target]) {
                        self.rcache.invalidate();
                    }
                    dir.erase[target] = dir.erase[target].saturating_add(1);
                }
                Err(other) => return Err(other),
            }
        } else {
            bd_erase(&*self.dev, dir.pair[target])?;
            if self.rcache.block == Some(dir.pair[target]) {
                self.rcache.invalidate();
            }
            dir.erase[target] = dir.erase[target].saturating_add(1);
        }

        let rev = dir.rev.next();
        let image = encode_meta_block(rev, dir.erase[target], &payload);
        bd_prog(
            &*self.dev,
            &self.geo,
            &mut self.pcache,
            &mut self.rcache,
            true,
            dir.pair[target],
            0,
            &image,
        )?;
        bd_flush(&*self.dev, &self.geo, &mut self.pcache, &mut self.rcache, true)?;
        trace!(
            pair0 = dir.pair[0].0,
            pair1 = dir.pair[1].0,
            rev = rev.0,
            bytes = payload.len(),
            "committed metadata pair"
        );

        dir.rev = rev;
        dir.current = target;

        if dir.pair != prev_pair {
            // The pair moved: rewrite the parent's entry and retarget any
            // open handles keyed on the old pair.
            for open in self.files.iter_mut().flatten() {
                if open.dir_pair == prev_pair {
                    open.dir_pair = dir.pair;
                }
            }
            self.fix_parent(prev_pair, dir.pair)?;
        }

        // Only now is everything handed out before this commit either
        // reachable on the device or orphaned; the next window rebuild
        // decides which.
        self.reserved.clear();
        self.lookahead.ack();
        Ok(())
    }

    /// Find the directory whose entry references `prev` and repoint it at
    /// `new`, committing the change (which may in turn relocate and
    /// recurse toward the root).
    fn fix_parent(&mut self, prev: [BlockAddr; 2], new: [BlockAddr; 2]) -> Result<()> {
        let mut queue = vec![ROOT_PAIR];
        while let Some(pair) = queue.pop() {
            let mut dir = self.fetch_dir(pair)?;
            let mut changed = false;
            for entry in &mut dir.entries {
                if let ember_ondisk::EntryData::Dir { pair: p } = &mut entry.data {
                    if *p == prev {
                        *p = new;
                        changed = true;
                    } else {
                        queue.push(*p);
                    }
                }
            }
            if changed {
                return self.commit_dir(&mut dir, None);
            }
        }
        Err(EmberError::Corruption {
            block: prev[0].0,
            detail: "relocated metadata pair has no parent entry".into(),
        })
    }
}
