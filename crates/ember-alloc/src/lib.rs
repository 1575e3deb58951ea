#![forbid(unsafe_code)]
//! Free-block lookahead allocation.
//!
//! A full free list or a whole-device bitmap would not fit in bounded RAM
//! for large devices, so free space is tracked in a bounded window: a
//! bitmap covering `lookahead_size` contiguously numbered blocks starting
//! at a rotating offset. Set bits mean "possibly in use"; the window is
//! conservative, so a block it reports free is guaranteed not referenced by
//! the metadata that was traversed into it.
//!
//! The window itself is pure bookkeeping. `ember-core` owns the refill
//! loop: when the window is exhausted it slides forward (wrapping at
//! `block_count`), the bitmap is cleared, and a traversal of live metadata
//! calls [`Lookahead::mark`] for every referenced block.

use ember_types::BlockAddr;

// ── Bitmap primitives ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Count clear bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u32
}

/// Find the first clear bit in `[start, count)`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Lookahead window ────────────────────────────────────────────────────────

/// Bounded free-block window over a rotating range of block numbers.
#[derive(Debug, Clone)]
pub struct Lookahead {
    /// First block number covered by the window.
    start: u32,
    /// Window size in blocks; at most `block_count`.
    size: u32,
    /// Total blocks on the device.
    block_count: u32,
    /// Scan cursor within the window.
    next: u32,
    /// Blocks consumed since the last acknowledged allocation; once this
    /// reaches `block_count` a full device pass found nothing free.
    scanned: u32,
    bitmap: Vec<u8>,
}

impl Lookahead {
    /// Create a window of `lookahead_size` blocks (clamped to the device)
    /// positioned at `start`. The window starts exhausted; the owner must
    /// populate it with a traversal before taking blocks.
    #[must_use]
    pub fn new(lookahead_size: u32, block_count: u32, start: u32) -> Self {
        let size = lookahead_size.min(block_count);
        Self {
            start: start % block_count,
            size,
            block_count,
            next: size, // exhausted until the first rebase+populate
            scanned: 0,
            bitmap: vec![0; (size as usize).div_ceil(8)],
        }
    }

    /// First block covered by the window.
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Window size in blocks.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the scan cursor has passed the end of the window.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.next >= self.size
    }

    /// Slide the window to the next range and clear it for repopulation.
    ///
    /// Returns `false` when a whole device pass has completed since the
    /// last acknowledged allocation, i.e. the device is full.
    pub fn slide(&mut self) -> bool {
        if self.scanned >= self.block_count {
            return false;
        }
        self.scanned = self.scanned.saturating_add(self.size);
        self.start = (self.start + self.size) % self.block_count;
        self.next = 0;
        self.bitmap.fill(0);
        true
    }

    /// Rewind the window to `start` and clear it for repopulation,
    /// resetting the full-pass accounting. Used once at mount.
    pub fn rebase(&mut self, start: u32) {
        self.start = start % self.block_count;
        self.next = 0;
        self.scanned = self.size;
        self.bitmap.fill(0);
    }

    /// Record `block` as possibly in use if it falls inside the window.
    pub fn mark(&mut self, block: u32) {
        let rel = ((u64::from(block) + u64::from(self.block_count) - u64::from(self.start))
            % u64::from(self.block_count)) as u32;
        if rel < self.size {
            bitmap_set(&mut self.bitmap, rel);
        }
    }

    /// Take the next free block from the window, if any.
    pub fn take_free(&mut self) -> Option<BlockAddr> {
        let rel = bitmap_find_free(&self.bitmap, self.size, self.next)?;
        bitmap_set(&mut self.bitmap, rel);
        self.next = rel + 1;
        Some(BlockAddr((self.start + rel) % self.block_count))
    }

    /// Acknowledge a successful allocation: the device demonstrably had a
    /// free block, so the full-pass accounting starts over.
    pub fn ack(&mut self) {
        self.scanned = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bitmap_basics() {
        let mut bm = vec![0u8; 2];
        assert!(!bitmap_get(&bm, 9));
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 9));
        assert_eq!(bitmap_count_free(&bm, 16), 15);
        assert_eq!(bitmap_find_free(&bm, 16, 9), Some(10));
        assert_eq!(bitmap_find_free(&bm, 10, 9), None);
    }

    #[test]
    fn window_clamps_to_device() {
        let la = Lookahead::new(16, 3, 0);
        assert_eq!(la.size(), 3);
    }

    #[test]
    fn marked_blocks_are_skipped() {
        let mut la = Lookahead::new(8, 8, 0);
        la.rebase(0);
        la.mark(0);
        la.mark(1);
        la.mark(5);
        assert_eq!(la.take_free(), Some(BlockAddr(2)));
        assert_eq!(la.take_free(), Some(BlockAddr(3)));
        assert_eq!(la.take_free(), Some(BlockAddr(4)));
        assert_eq!(la.take_free(), Some(BlockAddr(6)));
        assert_eq!(la.take_free(), Some(BlockAddr(7)));
        assert_eq!(la.take_free(), None);
        assert!(la.exhausted());
    }

    #[test]
    fn window_wraps_block_numbers() {
        let mut la = Lookahead::new(8, 10, 6);
        la.rebase(6);
        // Window covers blocks 6..10 then 0..4.
        la.mark(6);
        la.mark(7);
        la.mark(9);
        la.mark(0);
        assert_eq!(la.take_free(), Some(BlockAddr(8)));
        assert_eq!(la.take_free(), Some(BlockAddr(1)));
        // Marks outside the window are ignored.
        la.mark(5);
        assert_eq!(la.take_free(), Some(BlockAddr(2)));
    }

    #[test]
    fn full_pass_without_ack_reports_exhaustion() {
        let mut la = Lookahead::new(8, 16, 0);
        la.rebase(0);
        // First slide moves to blocks 8..16, second would complete the pass.
        assert!(la.slide());
        assert!(!la.slide());
        // An acknowledged allocation resets the accounting.
        la.ack();
        assert!(la.slide());
    }

    proptest! {
        #[test]
        fn never_returns_a_marked_block(
            marks in proptest::collection::vec(0u32..64, 0..48),
            start in 0u32..64,
        ) {
            let mut la = Lookahead::new(16, 64, 0);
            la.rebase(start);
            for &m in &marks {
                la.mark(m);
            }
            let mut seen = Vec::new();
            while let Some(BlockAddr(b)) = la.take_free() {
                prop_assert!(!marks.contains(&b), "allocated marked block {b}");
                prop_assert!(!seen.contains(&b), "allocated block {b} twice");
                seen.push(b);
            }
        }
    }
}
