#![forbid(unsafe_code)]
//! Test support for emberfs: the reference driver scenario, fault-injecting
//! device wrappers, and geometry presets shared by the integration suites
//! and the harness binary.

use ember_block::BlockDevice;
use ember_error::{EmberError, Result};
use ember_types::{BlockAddr, Geometry};
use emberfs::{format, Fs, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The geometry the reference driver configures.
#[must_use]
pub fn reference_geometry() -> Geometry {
    Geometry {
        read_size: 16,
        prog_size: 16,
        block_size: 320,
        block_count: 3,
        cache_size: 32,
        lookahead_size: 16,
        block_cycles: 500,
        inline_max: 32,
    }
}

// ── Fault injection ─────────────────────────────────────────────────────────

/// Device wrapper that simulates power loss after a budget of write
/// operations (programs and erases).
///
/// Once the budget is spent, every operation fails, as if the machine had
/// stopped; reads performed before the cut are unaffected. Sweeping the
/// budget over a workload exercises every commit boundary.
pub struct PowerCutDevice {
    inner: Arc<dyn BlockDevice>,
    remaining: AtomicU64,
    used: AtomicU64,
    dead: AtomicBool,
}

impl std::fmt::Debug for PowerCutDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerCutDevice")
            .field("remaining", &self.remaining)
            .field("used", &self.used)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl PowerCutDevice {
    #[must_use]
    pub fn new(inner: Arc<dyn BlockDevice>, budget: u64) -> Self {
        Self {
            inner,
            remaining: AtomicU64::new(budget),
            used: AtomicU64::new(0),
            dead: AtomicBool::new(false),
        }
    }

    /// Write operations performed so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn power_lost() -> EmberError {
        EmberError::Io(std::io::Error::other("simulated power loss"))
    }

    fn spend(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Self::power_lost());
        }
        loop {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                self.dead.store(true, Ordering::SeqCst);
                return Err(Self::power_lost());
            }
            if self
                .remaining
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.used.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }
    }
}

impl BlockDevice for PowerCutDevice {
    fn read(&self, block: BlockAddr, off: u32, buf: &mut [u8]) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Self::power_lost());
        }
        self.inner.read(block, off, buf)
    }

    fn program(&self, block: BlockAddr, off: u32, data: &[u8]) -> Result<()> {
        self.spend()?;
        self.inner.program(block, off, data)
    }

    fn erase(&self, block: BlockAddr) -> Result<()> {
        self.spend()?;
        self.inner.erase(block)
    }

    fn sync(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Self::power_lost());
        }
        self.inner.sync()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }
}

// ── Reference scenario ──────────────────────────────────────────────────────

/// What the reference driver observed, suitable for a JSON report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub geometry: Geometry,
    pub formatted: bool,
    pub bytes_written: usize,
    pub tell_after_rewind: u64,
    pub bytes_read: usize,
    pub tell_after_read: u64,
    pub reread_matches: bool,
    pub blocks_in_use: u64,
}

/// Run the reference driver flow: mount (formatting on a virgin device),
/// write `'1'` × 26 into `file1.txt`, rewind, read it back, then remount
/// and re-read through a fresh read-only handle.
pub fn run_scenario(dev: Arc<dyn BlockDevice>, geo: Geometry) -> Result<ScenarioReport> {
    let msg = vec![b'1'; 26];

    let (mut fs, formatted) = match Fs::mount(dev.clone(), geo) {
        Ok(fs) => (fs, false),
        Err(_) => {
            format(&*dev, &geo)?;
            (Fs::mount(dev.clone(), geo)?, true)
        }
    };

    let fh = fs.file_open("file1.txt", OpenFlags::READ_WRITE | OpenFlags::CREATE)?;
    let bytes_written = fs.file_write(fh, &msg)?;
    fs.file_rewind(fh)?;
    let tell_after_rewind = fs.file_tell(fh)?;

    let mut buf = [0u8; 100];
    let bytes_read = fs.file_read(fh, &mut buf)?;
    let tell_after_read = fs.file_tell(fh)?;
    let first_read_matches = &buf[..bytes_read] == msg.as_slice();

    fs.file_close(fh)?;
    let blocks_in_use = fs.fs_size()?;
    fs.unmount()?;

    let mut fs = Fs::mount(dev, geo)?;
    let fh = fs.file_open("file1.txt", OpenFlags::READ_ONLY)?;
    let mut reread = [0u8; 100];
    let n = fs.file_read(fh, &mut reread)?;
    let reread_matches =
        first_read_matches && n == msg.len() && &reread[..n] == msg.as_slice();
    fs.file_close(fh)?;
    fs.unmount()?;

    Ok(ScenarioReport {
        geometry: geo,
        formatted,
        bytes_written,
        tell_after_rewind,
        bytes_read,
        tell_after_read,
        reread_matches,
        blocks_in_use,
    })
}

/// Tiny deterministic generator for randomized-but-reproducible workloads.
#[derive(Debug, Clone)]
pub struct Xorshift(u64);

impl Xorshift {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 32) as u32
    }

    /// Uniform-ish value in `[lo, hi)`.
    pub fn range(&mut self, lo: u32, hi: u32) -> u32 {
        lo + self.next_u32() % (hi - lo)
    }
}
