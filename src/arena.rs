//! Arena façade: owns the backing buffer, hands out opaque keys, and fuses
//! fragmented free space by shifting live records left.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Result, TalusError};
use crate::fsm::{FreeSpaceManager, Reservation};
use crate::keymap::{KeyMap, DEFAULT_SHARDS};
use crate::treap::FreeSpan;

/// Bytes holding the little-endian payload length.
pub const HEADER_LEN: u64 = 8;
/// Bytes holding the little-endian record key.
pub const KEY_LEN: u64 = 8;
/// Fixed per-record cost in front of the payload.
pub const RECORD_OVERHEAD: u64 = HEADER_LEN + KEY_LEN;

/// Opaque identity of a stored record, valid from `write` until `free`.
///
/// Keys are issued monotonically starting at 2; 0 and 1 are never issued, so
/// stale bytes in a recycled buffer cannot masquerade as live records.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordKey(pub u64);

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Construction-time tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct ArenaOptions {
    /// Number of key-map shards. Must be a power of two between 16 and 64.
    pub key_shards: usize,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            key_shards: DEFAULT_SHARDS,
        }
    }
}

impl ArenaOptions {
    fn validate(&self) -> Result<()> {
        if !self.key_shards.is_power_of_two() || !(16..=64).contains(&self.key_shards) {
            return Err(TalusError::Invalid(
                "key shard count must be a power of two between 16 and 64",
            ));
        }
        Ok(())
    }
}

/// Counters tracking arena activity.
#[derive(Default)]
pub struct ArenaMetrics {
    writes: AtomicU64,
    reads: AtomicU64,
    frees: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_shifted: AtomicU64,
    shift_runs: AtomicU64,
}

/// Snapshot of arena metrics at a point in time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArenaMetricsSnapshot {
    /// Records written.
    pub writes: u64,
    /// Records read back.
    pub reads: u64,
    /// Records freed.
    pub frees: u64,
    /// Payload bytes written.
    pub bytes_written: u64,
    /// Payload bytes copied out by reads.
    pub bytes_read: u64,
    /// Live bytes relocated by compaction.
    pub bytes_shifted: u64,
    /// Number of record runs relocated by compaction.
    pub shift_runs: u64,
}

impl ArenaMetrics {
    /// Records written so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Records read so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Records freed so far.
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Live bytes relocated by compaction so far.
    pub fn bytes_shifted(&self) -> u64 {
        self.bytes_shifted.load(Ordering::Relaxed)
    }

    /// Creates a snapshot of the current counters.
    pub fn snapshot(&self) -> ArenaMetricsSnapshot {
        ArenaMetricsSnapshot {
            writes: self.writes(),
            reads: self.reads(),
            frees: self.frees(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_shifted: self.bytes_shifted(),
            shift_runs: self.shift_runs.load(Ordering::Relaxed),
        }
    }

    fn add_write(&self, payload: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(payload, Ordering::Relaxed);
    }

    fn add_read(&self, payload: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(payload, Ordering::Relaxed);
    }

    fn add_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn add_shift(&self, bytes: u64) {
        self.shift_runs.fetch_add(1, Ordering::Relaxed);
        self.bytes_shifted.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Fixed-capacity byte arena storing length-prefixed, key-tagged records.
///
/// Generic over any stably-addressed contiguous buffer (`Vec<u8>`,
/// `Box<[u8]>`, a mutable memory map). The buffer never grows and its
/// contents are meaningless once the arena is dropped.
pub struct Arena<B> {
    buf: RwLock<B>,
    size: u64,
    fsm: FreeSpaceManager,
    keymap: KeyMap,
    key: AtomicU64,
    metrics: Arc<ArenaMetrics>,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Arena<B> {
    /// Wraps `buffer` as an empty arena. The buffer must be longer than one
    /// record header (16 bytes).
    pub fn new(buffer: B) -> Result<Self> {
        Self::with_options(buffer, ArenaOptions::default())
    }

    pub fn with_options(buffer: B, options: ArenaOptions) -> Result<Self> {
        options.validate()?;
        let size = buffer.as_ref().len() as u64;
        if size <= RECORD_OVERHEAD {
            return Err(TalusError::Invalid("buffer too small for any record"));
        }
        let fsm = FreeSpaceManager::new();
        fsm.add(FreeSpan::new(0, size - 1))?;
        Ok(Self {
            buf: RwLock::new(buffer),
            size,
            fsm,
            keymap: KeyMap::new(options.key_shards),
            key: AtomicU64::new(1),
            metrics: Arc::new(ArenaMetrics::default()),
        })
    }

    /// Total buffer length in bytes.
    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Returns a handle to the activity counters.
    pub fn metrics(&self) -> Arc<ArenaMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stores `payload` and returns its key.
    ///
    /// Reserves free space first; when the reservation spans several free
    /// intervals, the live records between them are shifted left under the
    /// exclusive side of the arena lock until one interval large enough
    /// emerges. Fails with `NotEnoughSpace` when the arena provably cannot
    /// hold the record.
    pub fn write(&self, payload: &[u8]) -> Result<RecordKey> {
        let key = RecordKey(self.key.fetch_add(1, Ordering::SeqCst) + 1);
        let total = RECORD_OVERHEAD + payload.len() as u64;
        let tail = match self.fsm.reserve(total)? {
            Reservation::Ready(mut slot) => {
                let mut buf = self.buf.write();
                let pos = slot.start;
                write_record(buf.as_mut(), pos, key, payload);
                self.keymap.store(key.0, pos);
                slot.start += total;
                slot
            }
            Reservation::Fuse => {
                // the bundle is picked only now, under the exclusive lock,
                // so nothing can slip new spans or records into its gaps
                let mut buf = self.buf.write();
                let mut bundle = self.fsm.take_fused(total)?;
                let mem = buf.as_mut();
                for i in 0..bundle.len() - 1 {
                    let fused_start = self.shift_run(mem, bundle[i], bundle[i + 1].start);
                    bundle[i + 1].start = fused_start;
                }
                let mut slot = bundle[bundle.len() - 1];
                let pos = slot.start;
                write_record(mem, pos, key, payload);
                self.keymap.store(key.0, pos);
                slot.start += total;
                slot
            }
        };
        self.fsm.restore(tail)?;
        self.metrics.add_write(payload.len() as u64);
        trace!(key = key.0, len = payload.len(), "arena.write");
        Ok(key)
    }

    /// Copies out the payload stored under `key`.
    pub fn read(&self, key: RecordKey) -> Result<Vec<u8>> {
        let buf = self.buf.read();
        let mem = buf.as_ref();
        let pos = self
            .keymap
            .load(key.0)
            .ok_or(TalusError::WrongReadPosition)?;
        if pos + RECORD_OVERHEAD > self.size {
            return Err(TalusError::WrongReadPosition);
        }
        let len = read_u64_le(mem, pos);
        let data_start = pos + RECORD_OVERHEAD;
        if data_start + len > self.size {
            return Err(TalusError::Corruption(
                "record payload extends past the arena end",
            ));
        }
        let out = mem[data_start as usize..(data_start + len) as usize].to_vec();
        self.metrics.add_read(len);
        trace!(key = key.0, len, "arena.read");
        Ok(out)
    }

    /// Releases the record stored under `key`; its span merges back into the
    /// free-space index.
    pub fn free(&self, key: RecordKey) -> Result<()> {
        let buf = self.buf.write();
        let mem = buf.as_ref();
        let pos = self
            .keymap
            .load_and_delete(key.0)
            .ok_or(TalusError::WrongReadPosition)?;
        if pos + RECORD_OVERHEAD > self.size {
            return Err(TalusError::Corruption("freed record header out of bounds"));
        }
        let len = read_u64_le(mem, pos);
        let end = pos + RECORD_OVERHEAD + len - 1;
        if end >= self.size {
            return Err(TalusError::Corruption(
                "freed record payload extends past the arena end",
            ));
        }
        // The span must reach the index before the exclusive lock drops:
        // a compaction racing with the tail of this call could otherwise
        // re-parse the dead header and resurrect the key.
        self.fsm.add(FreeSpan::new(pos, end))?;
        drop(buf);
        self.metrics.add_free();
        trace!(key = key.0, start = pos, end, "arena.free");
        Ok(())
    }

    /// Free bytes tracked by the pool, observed at quiescence (after every
    /// in-flight write has returned its reservation).
    pub fn total_free_space(&self) -> u64 {
        self.fsm.total_free_space()
    }

    /// Consumes the arena and returns the backing buffer. Record bookkeeping
    /// is discarded; the bytes are only meaningful to a caller that kept its
    /// own notion of the layout.
    pub fn into_inner(self) -> B {
        self.buf.into_inner()
    }

    /// Moves the run of live records sitting in `[gap.end + 1, run_end)`
    /// left to `gap.start`, rewriting the key map entry of every record in
    /// the run, and returns the start of the fused free interval that
    /// emerges behind it.
    fn shift_run(&self, mem: &mut [u8], gap: FreeSpan, run_end: u64) -> u64 {
        let src_start = gap.end + 1;
        let dst_start = gap.start;
        let fused_start = gap.start + (run_end - gap.end - 1);
        let mut at = src_start;
        let mut moved = 0u64;
        while at < run_end {
            if at + RECORD_OVERHEAD > self.size {
                panic!("record header extends past the arena end during compaction");
            }
            let len = read_u64_le(mem, at);
            let key = read_u64_le(mem, at + HEADER_LEN);
            self.keymap.store(key, dst_start + moved);
            let span = RECORD_OVERHEAD + len;
            moved += span;
            at += span;
        }
        mem.copy_within(src_start as usize..run_end as usize, dst_start as usize);
        self.metrics.add_shift(run_end - src_start);
        debug!(
            from = src_start,
            to = dst_start,
            bytes = run_end - src_start,
            "arena.shift"
        );
        fused_start
    }
}

fn write_record(mem: &mut [u8], pos: u64, key: RecordKey, payload: &[u8]) {
    let pos = pos as usize;
    mem[pos..pos + HEADER_LEN as usize].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    mem[pos + HEADER_LEN as usize..pos + RECORD_OVERHEAD as usize]
        .copy_from_slice(&key.0.to_le_bytes());
    mem[pos + RECORD_OVERHEAD as usize..pos + RECORD_OVERHEAD as usize + payload.len()]
        .copy_from_slice(payload);
}

fn read_u64_le(mem: &[u8], pos: u64) -> u64 {
    let pos = pos as usize;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&mem[pos..pos + 8]);
    u64::from_le_bytes(raw)
}
