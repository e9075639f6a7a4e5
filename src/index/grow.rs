//! Index growth state and management
//!
//! A resize doubles (or multiplies) the bucket count of the index while it
//! stays online. The old table is split chunk by chunk; each chunk is claimed
//! by exactly one thread, either the resize coordinator or an operation that
//! needs a bucket in that chunk.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::address::Address;
use crate::index::KeyHash;

/// Recomputes the full key hash of the record stored at a log address.
///
/// Index entries keep only a 14-bit tag, so migrating an entry to a larger
/// table needs the hash bits above the old table mask. Returning `None`
/// marks the record as unreadable; its entry is dropped and counted in
/// [`GrowResult::rehash_failures`].
pub type RehashFn = Arc<dyn Fn(Address) -> Option<KeyHash> + Send + Sync>;

/// Default number of old-table buckets per migration chunk
pub const HASH_TABLE_CHUNK_SIZE: u64 = 16384;

/// Configuration for index growth
#[derive(Debug, Clone)]
pub struct GrowConfig {
    /// Load factor at or above which growth is suggested
    pub max_load_factor: f64,
    /// Growth factor (new_size = old_size * growth_factor), a power of two
    pub growth_factor: u64,
    /// Whether `should_grow` may ever report true
    pub auto_grow: bool,
}

impl Default for GrowConfig {
    fn default() -> Self {
        Self {
            max_load_factor: 0.9,
            growth_factor: 2,
            auto_grow: false,
        }
    }
}

impl GrowConfig {
    /// Create a new grow configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum load factor
    pub fn with_max_load_factor(mut self, factor: f64) -> Self {
        self.max_load_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Set the growth factor, rounded up to a power of two of at least 2
    pub fn with_growth_factor(mut self, factor: u64) -> Self {
        self.growth_factor = factor.max(2).next_power_of_two();
        self
    }

    /// Enable or disable automatic growth
    pub fn with_auto_grow(mut self, auto: bool) -> Self {
        self.auto_grow = auto;
        self
    }

    /// Check if growth should be triggered
    pub fn should_grow(&self, load_factor: f64) -> bool {
        self.auto_grow && load_factor >= self.max_load_factor
    }
}

/// Whether a resize is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    /// No resize; `version` names the only live table
    Done,
    /// Resize running; `version` names the table being split
    InProgress,
}

/// Resize status plus the version (0 or 1) of the current table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeInfo {
    /// Resize phase
    pub status: ResizeStatus,
    /// Current (old, while in progress) table slot
    pub version: u8,
    /// Number of resizes started on this index.
    ///
    /// Never repeats, so an unchanged word means no resize started or
    /// finished in between.
    pub resize_seq: u64,
}

impl ResizeInfo {
    const IN_PROGRESS_BIT: u64 = 1 << 8;
    const SEQ_SHIFT: u32 = 16;

    /// Status after initialization: no resize, table slot 0
    pub const fn initial() -> Self {
        Self {
            status: ResizeStatus::Done,
            version: 0,
            resize_seq: 0,
        }
    }

    const fn pack(self) -> u64 {
        let status = match self.status {
            ResizeStatus::Done => 0,
            ResizeStatus::InProgress => Self::IN_PROGRESS_BIT,
        };
        (self.resize_seq << Self::SEQ_SHIFT) | status | (self.version as u64 & 1)
    }

    const fn unpack(word: u64) -> Self {
        Self {
            status: if word & Self::IN_PROGRESS_BIT != 0 {
                ResizeStatus::InProgress
            } else {
                ResizeStatus::Done
            },
            version: (word & 1) as u8,
            resize_seq: word >> Self::SEQ_SHIFT,
        }
    }
}

/// [`ResizeInfo`] in one atomic word, so status and version flip together
pub(crate) struct AtomicResizeInfo(AtomicU64);

impl AtomicResizeInfo {
    pub(crate) const fn new(info: ResizeInfo) -> Self {
        Self(AtomicU64::new(info.pack()))
    }

    #[inline]
    pub(crate) fn load(&self, ordering: Ordering) -> ResizeInfo {
        ResizeInfo::unpack(self.0.load(ordering))
    }

    #[inline]
    pub(crate) fn store(&self, info: ResizeInfo, ordering: Ordering) {
        self.0.store(info.pack(), ordering);
    }
}

/// Migration state of one chunk of the old table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkStatus {
    /// Not yet claimed
    Pending = 0,
    /// Claimed; entries are being copied
    Splitting = 1,
    /// Fully copied into the new table
    Done = 2,
}

impl ChunkStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ChunkStatus::Pending,
            1 => ChunkStatus::Splitting,
            _ => ChunkStatus::Done,
        }
    }
}

/// Per-chunk split progress of a running resize.
///
/// Owned by the resize target table. Besides chunk claims it carries the
/// epoch barrier that separates operations still using the old table from
/// operations that must use the new one.
pub struct SplitTracker {
    chunks: Box<[AtomicU8]>,
    chunk_size: u64,
    old_size: u64,
    num_pending_chunks: AtomicU64,
    rehash: RehashFn,
    barrier_epoch: AtomicU64,
    barrier_passed: AtomicBool,
    entries_migrated: AtomicU64,
    rehash_failures: AtomicU64,
    started_at: Instant,
}

impl SplitTracker {
    /// Track the split of an `old_size`-bucket table in chunks of `chunk_size`
    pub fn new(old_size: u64, chunk_size: u64, rehash: RehashFn) -> Self {
        let chunk_size = chunk_size.max(1);
        let num_chunks = calculate_num_chunks(old_size, chunk_size);
        let chunks: Vec<AtomicU8> = (0..num_chunks)
            .map(|_| AtomicU8::new(ChunkStatus::Pending as u8))
            .collect();
        Self {
            chunks: chunks.into_boxed_slice(),
            chunk_size,
            old_size,
            num_pending_chunks: AtomicU64::new(num_chunks),
            rehash,
            barrier_epoch: AtomicU64::new(0),
            barrier_passed: AtomicBool::new(false),
            entries_migrated: AtomicU64::new(0),
            rehash_failures: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Total number of chunks
    pub fn num_chunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Old-table buckets per chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Bucket count of the table being split
    pub fn old_size(&self) -> u64 {
        self.old_size
    }

    /// Chunk holding old-table bucket `old_index`
    #[inline]
    pub fn chunk_of(&self, old_index: u64) -> u64 {
        old_index / self.chunk_size
    }

    /// Old-table bucket range `[start, end)` of a chunk
    pub fn chunk_bounds(&self, chunk: u64) -> (u64, u64) {
        get_chunk_bounds(chunk, self.chunk_size, self.old_size)
    }

    /// Current status of a chunk
    #[inline]
    pub fn status(&self, chunk: u64) -> ChunkStatus {
        ChunkStatus::from_u8(self.chunks[chunk as usize].load(Ordering::Acquire))
    }

    /// Claim a pending chunk for migration.
    ///
    /// Exactly one caller wins per chunk.
    pub fn try_claim(&self, chunk: u64) -> bool {
        self.chunks[chunk as usize]
            .compare_exchange(
                ChunkStatus::Pending as u8,
                ChunkStatus::Splitting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Give up a claim so another thread can retry the chunk
    pub(crate) fn release(&self, chunk: u64) {
        let released = self.chunks[chunk as usize].compare_exchange(
            ChunkStatus::Splitting as u8,
            ChunkStatus::Pending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug_assert!(released.is_ok());
    }

    /// Yield while another thread migrates `chunk`.
    ///
    /// Returns `Done`, or `Pending` if the claim was released after a
    /// failed attempt.
    pub fn wait_while_splitting(&self, chunk: u64) -> ChunkStatus {
        loop {
            match self.status(chunk) {
                ChunkStatus::Splitting => thread::yield_now(),
                status => return status,
            }
        }
    }

    /// Mark a claimed chunk done and record its statistics.
    ///
    /// Returns `true` for the caller that completed the last chunk.
    pub fn complete_chunk(&self, chunk: u64, migrated: u64, rehash_failures: u64) -> bool {
        debug_assert_eq!(self.status(chunk), ChunkStatus::Splitting);
        self.entries_migrated.fetch_add(migrated, Ordering::Relaxed);
        self.rehash_failures
            .fetch_add(rehash_failures, Ordering::Relaxed);
        self.chunks[chunk as usize].store(ChunkStatus::Done as u8, Ordering::Release);
        self.num_pending_chunks.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Chunks not yet done
    pub fn remaining_chunks(&self) -> u64 {
        self.num_pending_chunks.load(Ordering::Acquire)
    }

    /// Grow progress as (completed_chunks, total_chunks)
    pub fn progress(&self) -> (u64, u64) {
        let total = self.num_chunks();
        (total.saturating_sub(self.remaining_chunks()), total)
    }

    /// Recompute the hash of the record at `address`
    #[inline]
    pub fn rehash(&self, address: Address) -> Option<KeyHash> {
        (self.rehash)(address)
    }

    /// Epoch at which the resize became visible, or 0 before it is known
    #[inline]
    pub fn barrier_epoch(&self) -> u64 {
        self.barrier_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn set_barrier_epoch(&self, epoch: u64) {
        debug_assert!(epoch != 0);
        self.barrier_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Whether every operation that started before the barrier has left
    #[inline]
    pub fn barrier_passed(&self) -> bool {
        self.barrier_passed.load(Ordering::Acquire)
    }

    pub(crate) fn open_barrier(&self) {
        self.barrier_passed.store(true, Ordering::Release);
    }

    /// Yield until stragglers have drained
    pub fn wait_barrier(&self) {
        while !self.barrier_passed() {
            thread::yield_now();
        }
    }

    /// Entries copied so far
    pub fn entries_migrated(&self) -> u64 {
        self.entries_migrated.load(Ordering::Relaxed)
    }

    /// Entries dropped because their record could not be rehashed
    pub fn rehash_failures(&self) -> u64 {
        self.rehash_failures.load(Ordering::Relaxed)
    }

    /// Time since the split started
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl fmt::Debug for SplitTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitTracker")
            .field("old_size", &self.old_size)
            .field("chunk_size", &self.chunk_size)
            .field("progress", &self.progress())
            .field("barrier_epoch", &self.barrier_epoch())
            .field("barrier_passed", &self.barrier_passed())
            .finish()
    }
}

/// Result of a grow operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowResult {
    /// Old size of the hash table
    pub old_size: u64,
    /// New size of the hash table
    pub new_size: u64,
    /// Number of entries migrated
    pub entries_migrated: u64,
    /// Entries whose record could not be rehashed; dropped as dead records
    pub rehash_failures: u64,
    /// Number of chunks the old table was split into
    pub chunks: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl GrowResult {
    /// Check if any rehash failures occurred
    pub fn has_rehash_failures(&self) -> bool {
        self.rehash_failures > 0
    }

    /// Calculate the growth ratio
    pub fn growth_ratio(&self) -> f64 {
        if self.old_size == 0 {
            return 0.0;
        }
        self.new_size as f64 / self.old_size as f64
    }
}

/// Calculate the number of chunks for a given table size
pub fn calculate_num_chunks(table_size: u64, chunk_size: u64) -> u64 {
    table_size.div_ceil(chunk_size.max(1))
}

/// Calculate chunk boundaries
///
/// Returns `(start_bucket, end_bucket)`, end exclusive.
pub fn get_chunk_bounds(chunk_index: u64, chunk_size: u64, total_buckets: u64) -> (u64, u64) {
    let start = chunk_index * chunk_size;
    let end = std::cmp::min(start + chunk_size, total_buckets);
    (start, end)
}
