//! In-memory hash index
//!
//! The index keeps up to two table generations. Normally only one is live;
//! while a resize runs, the old generation is split chunk by chunk into the
//! new one. Every operation enters the index's epoch first and snapshots the
//! generation(s) once, so a generation is freed only after every operation
//! that could have seen it has finished.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::allocator::{FixedPageAllocator, DEFAULT_MAX_PAGES};
use crate::constants::CACHE_LINE_BYTES;
use crate::epoch::{EpochGuard, LightEpoch};
use crate::index::grow::AtomicResizeInfo;
use crate::index::{
    BucketId, FixedPageAddress, GrowConfig, HashBucket, HashBucketEntry, InternalHashTable,
    ResizeInfo, ResizeStatus, SlotLocation, SplitTracker, HASH_TABLE_CHUNK_SIZE,
};
use crate::status::Status;

mod grow;
mod ops;


/// Result of a find operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindResult {
    /// The entry found (or INVALID if not found)
    pub entry: HashBucketEntry,
    /// Where the entry lives, for a later `update_slot`
    pub location: Option<SlotLocation>,
}

impl FindResult {
    /// Create a not-found result
    pub fn not_found() -> Self {
        Self {
            entry: HashBucketEntry::INVALID,
            location: None,
        }
    }

    /// Check if an entry was found
    pub fn found(&self) -> bool {
        self.location.is_some()
    }
}

/// Configuration for the memory hash index
#[derive(Debug, Clone)]
pub struct MemHashIndexConfig {
    /// Size of the hash table in buckets (power of two, at most 2^31)
    pub table_size: u64,
    /// Alignment of the primary bucket array (power of two, at least 64)
    pub alignment: usize,
    /// Old-table buckets per resize chunk
    pub resize_chunk_size: u64,
    /// Page-table capacity of each generation's overflow allocator
    pub max_overflow_pages: usize,
}

impl MemHashIndexConfig {
    /// Create a new configuration
    pub fn new(table_size: u64) -> Self {
        Self {
            table_size,
            ..Self::default()
        }
    }

    /// Set the bucket array alignment
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the resize chunk size
    pub fn with_resize_chunk_size(mut self, chunk_size: u64) -> Self {
        self.resize_chunk_size = chunk_size.max(1);
        self
    }

    /// Set the overflow allocator capacity
    pub fn with_max_overflow_pages(mut self, pages: usize) -> Self {
        self.max_overflow_pages = pages.max(1);
        self
    }
}

impl Default for MemHashIndexConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 20, // 1M buckets
            alignment: CACHE_LINE_BYTES,
            resize_chunk_size: HASH_TABLE_CHUNK_SIZE,
            max_overflow_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// One table generation: primary buckets plus the overflow buckets chained
/// from them. Immutable once published, apart from slot contents and the
/// split tracker, which a resize target carries until the resize completes.
pub(crate) struct Generation {
    pub(crate) seq: u64,
    pub(crate) table: InternalHashTable,
    pub(crate) overflow: FixedPageAllocator,
    split: AtomicPtr<SplitTracker>,
}

impl Generation {
    fn allocate(
        seq: u64,
        size: u64,
        config: &MemHashIndexConfig,
        split: Option<SplitTracker>,
    ) -> Result<Self, Status> {
        Ok(Self {
            seq,
            table: InternalHashTable::allocate(size, config.alignment)?,
            overflow: FixedPageAllocator::with_max_pages(config.max_overflow_pages),
            split: AtomicPtr::new(
                split.map_or(ptr::null_mut(), |split| Box::into_raw(Box::new(split))),
            ),
        })
    }

    /// Split tracker of a running resize targeting this generation
    #[inline]
    pub(crate) fn split(&self) -> Option<&SplitTracker> {
        let split = self.split.load(Ordering::Acquire);
        // SAFETY: a detached tracker is released through the epoch, and
        // callers hold a guard on the index.
        (!split.is_null()).then(|| unsafe { &*split })
    }

    /// Detach the split tracker once the resize is complete
    fn take_split(&self) -> Option<Box<SplitTracker>> {
        let split = self.split.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: the pointer came from `Box::into_raw` and the swap makes
        // this the only owner.
        (!split.is_null()).then(|| unsafe { Box::from_raw(split) })
    }

    /// Resolve a bucket id of this generation
    #[inline]
    pub(crate) fn bucket(&self, id: BucketId) -> Option<&HashBucket> {
        match id {
            BucketId::Primary(index) if index < self.table.size() => {
                Some(self.table.bucket_at(index))
            }
            BucketId::Primary(_) => None,
            BucketId::Overflow(address) => self.overflow.get(address),
        }
    }

    /// Follow a bucket's overflow link
    #[inline]
    pub(crate) fn next_bucket(&self, bucket: &HashBucket) -> Option<(FixedPageAddress, &HashBucket)> {
        let overflow = bucket.overflow_entry.load(Ordering::Acquire);
        if overflow.is_unused() {
            return None;
        }
        let address = overflow.address();
        self.overflow.get(address).map(|next| (address, next))
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        drop(self.take_split());
    }
}

/// A finished resize's old generation and split tracker, scheduled for
/// release once the epoch is safe
struct RetiredGeneration {
    old: NonNull<Generation>,
    split: Option<Box<SplitTracker>>,
}

// Safety: the retired generation is unreachable from the index; only the
// epoch action that owns this value touches it again.
unsafe impl Send for RetiredGeneration {}

impl Drop for RetiredGeneration {
    fn drop(&mut self) {
        drop(self.split.take());
        // SAFETY: the pointer came from `Box::into_raw` and was detached from
        // the index before being wrapped; it is released exactly once here.
        unsafe { drop(Box::from_raw(self.old.as_ptr())) };
    }
}

/// Generations an operation works against, snapshotted once
pub(crate) enum View<'a> {
    /// No resize: the single live generation
    Stable(&'a Generation),
    /// Resize running
    Resizing {
        old: &'a Generation,
        new: &'a Generation,
        split: &'a SplitTracker,
        /// Protected before the resize became visible; must keep using `old`
        straggler: bool,
    },
}

/// In-memory hash index
///
/// Provides lock-free lookup from key hash to record address in the log.
/// Uses a two-generation scheme to support concurrent, online growth.
pub struct MemHashIndex {
    /// Table generations (two slots for growth)
    state: [AtomicPtr<Generation>; 2],
    /// Resize status and current slot
    resize_info: AtomicResizeInfo,
    /// Held by the resize coordinator from trigger until completion
    resize_in_progress: AtomicBool,
    /// Source of generation sequence numbers
    next_seq: AtomicU64,
    /// Epoch protecting generations and overflow buckets
    epoch: Arc<LightEpoch>,
    /// Growth policy
    grow_config: GrowConfig,
    /// Settings applied to every generation
    config: MemHashIndexConfig,
}

impl MemHashIndex {
    /// Create a new uninitialized hash index
    pub fn new() -> Self {
        Self::with_grow_config(GrowConfig::default())
    }

    /// Create a new hash index with growth configuration
    pub fn with_grow_config(grow_config: GrowConfig) -> Self {
        Self::with_epoch(Arc::new(LightEpoch::new()), grow_config)
    }

    /// Create a new hash index sharing an existing epoch
    pub fn with_epoch(epoch: Arc<LightEpoch>, grow_config: GrowConfig) -> Self {
        Self {
            state: [
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
            ],
            resize_info: AtomicResizeInfo::new(ResizeInfo::initial()),
            resize_in_progress: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            epoch,
            grow_config,
            config: MemHashIndexConfig::default(),
        }
    }

    /// Create and initialize an index in one step
    pub fn with_config(config: &MemHashIndexConfig) -> Result<Self, Status> {
        let mut index = Self::new();
        index.initialize(config)?;
        Ok(index)
    }

    /// Initialize the hash index with the given configuration
    ///
    /// Replaces any existing contents. On error the index is left as it was.
    pub fn initialize(&mut self, config: &MemHashIndexConfig) -> Result<(), Status> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let generation = Generation::allocate(seq, config.table_size, config, None)?;

        self.dispose();
        self.config = config.clone();
        *self.state[0].get_mut() = Box::into_raw(Box::new(generation));

        if tracing::enabled!(tracing::Level::INFO) {
            tracing::info!(
                table_size = config.table_size,
                alignment = config.alignment,
                resize_chunk_size = config.resize_chunk_size,
                "hash index initialized"
            );
        }
        Ok(())
    }

    /// Release every generation and its overflow buckets
    ///
    /// Exclusive access guarantees no operation is running. Generations
    /// already retired by a resize are owned by the epoch.
    pub fn dispose(&mut self) {
        for slot in self.state.iter_mut() {
            let generation = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !generation.is_null() {
                // SAFETY: published generations come from `Box::into_raw` and
                // `&mut self` rules out concurrent readers.
                unsafe { drop(Box::from_raw(generation)) };
            }
        }
        // Keep the resize sequence so it never repeats.
        let resize_seq = self.resize_info.load(Ordering::Relaxed).resize_seq;
        self.resize_info.store(
            ResizeInfo {
                resize_seq,
                ..ResizeInfo::initial()
            },
            Ordering::SeqCst,
        );
        *self.resize_in_progress.get_mut() = false;
        self.epoch.try_drain();
    }

    /// Enter the index's epoch.
    ///
    /// Hold the guard across a find, the log read it leads to and the
    /// following `update_slot` to keep the location valid throughout.
    pub fn protect(&self) -> EpochGuard<'_> {
        EpochGuard::new(&self.epoch)
    }

    /// The epoch protecting this index
    pub fn epoch(&self) -> &LightEpoch {
        &self.epoch
    }

    /// Get the grow configuration
    pub fn grow_config(&self) -> &GrowConfig {
        &self.grow_config
    }

    /// Set the grow configuration
    pub fn set_grow_config(&mut self, config: GrowConfig) {
        self.grow_config = config;
    }

    /// Get the configuration of the current generation
    pub fn config(&self) -> &MemHashIndexConfig {
        &self.config
    }

    /// Get the current table size (the old size while a resize runs)
    pub fn size(&self) -> u64 {
        let guard = self.protect();
        match self.view(&guard) {
            Ok(View::Stable(generation)) => generation.table.size(),
            Ok(View::Resizing { old, .. }) => old.table.size(),
            Err(_) => 0,
        }
    }

    /// Get the current version (table slot, 0 or 1)
    #[inline]
    pub fn version(&self) -> u8 {
        self.resize_info.load(Ordering::Acquire).version
    }

    /// Current resize status and version
    #[inline]
    pub fn resize_status(&self) -> ResizeInfo {
        self.resize_info.load(Ordering::SeqCst)
    }

    /// Check if a resize is running
    pub fn is_resize_in_progress(&self) -> bool {
        self.resize_in_progress.load(Ordering::Acquire)
    }

    /// Split progress as (completed_chunks, total_chunks), if a resize runs
    pub fn resize_progress(&self) -> Option<(u64, u64)> {
        let guard = self.protect();
        match self.view(&guard) {
            Ok(View::Resizing { split, .. }) => Some(split.progress()),
            _ => None,
        }
    }

    /// Snapshot the live generation(s).
    ///
    /// Fails with `InvalidOperation` on an uninitialized or disposed index.
    pub(crate) fn view<'a>(&'a self, guard: &EpochGuard<'_>) -> Result<View<'a>, Status> {
        loop {
            let info = self.resize_info.load(Ordering::SeqCst);
            let v = info.version as usize;
            let current = self.state[v].load(Ordering::Acquire);
            let target = match info.status {
                ResizeStatus::Done => ptr::null_mut(),
                ResizeStatus::InProgress => self.state[1 - v].load(Ordering::Acquire),
            };
            // SAFETY: generations reachable from `state` are retired through
            // the epoch, which `guard` holds.
            let split = unsafe { target.as_ref() }.and_then(Generation::split);

            // The pointers belong to `info` only if no resize started or
            // finished while they were loaded.
            if self.resize_info.load(Ordering::SeqCst) != info {
                thread::yield_now();
                continue;
            }

            // SAFETY: as above.
            let Some(current) = (unsafe { current.as_ref() }) else {
                if info.status == ResizeStatus::Done {
                    return Err(Status::InvalidOperation);
                }
                thread::yield_now();
                continue;
            };
            if info.status == ResizeStatus::Done {
                return Ok(View::Stable(current));
            }

            // SAFETY: as above.
            let (Some(new), Some(split)) = (unsafe { target.as_ref() }, split) else {
                thread::yield_now();
                continue;
            };
            let barrier = split.barrier_epoch();
            if barrier == 0 {
                thread::yield_now();
                continue;
            }
            if guard.protected_at() < barrier {
                return Ok(View::Resizing {
                    old: current,
                    new,
                    split,
                    straggler: true,
                });
            }
            split.wait_barrier();
            return Ok(View::Resizing {
                old: current,
                new,
                split,
                straggler: false,
            });
        }
    }

    /// Generation that owns `hash`, splitting its chunk first if needed
    pub(crate) fn generation_for<'a>(
        &'a self,
        guard: &EpochGuard<'_>,
        hash: crate::index::KeyHash,
    ) -> Result<&'a Generation, Status> {
        match self.view(guard)? {
            View::Stable(generation) => Ok(generation),
            View::Resizing {
                old,
                straggler: true,
                ..
            } => Ok(old),
            View::Resizing {
                old, new, split, ..
            } => {
                let chunk = split.chunk_of(old.table.index_of(hash));
                self.split_chunk(old, new, split, chunk)?;
                Ok(new)
            }
        }
    }

    /// Generation for whole-table scans; finishes the split first if needed
    pub(crate) fn generation_for_scan<'a>(
        &'a self,
        guard: &EpochGuard<'_>,
    ) -> Result<&'a Generation, Status> {
        match self.view(guard)? {
            View::Stable(generation) => Ok(generation),
            View::Resizing {
                old,
                straggler: true,
                ..
            } => Ok(old),
            View::Resizing {
                old, new, split, ..
            } => {
                for chunk in 0..split.num_chunks() {
                    self.split_chunk(old, new, split, chunk)?;
                }
                Ok(new)
            }
        }
    }

    /// Generation a location may be written in by this operation, if any
    pub(crate) fn writable_generation<'a>(
        &'a self,
        guard: &EpochGuard<'_>,
        seq: u64,
    ) -> Option<&'a Generation> {
        let generation = match self.view(guard).ok()? {
            View::Stable(generation) => generation,
            View::Resizing {
                old,
                straggler: true,
                ..
            } => old,
            // New-generation locations are only handed out after their chunk split.
            View::Resizing { new, .. } => new,
        };
        (generation.seq == seq).then_some(generation)
    }
}

impl Default for MemHashIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemHashIndex {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for MemHashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemHashIndex")
            .field("size", &self.size())
            .field("resize_status", &self.resize_status())
            .field("grow_config", &self.grow_config)
            .finish()
    }
}

/// Statistics about the hash index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    /// Total table size
    pub table_size: u64,
    /// Total entry slots, primary and overflow
    pub total_entries: u64,
    /// Number of used entries
    pub used_entries: u64,
    /// Used entries still marked tentative
    pub tentative_entries: u64,
    /// Number of buckets with at least one entry
    pub buckets_with_entries: u64,
    /// Overflow buckets reachable from the table
    pub overflow_buckets: u64,
    /// Longest bucket chain, counting the primary bucket
    pub max_chain_length: u64,
    /// Load factor (used/total)
    pub load_factor: f64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Index Statistics:")?;
        writeln!(f, "  Table size: {}", self.table_size)?;
        writeln!(f, "  Total entries: {}", self.total_entries)?;
        writeln!(f, "  Used entries: {}", self.used_entries)?;
        writeln!(f, "  Buckets with entries: {}", self.buckets_with_entries)?;
        writeln!(f, "  Overflow buckets: {}", self.overflow_buckets)?;
        writeln!(f, "  Max chain length: {}", self.max_chain_length)?;
        writeln!(f, "  Load factor: {:.2}%", self.load_factor * 100.0)
    }
}
