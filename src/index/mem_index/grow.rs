use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::address::Address;
use crate::epoch::get_thread_id;
use crate::index::{
    ChunkStatus, GrowResult, HashBucketEntry, KeyHash, RehashFn, ResizeInfo, ResizeStatus,
    SplitTracker,
};
use crate::status::Status;
use crate::utility::{is_32_bit, is_power_of_two};

use super::ops::Append;
use super::{Generation, MemHashIndex, RetiredGeneration, View};

/// Result of migrating a single chunk during index growth
#[derive(Debug, Default)]
struct ChunkMigrationResult {
    /// Number of entries copied into the new table
    migrated: u64,
    /// Number of entries whose record could not be rehashed
    rehash_failures: u64,
}

impl MemHashIndex {
    /// Grow the index by the configured growth factor.
    pub fn grow_with_rehash<F>(&self, rehash_fn: F) -> Result<GrowResult, Status>
    where
        F: Fn(Address) -> Option<KeyHash> + Send + Sync + 'static,
    {
        let new_size = self
            .size()
            .checked_mul(self.grow_config.growth_factor)
            .ok_or(Status::InvalidArgument)?;
        self.trigger_resize(new_size, rehash_fn)
    }

    /// Resize the index to `new_size` buckets while it stays in use.
    ///
    /// `rehash_fn` recomputes the key hash of the record at an address; see
    /// [`RehashFn`](crate::index::RehashFn). The call returns once every chunk
    /// is migrated and the old table has been handed to the epoch.
    ///
    /// Fails with `Aborted` if a resize is already running, `InvalidArgument`
    /// if `new_size` is not a power of two, exceeds 2^31 or is not larger
    /// than the current size, and `InvalidOperation` when called by a thread
    /// holding a guard on this index (it would wait on itself).
    ///
    /// If migrating a chunk runs out of memory the error is returned and the
    /// resize stays in progress; operations keep splitting chunks on access
    /// and [`help_resize`](Self::help_resize) finishes the rest.
    pub fn trigger_resize<F>(&self, new_size: u64, rehash_fn: F) -> Result<GrowResult, Status>
    where
        F: Fn(Address) -> Option<KeyHash> + Send + Sync + 'static,
    {
        if self.epoch.is_protected(get_thread_id()) {
            return Err(Status::InvalidOperation);
        }
        if self.resize_in_progress.swap(true, Ordering::AcqRel) {
            return Err(Status::Aborted);
        }

        let (old_version, old, new) = match self.start_resize(new_size, Arc::new(rehash_fn)) {
            Ok(started) => started,
            Err(status) => {
                self.resize_in_progress.store(false, Ordering::Release);
                return Err(status);
            }
        };

        // SAFETY: no chunk can complete before the barrier opens below, so
        // neither generation is retired until then. Afterwards `guard` keeps
        // both alive.
        let (old, new) = unsafe { (&*old, &*new) };
        let Some(split) = new.split() else {
            return Err(Status::InvalidOperation);
        };

        let barrier = self.epoch.bump_current_epoch();
        split.set_barrier_epoch(barrier);
        self.epoch.spin_wait_for_safe_to_reclaim(barrier - 1);

        let guard = self.protect();
        split.open_barrier();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(barrier, "resize barrier passed");
        }

        self.drive_split(old, new, split)?;
        let result = GrowResult {
            old_size: old.table.size(),
            new_size,
            entries_migrated: split.entries_migrated(),
            rehash_failures: split.rehash_failures(),
            chunks: split.num_chunks(),
            duration_ms: split.elapsed_ms(),
        };
        drop(guard);

        // The last chunk's owner may still be flipping the version.
        while self.resize_info.load(Ordering::SeqCst).version == old_version {
            thread::yield_now();
        }

        if tracing::enabled!(tracing::Level::INFO) {
            tracing::info!(
                old_size = result.old_size,
                new_size,
                entries_migrated = result.entries_migrated,
                rehash_failures = result.rehash_failures,
                duration_ms = result.duration_ms,
                "hash index resize complete"
            );
        }
        Ok(result)
    }

    /// Allocate and publish the target generation.
    ///
    /// Returns the old version with the old and target generations.
    fn start_resize(
        &self,
        new_size: u64,
        rehash: RehashFn,
    ) -> Result<(u8, *const Generation, *const Generation), Status> {
        let info = self.resize_info.load(Ordering::SeqCst);
        debug_assert_eq!(info.status, ResizeStatus::Done);
        let v = info.version as usize;

        let current = self.state[v].load(Ordering::Acquire);
        if current.is_null() {
            return Err(Status::InvalidOperation);
        }
        // SAFETY: only a resize retires the current generation, and this
        // thread owns the only resize.
        let old_size = unsafe { &*current }.table.size();

        if !is_power_of_two(new_size) || !is_32_bit(new_size) || new_size <= old_size {
            return Err(Status::InvalidArgument);
        }

        let split = SplitTracker::new(old_size, self.config.resize_chunk_size, rehash);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let target = Box::into_raw(Box::new(Generation::allocate(
            seq,
            new_size,
            &self.config,
            Some(split),
        )?));

        debug_assert!(self.state[1 - v].load(Ordering::Acquire).is_null());
        self.state[1 - v].store(target, Ordering::Release);
        self.resize_info.store(
            ResizeInfo {
                status: ResizeStatus::InProgress,
                version: info.version,
                resize_seq: info.resize_seq + 1,
            },
            Ordering::SeqCst,
        );

        if tracing::enabled!(tracing::Level::INFO) {
            tracing::info!(old_size, new_size, generation = seq, "hash index resize started");
        }
        Ok((info.version, current.cast_const(), target.cast_const()))
    }

    /// Migrate whatever chunks of a running resize are still pending.
    ///
    /// A no-op when no resize runs. Must not be called while holding a guard
    /// that predates the resize.
    pub fn help_resize(&self) -> Result<(), Status> {
        let guard = self.protect();
        match self.view(&guard)? {
            View::Resizing {
                old,
                new,
                split,
                straggler: false,
            } => self.drive_split(old, new, split),
            View::Resizing {
                straggler: true, ..
            } => Err(Status::InvalidOperation),
            View::Stable(_) => Ok(()),
        }
    }

    /// Claim and migrate chunks until every chunk is done
    fn drive_split(
        &self,
        old: &Generation,
        new: &Generation,
        split: &SplitTracker,
    ) -> Result<(), Status> {
        loop {
            let mut all_done = true;
            for chunk in 0..split.num_chunks() {
                match split.status(chunk) {
                    ChunkStatus::Done => {}
                    ChunkStatus::Splitting => all_done = false,
                    ChunkStatus::Pending => {
                        if split.try_claim(chunk) {
                            self.migrate_chunk(old, new, split, chunk)?;
                        } else {
                            all_done = false;
                        }
                    }
                }
            }
            if all_done {
                return Ok(());
            }
            thread::yield_now();
        }
    }

    /// Make sure `chunk` has been copied into the new generation
    pub(crate) fn split_chunk(
        &self,
        old: &Generation,
        new: &Generation,
        split: &SplitTracker,
        chunk: u64,
    ) -> Result<(), Status> {
        loop {
            match split.status(chunk) {
                ChunkStatus::Done => return Ok(()),
                ChunkStatus::Pending => {
                    if split.try_claim(chunk) {
                        return self.migrate_chunk(old, new, split, chunk);
                    }
                }
                ChunkStatus::Splitting => {
                    split.wait_while_splitting(chunk);
                }
            }
        }
    }

    /// Copy every confirmed entry of a claimed chunk into the new table.
    ///
    /// On allocation failure the claim is released so the chunk can be
    /// retried; entries already copied are recognised and not duplicated.
    fn migrate_chunk(
        &self,
        old: &Generation,
        new: &Generation,
        split: &SplitTracker,
        chunk: u64,
    ) -> Result<(), Status> {
        let result = match Self::migrate_chunk_with_rehash(old, new, split, chunk) {
            Ok(result) => result,
            Err(status) => {
                split.release(chunk);
                if tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(chunk, %status, "chunk migration failed");
                }
                return Err(status);
            }
        };

        if result.rehash_failures > 0 && tracing::enabled!(tracing::Level::WARN) {
            tracing::warn!(
                chunk,
                rehash_failures = result.rehash_failures,
                "dropped index entries whose records could not be rehashed"
            );
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(chunk, migrated = result.migrated, "chunk migrated");
        }

        if split.complete_chunk(chunk, result.migrated, result.rehash_failures) {
            self.finish_resize();
        }
        Ok(())
    }

    fn migrate_chunk_with_rehash(
        old: &Generation,
        new: &Generation,
        split: &SplitTracker,
        chunk: u64,
    ) -> Result<ChunkMigrationResult, Status> {
        let (start_bucket, end_bucket) = split.chunk_bounds(chunk);
        let mut result = ChunkMigrationResult::default();

        for bucket_idx in start_bucket..end_bucket {
            let mut bucket = old.table.bucket_at(bucket_idx);
            loop {
                for atomic in &bucket.entries {
                    let entry = atomic.load(Ordering::Acquire);
                    // Placeholders of unfinished inserts are dropped; their
                    // owner's update fails as stale and retries in the new table.
                    if entry.is_unused() || entry.is_tentative() || entry.address().is_invalid() {
                        continue;
                    }

                    let new_index = match split.rehash(entry.address()) {
                        Some(hash) if old.table.index_of(hash) == bucket_idx => {
                            new.table.index_of(hash)
                        }
                        _ => {
                            result.rehash_failures += 1;
                            continue;
                        }
                    };

                    if Self::insert_into_new_table_with_overflow(new, new_index, entry)? {
                        result.migrated += 1;
                    }
                }

                match old.next_bucket(bucket) {
                    Some((_, next)) => bucket = next,
                    None => break,
                }
            }
        }

        Ok(result)
    }

    /// Place a migrated entry in the first empty slot of its new chain.
    ///
    /// Returns `false` if the identical entry is already there, which happens
    /// when a chunk is retried after a failed attempt.
    fn insert_into_new_table_with_overflow(
        new: &Generation,
        bucket_idx: u64,
        entry: HashBucketEntry,
    ) -> Result<bool, Status> {
        let mut bucket = new.table.bucket_at(bucket_idx);

        loop {
            for atomic in &bucket.entries {
                let current = atomic.load(Ordering::Acquire);
                if current == entry {
                    return Ok(false);
                }
                if current.is_unused()
                    && atomic
                        .compare_exchange(
                            HashBucketEntry::INVALID,
                            entry,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    return Ok(true);
                }
            }

            let overflow = bucket.overflow_entry.load(Ordering::Acquire);
            if !overflow.is_unused() {
                match new.overflow.get(overflow.address()) {
                    Some(next) => bucket = next,
                    None => return Err(Status::InvalidOperation),
                }
                continue;
            }

            match Self::append_overflow_bucket(new, bucket, overflow)? {
                Append::Linked(_, next) | Append::Raced(_, next) => bucket = next,
                Append::Retry => {}
            }
        }
    }

    /// Flip to the new generation and retire the old one.
    ///
    /// Called once, by whichever thread completed the last chunk.
    fn finish_resize(&self) {
        let info = self.resize_info.load(Ordering::SeqCst);
        debug_assert_eq!(info.status, ResizeStatus::InProgress);
        let old_version = info.version;
        let new_version = 1 - old_version;

        self.resize_info.store(
            ResizeInfo {
                status: ResizeStatus::Done,
                version: new_version,
                resize_seq: info.resize_seq,
            },
            Ordering::SeqCst,
        );
        let old = self.state[old_version as usize].swap(std::ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!old.is_null());
        let current = self.state[new_version as usize].load(Ordering::Acquire);
        // SAFETY: the new generation is live; only a later resize retires it,
        // and that cannot start before `resize_in_progress` is cleared below.
        let split = unsafe { current.as_ref() }.and_then(Generation::take_split);

        if let Some(old) = NonNull::new(old) {
            // SAFETY: `old` was just detached; nothing new can reach it.
            let seq = unsafe { old.as_ref() }.seq;
            let retired = RetiredGeneration { old, split };
            let epoch = self.epoch.bump_current_epoch_with_action(move || {
                drop(retired);
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(generation = seq, "retired table generation freed");
                }
            });
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(generation = seq, epoch, "table generation retired");
            }
        }

        self.resize_in_progress.store(false, Ordering::Release);
    }
}
