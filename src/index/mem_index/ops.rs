use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::index::{
    BucketId, FixedPageAddress, HashBucket, HashBucketEntry, HashBucketOverflowEntry,
    HashEntryInfo, KeyHash, SlotLocation,
};
use crate::status::Status;

use super::{FindResult, Generation, IndexStats, MemHashIndex, View};

/// Outcome of a combined find / free-slot scan
enum Probe<'a> {
    /// Confirmed entry with the tag
    Found {
        bucket_id: BucketId,
        slot: usize,
        entry: HashBucketEntry,
    },
    /// First empty (or reclaimed) slot of the chain
    Free {
        bucket_id: BucketId,
        bucket: &'a HashBucket,
        slot: usize,
    },
}

/// Outcome of linking a fresh overflow bucket at a chain end
pub(super) enum Append<'a> {
    /// Our bucket is linked
    Linked(FixedPageAddress, &'a HashBucket),
    /// Another thread linked first; continue with its bucket
    Raced(FixedPageAddress, &'a HashBucket),
    /// Only the link's high bits changed; re-read it
    Retry,
}

impl MemHashIndex {
    /// Get the current load factor
    pub fn load_factor(&self) -> f64 {
        self.dump_distribution().load_factor
    }

    /// Check if growth should be triggered based on configuration
    pub fn should_grow(&self) -> bool {
        if self.is_resize_in_progress() {
            return false;
        }
        self.grow_config.should_grow(self.load_factor())
    }

    /// Overflow buckets handed out by the current generation's allocator
    pub fn overflow_buckets_allocated(&self) -> u64 {
        let guard = self.protect();
        match self.view(&guard) {
            Ok(View::Stable(generation)) => generation.overflow.allocated_buckets(),
            Ok(View::Resizing { old, .. }) => old.overflow.allocated_buckets(),
            Err(_) => 0,
        }
    }

    /// Look up the confirmed entry for `info`'s tag.
    ///
    /// On success the cursor holds the entry and its location. Returns
    /// `Ok(false)` when the tag is absent.
    pub fn find_tag(&self, info: &mut HashEntryInfo) -> Result<bool, Status> {
        let guard = self.protect();
        let generation = self.generation_for(&guard, info.hash())?;
        Ok(Self::find_tag_in(generation, info))
    }

    /// Find an entry in the hash index
    ///
    /// An uninitialized index finds nothing.
    pub fn find_entry(&self, hash: KeyHash) -> FindResult {
        let mut info = HashEntryInfo::new(hash);
        match self.find_tag(&mut info) {
            Ok(true) => FindResult {
                entry: info.entry(),
                location: Some(info.location()),
            },
            _ => FindResult::not_found(),
        }
    }

    fn find_tag_in(generation: &Generation, info: &mut HashEntryInfo) -> bool {
        let tag = info.tag();
        let index = generation.table.index_of(info.hash());
        info.reset();
        info.generation = generation.seq;
        info.bucket_index = index;
        info.first_bucket = BucketId::Primary(index);

        let mut bucket_id = BucketId::Primary(index);
        let mut bucket = generation.table.bucket_at(index);
        loop {
            for (slot, atomic) in bucket.entries.iter().enumerate() {
                let entry = atomic.load(Ordering::Acquire);
                if entry.matches(tag) {
                    info.bucket = bucket_id;
                    info.slot = slot;
                    info.entry = entry;
                    return true;
                }
            }

            match generation.next_bucket(bucket) {
                Some((address, next)) => {
                    bucket_id = BucketId::Overflow(address);
                    bucket = next;
                }
                None => return false,
            }
        }
    }

    /// Find the entry for `info`'s tag, creating it if absent.
    ///
    /// Slots whose address is below `begin_address` are reclaimed on the way.
    /// A created entry is confirmed with the placeholder address
    /// [`Address::INVALID`]; the caller installs the real address with
    /// [`update_slot`](Self::update_slot).
    pub fn find_or_create_tag(
        &self,
        info: &mut HashEntryInfo,
        begin_address: Address,
    ) -> Result<(), Status> {
        let guard = self.protect();
        let generation = self.generation_for(&guard, info.hash())?;
        Self::find_or_create_in(generation, info, begin_address)
    }

    /// Find or create an entry in the hash index
    pub fn find_or_create_entry(
        &self,
        hash: KeyHash,
        begin_address: Address,
    ) -> Result<FindResult, Status> {
        let mut info = HashEntryInfo::new(hash);
        self.find_or_create_tag(&mut info, begin_address)?;
        Ok(FindResult {
            entry: info.entry(),
            location: Some(info.location()),
        })
    }

    pub(crate) fn find_or_create_in(
        generation: &Generation,
        info: &mut HashEntryInfo,
        begin_address: Address,
    ) -> Result<(), Status> {
        let tag = info.tag();
        let index = generation.table.index_of(info.hash());
        info.reset();
        info.generation = generation.seq;
        info.bucket_index = index;
        info.first_bucket = BucketId::Primary(index);

        loop {
            match Self::find_tag_or_free(generation, index, tag, begin_address)? {
                Probe::Found {
                    bucket_id,
                    slot,
                    entry,
                } => {
                    info.bucket = bucket_id;
                    info.slot = slot;
                    info.entry = entry;
                    return Ok(());
                }
                Probe::Free {
                    bucket_id,
                    bucket,
                    slot,
                } => {
                    let atomic = &bucket.entries[slot];
                    let tentative = HashBucketEntry::tentative(tag);
                    // SeqCst pairs the claim with the uniqueness scan below:
                    // of two racing claimers, at least one sees the other.
                    if atomic
                        .compare_exchange(
                            HashBucketEntry::INVALID,
                            tentative,
                            Ordering::SeqCst,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }

                    // From here until the store below this thread is the only
                    // writer of the slot: reclamation skips tentative entries.
                    if Self::find_other_slot_for_tag(generation, index, tag, bucket_id, slot) {
                        debug_assert_eq!(atomic.load(Ordering::Acquire), tentative);
                        atomic.store(HashBucketEntry::INVALID, Ordering::Release);
                        continue;
                    }

                    let confirmed = tentative.confirmed();
                    debug_assert_eq!(atomic.load(Ordering::Acquire), tentative);
                    atomic.store(confirmed, Ordering::Release);

                    info.bucket = bucket_id;
                    info.slot = slot;
                    info.entry = confirmed;
                    return Ok(());
                }
            }
        }
    }

    /// Scan the chain for `tag`, remembering the first free slot.
    ///
    /// Dead entries (address below `begin_address`) are cleared as they are
    /// met. At the chain end with no free slot, an overflow bucket is linked.
    fn find_tag_or_free<'a>(
        generation: &'a Generation,
        index: u64,
        tag: u16,
        begin_address: Address,
    ) -> Result<Probe<'a>, Status> {
        let mut bucket_id = BucketId::Primary(index);
        let mut bucket = generation.table.bucket_at(index);
        let mut free: Option<(BucketId, &'a HashBucket, usize)> = None;

        loop {
            for (slot, atomic) in bucket.entries.iter().enumerate() {
                let entry = atomic.load(Ordering::Acquire);
                if entry.is_unused() {
                    if free.is_none() {
                        free = Some((bucket_id, bucket, slot));
                    }
                    continue;
                }
                if entry.is_reclaimable(begin_address) {
                    // Losing to another reclaimer still leaves an empty slot.
                    let cleared = match atomic.compare_exchange(
                        entry,
                        HashBucketEntry::INVALID,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => true,
                        Err(actual) => actual.is_unused(),
                    };
                    if cleared && free.is_none() {
                        free = Some((bucket_id, bucket, slot));
                    }
                    continue;
                }
                if entry.matches(tag) {
                    return Ok(Probe::Found {
                        bucket_id,
                        slot,
                        entry,
                    });
                }
            }

            let overflow = bucket.overflow_entry.load(Ordering::Acquire);
            if !overflow.is_unused() {
                match generation.overflow.get(overflow.address()) {
                    Some(next) => {
                        bucket_id = BucketId::Overflow(overflow.address());
                        bucket = next;
                        continue;
                    }
                    None => {
                        debug_assert!(false, "dangling overflow link {overflow:?}");
                        return Err(Status::InvalidOperation);
                    }
                }
            }

            if let Some((bucket_id, bucket, slot)) = free {
                return Ok(Probe::Free {
                    bucket_id,
                    bucket,
                    slot,
                });
            }

            match Self::append_overflow_bucket(generation, bucket, overflow)? {
                Append::Linked(address, linked) => {
                    return Ok(Probe::Free {
                        bucket_id: BucketId::Overflow(address),
                        bucket: linked,
                        slot: 0,
                    });
                }
                Append::Raced(address, next) => {
                    bucket_id = BucketId::Overflow(address);
                    bucket = next;
                }
                Append::Retry => {}
            }
        }
    }

    /// Link a fresh overflow bucket after `bucket`, whose link was `observed`.
    pub(super) fn append_overflow_bucket<'a>(
        generation: &'a Generation,
        bucket: &HashBucket,
        observed: HashBucketOverflowEntry,
    ) -> Result<Append<'a>, Status> {
        let address = generation.overflow.allocate()?;
        let Some(fresh) = generation.overflow.get(address) else {
            return Err(Status::OutOfMemory);
        };

        match bucket.overflow_entry.compare_exchange(
            observed,
            observed.with_address(address),
            Ordering::SeqCst,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(Append::Linked(address, fresh)),
            Err(actual) => {
                // Never published, so it can go straight back.
                generation.overflow.free(address);
                if actual.is_unused() {
                    return Ok(Append::Retry);
                }
                generation
                    .overflow
                    .get(actual.address())
                    .map(|next| Append::Raced(actual.address(), next))
                    .ok_or(Status::InvalidOperation)
            }
        }
    }

    /// Whether `tag` occupies any slot of the chain other than the given one,
    /// tentatively or not.
    fn find_other_slot_for_tag(
        generation: &Generation,
        index: u64,
        tag: u16,
        own_bucket: BucketId,
        own_slot: usize,
    ) -> bool {
        let mut bucket_id = BucketId::Primary(index);
        let mut bucket = generation.table.bucket_at(index);
        loop {
            for (slot, atomic) in bucket.entries.iter().enumerate() {
                if bucket_id == own_bucket && slot == own_slot {
                    continue;
                }
                let entry = atomic.load(Ordering::SeqCst);
                if !entry.is_unused() && entry.tag() == tag {
                    return true;
                }
            }

            let overflow = bucket.overflow_entry.load(Ordering::SeqCst);
            if overflow.is_unused() {
                return false;
            }
            match generation.overflow.get(overflow.address()) {
                Some(next) => {
                    bucket_id = BucketId::Overflow(overflow.address());
                    bucket = next;
                }
                None => return false,
            }
        }
    }

    /// Compare-and-swap one slot.
    ///
    /// Returns `Ok(previous)` on success and `Err(observed)` otherwise. A
    /// location whose generation was retired, or is being split by a resize,
    /// fails with `Err(HashBucketEntry::STALE)`; find the tag again and retry.
    pub fn update_slot(
        &self,
        location: SlotLocation,
        expected: HashBucketEntry,
        desired: HashBucketEntry,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        let guard = self.protect();
        let Some(generation) = self.writable_generation(&guard, location.generation) else {
            return Err(HashBucketEntry::STALE);
        };
        let Some(bucket) = generation.bucket(location.bucket) else {
            return Err(HashBucketEntry::STALE);
        };
        let Some(atomic) = bucket.entries.get(location.slot) else {
            return Err(HashBucketEntry::STALE);
        };
        atomic.compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Try to update the address of an entry atomically by hash
    ///
    /// Used when a record moves (compaction, copy-to-tail). Fails with
    /// `NotFound` if the tag no longer points at `old_address`, and with
    /// `Aborted` if the slot changed between the find and the swap.
    pub fn try_update_address(
        &self,
        hash: KeyHash,
        old_address: Address,
        new_address: Address,
    ) -> Result<(), Status> {
        let _guard = self.protect();
        let result = self.find_entry(hash);
        let Some(location) = result.location else {
            return Err(Status::NotFound);
        };
        if result.entry.address() != old_address {
            return Err(Status::NotFound);
        }

        self.update_slot(location, result.entry, result.entry.with_address(new_address))
            .map(|_| ())
            .map_err(|_| Status::Aborted)
    }

    /// Garbage collect entries pointing to addresses before the given address
    ///
    /// Returns the number of slots cleared. Tentative entries are left alone.
    pub fn garbage_collect(&self, new_begin_address: Address) -> Result<u64, Status> {
        let guard = self.protect();
        let generation = self.generation_for_scan(&guard)?;
        let mut cleaned = 0u64;

        for base in generation.table.iter() {
            let mut bucket = base;
            loop {
                for atomic in &bucket.entries {
                    let entry = atomic.load(Ordering::Acquire);
                    if entry.is_reclaimable(new_begin_address)
                        && atomic
                            .compare_exchange(
                                entry,
                                HashBucketEntry::INVALID,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        cleaned += 1;
                    }
                }
                match generation.next_bucket(bucket) {
                    Some((_, next)) => bucket = next,
                    None => break,
                }
            }
        }

        if cleaned > 0 && tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                cleaned,
                begin_address = new_begin_address.control(),
                "index garbage collected"
            );
        }
        Ok(cleaned)
    }

    /// Dump distribution statistics
    ///
    /// While a resize runs, statistics describe the table being split.
    pub fn dump_distribution(&self) -> IndexStats {
        let guard = self.protect();
        let generation = match self.view(&guard) {
            Ok(View::Stable(generation)) => generation,
            Ok(View::Resizing { old, .. }) => old,
            Err(_) => return IndexStats::default(),
        };

        let mut stats = IndexStats {
            table_size: generation.table.size(),
            ..IndexStats::default()
        };

        for base in generation.table.iter() {
            let mut bucket = base;
            let mut chain_length = 1u64;
            let mut chain_used = 0u64;
            loop {
                for atomic in &bucket.entries {
                    let entry = atomic.load(Ordering::Relaxed);
                    stats.total_entries += 1;
                    if !entry.is_unused() {
                        stats.used_entries += 1;
                        chain_used += 1;
                        if entry.is_tentative() {
                            stats.tentative_entries += 1;
                        }
                    }
                }
                match generation.next_bucket(bucket) {
                    Some((_, next)) => {
                        bucket = next;
                        chain_length += 1;
                        stats.overflow_buckets += 1;
                    }
                    None => break,
                }
            }
            if chain_used > 0 {
                stats.buckets_with_entries += 1;
            }
            stats.max_chain_length = stats.max_chain_length.max(chain_length);
        }

        stats.load_factor = if stats.total_entries == 0 {
            0.0
        } else {
            stats.used_entries as f64 / stats.total_entries as f64
        };
        stats
    }
}
