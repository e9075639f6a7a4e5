//! Hash bucket structures for the tag index
//!
//! This module is the single source of the index word layout. Every other
//! module reads and writes slots through these types.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::constants::CACHE_LINE_BYTES;

/// Entry stored in a hash bucket slot
///
/// Packed into 8 bytes:
/// - address (48 bits): logical address of the newest record for the tag
///   (bit 47 marks a read-cache address)
/// - tag (14 bits): hash fingerprint distinguishing keys in one bucket
/// - pending (1 bit): reserved, never set by this crate
/// - tentative (1 bit): slot claimed by an insert that has not been confirmed
///
/// A word of zero is an empty slot.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    /// Empty slot
    pub const INVALID: Self = Self(0);

    /// Observed value reported by `update_slot` when the slot's table
    /// generation can no longer be written. Never stored in a bucket.
    pub const STALE: Self = Self(u64::MAX);

    /// Number of bits for the tag
    pub const TAG_BITS: u32 = 14;

    /// Address mask (48 bits)
    pub const ADDRESS_MASK: u64 = (1 << Address::ADDRESS_BITS) - 1;

    const READ_CACHE_BIT: u64 = Address::READ_CACHE_MASK;
    const TAG_SHIFT: u32 = Address::ADDRESS_BITS;
    const TAG_MASK: u64 = (1 << Self::TAG_BITS) - 1;
    const PENDING_BIT: u64 = 1 << 62;
    const TENTATIVE_BIT: u64 = 1 << 63;

    /// Create a new entry
    #[inline]
    pub const fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::ADDRESS_MASK;
        control |= ((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            control |= Self::TENTATIVE_BIT;
        }
        Self(control)
    }

    /// Create a tentative placeholder for `tag`
    #[inline]
    pub const fn tentative(tag: u16) -> Self {
        Self::new(Address::INVALID, tag, true)
    }

    /// Create an entry from raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Check if this slot is empty
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Get the address portion
    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    /// Get the tag portion
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    /// Check if the entry is tentative (insert in flight)
    #[inline]
    pub const fn is_tentative(&self) -> bool {
        (self.0 & Self::TENTATIVE_BIT) != 0
    }

    /// Check the reserved pending bit
    #[inline]
    pub const fn is_pending(&self) -> bool {
        (self.0 & Self::PENDING_BIT) != 0
    }

    /// Check if the address points to the read cache
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_BIT) != 0
    }

    /// A confirmed entry whose tag equals `tag`
    #[inline]
    pub const fn matches(&self, tag: u16) -> bool {
        !self.is_unused() && !self.is_tentative() && self.tag() == tag
    }

    /// Same entry with the tentative bit cleared
    #[inline]
    pub const fn confirmed(&self) -> Self {
        Self(self.0 & !Self::TENTATIVE_BIT)
    }

    /// Same tag and flags, pointing at `address`
    #[inline]
    pub const fn with_address(&self, address: Address) -> Self {
        Self((self.0 & !Self::ADDRESS_MASK) | (address.control() & Self::ADDRESS_MASK))
    }

    /// Whether the begin-address sweep may clear this slot.
    ///
    /// Tentative entries and the tentative placeholder address are never
    /// reclaimable: a tentative slot belongs to the thread that claimed it
    /// until that thread overwrites it.
    #[inline]
    pub fn is_reclaimable(&self, begin_address: Address) -> bool {
        !self.is_unused()
            && !self.is_tentative()
            && !self.address().is_invalid()
            && self.address() < begin_address
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for HashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::STALE {
            return write!(f, "HashBucketEntry(STALE)");
        }
        f.debug_struct("HashBucketEntry")
            .field("address", &self.address().control())
            .field("tag", &self.tag())
            .field("tentative", &self.is_tentative())
            .field("read_cache", &self.in_read_cache())
            .finish()
    }
}

/// Atomic slot holding a [`HashBucketEntry`]
#[repr(transparent)]
pub struct AtomicHashBucketEntry {
    control: AtomicU64,
}

impl AtomicHashBucketEntry {
    /// Create a new empty slot
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Load the entry atomically
    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketEntry {
        HashBucketEntry(self.control.load(ordering))
    }

    /// Store an entry atomically
    #[inline]
    pub fn store(&self, entry: HashBucketEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    /// Compare and exchange
    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(HashBucketEntry)
            .map_err(HashBucketEntry)
    }
}

impl Default for AtomicHashBucketEntry {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Debug for AtomicHashBucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

/// Logical address of an overflow bucket inside a `FixedPageAllocator`
///
/// Zero means "no bucket"; the allocator never issues it.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FixedPageAddress(u64);

impl FixedPageAddress {
    /// No overflow bucket
    pub const NONE: Self = Self(0);

    /// Largest representable address (48 bits)
    pub const MAX: u64 = (1 << Address::ADDRESS_BITS) - 1;

    /// Create a new fixed page address
    #[inline]
    pub const fn new(address: u64) -> Self {
        Self(address)
    }

    /// Get the raw address value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if the address refers to no bucket
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for FixedPageAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "FixedPageAddress(NONE)")
        } else {
            write!(f, "FixedPageAddress({})", self.0)
        }
    }
}

/// Overflow slot of a bucket: link to the next bucket in the chain
///
/// Bits above the 48-bit address are carried through unchanged by every
/// update and ignored when following the link.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct HashBucketOverflowEntry(u64);

impl HashBucketOverflowEntry {
    /// Empty link
    pub const INVALID: Self = Self(0);

    const ADDRESS_MASK: u64 = FixedPageAddress::MAX;

    /// Create a new overflow entry
    #[inline]
    pub const fn new(address: FixedPageAddress) -> Self {
        Self(address.control() & Self::ADDRESS_MASK)
    }

    /// Create from raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Check if the link is empty
    #[inline]
    pub const fn is_unused(&self) -> bool {
        (self.0 & Self::ADDRESS_MASK) == 0
    }

    /// Get the overflow bucket address
    #[inline]
    pub const fn address(&self) -> FixedPageAddress {
        FixedPageAddress::new(self.0 & Self::ADDRESS_MASK)
    }

    /// Same non-address bits, linking to `address`
    #[inline]
    pub const fn with_address(&self, address: FixedPageAddress) -> Self {
        Self((self.0 & !Self::ADDRESS_MASK) | (address.control() & Self::ADDRESS_MASK))
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for HashBucketOverflowEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBucketOverflowEntry")
            .field("address", &self.address())
            .field("high_bits", &(self.0 >> Address::ADDRESS_BITS))
            .finish()
    }
}

/// Atomic overflow slot
#[repr(transparent)]
pub struct AtomicHashBucketOverflowEntry {
    control: AtomicU64,
}

impl AtomicHashBucketOverflowEntry {
    /// Create an empty link
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Load the link atomically
    #[inline]
    pub fn load(&self, ordering: Ordering) -> HashBucketOverflowEntry {
        HashBucketOverflowEntry(self.control.load(ordering))
    }

    /// Store a link atomically
    #[inline]
    pub fn store(&self, entry: HashBucketOverflowEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    /// Compare and exchange
    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketOverflowEntry,
        new: HashBucketOverflowEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<HashBucketOverflowEntry, HashBucketOverflowEntry> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(HashBucketOverflowEntry)
            .map_err(HashBucketOverflowEntry)
    }
}

impl Default for AtomicHashBucketOverflowEntry {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Hash bucket: 7 entries plus one overflow link, exactly one cache line.
///
/// All-zero bytes are a valid empty bucket, so bucket arrays are allocated
/// with zeroed memory and never constructed element by element.
#[repr(C, align(64))]
pub struct HashBucket {
    /// Hash bucket entries
    pub entries: [AtomicHashBucketEntry; Self::NUM_ENTRIES],
    /// Overflow pointer to next bucket
    pub overflow_entry: AtomicHashBucketOverflowEntry,
}

impl HashBucket {
    /// Number of entries per bucket (excluding overflow)
    pub const NUM_ENTRIES: usize = 7;

    /// Create a new empty hash bucket
    pub const fn new() -> Self {
        Self {
            entries: [
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
                AtomicHashBucketEntry::invalid(),
            ],
            overflow_entry: AtomicHashBucketOverflowEntry::invalid(),
        }
    }

    /// Zero every slot and the overflow link.
    ///
    /// Only valid when no other thread can reach the bucket.
    pub fn reset(&self) {
        for entry in &self.entries {
            entry.store(HashBucketEntry::INVALID, Ordering::Relaxed);
        }
        self.overflow_entry
            .store(HashBucketOverflowEntry::INVALID, Ordering::Release);
    }

    /// Number of non-empty slots
    pub fn occupied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.load(Ordering::Acquire).is_unused())
            .count()
    }
}

impl Default for HashBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HashBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBucket")
            .field("entries", &self.entries)
            .field("overflow", &self.overflow_entry.load(Ordering::Relaxed))
            .finish()
    }
}

// Ensure HashBucket fits in a cache line
const _: () = assert!(mem::size_of::<HashBucket>() == CACHE_LINE_BYTES);
const _: () = assert!(mem::align_of::<HashBucket>() == CACHE_LINE_BYTES);
