//! Hash index for the log-structured store
//!
//! Maps 64-bit key hashes to the log address of the newest record for the
//! key. Each bucket slot stores a 14-bit tag next to the address; callers
//! resolve tag collisions by following the record chain in the log.

mod grow;
mod hash_bucket;
mod hash_table;
mod mem_index;

pub use grow::{
    calculate_num_chunks, get_chunk_bounds, ChunkStatus, GrowConfig, GrowResult, RehashFn,
    ResizeInfo, ResizeStatus, SplitTracker, HASH_TABLE_CHUNK_SIZE,
};
pub use hash_bucket::{
    AtomicHashBucketEntry, AtomicHashBucketOverflowEntry, FixedPageAddress, HashBucket,
    HashBucketEntry, HashBucketOverflowEntry,
};
pub use hash_table::{InternalHashTable, MAX_TABLE_SIZE};
pub use mem_index::{FindResult, IndexStats, MemHashIndex, MemHashIndexConfig};

/// Key hash type for index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Number of bits used for the tag
    pub const TAG_BITS: u32 = HashBucketEntry::TAG_BITS;

    /// Bit position of the tag within the hash
    pub const TAG_SHIFT: u32 = 48;

    /// Create a new key hash
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the hash table index for a given table size
    #[inline]
    pub const fn hash_table_index(&self, size: u64) -> u64 {
        self.hash & (size - 1)
    }

    /// Get the tag portion of the hash (14 bits)
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.hash >> Self::TAG_SHIFT) & ((1 << Self::TAG_BITS) - 1)) as u16
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}

/// Identifies one bucket of a table generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketId {
    /// Primary bucket by index
    Primary(u64),
    /// Overflow bucket by allocator address
    Overflow(FixedPageAddress),
}

/// Location of one slot, returned by value from lookups.
///
/// Holds no reference into table memory; the index resolves it again (and
/// rejects it if its generation is gone) on every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotLocation {
    /// Sequence number of the table generation the slot belongs to
    pub generation: u64,
    /// Bucket holding the slot
    pub bucket: BucketId,
    /// Slot within the bucket, `< HashBucket::NUM_ENTRIES`
    pub slot: usize,
}

/// Per-operation cursor for tag lookups.
///
/// The caller fills in the hash (and optionally an explicit tag); lookups
/// fill in where the tag was found or created. A cursor belongs to one
/// operation on one thread and is not shared.
#[derive(Debug, Clone)]
pub struct HashEntryInfo {
    hash: KeyHash,
    tag: u16,
    pub(crate) generation: u64,
    pub(crate) bucket_index: u64,
    pub(crate) first_bucket: BucketId,
    pub(crate) bucket: BucketId,
    pub(crate) slot: usize,
    pub(crate) entry: HashBucketEntry,
}

impl HashEntryInfo {
    /// Cursor for `hash`, with the tag taken from the hash
    pub fn new(hash: KeyHash) -> Self {
        Self::with_tag(hash, hash.tag())
    }

    /// Cursor with an explicitly supplied tag
    pub fn with_tag(hash: KeyHash, tag: u16) -> Self {
        Self {
            hash,
            tag: tag & ((1 << KeyHash::TAG_BITS) - 1),
            generation: 0,
            bucket_index: 0,
            first_bucket: BucketId::Primary(0),
            bucket: BucketId::Primary(0),
            slot: 0,
            entry: HashBucketEntry::INVALID,
        }
    }

    /// Input hash
    #[inline]
    pub fn hash(&self) -> KeyHash {
        self.hash
    }

    /// Input tag
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Entry observed by the last lookup (`INVALID` if not found)
    #[inline]
    pub fn entry(&self) -> HashBucketEntry {
        self.entry
    }

    /// Address of the entry observed by the last lookup
    #[inline]
    pub fn address(&self) -> crate::Address {
        self.entry.address()
    }

    /// Primary bucket index the hash mapped to
    #[inline]
    pub fn bucket_index(&self) -> u64 {
        self.bucket_index
    }

    /// First bucket of the chain that was searched
    #[inline]
    pub fn first_bucket(&self) -> BucketId {
        self.first_bucket
    }

    /// Location of the found or created slot
    #[inline]
    pub fn location(&self) -> SlotLocation {
        SlotLocation {
            generation: self.generation,
            bucket: self.bucket,
            slot: self.slot,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.entry = HashBucketEntry::INVALID;
        self.slot = 0;
    }
}
