//! Internal hash table: one generation's primary bucket array

use std::mem;

use crate::constants::CACHE_LINE_BYTES;
use crate::index::{HashBucket, KeyHash};
use crate::status::Status;
use crate::utility::{is_32_bit, is_power_of_two, log2, AlignedBuffer};

/// Largest supported table size, in buckets
pub const MAX_TABLE_SIZE: u64 = 1 << 31;

/// Internal hash table - a sized array of HashBuckets
///
/// The array is one zeroed, explicitly aligned allocation. Buckets are never
/// freed or moved while the table lives.
pub struct InternalHashTable {
    buffer: AlignedBuffer,
    size: u64,
    size_mask: u64,
    size_bits: u32,
}

impl InternalHashTable {
    /// Allocate a table of `size` empty buckets.
    ///
    /// `size` must be a power of two no larger than 2^31; `alignment` must be
    /// a power of two of at least one cache line.
    pub fn allocate(size: u64, alignment: usize) -> Result<Self, Status> {
        if !is_power_of_two(size) || !is_32_bit(size) {
            return Err(Status::InvalidArgument);
        }
        if !is_power_of_two(alignment as u64) || alignment < CACHE_LINE_BYTES {
            return Err(Status::InvalidArgument);
        }

        let bytes = (size as usize)
            .checked_mul(mem::size_of::<HashBucket>())
            .ok_or(Status::OutOfMemory)?;
        let buffer = AlignedBuffer::zeroed(alignment, bytes).ok_or(Status::OutOfMemory)?;

        Ok(Self {
            buffer,
            size,
            size_mask: size - 1,
            size_bits: log2(size),
        })
    }

    /// Index of the bucket `hash` maps to
    #[inline]
    pub fn index_of(&self, hash: KeyHash) -> u64 {
        hash.hash_table_index(self.size)
    }

    /// Get the bucket at a specific index
    #[inline]
    pub fn bucket_at(&self, index: u64) -> &HashBucket {
        assert!(index < self.size, "bucket index {index} out of range");
        // SAFETY: the buffer holds `size` zero-initialised buckets and lives as long as `self`.
        unsafe { &*(self.buffer.as_ptr() as *const HashBucket).add(index as usize) }
    }

    /// Number of buckets
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// `size - 1`
    #[inline]
    pub fn size_mask(&self) -> u64 {
        self.size_mask
    }

    /// `log2(size)`
    #[inline]
    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    /// Alignment of the bucket array
    #[inline]
    pub fn alignment(&self) -> usize {
        self.buffer.alignment()
    }

    /// Iterate over all primary buckets in index order
    pub fn iter(&self) -> impl Iterator<Item = &HashBucket> + '_ {
        (0..self.size).map(move |i| self.bucket_at(i))
    }
}

impl std::fmt::Debug for InternalHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalHashTable")
            .field("size", &self.size)
            .field("size_bits", &self.size_bits)
            .field("alignment", &self.alignment())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_hash_table_allocate() {
        let table = InternalHashTable::allocate(1024, 64).unwrap();
        assert_eq!(table.size(), 1024);
        assert_eq!(table.size_mask(), 1023);
        assert_eq!(table.size_bits(), 10);
        assert_eq!(table.bucket_at(0) as *const _ as usize % 64, 0);
    }

    #[test]
    fn test_hash_table_bucket_access() {
        let table = InternalHashTable::allocate(16, 64).unwrap();
        let hash = KeyHash::new(0xABCD_0000_0000_0013);

        assert_eq!(table.index_of(hash), 3);
        assert_eq!(table.index_of(hash), hash.hash_table_index(table.size()));
        assert!(table.iter().all(|b| b.occupied() == 0));
        assert!(table
            .iter()
            .all(|b| b.overflow_entry.load(Ordering::Relaxed).is_unused()));
    }

    #[test]
    fn test_hash_table_larger_alignment() {
        let table = InternalHashTable::allocate(8, 4096).unwrap();
        assert_eq!(table.alignment(), 4096);
        assert_eq!(table.bucket_at(0) as *const _ as usize % 4096, 0);
    }

    #[test]
    fn test_hash_table_rejects_bad_arguments() {
        assert_eq!(
            InternalHashTable::allocate(1000, 64).unwrap_err(),
            Status::InvalidArgument
        );
        assert_eq!(
            InternalHashTable::allocate(0, 64).unwrap_err(),
            Status::InvalidArgument
        );
        assert_eq!(
            InternalHashTable::allocate(MAX_TABLE_SIZE << 1, 64).unwrap_err(),
            Status::InvalidArgument
        );
        assert_eq!(
            InternalHashTable::allocate(16, 32).unwrap_err(),
            Status::InvalidArgument
        );
        assert_eq!(
            InternalHashTable::allocate(16, 96).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    #[should_panic]
    fn test_bucket_at_out_of_range() {
        let table = InternalHashTable::allocate(4, 64).unwrap();
        table.bucket_at(4);
    }
}
