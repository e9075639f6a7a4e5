//! Log address type stored in index entries
//!
//! The index never interprets log addresses beyond ordering them against the
//! truncation watermark (`BeginAddress`). The page/offset split below mirrors
//! the layout used by the hybrid log that owns the records.

use std::cmp::Ordering;
use std::fmt;

/// A logical address into the record log.
///
/// Uses 48 bits: 25 bits for the offset within a page and 23 bits for the page.
/// The remaining 16 bits of an index entry carry the tag and status bits.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Hash)]
pub struct Address(u64);

impl Address {
    /// The all-zero address. An index word of zero is an empty slot, so no
    /// confirmed entry ever stores this value.
    pub const NULL: Self = Self(0);

    /// Placeholder address carried by tentative entries while an insert is in flight.
    ///
    /// Set to 1, not 0, so a tentative entry is never mistaken for an empty slot,
    /// and never reclaimed by the begin-address sweep.
    pub const INVALID: Self = Self(1);

    /// Total number of address bits used
    pub const ADDRESS_BITS: u32 = 48;

    /// Number of bits used for page offset (32 MB per page)
    pub const OFFSET_BITS: u32 = 25;

    /// Number of bits used for page number
    pub const PAGE_BITS: u32 = Self::ADDRESS_BITS - Self::OFFSET_BITS;

    /// Maximum valid address value
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Read cache bit mask (bit 47)
    pub const READ_CACHE_MASK: u64 = 1 << (Self::ADDRESS_BITS - 1);

    /// Create a new address from page and offset
    #[inline]
    pub const fn new(page: u32, offset: u32) -> Self {
        debug_assert!(page < (1 << Self::PAGE_BITS));
        debug_assert!(offset < (1 << Self::OFFSET_BITS));
        Self(((page as u64) << Self::OFFSET_BITS) | (offset as u64))
    }

    /// Create an address from a raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Get the page number
    #[inline]
    pub const fn page(&self) -> u32 {
        ((self.0 >> Self::OFFSET_BITS) & ((1 << Self::PAGE_BITS) - 1)) as u32
    }

    /// Get the offset within the page
    #[inline]
    pub const fn offset(&self) -> u32 {
        (self.0 & ((1 << Self::OFFSET_BITS) - 1)) as u32
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if this address is in the read cache
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_MASK) != 0
    }

    /// Check if this is the tentative placeholder address
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("page", &self.page())
            .field("offset", &self.offset())
            .field("control", &self.0)
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.offset())
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_new() {
        let addr = Address::new(3, 1000);
        assert_eq!(addr.page(), 3);
        assert_eq!(addr.offset(), 1000);
        assert_eq!(addr.control(), (3u64 << Address::OFFSET_BITS) | 1000);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::INVALID.is_invalid());
        assert!(!Address::NULL.is_invalid());
        assert!(Address::NULL < Address::INVALID);
        assert!(!Address::from(100).is_invalid());
    }

    #[test]
    fn test_address_ordering() {
        let a = Address::from(100);
        let b = Address::from(150);
        assert!(a < b);
        assert_eq!(a.max(b), b);
        assert_eq!(u64::from(b), 150);
    }

    #[test]
    fn test_read_cache_bit() {
        let addr = Address::from_control(Address::READ_CACHE_MASK | 42);
        assert!(addr.in_read_cache());
        assert!(!Address::from(42).in_read_cache());
    }
}
