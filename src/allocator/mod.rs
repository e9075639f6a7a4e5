//! Memory allocators for the tag index
//!
//! Primary bucket arrays are allocated once per table generation (see
//! [`crate::index::InternalHashTable`]). Overflow buckets come from a
//! [`FixedPageAllocator`] owned by the same generation: buckets are
//! addressed by small logical integers so that an overflow link fits in the
//! 48-bit address field of a bucket's last slot.

mod fixed_page;

pub use fixed_page::{FixedPageAllocator, DEFAULT_MAX_PAGES, FIXED_PAGE_BITS, FIXED_PAGE_SIZE};
