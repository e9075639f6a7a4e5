//! tagindex - A lock-free, resizable hash index for log-structured stores
//!
//! The index maps 64-bit key hashes to the log address of the newest record
//! for the key. It is the in-memory index of a FASTER-style key-value engine:
//!
//! - **Lock-free operations**: find, find-or-create and slot updates use only
//!   single-word compare-and-swap
//! - **Overflow chains**: buckets that fill up spill into overflow buckets from
//!   a page-based allocator
//! - **Online resize**: the table grows while in use; operations help split
//!   the chunks they touch
//! - **Epoch-based reclamation**: retired tables are freed once no thread can
//!   still see them
//!
//! # Quick Start
//!
//! ```rust
//! use tagindex::{Address, KeyHash, MemHashIndex, MemHashIndexConfig};
//!
//! let index = MemHashIndex::with_config(&MemHashIndexConfig::new(1024))?;
//!
//! let hash = KeyHash::new(0x0042_0000_0000_0007);
//! let created = index.find_or_create_entry(hash, Address::NULL)?;
//! if let Some(location) = created.location {
//!     let desired = created.entry.with_address(Address::new(1, 64));
//!     let _ = index.update_slot(location, created.entry, desired);
//! }
//!
//! assert_eq!(index.find_entry(hash).entry.address(), Address::new(1, 64));
//! # Ok::<(), tagindex::Status>(())
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod config;
pub mod epoch;
pub mod index;
pub mod status;
mod utility;

// Re-exports for convenience
pub use address::Address;
pub use config::{ConfigError, IndexSettings};
pub use epoch::{EpochGuard, LightEpoch};
pub use index::{
    FindResult, GrowConfig, GrowResult, HashBucketEntry, HashEntryInfo, IndexStats, KeyHash,
    MemHashIndex, MemHashIndexConfig, SlotLocation,
};
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads that may hold an epoch slot at once
    pub const MAX_THREADS: usize = 128;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::index::{HashEntryInfo, KeyHash, MemHashIndex, MemHashIndexConfig};
    pub use crate::status::Status;
}
