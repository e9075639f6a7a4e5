//! Shared helpers for index integration tests.
//!
//! Test keys are plain ids. A key's log address encodes its id, so the rehash
//! callback a resize needs can recover the full hash from the address alone.

#![allow(dead_code)]

use tagindex::index::KeyHash;
use tagindex::{Address, MemHashIndex, MemHashIndexConfig, Status};

/// Addresses of first versions start here.
pub const ADDRESS_BASE: u64 = 1 << 20;

/// Addresses of rewritten versions start here.
pub const REWRITE_BASE: u64 = 1 << 40;

/// Ids below this get distinct tags.
pub const MAX_DISTINCT_ID: u64 = (1 << KeyHash::TAG_BITS) - 1;

/// Full hash of a key id.
pub fn key_hash(id: u64) -> KeyHash {
    let tag = id % MAX_DISTINCT_ID + 1;
    let low = id.wrapping_mul(0x9E37_79B9_7F4A_7C15) & ((1 << KeyHash::TAG_SHIFT) - 1);
    KeyHash::new((tag << KeyHash::TAG_SHIFT) | low)
}

pub fn key_address(id: u64) -> Address {
    Address::from(ADDRESS_BASE + id)
}

pub fn rewrite_address(id: u64) -> Address {
    Address::from(REWRITE_BASE + id)
}

/// Rehash callback for addresses made by `key_address` / `rewrite_address`.
pub fn rehash_key(address: Address) -> Option<KeyHash> {
    let control = address.control();
    let id = if control >= REWRITE_BASE {
        control - REWRITE_BASE
    } else {
        control.checked_sub(ADDRESS_BASE)?
    };
    Some(key_hash(id))
}

pub fn create_index(size: u64) -> MemHashIndex {
    MemHashIndex::with_config(&MemHashIndexConfig::new(size)).unwrap()
}

/// Point `hash` at `address`, creating the entry if needed.
///
/// Retries when the slot changed underneath or its table was retired.
pub fn upsert(index: &MemHashIndex, hash: KeyHash, address: Address) -> Result<(), Status> {
    loop {
        let result = index.find_or_create_entry(hash, Address::NULL)?;
        let Some(location) = result.location else {
            return Err(Status::InvalidOperation);
        };
        // Err is either another writer's value or STALE; both mean find again.
        if index
            .update_slot(location, result.entry, result.entry.with_address(address))
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Current address of `hash`, if present.
pub fn lookup(index: &MemHashIndex, hash: KeyHash) -> Option<Address> {
    let result = index.find_entry(hash);
    result.found().then_some(result.entry.address())
}
