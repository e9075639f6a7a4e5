//! Basic operation tests for tagindex
//!
//! Single-threaded find / find-or-create / update / reclamation through the
//! public API.

mod common;

use common::{create_index, key_address, key_hash, lookup, upsert};
use tagindex::index::{BucketId, KeyHash};
use tagindex::{Address, HashBucketEntry, HashEntryInfo, MemHashIndex, MemHashIndexConfig, Status};

/// Hash for `tag` in bucket 3 of a 16-bucket table
fn bucket3(tag: u16) -> KeyHash {
    KeyHash::new(((tag as u64) << KeyHash::TAG_SHIFT) | 3)
}

#[test]
fn test_basic_insert_find() {
    let index = create_index(1024);

    for id in 0..500 {
        upsert(&index, key_hash(id), key_address(id)).unwrap();
    }
    for id in 0..500 {
        assert_eq!(lookup(&index, key_hash(id)), Some(key_address(id)));
    }
    assert_eq!(lookup(&index, key_hash(501)), None);
}

#[test]
fn test_find_nonexistent() {
    let index = create_index(64);
    let mut info = HashEntryInfo::new(key_hash(7));
    assert_eq!(index.find_tag(&mut info), Ok(false));
    assert_eq!(info.entry(), HashBucketEntry::INVALID);
}

#[test]
fn test_update_existing() {
    let index = create_index(64);
    let hash = key_hash(42);

    upsert(&index, hash, Address::from(100)).unwrap();
    upsert(&index, hash, Address::from(200)).unwrap();
    assert_eq!(lookup(&index, hash), Some(Address::from(200)));
    assert_eq!(index.dump_distribution().used_entries, 1);
}

#[test]
fn test_four_tags_one_bucket_with_reclaimed_slot() {
    let index = create_index(16);
    let (a, b, c, d) = (bucket3(1), bucket3(2), bucket3(3), bucket3(4));

    upsert(&index, a, Address::from(100)).unwrap();
    upsert(&index, b, Address::from(200)).unwrap();
    upsert(&index, c, Address::from(300)).unwrap();

    assert_eq!(lookup(&index, a), Some(Address::from(100)));
    assert_eq!(lookup(&index, b), Some(Address::from(200)));
    assert_eq!(lookup(&index, c), Some(Address::from(300)));
    let slot_of_a = index.find_entry(a).location.unwrap();

    let mut info = HashEntryInfo::new(d);
    index.find_or_create_tag(&mut info, Address::from(150)).unwrap();
    assert_eq!(info.location(), slot_of_a);
    assert_eq!(info.bucket_index(), 3);

    assert_eq!(lookup(&index, a), None);
    assert_eq!(lookup(&index, b), Some(Address::from(200)));
    assert_eq!(lookup(&index, c), Some(Address::from(300)));
    assert_eq!(lookup(&index, d), Some(Address::INVALID));
}

#[test]
fn test_dead_entries_do_not_block_creation() {
    let index = create_index(16);
    let hash = bucket3(9);
    upsert(&index, hash, Address::from(100)).unwrap();

    // Past the watermark the old entry is gone and the tag is created afresh.
    let created = index.find_or_create_entry(hash, Address::from(1000)).unwrap();
    assert_eq!(created.entry.address(), Address::INVALID);
    assert_eq!(index.dump_distribution().used_entries, 1);
}

#[test]
fn test_overflow_chain_spill() {
    let index = create_index(16);
    for tag in 1..=30u16 {
        upsert(&index, bucket3(tag), Address::from(1000 + tag as u64)).unwrap();
    }
    for tag in 1..=30u16 {
        assert_eq!(
            lookup(&index, bucket3(tag)),
            Some(Address::from(1000 + tag as u64))
        );
    }

    let stats = index.dump_distribution();
    assert_eq!(stats.buckets_with_entries, 1);
    assert_eq!(stats.max_chain_length, 5);

    let mut info = HashEntryInfo::new(bucket3(30));
    assert!(index.find_tag(&mut info).unwrap());
    assert_eq!(info.first_bucket(), BucketId::Primary(3));
    assert!(matches!(info.location().bucket, BucketId::Overflow(_)));
}

#[test]
fn test_garbage_collect_then_reuse() {
    let index = create_index(16);
    for tag in 1..=14u16 {
        upsert(&index, bucket3(tag), Address::from(100 * tag as u64)).unwrap();
    }
    let before = index.overflow_buckets_allocated();

    assert_eq!(index.garbage_collect(Address::from(800)), Ok(7));
    for tag in 15..=21u16 {
        upsert(&index, bucket3(tag), Address::from(10_000)).unwrap();
    }

    // Freed slots were reused; the chain did not grow.
    assert_eq!(index.overflow_buckets_allocated(), before);
    assert_eq!(index.dump_distribution().used_entries, 14);
}

#[test]
fn test_try_update_address_after_record_moves() {
    let index = create_index(64);
    let hash = key_hash(5);
    upsert(&index, hash, key_address(5)).unwrap();

    index
        .try_update_address(hash, key_address(5), Address::from(77))
        .unwrap();
    assert_eq!(lookup(&index, hash), Some(Address::from(77)));
    assert_eq!(
        index.try_update_address(hash, key_address(5), Address::from(78)),
        Err(Status::NotFound)
    );
}

#[test]
fn test_uninitialized_index() {
    let index = MemHashIndex::new();
    assert_eq!(index.size(), 0);
    assert!(!index.find_entry(key_hash(1)).found());
    assert_eq!(
        index.find_or_create_entry(key_hash(1), Address::NULL),
        Err(Status::InvalidOperation)
    );
}

#[test]
fn test_initialize_alignment() {
    let config = MemHashIndexConfig::new(256).with_alignment(4096);
    let index = MemHashIndex::with_config(&config).unwrap();
    assert_eq!(index.config().alignment, 4096);
    upsert(&index, key_hash(1), key_address(1)).unwrap();
    assert_eq!(lookup(&index, key_hash(1)), Some(key_address(1)));
}
