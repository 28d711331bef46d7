// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios from spec.md section 8, exercised against the
//! core API directly (this crate implements the data structures and
//! locking/allocation substrate, not a command protocol -- STRLEN/APPEND/
//! INCRBY/ZADD/ZRANGE/... are the caller's command glue, out of scope per
//! spec.md section 1's non-goals, so each scenario below reaches the same
//! observable state through `Database`/`Object`/collection calls instead
//! of literal command syntax). S6 runs at reduced scale (a handful of
//! threads, each attaching its own `Mapping` to the same directory, in
//! place of ten separate OS processes and ten million keys).

use mmkv_core::alloc::ArenaKind;
use mmkv_core::collections::{RelocHashMap, RelocSet, RelocZSet};
use mmkv_core::db::{self, Database};
use mmkv_core::mapping::{CreateOptions, Mapping};
use mmkv_core::object::{Object, ObjectType};
use mmkv_core::snapshot;
use std::time::Duration;
use tempfile::tempdir;

fn small_mapping(dir: &std::path::Path) -> Mapping {
    Mapping::open_or_create(dir, &CreateOptions::default()).unwrap()
}

/// S1 -- String round-trip: `SET`, `GET`, `STRLEN`, `APPEND`, `GET`.
#[test]
fn s1_string_round_trip() {
    let dir = tempdir().unwrap();
    let mapping = small_mapping(dir.path());
    let alloc = mapping.allocator();
    let db = Database::new(0);

    let key = Object::new_string(&alloc, ArenaKind::Key, b"k1").unwrap();
    db.set(&mapping, key, Object::new_string(&alloc, ArenaKind::Value, b"hello").unwrap()).unwrap();

    let got = db.get(&mapping, &key).unwrap().unwrap();
    let bytes = got.to_bytes(&alloc).unwrap();
    assert_eq!(bytes.as_ref(), b"hello");
    assert_eq!(bytes.len(), 5);

    let mut appended = bytes.into_owned();
    appended.extend_from_slice(b"!");
    db.set(&mapping, key, Object::new_string(&alloc, ArenaKind::Value, &appended).unwrap()).unwrap();
    assert_eq!(db.get(&mapping, &key).unwrap().unwrap().to_bytes(&alloc).unwrap().as_ref(), b"hello!");
}

/// S2 -- Integer encoding invariant: a canonical decimal string is stored
/// as `Encoding::Integer`, and `INCRBY` is a decode-add-reencode cycle.
#[test]
fn s2_integer_encoding_invariant() {
    let dir = tempdir().unwrap();
    let mapping = small_mapping(dir.path());
    let alloc = mapping.allocator();
    let db = Database::new(0);

    let key = Object::new_string(&alloc, ArenaKind::Key, b"n").unwrap();
    let value = Object::new_string(&alloc, ArenaKind::Value, b"12345").unwrap();
    assert_eq!(value.encoding(), mmkv_core::object::Encoding::Integer);
    db.set(&mapping, key, value).unwrap();

    let current = db.get(&mapping, &key).unwrap().unwrap();
    let incremented = current.as_integer().unwrap() + 5;
    db.set(&mapping, key, Object::new_integer(ObjectType::String, incremented)).unwrap();

    let got = db.get(&mapping, &key).unwrap().unwrap();
    assert_eq!(got.as_integer(), Some(12350));
    assert_eq!(got.to_bytes(&alloc).unwrap().as_ref(), b"12350");
}

/// S3 -- TTL expiry: `SET`, `PEXPIRE ms=50`, sleep past it, `sweep`
/// removes exactly one entry, `EXISTS` becomes false.
#[test]
fn s3_ttl_expiry() {
    let dir = tempdir().unwrap();
    let mapping = small_mapping(dir.path());
    let alloc = mapping.allocator();
    let db = Database::new(0);

    let key = Object::new_string(&alloc, ArenaKind::Key, b"x").unwrap();
    db.set(&mapping, key, Object::new_string(&alloc, ArenaKind::Value, b"v").unwrap()).unwrap();
    db.set_ttl(&mapping, &key, 50).unwrap();

    let removed = db::sweep(&mapping, 150, 10, Duration::from_millis(10)).unwrap();
    assert_eq!(removed, 1);
    assert!(!db.contains(&mapping, &key).unwrap());
}

/// S4 -- Sorted set dual index: `ZADD` three members, `ZSCORE`, rank
/// order, then `ZREM` one and check both indexes still agree.
#[test]
fn s4_sorted_set_dual_index() {
    let dir = tempdir().unwrap();
    let mapping = small_mapping(dir.path());
    let alloc = mapping.allocator();
    let db = Database::new(0);

    let key = Object::new_string(&alloc, ArenaKind::Key, b"z").unwrap();
    let zset_ptr = db.get_or_create_typed::<RelocZSet>(&mapping, &key).unwrap();
    let zset = unsafe { &mut *zset_ptr.as_ptr() };
    for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
        let m = Object::new_string(&alloc, ArenaKind::Key, member.as_bytes()).unwrap();
        zset.insert(m, score, &alloc);
    }

    let b = Object::new_string(&alloc, ArenaKind::Key, b"b").unwrap();
    assert_eq!(zset.score(&b, &alloc), Some(2.0));
    let ordered: Vec<Vec<u8>> = zset.iter_by_score().map(|(_, m)| m.to_bytes(&alloc).unwrap().into_owned()).collect();
    assert_eq!(ordered, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    assert_eq!(zset.remove(&b, &alloc), Some(2.0));
    assert_eq!(zset.len(), 2);
    let remaining: Vec<Vec<u8>> = zset.iter_by_score().map(|(_, m)| m.to_bytes(&alloc).unwrap().into_owned()).collect();
    assert_eq!(remaining, vec![b"a".to_vec(), b"c".to_vec()]);
}

/// S5 -- Backup/restore identity: load keys of every non-collection and
/// collection type into one segment, back it up, restore into a fresh
/// directory, and check every value reads back identically.
#[test]
fn s5_backup_restore_identity() {
    let src_dir = tempdir().unwrap();
    let snap_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();

    let mapping = small_mapping(src_dir.path());
    let alloc = mapping.allocator();
    let db = Database::new(0);

    for i in 0..50i64 {
        let key = Object::new_string(&alloc, ArenaKind::Key, format!("str{i}").as_bytes()).unwrap();
        db.set(&mapping, key, Object::new_string(&alloc, ArenaKind::Value, format!("value-{i}").as_bytes()).unwrap()).unwrap();
    }

    let hash_key = Object::new_string(&alloc, ArenaKind::Key, b"profile").unwrap();
    let hash_ptr = db.get_or_create_typed::<RelocHashMap>(&mapping, &hash_key).unwrap();
    unsafe { &mut *hash_ptr.as_ptr() }.insert(
        Object::new_string(&alloc, ArenaKind::Key, b"name").unwrap(),
        Object::new_string(&alloc, ArenaKind::Value, b"ava").unwrap(),
        &alloc,
    );

    let set_key = Object::new_string(&alloc, ArenaKind::Key, b"tags").unwrap();
    let set_ptr = db.get_or_create_typed::<RelocSet>(&mapping, &set_key).unwrap();
    for tag in ["alpha", "beta"] {
        unsafe { &mut *set_ptr.as_ptr() }.insert(Object::new_string(&alloc, ArenaKind::Key, tag.as_bytes()).unwrap(), &alloc);
    }

    snapshot::backup(&mapping, &alloc, snap_dir.path()).unwrap();
    let restored = snapshot::restore(snap_dir.path(), dst_dir.path().join("segment")).unwrap();
    let restored_alloc = restored.allocator();
    let restored_db = Database::new(0);

    for i in 0..50i64 {
        let key = Object::new_string(&restored_alloc, ArenaKind::Key, format!("str{i}").as_bytes()).unwrap();
        let got = restored_db.get(&restored, &key).unwrap().unwrap();
        assert_eq!(got.to_bytes(&restored_alloc).unwrap().as_ref(), format!("value-{i}").as_bytes());
    }

    let restored_hash_key = Object::new_string(&restored_alloc, ArenaKind::Key, b"profile").unwrap();
    let restored_hash = restored_db.get(&restored, &restored_hash_key).unwrap().unwrap();
    assert_eq!(restored_hash.kind(), ObjectType::Hash);

    let restored_set_key = Object::new_string(&restored_alloc, ArenaKind::Key, b"tags").unwrap();
    let restored_set = restored_db.get(&restored, &restored_set_key).unwrap().unwrap();
    assert_eq!(restored_set.kind(), ObjectType::Set);
}

/// S6 -- Multi-process write, at reduced scale: several threads, each
/// attaching its own `Mapping` to the same directory, write disjoint keys
/// concurrently; afterwards every written key is present and `dbsize`
/// matches the total written.
#[test]
fn s6_concurrent_writers_disjoint_keys() {
    const WRITERS: usize = 4;
    const KEYS_PER_WRITER: usize = 200;

    let dir = tempdir().unwrap();
    // Create the segment up front so every writer thread only attaches.
    drop(small_mapping(dir.path()));

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let mapping = Mapping::open_or_create(&path, &CreateOptions::default()).unwrap();
                let alloc = mapping.allocator();
                let db = Database::new(5);
                mapping.lock().lock_write();
                for i in 0..KEYS_PER_WRITER {
                    let name = format!("w{w}-k{i}");
                    let key = Object::new_string(&alloc, ArenaKind::Key, name.as_bytes()).unwrap();
                    db.set(&mapping, key, Object::new_integer(ObjectType::String, i as i64)).unwrap();
                }
                mapping.lock().unlock_write();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mapping = Mapping::open_or_create(dir.path(), &CreateOptions::default()).unwrap();
    let alloc = mapping.allocator();
    let db = Database::new(5);
    assert_eq!(db.dbsize(&mapping).unwrap(), WRITERS * KEYS_PER_WRITER);
    for w in 0..WRITERS {
        for i in 0..KEYS_PER_WRITER {
            let name = format!("w{w}-k{i}");
            let key = Object::new_string(&alloc, ArenaKind::Key, name.as_bytes()).unwrap();
            assert!(db.contains(&mapping, &key).unwrap());
        }
    }
}
