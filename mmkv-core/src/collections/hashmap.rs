// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::hash_object;
use crate::alloc::{Allocator, Arena};
use crate::object::Object;
use hashbrown::HashTable;

/// A key/value map backed by a `hashbrown::HashTable` allocated straight
/// out of an [`Arena`], used for both the `HASH` type and the database's
/// own key table and named-objects index.
///
/// Every method takes `&Allocator` rather than storing one: a `HashMap`
/// instance is typically reached through an `Object::OffsetPtr` root that
/// outlives any single `Allocator` view, and the allocator handles
/// themselves go stale across a mapping grow (see `crate::mapping`), so
/// the caller always supplies a freshly-derived one.
pub struct RelocHashMap {
    table: HashTable<(Object, Object), Arena>,
}

impl RelocHashMap {
    pub fn new_in(arena: Arena) -> Self {
        RelocHashMap { table: HashTable::new_in(arena) }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, key: &Object, alloc: &Allocator) -> Option<Object> {
        let hash = hash_object(key, alloc);
        self.table
            .find(hash, |(k, _)| k.equals(key, alloc).unwrap_or(false))
            .map(|(_, v)| *v)
    }

    pub fn contains_key(&self, key: &Object, alloc: &Allocator) -> bool {
        self.get(key, alloc).is_some()
    }

    /// Inserts `value` under `key`, returning the previous value if the key
    /// was already present.
    pub fn insert(&mut self, key: Object, value: Object, alloc: &Allocator) -> Option<Object> {
        let hash = hash_object(&key, alloc);
        if let Some(slot) = self
            .table
            .find_mut(hash, |(k, _)| k.equals(&key, alloc).unwrap_or(false))
        {
            let old = slot.1;
            slot.1 = value;
            return Some(old);
        }
        self.table
            .insert_unique(hash, (key, value), |(k, _)| hash_object(k, alloc));
        None
    }

    /// Removes `key`, returning its value if present. Does not free an
    /// `OFFSET_PTR`-encoded key or value's owned allocation -- callers that
    /// need that must resolve the removed pair and call
    /// `Object::destroy` themselves (mirrors `Object::destroy`'s own
    /// contract).
    pub fn remove(&mut self, key: &Object, alloc: &Allocator) -> Option<(Object, Object)> {
        let hash = hash_object(key, alloc);
        match self.table.find_entry(hash, |(k, _)| k.equals(key, alloc).unwrap_or(false)) {
            Ok(entry) => Some(entry.remove().0),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Object, Object)> {
        self.table.iter()
    }

    /// Toggles the stored value's `HASTTL` tag bit for `key` in place,
    /// without disturbing its hash or position. Returns `false` if `key`
    /// is not present. Used to keep a database's key table's `has_ttl`
    /// bit in sync with the store-wide TTL index (`crate::ttl`) on
    /// `EXPIRE`/`PERSIST`-shaped operations.
    pub fn set_value_has_ttl(&mut self, key: &Object, alloc: &Allocator, has_ttl: bool) -> bool {
        let hash = hash_object(key, alloc);
        match self.table.find_mut(hash, |(k, _)| k.equals(key, alloc).unwrap_or(false)) {
            Some(slot) => {
                slot.1.set_has_ttl(has_ttl);
                true
            }
            None => false,
        }
    }

    /// Destroys every key and value that owns an arena allocation, then
    /// empties the table. Must be called before dropping a `RelocHashMap`
    /// whose entries may hold `OFFSET_PTR` strings, or those allocations
    /// leak.
    ///
    /// # Safety
    /// Every entry's key and value must not be referenced elsewhere (no
    /// other `Object` alias points at the same arena allocation).
    pub unsafe fn destroy_all(&mut self, alloc: &Allocator) {
        for (k, v) in self.table.iter() {
            k.destroy(alloc);
            v.destroy(alloc);
        }
        self.table.clear();
    }

    /// Empties the table without freeing any entry's allocation. For use
    /// once the caller has already torn down every entry itself -- e.g. a
    /// database key table whose values may be typed collection roots that
    /// `Object::destroy` alone cannot tear down (see `db::destroy_value`).
    pub fn clear(&mut self) {
        self.table.clear();
    }
}
