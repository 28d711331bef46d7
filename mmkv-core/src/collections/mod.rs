// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relocatable collection types built on [`crate::alloc::Arena`] and
//! [`crate::object::Object`] (spec.md section 4.5's HASH/LIST/SET/ZSET
//! bodies; command-level logic that consumes them is explicitly out of
//! scope).

mod hashmap;
mod list;
mod ordered;
mod set;
mod zset;

pub use hashmap::RelocHashMap;
pub use list::RelocList;
pub use ordered::OrderedVec;
pub use set::RelocSet;
pub use zset::RelocZSet;

use crate::alloc::Allocator;
use crate::object::Object;

/// Deterministic (non-randomized) hash of an object's logical bytes. Every
/// hash table in this crate lives in shared memory and is read by other
/// processes, so the hash of a given key must be identical across
/// processes and across runs -- ruling out `std`'s per-process-randomized
/// `RandomState` the same way the string table this is grounded on does.
pub fn hash_object(obj: &Object, alloc: &Allocator) -> u64 {
    let bytes = obj.to_bytes(alloc).expect("hashable object must resolve its bytes");
    fnv1a(&bytes)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_deterministic_across_calls() {
        assert_eq!(fnv1a(b"hello"), fnv1a(b"hello"));
        assert_ne!(fnv1a(b"hello"), fnv1a(b"world"));
    }
}
