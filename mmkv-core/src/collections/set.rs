// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::OrderedVec;
use crate::alloc::{Allocator, Arena};
use crate::object::Object;

/// The `SET` type's storage: a deduplicated, alphabetically-ordered vector
/// of members (spec.md section 4.5). Ordered rather than hashed so range
/// scans over a `SET` come for free from the same `OrderedVec` building
/// block `ZSET`'s score index and the TTL index use.
pub struct RelocSet {
    members: OrderedVec<Object>,
}

impl RelocSet {
    pub fn new_in(arena: Arena) -> Self {
        RelocSet { members: OrderedVec::new_in(arena) }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &Object, alloc: &Allocator) -> bool {
        self.members
            .search_by(|m| m.compare_alphabetic(member, alloc).unwrap_or(core::cmp::Ordering::Equal))
            .is_ok()
    }

    /// Inserts `member` if not already present. Returns `true` if it was
    /// newly added.
    pub fn insert(&mut self, member: Object, alloc: &Allocator) -> bool {
        match self
            .members
            .search_by(|m| m.compare_alphabetic(&member, alloc).unwrap_or(core::cmp::Ordering::Equal))
        {
            Ok(_) => false,
            Err(_) => {
                self.members
                    .insert_sorted(member, |m| m.compare_alphabetic(&member, alloc).unwrap_or(core::cmp::Ordering::Equal));
                true
            }
        }
    }

    /// Removes `member`, returning it if present.
    pub fn remove(&mut self, member: &Object, alloc: &Allocator) -> Option<Object> {
        self.members
            .remove_by(|m| m.compare_alphabetic(member, alloc).unwrap_or(core::cmp::Ordering::Equal))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.members.iter()
    }

    /// Destroys every member's owned allocation, then empties the set.
    ///
    /// # Safety
    /// No member may be referenced elsewhere.
    pub unsafe fn destroy_all(&mut self, alloc: &Allocator) {
        for m in self.members.iter() {
            m.destroy(alloc);
        }
        self.members.clear();
    }
}
