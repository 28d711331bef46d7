// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{OrderedVec, RelocHashMap};
use crate::alloc::{Allocator, Arena};
use crate::object::Object;
use core::cmp::Ordering;

/// The `ZSET` type's storage: a score-ordered index paired with a
/// member-to-score map, kept in sync on every mutation (spec.md section
/// 4.5's dual-index invariant).
///
/// `by_value` owns each member's arena allocation (it is the map whose key
/// is the canonical copy); `by_score` holds a second `Object` alias of the
/// same member purely for sort order; `destroy_all` only ever frees through
/// `by_value` to avoid a double free of the same string payload.
pub struct RelocZSet {
    by_score: OrderedVec<(f64, Object)>,
    by_value: RelocHashMap,
}

impl RelocZSet {
    pub fn new_in(arena: Arena) -> Self {
        RelocZSet {
            by_score: OrderedVec::new_in(arena),
            by_value: RelocHashMap::new_in(arena),
        }
    }

    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    pub fn score(&self, member: &Object, alloc: &Allocator) -> Option<f64> {
        self.by_value.get(member, alloc).and_then(|o| o.as_score())
    }

    /// Inserts or updates `member`'s score, returning the previous score if
    /// it was already a member.
    pub fn insert(&mut self, member: Object, score: f64, alloc: &Allocator) -> Option<f64> {
        let previous = self.score(&member, alloc);
        if let Some(old_score) = previous {
            self.by_score.remove_by(|(s, v)| cmp_score_member(*s, v, old_score, &member, alloc));
        }
        self.by_value.insert(member, Object::new_score(score), alloc);
        self.by_score
            .insert_sorted((score, member), |(s, v)| cmp_score_member(*s, v, score, &member, alloc));
        previous
    }

    /// Removes `member`, returning its score if it was present.
    pub fn remove(&mut self, member: &Object, alloc: &Allocator) -> Option<f64> {
        let (_, score_obj) = self.by_value.remove(member, alloc)?;
        let score = score_obj.as_score().expect("zset value is always score-encoded");
        self.by_score.remove_by(|(s, v)| cmp_score_member(*s, v, score, member, alloc));
        Some(score)
    }

    pub fn iter_by_score(&self) -> impl Iterator<Item = &(f64, Object)> {
        self.by_score.iter()
    }

    /// Index range covering members whose score falls in `[min, max]`, used
    /// by range-query operations above this crate's scope.
    pub fn score_range_indices(&self, min: f64, max: f64) -> (usize, usize) {
        self.by_score
            .range_indices(|(s, _)| s.partial_cmp(&min).unwrap_or(Ordering::Equal), |(s, _)| {
                match s.partial_cmp(&max) {
                    Some(Ordering::Greater) => Ordering::Greater,
                    _ => Ordering::Less,
                }
            })
    }

    /// Destroys every member's owned allocation, then empties both indexes.
    ///
    /// # Safety
    /// No member `Object` may be referenced elsewhere.
    pub unsafe fn destroy_all(&mut self, alloc: &Allocator) {
        self.by_value.destroy_all(alloc);
        self.by_score.clear();
    }
}

fn cmp_score_member(score: f64, value: &Object, target_score: f64, target_value: &Object, alloc: &Allocator) -> Ordering {
    match score.partial_cmp(&target_score).unwrap_or(Ordering::Equal) {
        Ordering::Equal => value.compare_alphabetic(target_value, alloc).unwrap_or(Ordering::Equal),
        other => other,
    }
}
