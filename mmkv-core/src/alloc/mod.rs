// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The allocator component: two independent heaps (`key` and `value`
//! arenas) carved out of the mapping, addressed via [`ArenaPtr`] rather
//! than raw pointers so their free lists survive remapping.
//!
//! Each [`Arena`] is a segregated free-list allocator: a bounded set of
//! geometric size classes, each with its own free-list head, plus a
//! bump-pointer for bytes that have never been allocated. This is a
//! simplification of Doug Lea's `mspace` (no block splitting/coalescing
//! across size classes) sized to the budget of this crate -- see
//! DESIGN.md.

mod arena;
mod two_arena;

pub use arena::{Arena, ArenaControl, ArenaKind, ArenaPtr};
pub use two_arena::{Allocator, Handle};
