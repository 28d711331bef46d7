// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::arena::{Arena, ArenaKind, ArenaPtr};
use crate::error::{Error, Result};

/// A pointer paired with the arena it was carved from. Needed because
/// [`ArenaPtr`] alone only makes sense relative to a specific [`Arena`]'s
/// base address, and the two-arena fallback means a request for one arena
/// can be satisfied by the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle<T> {
    pub ptr: ArenaPtr<T>,
    pub arena: ArenaKind,
}

impl<T> Handle<T> {
    pub fn null(arena: ArenaKind) -> Self {
        Handle { ptr: ArenaPtr::NULL, arena }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

/// The two-heap allocator described in spec section 4.3: `allocate` tries
/// the requested arena first, falling back to the other arena on failure;
/// `deallocate`/`reallocate`/`usable_size` dispatch on which arena a handle
/// says it came from.
#[derive(Clone, Copy)]
pub struct Allocator {
    key: Arena,
    value: Arena,
}

impl Allocator {
    pub fn new(key: Arena, value: Arena) -> Self {
        Allocator { key, value }
    }

    #[inline]
    pub fn key_arena(&self) -> Arena {
        self.key
    }

    #[inline]
    pub fn value_arena(&self) -> Arena {
        self.value
    }

    fn arena_for(&self, kind: ArenaKind) -> Arena {
        match kind {
            ArenaKind::Key => self.key,
            ArenaKind::Value => self.value,
        }
    }

    fn other(kind: ArenaKind) -> ArenaKind {
        match kind {
            ArenaKind::Key => ArenaKind::Value,
            ArenaKind::Value => ArenaKind::Key,
        }
    }

    /// Allocates `n` bytes, preferring `preferred`'s arena, falling back to
    /// the other arena if the preferred one is exhausted.
    pub fn allocate(&self, n: usize, preferred: ArenaKind) -> Result<Handle<u8>> {
        let primary = self.arena_for(preferred);
        if let Ok(ptr) = primary.allocate_bytes(n) {
            return Ok(Handle { ptr, arena: preferred });
        }
        let fallback_kind = Self::other(preferred);
        let fallback = self.arena_for(fallback_kind);
        fallback
            .allocate_bytes(n)
            .map(|ptr| Handle { ptr, arena: fallback_kind })
            .map_err(|_| Error::OutOfSpace)
    }

    /// # Safety
    /// `handle` must be a live allocation produced by this allocator and
    /// not already freed.
    pub unsafe fn deallocate(&self, handle: Handle<u8>) {
        if handle.is_null() {
            return;
        }
        self.arena_for(handle.arena).deallocate(handle.ptr);
    }

    /// Reallocates within the same arena the block currently lives in --
    /// never migrates arenas, per spec.
    ///
    /// # Safety
    /// `handle` must be a live allocation produced by this allocator with
    /// `old_len` live payload bytes.
    pub unsafe fn reallocate(&self, handle: Handle<u8>, old_len: usize, new_len: usize) -> Result<Handle<u8>> {
        let arena = self.arena_for(handle.arena);
        let ptr = arena
            .reallocate(handle.ptr, old_len, new_len)
            .map_err(|_| Error::OutOfSpace)?;
        Ok(Handle { ptr, arena: handle.arena })
    }

    /// # Safety
    /// `handle` must be a live allocation produced by this allocator.
    pub unsafe fn usable_size(&self, handle: Handle<u8>) -> usize {
        if handle.is_null() {
            return 0;
        }
        self.arena_for(handle.arena).usable_size(handle.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ArenaControl;
    use core::ptr::NonNull;

    fn make_allocator(key_cap: u64, value_cap: u64) -> (Vec<u8>, Vec<u8>, Allocator) {
        let mut key_buf = vec![0u8; key_cap as usize];
        let mut value_buf = vec![0u8; value_cap as usize];
        let key_ctrl = unsafe { ArenaControl::init(NonNull::new(key_buf.as_mut_ptr()).unwrap(), key_cap) };
        let value_ctrl = unsafe { ArenaControl::init(NonNull::new(value_buf.as_mut_ptr()).unwrap(), value_cap) };
        let key = unsafe { Arena::from_control(key_ctrl, ArenaKind::Key) };
        let value = unsafe { Arena::from_control(value_ctrl, ArenaKind::Value) };
        (key_buf, value_buf, Allocator::new(key, value))
    }

    #[test]
    fn allocates_from_preferred_arena() {
        let (_kb, _vb, alloc) = make_allocator(1 << 16, 1 << 16);
        let handle = alloc.allocate(64, ArenaKind::Value).unwrap();
        assert_eq!(handle.arena, ArenaKind::Value);
    }

    #[test]
    fn falls_back_to_other_arena_when_preferred_is_full() {
        let (_kb, _vb, alloc) = make_allocator(256, 1 << 16);
        // Exhaust the tiny key arena.
        while alloc.allocate(64, ArenaKind::Key).is_ok() {}
        let handle = alloc.allocate(64, ArenaKind::Key).unwrap();
        assert_eq!(handle.arena, ArenaKind::Value, "should fall back once key arena is full");
    }

    #[test]
    fn out_of_space_when_both_arenas_are_full() {
        let (_kb, _vb, alloc) = make_allocator(256, 256);
        let mut last = Ok(Handle::null(ArenaKind::Key));
        for _ in 0..100 {
            last = alloc.allocate(64, ArenaKind::Key);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(Error::OutOfSpace)));
    }

    #[test]
    fn deallocate_then_reallocate_roundtrip() {
        let (_kb, _vb, alloc) = make_allocator(1 << 16, 1 << 16);
        let handle = alloc.allocate(16, ArenaKind::Value).unwrap();
        let grown = unsafe { alloc.reallocate(handle, 16, 2000) }.unwrap();
        assert_eq!(grown.arena, ArenaKind::Value);
        unsafe { alloc.deallocate(grown) };
    }
}
