// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::alloc::{Arena, ArenaPtr};
use crate::error::{Error, Result};
use crate::object::Object;
use core::mem::size_of;

/// A double-ended, arena-backed ring buffer of `Object`s: the storage for
/// the `LIST` type. Grows by doubling; never shrinks its backing buffer on
/// pop (matches the arena allocator's own no-shrink policy).
///
/// Built directly on [`Arena::allocate_bytes`]/[`Arena::reallocate`] rather
/// than `allocator_api2::vec::Vec` because a plain `Vec` only supports
/// O(1) push/pop at one end; a ring buffer gets both ends in O(1), which a
/// `LPUSH`/`RPUSH`/`LPOP`/`RPOP`-shaped workload needs.
pub struct RelocList {
    arena: Arena,
    buf: ArenaPtr<Object>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RelocList {
    pub fn new_in(arena: Arena) -> Self {
        RelocList {
            arena,
            buf: ArenaPtr::NULL,
            capacity: 0,
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn slot(&self, logical_index: usize) -> *mut Object {
        debug_assert!(logical_index < self.len);
        let physical = (self.head + logical_index) % self.capacity;
        // SAFETY: `buf` is a live allocation of at least `capacity` objects
        // whenever `capacity > 0`, which holds for any in-bounds index.
        let base = unsafe { self.arena.resolve::<Object>(self.buf) }.unwrap();
        unsafe { base.as_ptr().add(physical) }
    }

    pub fn get(&self, index: usize) -> Option<Object> {
        if index >= self.len {
            return None;
        }
        Some(unsafe { *self.slot(index) })
    }

    pub fn iter(&self) -> impl Iterator<Item = Object> + '_ {
        (0..self.len).map(move |i| self.get(i).unwrap())
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = (self.capacity * 2).max(4);
        let new_bytes = new_capacity * size_of::<Object>();
        let new_handle = self.arena.allocate_bytes(new_bytes).map_err(|_| Error::OutOfSpace)?;
        let new_base = unsafe { self.arena.resolve::<Object>(new_handle) }.unwrap();

        // Copy logical elements out in order, un-wrapping the ring, so the
        // new buffer starts fresh at head = 0.
        for i in 0..self.len {
            let src = self.slot(i);
            unsafe { core::ptr::copy_nonoverlapping(src, new_base.as_ptr().add(i), 1) };
        }
        if !self.buf.is_null() {
            unsafe { self.arena.deallocate(self.buf.cast::<u8>()) };
        }
        self.buf = new_handle;
        self.capacity = new_capacity;
        self.head = 0;
        Ok(())
    }

    pub fn push_back(&mut self, value: Object) -> Result<()> {
        if self.len == self.capacity {
            self.grow()?;
        }
        let physical = (self.head + self.len) % self.capacity;
        let base = unsafe { self.arena.resolve::<Object>(self.buf) }.unwrap();
        unsafe { core::ptr::write(base.as_ptr().add(physical), value) };
        self.len += 1;
        Ok(())
    }

    pub fn push_front(&mut self, value: Object) -> Result<()> {
        if self.len == self.capacity {
            self.grow()?;
        }
        self.head = (self.head + self.capacity - 1) % self.capacity;
        let base = unsafe { self.arena.resolve::<Object>(self.buf) }.unwrap();
        unsafe { core::ptr::write(base.as_ptr().add(self.head), value) };
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Object> {
        if self.len == 0 {
            return None;
        }
        let value = unsafe { *self.slot(0) };
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(value)
    }

    pub fn pop_back(&mut self) -> Option<Object> {
        if self.len == 0 {
            return None;
        }
        let value = unsafe { *self.slot(self.len - 1) };
        self.len -= 1;
        Some(value)
    }

    /// Destroys every element's owned allocation, then empties the list.
    ///
    /// # Safety
    /// No element may be referenced elsewhere.
    pub unsafe fn destroy_all(&mut self, alloc: &crate::alloc::Allocator) {
        for i in 0..self.len {
            (*self.slot(i)).destroy(alloc);
        }
        self.len = 0;
    }
}
