// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-relative pointers.
//!
//! Every cross-structure reference inside the mapping is stored as
//! `target_address - address_of_this_field`, not as an absolute pointer.
//! A second process attaching the same file at a different base address
//! still dereferences correctly, because the arithmetic only ever depends
//! on `self`'s own address, never on a process-wide base.
//!
//! Containers are encouraged to prefer a single stored base plus indices
//! where that's sufficient (see `collections`); `Offset<T>` is reserved for
//! genuine cross-structure references: named-object roots, TTL map values,
//! an `Object`'s `OFFSET_PTR` payload.

use core::marker::PhantomData;
use core::ptr::NonNull;

/// A self-relative pointer to a `T`, stored as a signed byte delta from its
/// own address. `delta == 0` is reserved to mean "null" -- a pointer can
/// never legally point at its own storage.
#[repr(transparent)]
pub struct Offset<T> {
    delta: i64,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for Offset<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Offset<T> {}

impl<T> core::fmt::Debug for Offset<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Offset").field("delta", &self.delta).finish()
    }
}

impl<T> Default for Offset<T> {
    fn default() -> Self {
        Self::NULL
    }
}

// SAFETY: an offset delta is plain data; no thread-local or process-local
// state is embedded in it. The pointee it refers to is shared memory.
unsafe impl<T> Send for Offset<T> {}
unsafe impl<T> Sync for Offset<T> {}

impl<T> Offset<T> {
    pub const NULL: Self = Offset {
        delta: 0,
        _marker: PhantomData,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        self.delta == 0
    }

    /// Builds an `Offset<T>` that will live at `self_addr` and point at
    /// `target_addr`.
    ///
    /// # Panics
    /// Panics (debug-only) if the two addresses are identical, since that
    /// would be indistinguishable from null.
    #[inline]
    pub fn from_addresses(self_addr: usize, target_addr: usize) -> Self {
        debug_assert_ne!(self_addr, target_addr, "offset pointer cannot reference its own storage");
        let delta = (target_addr as i128) - (self_addr as i128);
        Self {
            delta: delta as i64,
            _marker: PhantomData,
        }
    }

    /// Builds an `Offset<T>` at the address `&self_field` pointing at
    /// `target`.
    #[inline]
    pub fn to(self_field_addr: usize, target: NonNull<T>) -> Self {
        Self::from_addresses(self_field_addr, target.as_ptr() as usize)
    }

    /// Dereferences the pointer, given the address of its own storage.
    ///
    /// # Safety
    /// The caller must pass the true current address of this `Offset<T>`
    /// value (i.e. `&self as *const _ as usize`), and the target must still
    /// be a live, validly-typed `T` in the same mapping.
    #[inline]
    pub unsafe fn deref_at(&self, self_addr: usize) -> Option<NonNull<T>> {
        if self.is_null() {
            return None;
        }
        let target = (self_addr as i128 + self.delta as i128) as usize;
        NonNull::new(target as *mut T)
    }

    /// Convenience form of [`Offset::deref_at`] using `self`'s own current
    /// address. Correct as long as the `Offset` value has not been copied
    /// to a different address since it was dereferenced last -- callers
    /// that move an `Offset` (e.g. by copying a struct containing one) must
    /// re-derive it at its new address before calling this again.
    ///
    /// # Safety
    /// Same requirements as [`Offset::deref_at`].
    #[inline]
    pub unsafe fn deref(&self) -> Option<NonNull<T>> {
        self.deref_at(self as *const Self as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Pair {
        value: u64,
        link: Offset<u64>,
    }

    #[test]
    fn null_is_default_and_zero_delta() {
        let o: Offset<u64> = Offset::default();
        assert!(o.is_null());
    }

    #[test]
    fn self_relative_roundtrip_across_simulated_rebase() {
        let mut a = Pair { value: 42, link: Offset::NULL };
        let b = Box::new(99u64);
        let b_addr = NonNull::from(b.as_ref());

        let link_addr = &a.link as *const _ as usize;
        a.link = Offset::to(link_addr, b_addr);

        let resolved = unsafe { a.link.deref() }.unwrap();
        assert_eq!(unsafe { *resolved.as_ref() }, 99);
    }

    #[test]
    fn surviving_a_full_mapping_rebase() {
        // Simulate remap: both the pointer and its target live inside one
        // contiguous buffer ("the mapping"). Moving the whole buffer to a
        // new base address (as happens when a second process attaches it
        // elsewhere, or this process grows and remaps it) must not break
        // the pointer, because both addresses shift by the same amount.
        const PAIR_OFFSET: usize = 0;
        const TARGET_OFFSET: usize = 64;

        let mut buf1 = vec![0u8; 128];
        let base1 = buf1.as_mut_ptr() as usize;
        unsafe {
            *(base1 as *mut u64 + TARGET_OFFSET as usize / 8) = 7;
            let pair_ptr = (base1 + PAIR_OFFSET) as *mut Pair;
            (*pair_ptr).value = 1;
            let link_addr = &(*pair_ptr).link as *const _ as usize;
            let target_ptr = NonNull::new((base1 + TARGET_OFFSET) as *mut u64).unwrap();
            (*pair_ptr).link = Offset::to(link_addr, target_ptr);
        }

        // "Remap" by copying the identical bytes to a different address.
        let mut buf2 = vec![0u8; 128];
        buf2.copy_from_slice(&buf1);
        let base2 = buf2.as_mut_ptr() as usize;

        unsafe {
            let pair_ptr = (base2 + PAIR_OFFSET) as *const Pair;
            let resolved = (*pair_ptr).link.deref().unwrap();
            assert_eq!(*resolved.as_ref(), 7);
        }
    }
}
