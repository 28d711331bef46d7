// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS virtual-memory primitives used to size and align the mapping and its
//! two arenas. Kept as its own crate, mirroring how the teacher workspace
//! isolates low-level platform concerns (page size, mmap-adjacent helpers)
//! from the data structures built on top of them.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub use allocator_api2::alloc::{AllocError, Layout};

/// Rounds `num` up to the next multiple of `pow2`, which must be a power of
/// two. Never returns zero.
#[inline]
pub fn pad_to_pow2(num: usize, pow2: usize) -> Option<usize> {
    debug_assert!(pow2.is_power_of_two());
    let bytes = num.max(pow2);
    let remainder = bytes & (pow2 - 1);
    match remainder {
        0 => Some(bytes),
        _ => bytes.checked_add(pow2 - remainder),
    }
}

#[cfg(unix)]
pub mod os {
    use super::AllocError;

    /// Queries the OS page size via `sysconf(_SC_PAGESIZE)`.
    pub fn page_size() -> Result<usize, AllocError> {
        // SAFETY: sysconf with a well-known, argument-free query.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result <= 0 {
            return Err(AllocError);
        }
        let size = result as usize;
        if !size.is_power_of_two() {
            return Err(AllocError);
        }
        Ok(size)
    }
}

#[cfg(not(unix))]
pub mod os {
    use super::AllocError;

    pub fn page_size() -> Result<usize, AllocError> {
        Ok(4096)
    }
}

/// Rounds `size` up to a whole number of OS pages.
pub fn round_up_to_page(size: usize) -> Result<usize, AllocError> {
    let page = os::page_size()?;
    pad_to_pow2(size, page).ok_or(AllocError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = os::page_size().unwrap();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn pad_exact_multiple() {
        assert_eq!(pad_to_pow2(4096, 4096), Some(4096));
        assert_eq!(pad_to_pow2(8192, 4096), Some(8192));
    }

    #[test]
    fn pad_rounds_up() {
        assert_eq!(pad_to_pow2(1, 4096), Some(4096));
        assert_eq!(pad_to_pow2(4097, 4096), Some(8192));
    }

    #[test]
    fn round_up_to_page_matches_os_page_size() {
        let page = os::page_size().unwrap();
        assert_eq!(round_up_to_page(1).unwrap(), page);
        assert_eq!(round_up_to_page(page + 1).unwrap(), page * 2);
    }
}
