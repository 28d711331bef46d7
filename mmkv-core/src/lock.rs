// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-shared, writer-preferring reader-writer lock described in
//! spec.md section 4.2.
//!
//! The lock word lives in the separate `locks` file (in
//! [`crate::mapping::LockRegion`]), never in the `data` file's
//! [`crate::mapping::Meta`]/[`crate::mapping::Header`] region, so a
//! `data`-file restore or truncation never disturbs a lock another process
//! might be holding. Every attached process maps the same `locks` file and
//! synchronizes against the same state. It is woken with the raw `futex(2)`
//! syscall rather than a `std` or crate
//! primitive, because no safe abstraction in the ecosystem supports a futex
//! word living in memory shared across unrelated processes (`std::sync`
//! primitives assume a single address space; `parking_lot` the same). This
//! mirrors the approach of the system this crate distills, simplified to a
//! single packed state word instead of a two-word bit-hack.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// One waiting writer's worth of weight added to [`RawRwLock::state`] while
/// it waits, so readers can see a writer is queued and stop acquiring new
/// read locks (writer preference).
const WRITER_WAITING: u32 = 1 << 30;
/// Set while a writer holds the lock. Mutually exclusive with any reader
/// count and with `WRITER_WAITING`'s sibling bits.
const WRITE_LOCKED: u32 = 1 << 31;
const READER_MASK: u32 = WRITER_WAITING - 1;

/// A futex-backed reader-writer lock whose state word is shared-memory
/// resident. Contains no process-local state, so any number of processes
/// can hold a `&RawRwLock` over the same address and cooperate correctly.
#[repr(C)]
pub struct RawRwLock {
    state: AtomicU32,
}

impl RawRwLock {
    /// Initializes a zeroed (unlocked, no waiters) lock in place.
    pub fn init(&mut self) {
        self.state = AtomicU32::new(0);
    }

    pub fn try_read(&self) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur & (WRITE_LOCKED | WRITER_WAITING) != 0 {
                return false;
            }
            if cur & READER_MASK == READER_MASK {
                return false; // reader count saturated, vanishingly unlikely
            }
            if self
                .state
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn lock_read(&self) {
        loop {
            if self.try_read() {
                return;
            }
            let cur = self.state.load(Ordering::Acquire);
            if cur & (WRITE_LOCKED | WRITER_WAITING) != 0 {
                futex_wait(&self.state, cur, None);
            }
        }
    }

    pub fn unlock_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READER_MASK > 0, "unbalanced read unlock");
        if prev & READER_MASK == 1 {
            // Last reader gone; a waiting writer (or another racing
            // acquirer) may be parked on the old value.
            futex_wake(&self.state, i32::MAX);
        }
    }

    pub fn try_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITE_LOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock_write(&self) {
        if self.try_write() {
            return;
        }
        self.state.fetch_add(WRITER_WAITING, Ordering::AcqRel);
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur & WRITE_LOCKED == 0 {
                let locked = (cur - WRITER_WAITING) | WRITE_LOCKED;
                if self
                    .state
                    .compare_exchange(cur, locked, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            futex_wait(&self.state, cur, None);
        }
    }

    /// Blocking write-lock with a maximum wait, for the owning process to
    /// detect and recover from a writer that crashed mid-critical-section
    /// (spec.md section 9's crash-recovery open question; see
    /// [`crate::mapping::Mapping::reset_if_dead_writer`]).
    pub fn lock_write_timeout(&self, timeout: Duration) -> bool {
        if self.try_write() {
            return true;
        }
        self.state.fetch_add(WRITER_WAITING, Ordering::AcqRel);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur & WRITE_LOCKED == 0 {
                let locked = (cur - WRITER_WAITING) | WRITE_LOCKED;
                if self
                    .state
                    .compare_exchange(cur, locked, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                self.state.fetch_sub(WRITER_WAITING, Ordering::AcqRel);
                return false;
            }
            futex_wait(&self.state, cur, Some(remaining));
        }
    }

    pub fn unlock_write(&self) {
        let prev = self.state.fetch_and(!WRITE_LOCKED, Ordering::AcqRel);
        debug_assert!(prev & WRITE_LOCKED != 0, "unlock_write without a held write lock");
        futex_wake(&self.state, i32::MAX);
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITE_LOCKED != 0
    }

    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & READER_MASK
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, n: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            n,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        );
    }
}

/// Non-Linux unix targets have no portable cross-process futex; fall back
/// to a short spin-sleep. Correct, just not as efficient under contention.
#[cfg(all(unix, not(target_os = "linux")))]
fn futex_wait(_word: &AtomicU32, _expected: u32, timeout: Option<Duration>) {
    std::thread::sleep(timeout.unwrap_or(Duration::from_micros(50)).min(Duration::from_millis(5)));
}

#[cfg(all(unix, not(target_os = "linux")))]
fn futex_wake(_word: &AtomicU32, _n: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_lock() -> RawRwLock {
        let mut lock = RawRwLock { state: AtomicU32::new(0) };
        lock.init();
        lock
    }

    #[test]
    fn multiple_readers_can_hold_the_lock_concurrently() {
        let lock = new_lock();
        assert!(lock.try_read());
        assert!(lock.try_read());
        assert_eq!(lock.reader_count(), 2);
        lock.unlock_read();
        lock.unlock_read();
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn writer_excludes_readers_and_other_writers() {
        let lock = new_lock();
        assert!(lock.try_write());
        assert!(!lock.try_read());
        assert!(!lock.try_write());
        lock.unlock_write();
        assert!(lock.try_read());
    }

    #[test]
    fn contended_write_lock_is_eventually_acquired() {
        let lock = Arc::new(new_lock());
        assert!(lock.try_write());

        let lock2 = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            lock2.lock_write();
            lock2.unlock_write();
        });

        std::thread::sleep(Duration::from_millis(10));
        lock.unlock_write();
        handle.join().unwrap();
    }

    #[test]
    fn write_lock_timeout_reports_failure_when_held() {
        let lock = new_lock();
        assert!(lock.try_write());
        let acquired = lock.lock_write_timeout(Duration::from_millis(20));
        assert!(!acquired);
        lock.unlock_write();
        assert!(lock.lock_write_timeout(Duration::from_millis(20)));
    }
}
