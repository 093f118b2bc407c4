//! Process-shared semaphores backed by futex words.
//!
//! The handshake protocol needs counting semaphores that live inside the
//! memory-mapped control file and work across process boundaries. Each
//! semaphore is a single `u32`: the count is decremented by waiters with a
//! CAS loop and incremented by `post`, which then wakes one sleeper via
//! `FUTEX_WAKE`. The futex operations deliberately omit
//! `FUTEX_PRIVATE_FLAG` so that waiters in other processes mapping the
//! same page are woken.
//!
//! Waits never run while the control-file lock is held; see the handshake
//! module for the ordering rules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A counting semaphore stored in shared memory.
///
/// `repr(C)` with a single `u32` word so it can be embedded in the
/// control-file layout at a stable offset.
#[repr(C)]
pub(crate) struct ShmSem {
    value: AtomicU32,
}

impl ShmSem {
    /// A fresh semaphore with a count of zero (for tests and local use).
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Reset the count to zero in place (used when the control file is
    /// initialized or fully reset).
    pub(crate) fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }

    /// Current count, for dumps and tests.
    pub(crate) fn count(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Increment the count and wake one waiter, in any process.
    pub(crate) fn post(&self) {
        self.value.fetch_add(1, Ordering::Release);
        self.futex_wake();
    }

    /// Take one count without blocking. Returns `false` if the count was
    /// zero.
    pub(crate) fn try_wait(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        while current > 0 {
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    /// Block until a count can be taken.
    pub(crate) fn wait(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            // Sleeps only while the word is still zero; EAGAIN and EINTR
            // both fall through to another try_wait pass.
            self.futex_wait(None);
        }
    }

    /// Block until a count can be taken or the timeout elapses. Returns
    /// `true` if a count was taken.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.futex_wait(Some(deadline - now));
        }
    }

    /// `FUTEX_WAIT` on the word while it reads zero. A `None` timeout
    /// sleeps indefinitely; failures (EAGAIN on a changed word, EINTR,
    /// ETIMEDOUT) are handled by the callers' retry loops.
    fn futex_wait(&self, timeout: Option<Duration>) {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        // SAFETY: the futex word is a valid, aligned u32 for the lifetime
        // of the mapping; FUTEX_WAIT only reads it and sleeps.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.value.as_ptr(),
                libc::FUTEX_WAIT,
                0u32,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    /// `FUTEX_WAKE` one waiter on the word.
    fn futex_wake(&self) {
        // SAFETY: the futex word is a valid, aligned u32 for the lifetime
        // of the mapping; FUTEX_WAKE does not dereference the other args.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.value.as_ptr(),
                libc::FUTEX_WAKE,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}
