//! Process-shared POSIX semaphores embedded in the shared region.
//!
//! Two kinds of signal ride on these: the global loader wakeup posted by
//! workers on every `request`, and one completion semaphore per worker
//! posted by the loader on every publication. The semaphore lives inside
//! the mapped region (`sem_init` with `pshared = 1`), so every process that
//! maps the region shares the same kernel futex.

use std::cell::UnsafeCell;
use std::io;
use std::time::Duration;

use static_assertions::{const_assert, const_assert_eq};

use crate::constants::CACHE_LINE_SIZE;

/// A `sem_t` padded to its own cache line inside the shared region.
#[repr(C, align(64))]
pub struct SharedSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

const_assert!(std::mem::size_of::<libc::sem_t>() <= CACHE_LINE_SIZE);
const_assert_eq!(std::mem::size_of::<SharedSemaphore>(), CACHE_LINE_SIZE);

// sem_* functions synchronize internally; the cell is shared across
// processes by construction.
unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Initialize the semaphore in place with an initial count of zero.
    ///
    /// # Safety
    /// `sem` must point into a mapped region and must not be initialized
    /// twice without an intervening [`SharedSemaphore::destroy`].
    pub unsafe fn init(sem: *mut SharedSemaphore) -> io::Result<()> {
        if libc::sem_init((*sem).inner.get(), 1, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Destroy the semaphore. Only the region owner calls this, at unlink.
    ///
    /// # Safety
    /// No process may be blocked on the semaphore.
    pub unsafe fn destroy(sem: *mut SharedSemaphore) {
        libc::sem_destroy((*sem).inner.get());
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) {
        let rc = unsafe { libc::sem_post(self.inner.get()) };
        debug_assert_eq!(rc, 0, "sem_post failed: {}", io::Error::last_os_error());
    }

    /// Block until the count is positive, then decrement. Retries on EINTR.
    pub fn wait(&self) {
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("sem_wait failed: {}", err);
            }
        }
    }

    /// Decrement without blocking. Returns false if the count was zero.
    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.inner.get()) == 0 }
    }

    /// Block up to `timeout`, then give up. Returns true if decremented.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return self.try_wait();
        }
        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + nanos / 1_000_000_000,
            tv_nsec: nanos % 1_000_000_000,
        };
        loop {
            if unsafe { libc::sem_timedwait(self.inner.get(), &deadline) } == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return false,
                _ => panic!("sem_timedwait failed: {}", err),
            }
        }
    }
}
