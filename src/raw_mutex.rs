// The raw trait and the guard marker types follow the lock_api design used by
// parking_lot (MIT licensed, by Amanieu d'Antras).

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use atomic_wait::{wait, wake_one};

/// Marker type which indicates that the guard type for a lock is `Send`.
pub struct GuardSend(());

/// Marker type which indicates that the guard type for a lock is not `Send`.
pub struct GuardNoSend(*mut ());

unsafe impl Sync for GuardNoSend {}

/// Basic operations for a mutex.
///
/// This is the shape of the inner mutex that serializes a lock's slow paths:
/// just the lock state, no data. Anything implementing this trait can be used
/// as the inner mutex of a [`RawReentrantRwLock`], and can be waited on with
/// [`Condvar`].
///
/// [`RawReentrantRwLock`]: crate::RawReentrantRwLock
/// [`Condvar`]: crate::Condvar
///
/// # Safety
///
/// Implementations of this trait must ensure that the mutex is actually
/// exclusive: a lock can't be acquired while the mutex is already locked.
pub unsafe trait RawMutex {
    /// Initial value for an unlocked mutex.
    const INIT: Self;

    /// Marker type which determines whether a lock guard should be `Send`.
    /// Use one of the `GuardSend` or `GuardNoSend` helper types here.
    type GuardMarker;

    /// Acquires this mutex, blocking the current thread until it is able to
    /// do so.
    fn lock(&self);

    /// Attempts to acquire this mutex without blocking.
    /// Returns `true` if the lock was successfully acquired and `false`
    /// otherwise.
    fn try_lock(&self) -> bool;

    /// Unlocks this mutex.
    ///
    /// # Safety
    ///
    /// This method may only be called if the mutex is held in the current
    /// context, i.e. it must be paired with a successful call to [`lock`] or
    /// [`try_lock`].
    ///
    /// [`lock`]: RawMutex::lock
    /// [`try_lock`]: RawMutex::try_lock
    unsafe fn unlock(&self);

    /// Checks whether the mutex is currently locked.
    #[inline]
    fn is_locked(&self) -> bool {
        let acquired_lock = self.try_lock();
        if acquired_lock {
            // SAFETY: The lock has been successfully acquired above.
            unsafe {
                self.unlock();
            }
        }
        !acquired_lock
    }
}

/// Number of times a contended lock attempt spins before giving the
/// scheduler (or the futex) a chance.
pub(crate) const SPIN_LIMIT: u32 = 100;

/// A test-and-test-and-set spin mutex.
///
/// Waiting threads spin on a shared read of the lock word to avoid hammering
/// the cache line, and yield to the scheduler once they have spun for a
/// while. Suited to critical sections that are short on every path.
pub struct RawSpinMutex {
    locked: AtomicBool,
}

impl RawSpinMutex {
    /// Creates the mutex in an unlocked state.
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for RawSpinMutex {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawSpinMutex {
    const INIT: Self = Self::new();

    type GuardMarker = GuardSend;

    fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }

            // TTAS: spin on a read until the lock looks free.
            let mut spins = 0u32;
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPIN_LIMIT {
                    spins += 1;
                    core::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A futex-backed mutex.
///
/// Contended threads sleep in the kernel instead of spinning. The lock word
/// has three states: 0 is unlocked, 1 is locked with no waiters, 2 is locked
/// with (possibly) waiting threads, so the unlock path only issues a wake
/// syscall when someone may actually be asleep.
pub struct RawFutexMutex {
    /// 0: unlocked, 1: locked, 2: locked with waiters.
    state: AtomicU32,
}

impl RawFutexMutex {
    /// Creates the mutex in an unlocked state.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Contended path: spin briefly in case the holder is about to leave,
    /// then sleep on the futex.
    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0u32;

        // Only spin while there are no other waiters; once the state is 2
        // somebody else already gave up spinning.
        while self.state.load(Ordering::Relaxed) == 1 && spins < SPIN_LIMIT {
            spins += 1;
            core::hint::spin_loop();
        }

        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // Mark the lock contended and sleep until it is handed back to 0.
        // The swap leaves 2 behind so the eventual unlock knows to wake us.
        while self.state.swap(2, Ordering::Acquire) != 0 {
            wait(&self.state, 2);
        }
    }
}

impl Default for RawFutexMutex {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawFutexMutex {
    const INIT: Self = Self::new();

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Only wake when another thread recorded itself as waiting.
        if self.state.swap(0, Ordering::Release) == 2 {
            wake_one(&self.state);
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn exclusion_test<M: RawMutex + Sync>(mutex: M) {
        let counter = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        mutex.lock();
                        // Non-atomic increment through relaxed load/store:
                        // only safe if the mutex actually excludes.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        unsafe { mutex.unlock() };
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn spin_mutex_excludes() {
        exclusion_test(RawSpinMutex::new());
    }

    #[test]
    fn futex_mutex_excludes() {
        exclusion_test(RawFutexMutex::new());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let mutex = RawFutexMutex::new();
        mutex.lock();
        assert!(!mutex.try_lock());
        assert!(mutex.is_locked());
        unsafe { mutex.unlock() };
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
        assert!(!mutex.is_locked());
    }

    #[test]
    fn contended_state_resets() {
        // Drive the futex mutex through its contended path and make sure it
        // ends up fully unlocked.
        let mutex = RawFutexMutex::new();
        thread::scope(|s| {
            mutex.lock();
            let t = s.spawn(|| {
                mutex.lock();
                unsafe { mutex.unlock() };
            });
            thread::sleep(std::time::Duration::from_millis(50));
            unsafe { mutex.unlock() };
            t.join().unwrap();
        });
        assert!(!mutex.is_locked());
    }
}
