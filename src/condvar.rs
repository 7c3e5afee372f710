use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use atomic_wait::{wait, wake_all, wake_one};

use crate::raw_mutex::RawMutex;

/// A condition variable that can wait on any [`RawMutex`].
///
/// Condition variables block a thread so that it consumes no CPU time while
/// waiting for an event to occur. They are always associated with a boolean
/// predicate and a mutex; the predicate is verified under the mutex before
/// deciding to block.
///
/// The implementation is a notification counter that waiters sleep on via a
/// futex: a notification bumps the counter and wakes sleepers, and a waiter
/// that finds the counter already changed does not go to sleep at all. A
/// waiter count lets the notify calls skip the wake syscall entirely when
/// nobody is waiting.
///
/// Two caveats, both fine for predicate-loop use:
///
/// - Waits may wake spuriously. Always re-check the predicate; or use
///   [`wait_while`], which does.
/// - Notifications are only reliable if the notifier holds the mutex the
///   waiters are using. (A waiter registers itself before releasing the
///   mutex, so a notifier inside the critical section cannot miss it.)
///
/// [`wait_while`]: Condvar::wait_while
pub struct Condvar {
    /// Bumped on every notification. A waiter sleeps only while this still
    /// has the value it read under the mutex. The counter can in principle
    /// wrap around; a waiter would then miss exactly 2^32 in-flight
    /// notifications, which is not a realizable schedule.
    counter: AtomicU32,
    /// Number of threads between "about to sleep" and "woken".
    num_waiters: AtomicUsize,
}

impl Condvar {
    /// Creates a new condition variable ready to be waited on and notified.
    #[inline]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            num_waiters: AtomicUsize::new(0),
        }
    }

    /// Wakes up one thread blocked on this condition variable, if any.
    #[inline]
    pub fn notify_one(&self) {
        if self.num_waiters.load(Ordering::Relaxed) > 0 {
            self.counter.fetch_add(1, Ordering::Relaxed);
            wake_one(&self.counter);
        }
    }

    /// Wakes up all threads blocked on this condition variable.
    #[inline]
    pub fn notify_all(&self) {
        if self.num_waiters.load(Ordering::Relaxed) > 0 {
            self.counter.fetch_add(1, Ordering::Relaxed);
            wake_all(&self.counter);
        }
    }

    /// Blocks the current thread until this condition variable is notified.
    ///
    /// Atomically releases `mutex` and waits; the mutex is held again when
    /// this returns. May wake spuriously.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `mutex`, and `mutex` must be the one
    /// mutex associated with this condition variable for the duration of the
    /// wait.
    pub unsafe fn wait<M: RawMutex>(&self, mutex: &M) {
        // Register before unlocking: every notifier that enters the critical
        // section after us is then guaranteed to see the waiter count.
        self.num_waiters.fetch_add(1, Ordering::Relaxed);
        let counter = self.counter.load(Ordering::Relaxed);

        // SAFETY: the caller holds the mutex.
        unsafe { mutex.unlock() };

        // Sleeps only if no notification arrived since the load above.
        wait(&self.counter, counter);

        self.num_waiters.fetch_sub(1, Ordering::Relaxed);
        mutex.lock();
    }

    /// Blocks the current thread while `condition` returns `true`.
    ///
    /// The condition is evaluated under the mutex, including once before the
    /// first wait, so a predicate that is already false never blocks.
    ///
    /// # Safety
    ///
    /// Same contract as [`wait`](Condvar::wait).
    pub unsafe fn wait_while<M, F>(&self, mutex: &M, mut condition: F)
    where
        M: RawMutex,
        F: FnMut() -> bool,
    {
        while condition() {
            // SAFETY: forwarded from the caller.
            unsafe { self.wait(mutex) };
        }
    }
}

impl Default for Condvar {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_mutex::RawFutexMutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wakes_waiter() {
        let mutex = RawFutexMutex::new();
        let cond = Condvar::new();
        let value = AtomicU32::new(0);

        thread::scope(|s| {
            s.spawn(|| {
                // Give the main thread time to start waiting.
                thread::sleep(Duration::from_millis(100));
                mutex.lock();
                value.store(123, Ordering::Relaxed);
                cond.notify_one();
                unsafe { mutex.unlock() };
            });

            mutex.lock();
            unsafe { cond.wait_while(&mutex, || value.load(Ordering::Relaxed) < 100) };
            assert_eq!(value.load(Ordering::Relaxed), 123);
            unsafe { mutex.unlock() };
        });
    }

    #[test]
    fn already_true_predicate_does_not_block() {
        let mutex = RawFutexMutex::new();
        let cond = Condvar::new();

        mutex.lock();
        unsafe { cond.wait_while(&mutex, || false) };
        unsafe { mutex.unlock() };
    }

    #[test]
    fn notify_all_releases_every_waiter() {
        let mutex = RawFutexMutex::new();
        let cond = Condvar::new();
        let go = AtomicU32::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    mutex.lock();
                    unsafe { cond.wait_while(&mutex, || go.load(Ordering::Relaxed) == 0) };
                    unsafe { mutex.unlock() };
                });
            }

            thread::sleep(Duration::from_millis(100));
            mutex.lock();
            go.store(1, Ordering::Relaxed);
            cond.notify_all();
            unsafe { mutex.unlock() };
        });
    }
}
