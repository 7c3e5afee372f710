use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::condvar::Condvar;
use crate::raw_mutex::{RawMutex, SPIN_LIMIT};
use crate::recurse::{Hint, RecurseCounts};

/// A raw reentrant read-write lock with writer preference.
///
/// This is the synchronization protocol itself: no data, no guards, hints in
/// and out. Most users want [`ReentrantRwLock`](crate::ReentrantRwLock)
/// instead.
///
/// `M` is the inner mutex serializing the slow paths (see [`RawMutex`]);
/// `C` is the recursion-accounting policy (see [`RecurseCounts`]).
///
/// The lock is reentrant in every direction: a thread may take the read lock
/// repeatedly, take the write lock repeatedly, take read locks while holding
/// the write lock, and take the write lock while holding read locks. Each
/// acquisition must be matched by a release from the same thread.
///
/// Readers that arrive while no writer is present never block and, with
/// [`ThreadLocalRecurseCounts`](crate::ThreadLocalRecurseCounts) accounting,
/// never touch the inner mutex. Once a writer has claimed the lock, new
/// readers wait, so the writer only has to drain the readers that were
/// already granted.
pub struct RawReentrantRwLock<M, C> {
    /// Granted read acquisitions, across all threads, summed over recursion.
    readers            : AtomicUsize,
    /// Readers past the fast-path check but not yet counted in `readers`.
    reader_reservation : AtomicUsize,
    /// Writers queuing for the lock.
    writer_reservation : AtomicUsize,
    /// Whether some thread currently holds the write lock.
    writer             : AtomicBool,
    mutex              : M,
    cond               : Condvar,
    recurse            : C,
}

impl<M: RawMutex, C: RecurseCounts + Default> RawReentrantRwLock<M, C> {
    /// Creates the lock in an unlocked state.
    pub fn new() -> Self {
        Self {
            readers: AtomicUsize::new(0),
            reader_reservation: AtomicUsize::new(0),
            writer_reservation: AtomicUsize::new(0),
            writer: AtomicBool::new(false),
            mutex: M::INIT,
            cond: Condvar::new(),
            recurse: C::default(),
        }
    }
}

impl<M: RawMutex, C: RecurseCounts + Default> Default for RawReentrantRwLock<M, C> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, C: RecurseCounts> RawReentrantRwLock<M, C> {
    /// Acquires the lock in read mode, possibly recursively.
    ///
    /// Returns a [`Hint`] identifying this thread's read-recursion counter;
    /// hand it back to [`read_unlock`](Self::read_unlock) to skip the
    /// counter lookup on release.
    pub fn read_lock(&self) -> Hint {
        self.reader_reservation.fetch_add(1, Ordering::SeqCst);

        let local = self.recurse.local();

        if !self.writer.load(Ordering::SeqCst) {
            // There is no writer, go freely to the critical section.
            self.readers.fetch_add(1, Ordering::SeqCst);
            self.reader_reservation.fetch_sub(1, Ordering::SeqCst);

            // SAFETY: `local` is this thread's handle and the inner mutex is
            // not held here.
            unsafe { self.recurse.increment_read_count(local, &self.mutex) }
        } else if !unsafe { self.recurse.is_not_current_writer(local) } {
            // This thread is the writer: it may still take read locks.
            self.reader_reservation.fetch_sub(1, Ordering::SeqCst);

            // This can run concurrently with another thread heading into the
            // slow path, which also resolves its local read count and can
            // thereby mutate the shared mapping.
            let hint = unsafe { self.recurse.increment_read_count(local, &self.mutex) };
            self.readers.fetch_add(1, Ordering::SeqCst);
            hint
        } else {
            self.read_lock_contended(local)
        }
    }

    /// Slow path: a foreign writer holds or has claimed the lock.
    #[cold]
    fn read_lock_contended(&self, local: C::Local) -> Hint {
        self.reader_reservation.fetch_sub(1, Ordering::SeqCst);

        self.mutex.lock();

        // Wait for writers, if any.
        // SAFETY: `local` is this thread's handle; the inner mutex is held.
        if self.writer.load(Ordering::SeqCst)
            && unsafe { self.recurse.is_not_current_writer(local) }
        {
            let reader_count =
                unsafe { self.recurse.local_readers(local).as_ref() }.load(Ordering::Relaxed);
            if reader_count == 0 {
                // SAFETY: the inner mutex is held.
                unsafe {
                    self.cond
                        .wait_while(&self.mutex, || self.writer.load(Ordering::SeqCst))
                };
            }
            // There is a writer *but* this thread has outstanding read
            // locks: that writer can only be waiting on this very thread to
            // release them (were it on this thread, it would not still hold
            // reads). Waiting here would deadlock both; keep going instead,
            // this thread will eventually release its reads or upgrade.
        }

        // SAFETY: the inner mutex is held.
        let hint = unsafe { self.recurse.increment_read_count_locked(local) };

        // The lock now belongs to the readers.
        self.readers.fetch_add(1, Ordering::SeqCst);

        // SAFETY: locked above.
        unsafe { self.mutex.unlock() };

        hint
    }

    /// Releases one level of read lock.
    ///
    /// Passing `None` for the hint takes a slow path that looks the
    /// counter up through this thread's identity.
    ///
    /// # Safety
    ///
    /// Must be paired with a prior [`read_lock`](Self::read_lock) on the
    /// calling thread, and `hint`, if given, must be the value that call
    /// returned.
    pub unsafe fn read_unlock(&self, hint: Option<Hint>) {
        let slot = match hint {
            Some(hint) => hint.slot(),
            None => {
                // Rare: the caller lost its hint.
                let local = self.recurse.local();
                self.mutex.lock();
                // SAFETY: the inner mutex was just acquired.
                let slot = unsafe { self.recurse.local_readers(local) };
                // SAFETY: locked above.
                unsafe { self.mutex.unlock() };
                slot
            }
        };

        if self.readers.fetch_sub(1, Ordering::SeqCst) == 1
            && self.writer_reservation.load(Ordering::SeqCst) > 0
        {
            // `readers` just hit zero with a writer queued; the mutex is
            // still needed here to avoid interleaving with that writer.
            self.mutex.lock();

            // SAFETY: the slot stays valid for the owning thread's lifetime.
            unsafe { slot.as_ref() }.fetch_sub(1, Ordering::Relaxed);

            // Make sure a waiting writer wakes up. Spurious wakeups are
            // fine, the writer re-checks `readers` under the mutex.
            self.cond.notify_all();

            // SAFETY: locked above.
            unsafe { self.mutex.unlock() };
        } else {
            // SAFETY: as above.
            unsafe { slot.as_ref() }.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Acquires the lock in write mode, possibly recursively, upgrading any
    /// read locks this thread already holds.
    ///
    /// Returns an advisory [`Hint`] to this thread's read-recursion counter.
    pub fn write_lock(&self) -> Hint {
        self.writer_reservation.fetch_add(1, Ordering::SeqCst);

        self.mutex.lock();

        let local = self.recurse.local();

        // Drop this thread's own reader contribution for the duration: a
        // writer queued ahead of us must be able to observe zero remaining
        // readers, and our own reads must not keep *us* waiting below.
        // SAFETY: `local` is this thread's handle; the inner mutex is held.
        let slot = unsafe { self.recurse.local_readers(local) };
        let reader_count = unsafe { slot.as_ref() }.load(Ordering::Relaxed);
        self.readers.fetch_sub(reader_count, Ordering::SeqCst);

        // Wait for other writers, if any.
        if self.writer.load(Ordering::SeqCst)
            && unsafe { self.recurse.is_not_current_writer(local) }
        {
            if reader_count > 0 && self.readers.load(Ordering::SeqCst) == 0 {
                // Subtracting our reads drove `readers` to zero; the writer
                // in front of us may be asleep waiting for exactly that.
                self.cond.notify_all();
            }
            // SAFETY: the inner mutex is held.
            unsafe {
                self.cond
                    .wait_while(&self.mutex, || self.writer.load(Ordering::SeqCst))
            };
        }

        // Claim the lock for this writer.
        self.writer.store(true, Ordering::SeqCst);
        // SAFETY: the inner mutex is held.
        unsafe { self.recurse.set_is_writer(local) };

        // Drain the reader reservations: readers past the fast-path check
        // but not yet counted in `readers`. Reservations are short-lived, a
        // yielding spin is enough.
        let mut spins = 0u32;
        while self.reader_reservation.load(Ordering::SeqCst) != 0 {
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        // Wait for the remaining readers (this thread's own reads were
        // subtracted above).
        // SAFETY: the inner mutex is held.
        unsafe {
            self.cond
                .wait_while(&self.mutex, || self.readers.load(Ordering::SeqCst) != 0)
        };

        // Restore this thread's reader contribution.
        self.readers.fetch_add(reader_count, Ordering::SeqCst);

        self.writer_reservation.fetch_sub(1, Ordering::SeqCst);

        // SAFETY: locked at the top.
        unsafe { self.mutex.unlock() };

        Hint::new(slot)
    }

    /// Releases one level of write lock.
    ///
    /// Releasing a write lock that is not held is a logic error: it is
    /// reported through the `log` facade and the lock state is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// Must be paired with a prior [`write_lock`](Self::write_lock) on the
    /// calling thread.
    pub unsafe fn write_unlock(&self) {
        // The mutex prevents interleaving with a releasing reader.
        self.mutex.lock();

        if !self.writer.load(Ordering::SeqCst) || self.recurse.write_recurse() == 0 {
            log::error!("write lock already released for {:p}", self);
            // SAFETY: locked above.
            unsafe { self.mutex.unlock() };
            return;
        }

        // SAFETY: the inner mutex is held and the depth is non-zero.
        unsafe { self.recurse.decrement_write_count() };

        if self.recurse.write_recurse() == 0 {
            self.writer.store(false, Ordering::SeqCst);

            let local = self.recurse.local();
            // SAFETY: `local` is this thread's handle; the mutex is held.
            unsafe { self.recurse.reset_is_writer(local) };

            // Wake every reader and writer waiting on us.
            self.cond.notify_all();
        }

        // SAFETY: locked above.
        unsafe { self.mutex.unlock() };
    }

    /// Snapshots and releases everything the calling thread holds on this
    /// lock: its read recursion, and the write lock at its full depth if
    /// this thread is the writer.
    ///
    /// Afterwards the thread holds no part of the lock, exactly as if it had
    /// released every acquisition one by one. The returned token restores
    /// the holdings via [`restore`](Self::restore); a token saved while
    /// holding nothing restores nothing.
    pub fn save(&self) -> SavedState {
        let local = self.recurse.local();

        self.mutex.lock();
        // SAFETY: the inner mutex was just acquired.
        let slot = unsafe { self.recurse.local_readers(local) };
        // SAFETY: locked above.
        unsafe { self.mutex.unlock() };

        // SAFETY: the slot stays valid for the owning thread's lifetime.
        let readers_count = unsafe { slot.as_ref() }.load(Ordering::Relaxed);

        let mut state = SavedState {
            readers_count,
            slot,
            write_recurse: 0,
            is_writer: false,
        };

        if self.writer.load(Ordering::SeqCst)
            && !unsafe { self.recurse.is_not_current_writer(local) }
        {
            // Holding the write lock: record the full depth, then set the
            // lock (and any read locks) up for release in a single unlock.
            state.is_writer = true;
            state.write_recurse = self.recurse.write_recurse();

            self.readers.fetch_sub(readers_count, Ordering::SeqCst);
            // SAFETY: this thread is the current writer.
            unsafe { self.recurse.set_write_recurse(1) };
            unsafe { slot.as_ref() }.store(0, Ordering::Relaxed);

            // SAFETY: this thread holds the write lock.
            unsafe { self.write_unlock() };
        } else if readers_count > 0 {
            // Holding read locks only: fold the recursion down to a single
            // unit and release it.
            self.readers.fetch_sub(readers_count - 1, Ordering::SeqCst);
            unsafe { slot.as_ref() }.store(1, Ordering::Relaxed);

            // SAFETY: this thread holds at least one read lock and the hint
            // refers to this thread's own slot.
            unsafe { self.read_unlock(Some(Hint::new(slot))) };
        }

        state
    }

    /// Reacquires the holdings recorded in `state`, blocking like a normal
    /// acquisition would.
    ///
    /// # Safety
    ///
    /// `state` must have been returned by [`save`](Self::save) on *this*
    /// lock (the token is already `!Send`, so it cannot change threads).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread still holds any part of the lock.
    pub unsafe fn restore(&self, state: SavedState) {
        // At a restore point the thread must not hold any part of the lock;
        // the code below would forget about it.
        assert_eq!(
            // SAFETY: the slot is this thread's own and outlives the token.
            unsafe { state.slot.as_ref() }.load(Ordering::Relaxed),
            0,
            "restore requires that the thread holds no part of the lock"
        );

        let readers_count = state.readers_count;

        if state.is_writer {
            self.write_lock();

            // The write lock is ours again; replay the recursion depths
            // that a single `write_lock` does not know about.
            self.mutex.lock();
            // SAFETY: this thread is the writer; the inner mutex is held.
            unsafe { self.recurse.set_write_recurse(state.write_recurse) };
            unsafe { state.slot.as_ref() }.store(readers_count, Ordering::Relaxed);
            self.readers.fetch_add(readers_count, Ordering::SeqCst);
            // SAFETY: locked above.
            unsafe { self.mutex.unlock() };
        } else if readers_count > 0 {
            self.read_lock();

            // `read_lock` contributed one unit; replay the rest.
            unsafe { state.slot.as_ref() }.store(readers_count, Ordering::Relaxed);
            self.readers.fetch_add(readers_count - 1, Ordering::SeqCst);
        }
    }

    /// Granted read acquisitions across all threads, summed over recursion.
    ///
    /// A racy snapshot, only meaningful as a diagnostic.
    #[inline]
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// Whether some thread currently holds the write lock.
    ///
    /// A racy snapshot, only meaningful as a diagnostic.
    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.writer.load(Ordering::SeqCst)
    }

    /// Current write-recursion depth.
    #[inline]
    pub fn write_recurse(&self) -> usize {
        self.recurse.write_recurse()
    }
}

impl<M: RawMutex, C: RecurseCounts> fmt::Debug for RawReentrantRwLock<M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawReentrantRwLock")
            .field("readers", &self.readers())
            .field("writer", &self.is_write_locked())
            .field("write_recurse", &self.write_recurse())
            .finish_non_exhaustive()
    }
}

/// A thread's saved lock holdings, produced by
/// [`save`](RawReentrantRwLock::save).
///
/// Records the read-recursion depth, whether the thread was the writer, and
/// the write-recursion depth if so. The token is `!Send`: it must be
/// restored on the thread that saved it.
pub struct SavedState {
    readers_count: usize,
    slot: NonNull<AtomicUsize>,
    write_recurse: usize,
    is_writer: bool,
}

impl fmt::Debug for SavedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedState")
            .field("readers_count", &self.readers_count)
            .field("is_writer", &self.is_writer)
            .field("write_recurse", &self.write_recurse)
            .finish_non_exhaustive()
    }
}
