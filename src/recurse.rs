use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap;

use crate::raw_mutex::RawMutex;
use crate::thread_id::{GetThreadId, RawThreadId};

/// An opaque reference to the calling thread's read-recursion counter.
///
/// Returned by every read acquisition and handed back on release so the
/// release does not have to look the counter up again. A `Hint` is only
/// meaningful on the thread that produced it and for the lock that produced
/// it; it is deliberately neither `Send` nor `Sync`.
#[derive(Clone, Copy, Debug)]
pub struct Hint(NonNull<AtomicUsize>);

impl Hint {
    #[inline]
    pub(crate) fn new(slot: NonNull<AtomicUsize>) -> Self {
        Self(slot)
    }

    #[inline]
    pub(crate) fn slot(self) -> NonNull<AtomicUsize> {
        self.0
    }
}

/// Per-thread recursion accounting for a reentrant read-write lock.
///
/// An implementation tracks, for each thread, how many read acquisitions the
/// thread currently holds and whether it is the current writer, plus a single
/// write-recursion depth shared by the whole lock (there is at most one
/// writer at a time).
///
/// Read-count slots are `AtomicUsize` cells: the owning thread updates its
/// own slot, possibly outside the inner mutex, with relaxed ordering, and any
/// thread may read a slot while holding the inner mutex.
///
/// # Safety
///
/// Implementations must ensure that:
///
/// - the slot returned by `local_readers` (and referenced by returned
///   [`Hint`]s) stays at a stable address for the lifetime of the owning
///   thread;
/// - distinct live threads get distinct slots;
/// - `write_recurse` reflects exactly the increments from `set_is_writer`
///   and `set_write_recurse` minus the decrements from
///   `decrement_write_count`.
pub unsafe trait RecurseCounts {
    /// Handle identifying the calling thread, produced by [`local`] and
    /// consumed by the per-thread operations.
    ///
    /// [`local`]: RecurseCounts::local
    type Local: Copy;

    /// Returns the identity handle for the calling thread.
    fn local(&self) -> Self::Local;

    /// Returns the read-recursion counter slot for `local`, creating a
    /// zero-initialized slot on first use.
    ///
    /// # Safety
    ///
    /// `local` must have been returned by [`local`](RecurseCounts::local) on
    /// the calling thread, and the caller must hold the lock's inner mutex
    /// if the backing store is shared between threads (it is for
    /// [`RecurseCountMap`]).
    unsafe fn local_readers(&self, local: Self::Local) -> NonNull<AtomicUsize>;

    /// Increments this thread's read count, acquiring `mutex` first if the
    /// backing store needs it (a shared map does; dedicated thread-local
    /// slots do not).
    ///
    /// # Safety
    ///
    /// `local` must have been returned by [`local`](RecurseCounts::local) on
    /// the calling thread; `mutex` must be the lock's inner mutex and must
    /// not already be held by the calling thread.
    unsafe fn increment_read_count<M: RawMutex>(&self, local: Self::Local, mutex: &M) -> Hint;

    /// Increments this thread's read count without touching the inner mutex.
    ///
    /// # Safety
    ///
    /// `local` must have been returned by [`local`](RecurseCounts::local) on
    /// the calling thread, and the caller must hold the inner mutex if the
    /// backing store is shared (see [`local_readers`]).
    ///
    /// [`local_readers`]: RecurseCounts::local_readers
    unsafe fn increment_read_count_locked(&self, local: Self::Local) -> Hint;

    /// Returns `true` iff the calling thread is *not* the current writer.
    ///
    /// This is the query a waiting path uses to tell a foreign writer from
    /// its own re-entrant acquisition.
    ///
    /// # Safety
    ///
    /// `local` must have been returned by [`local`](RecurseCounts::local) on
    /// the calling thread.
    unsafe fn is_not_current_writer(&self, local: Self::Local) -> bool;

    /// Marks the calling thread as the current writer and increments the
    /// write-recursion depth.
    ///
    /// # Safety
    ///
    /// `local` must have been returned by [`local`](RecurseCounts::local) on
    /// the calling thread, which must hold the lock's inner mutex.
    unsafe fn set_is_writer(&self, local: Self::Local);

    /// Clears the current-writer mark.
    ///
    /// # Safety
    ///
    /// Same contract as [`set_is_writer`](RecurseCounts::set_is_writer).
    unsafe fn reset_is_writer(&self, local: Self::Local);

    /// Current write-recursion depth.
    fn write_recurse(&self) -> usize;

    /// Overwrites the write-recursion depth.
    ///
    /// # Safety
    ///
    /// The calling thread must be the current writer.
    unsafe fn set_write_recurse(&self, depth: usize);

    /// Decrements the write-recursion depth.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock's inner mutex and
    /// [`write_recurse`](RecurseCounts::write_recurse) must be non-zero.
    unsafe fn decrement_write_count(&self);
}

/// Recursion accounting backed by a map from thread id to counter slot.
///
/// Works for any number of lock instances. The map itself is only touched
/// while the lock's inner mutex is held (which is why the two-argument
/// increment exists), but each counter lives in its own heap cell, so hints
/// stay valid across rehashes and the owning thread can update its counter
/// without the mutex.
///
/// Slots are never removed while the lock is alive; a thread that exits
/// leaves an idle zero-count slot behind, reclaimed when the lock is
/// dropped.
pub struct RecurseCountMap<G: GetThreadId = RawThreadId> {
    /// Thread id -> read-recursion slot. Guarded by the lock's inner mutex.
    read_counts: UnsafeCell<HashMap<usize, NonNull<AtomicUsize>>>,
    /// Thread id of the current writer, 0 if there is none.
    writer_thread: AtomicUsize,
    /// Write-recursion depth of the current writer.
    write_recurse: AtomicUsize,
    get_thread_id: G,
}

// SAFETY: the map is only mutated or traversed under the lock's inner mutex
// (the unsafe contracts above); the slots themselves are atomics.
unsafe impl<G: GetThreadId + Send> Send for RecurseCountMap<G> {}
unsafe impl<G: GetThreadId + Sync> Sync for RecurseCountMap<G> {}

impl<G: GetThreadId> RecurseCountMap<G> {
    /// Creates empty accounting state.
    pub fn new() -> Self {
        Self {
            read_counts: UnsafeCell::new(HashMap::new()),
            writer_thread: AtomicUsize::new(0),
            write_recurse: AtomicUsize::new(0),
            get_thread_id: G::INIT,
        }
    }
}

impl<G: GetThreadId> Default for RecurseCountMap<G> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GetThreadId> Drop for RecurseCountMap<G> {
    fn drop(&mut self) {
        for (_, slot) in self.read_counts.get_mut().drain() {
            // SAFETY: every slot was allocated by `Box::leak` in
            // `local_readers` and is freed exactly once, here.
            unsafe { drop(Box::from_raw(slot.as_ptr())) };
        }
    }
}

unsafe impl<G: GetThreadId> RecurseCounts for RecurseCountMap<G> {
    type Local = usize;

    #[inline]
    fn local(&self) -> usize {
        self.get_thread_id.nonzero_thread_id().get()
    }

    unsafe fn local_readers(&self, local: usize) -> NonNull<AtomicUsize> {
        // SAFETY: the caller holds the inner mutex, so we have exclusive
        // access to the map.
        let counts = unsafe { &mut *self.read_counts.get() };
        *counts
            .entry(local)
            .or_insert_with(|| NonNull::from(Box::leak(Box::new(AtomicUsize::new(0)))))
    }

    unsafe fn increment_read_count<M: RawMutex>(&self, local: usize, mutex: &M) -> Hint {
        // Inserting into the map can run concurrently with another thread
        // doing the same, so it has to be serialized by the inner mutex.
        mutex.lock();
        // SAFETY: the mutex was just acquired.
        let hint = unsafe { self.increment_read_count_locked(local) };
        // SAFETY: acquired above.
        unsafe { mutex.unlock() };
        hint
    }

    unsafe fn increment_read_count_locked(&self, local: usize) -> Hint {
        // SAFETY: forwarded from the caller.
        let slot = unsafe { self.local_readers(local) };
        // SAFETY: slots live until the accounting state is dropped.
        unsafe { slot.as_ref() }.fetch_add(1, Ordering::Relaxed);
        Hint::new(slot)
    }

    #[inline]
    unsafe fn is_not_current_writer(&self, local: usize) -> bool {
        self.writer_thread.load(Ordering::Relaxed) != local
    }

    #[inline]
    unsafe fn set_is_writer(&self, local: usize) {
        self.write_recurse.fetch_add(1, Ordering::Relaxed);
        self.writer_thread.store(local, Ordering::Relaxed);
    }

    #[inline]
    unsafe fn reset_is_writer(&self, _local: usize) {
        self.writer_thread.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn write_recurse(&self) -> usize {
        self.write_recurse.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn set_write_recurse(&self, depth: usize) {
        self.write_recurse.store(depth, Ordering::Relaxed);
    }

    #[inline]
    unsafe fn decrement_write_count(&self) {
        self.write_recurse.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-thread counters used by [`ThreadLocalRecurseCounts`].
pub struct LocalSlot {
    readers: AtomicUsize,
    is_writer: Cell<bool>,
}

thread_local! {
    static LOCAL_SLOT: LocalSlot = const {
        LocalSlot {
            readers: AtomicUsize::new(0),
            is_writer: Cell::new(false),
        }
    };
}

/// Set while a lock backed by [`ThreadLocalRecurseCounts`] is alive.
static THREAD_LOCAL_COUNTS_LIVE: AtomicBool = AtomicBool::new(false);

/// Recursion accounting in dedicated thread-local slots.
///
/// Skips the map entirely: each thread's counters sit in a `thread_local!`
/// slot, so the reader fast path never takes the inner mutex and the
/// current-writer check is a read of the thread's own flag. The trade-off is
/// that the slots belong to *the* lock: at most one lock using this policy
/// may be alive in the process. Constructing a second one panics; dropping
/// the lock releases the claim.
pub struct ThreadLocalRecurseCounts {
    /// Write-recursion depth of the current writer.
    write_recurse: AtomicUsize,
}

impl ThreadLocalRecurseCounts {
    /// Claims the process-wide thread-local slots.
    ///
    /// # Panics
    ///
    /// Panics if another lock using this policy is currently alive.
    pub fn new() -> Self {
        if THREAD_LOCAL_COUNTS_LIVE.swap(true, Ordering::SeqCst) {
            panic!(
                "only one lock backed by ThreadLocalRecurseCounts may be alive per process"
            );
        }
        Self {
            write_recurse: AtomicUsize::new(0),
        }
    }
}

impl Default for ThreadLocalRecurseCounts {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadLocalRecurseCounts {
    fn drop(&mut self) {
        THREAD_LOCAL_COUNTS_LIVE.store(false, Ordering::SeqCst);
    }
}

unsafe impl RecurseCounts for ThreadLocalRecurseCounts {
    type Local = NonNull<LocalSlot>;

    #[inline]
    fn local(&self) -> NonNull<LocalSlot> {
        // The slot address is stable for the lifetime of the thread.
        LOCAL_SLOT.with(|slot| NonNull::from(slot))
    }

    #[inline]
    unsafe fn local_readers(&self, local: NonNull<LocalSlot>) -> NonNull<AtomicUsize> {
        // SAFETY: `local` is the calling thread's own live slot.
        NonNull::from(&unsafe { local.as_ref() }.readers)
    }

    #[inline]
    unsafe fn increment_read_count<M: RawMutex>(&self, local: NonNull<LocalSlot>, _mutex: &M) -> Hint {
        // The slot always exists and belongs to this thread alone; there is
        // no shared structure to guard.
        unsafe { self.increment_read_count_locked(local) }
    }

    #[inline]
    unsafe fn increment_read_count_locked(&self, local: NonNull<LocalSlot>) -> Hint {
        // SAFETY: forwarded from the caller.
        let slot = unsafe { self.local_readers(local) };
        // SAFETY: the slot outlives the owning thread's use of it.
        unsafe { slot.as_ref() }.fetch_add(1, Ordering::Relaxed);
        Hint::new(slot)
    }

    #[inline]
    unsafe fn is_not_current_writer(&self, local: NonNull<LocalSlot>) -> bool {
        // SAFETY: `local` is the calling thread's own live slot, and the
        // writer flag is only ever touched by its owner.
        !unsafe { local.as_ref() }.is_writer.get()
    }

    #[inline]
    unsafe fn set_is_writer(&self, local: NonNull<LocalSlot>) {
        self.write_recurse.fetch_add(1, Ordering::Relaxed);
        // SAFETY: as above.
        unsafe { local.as_ref() }.is_writer.set(true);
    }

    #[inline]
    unsafe fn reset_is_writer(&self, local: NonNull<LocalSlot>) {
        // SAFETY: as above.
        unsafe { local.as_ref() }.is_writer.set(false);
    }

    #[inline]
    fn write_recurse(&self) -> usize {
        self.write_recurse.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn set_write_recurse(&self, depth: usize) {
        self.write_recurse.store(depth, Ordering::Relaxed);
    }

    #[inline]
    unsafe fn decrement_write_count(&self) {
        self.write_recurse.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_mutex::RawSpinMutex;

    #[test]
    fn map_counts_reads_per_thread() {
        let counts = RecurseCountMap::<RawThreadId>::new();
        let mutex = RawSpinMutex::new();
        let local = counts.local();

        let hint = unsafe { counts.increment_read_count(local, &mutex) };
        unsafe { counts.increment_read_count(local, &mutex) };
        assert_eq!(unsafe { hint.slot().as_ref() }.load(Ordering::Relaxed), 2);

        // The hint and a fresh lookup refer to the same slot.
        mutex.lock();
        let slot = unsafe { counts.local_readers(local) };
        unsafe { mutex.unlock() };
        assert_eq!(slot, hint.slot());

        // Another thread gets a slot of its own.
        std::thread::scope(|s| {
            s.spawn(|| {
                let local = counts.local();
                let hint = unsafe { counts.increment_read_count(local, &mutex) };
                assert_eq!(unsafe { hint.slot().as_ref() }.load(Ordering::Relaxed), 1);
            });
        });
        assert_eq!(unsafe { hint.slot().as_ref() }.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn map_tracks_current_writer() {
        let counts = RecurseCountMap::<RawThreadId>::new();
        let local = counts.local();

        assert!(unsafe { counts.is_not_current_writer(local) });
        assert_eq!(counts.write_recurse(), 0);

        unsafe { counts.set_is_writer(local) };
        assert!(!unsafe { counts.is_not_current_writer(local) });
        assert_eq!(counts.write_recurse(), 1);

        // A foreign thread is never the writer.
        std::thread::scope(|s| {
            s.spawn(|| {
                let local = counts.local();
                assert!(unsafe { counts.is_not_current_writer(local) });
            });
        });

        unsafe { counts.decrement_write_count() };
        unsafe { counts.reset_is_writer(local) };
        assert!(unsafe { counts.is_not_current_writer(local) });
        assert_eq!(counts.write_recurse(), 0);
    }

    #[test]
    fn thread_local_counts_lifecycle() {
        // All thread-local-variant coverage lives in this one test: the
        // policy is process-wide, so separate tests would race each other's
        // singleton claims.
        let counts = ThreadLocalRecurseCounts::new();
        let mutex = RawSpinMutex::new();
        let local = counts.local();

        // Read counting, without the mutex being taken.
        let hint = unsafe { counts.increment_read_count(local, &mutex) };
        assert!(!mutex.is_locked());
        assert_eq!(unsafe { hint.slot().as_ref() }.load(Ordering::Relaxed), 1);
        unsafe { hint.slot().as_ref() }.fetch_sub(1, Ordering::Relaxed);

        // Writer flag is per thread.
        unsafe { counts.set_is_writer(local) };
        assert!(!unsafe { counts.is_not_current_writer(local) });
        std::thread::scope(|s| {
            s.spawn(|| {
                let local = counts.local();
                assert!(unsafe { counts.is_not_current_writer(local) });
            });
        });
        unsafe { counts.decrement_write_count() };
        unsafe { counts.reset_is_writer(local) };

        // A second claim while this one is alive is refused...
        let second = std::panic::catch_unwind(|| ThreadLocalRecurseCounts::new());
        assert!(second.is_err());

        // ...but dropping the first frees the slots for a successor.
        drop(counts);
        let counts = ThreadLocalRecurseCounts::new();
        drop(counts);

        // The full lock over this policy, still inside the one test.
        let lock = crate::UniqueFutexReentrantRwLock::new(AtomicUsize::new(0));

        // Upgrade while holding a read, then nested guards unwind cleanly.
        let r = lock.read();
        let w = lock.write();
        w.store(1, Ordering::Relaxed);
        drop(w);
        assert_eq!(r.load(Ordering::Relaxed), 1);
        drop(r);

        // Other threads get slots of their own and are excluded properly.
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let w = lock.write();
                        let v = w.load(Ordering::Relaxed);
                        w.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(lock.read().load(Ordering::Relaxed), 2001);

        // Save/restore round-trip on the raw lock.
        let raw = unsafe { lock.raw() };
        let h1 = raw.read_lock();
        raw.read_lock();
        let state = raw.save();
        assert_eq!(raw.readers(), 0);
        unsafe { raw.restore(state) };
        assert_eq!(raw.readers(), 2);
        unsafe { raw.read_unlock(None) };
        unsafe { raw.read_unlock(Some(h1)) };

        // Dropping the lock releases the singleton claim one more time.
        drop(lock);
        drop(ThreadLocalRecurseCounts::new());
    }
}
