//! A reentrant read-write lock with writer preference.
//!
//! ## What this lock does
//!
//! A read-write lock arbitrates access to a shared resource between many
//! readers and a single writer. This implementation adds an unusual contract
//! on top of that:
//!
//! - A thread that already holds the read lock may take the write lock
//!   without releasing its reads first (an *upgrade*), and a thread holding
//!   the write lock may take additional read locks (*re-entry*). Neither
//!   deadlocks against itself.
//! - Acquisitions are counted per thread; every acquisition must be matched
//!   by a release from the same thread, and the lock only changes hands once
//!   a thread's recursion depth returns to zero.
//! - A thread can [`save`] its entire holdings (any number of read locks,
//!   plus the write lock at any depth) into an opaque token, let other
//!   threads run, and later [`restore`] them to exactly the same depths.
//!
//! Readers that arrive while no writer is around take a fast path that never
//! touches the internal mutex. Writers are preferred: a writer that has
//! claimed the lock only waits for the readers that were already granted, so
//! a steady stream of new readers cannot starve it.
//!
//! [`save`]: RawReentrantRwLock::save
//! [`restore`]: RawReentrantRwLock::restore
//!
//! ## Layers
//!
//! The crate is built the same way as the typed-wrapper lock crates: raw
//! primitives that only contain lock state, wrapped by a typed lock that
//! owns the protected data and hands out RAII guards.
//!
//! - [`RawMutex`] is the trait for the *inner* mutex that serializes the
//!   lock's slow paths. [`RawSpinMutex`] and [`RawFutexMutex`] are provided;
//!   any other implementation of the trait works too.
//! - [`Condvar`] is a condition variable that can wait on any [`RawMutex`].
//! - [`RecurseCounts`] is the per-thread recursion accounting policy.
//!   [`RecurseCountMap`] works for any number of lock instances;
//!   [`ThreadLocalRecurseCounts`] trades that generality for a
//!   mutex-free reader fast path and is restricted to one live lock
//!   process-wide.
//! - [`RawReentrantRwLock`] implements the synchronization protocol itself.
//! - [`ReentrantRwLock`] owns a value of type `T` and exposes `read()` /
//!   `write()` guards.
//!
//! Because the write lock is reentrant, write guards hand out `&T` rather
//! than `&mut T`; see [`ReentrantRwLockWriteGuard`] for the reasoning and
//! the interior-mutability escape hatch.

mod condvar;
mod raw_mutex;
mod raw_rwlock;
mod recurse;
mod rwlock;
mod thread_id;

pub use condvar::Condvar;
pub use raw_mutex::{GuardNoSend, GuardSend, RawFutexMutex, RawMutex, RawSpinMutex};
pub use raw_rwlock::{RawReentrantRwLock, SavedState};
pub use recurse::{Hint, LocalSlot, RecurseCountMap, RecurseCounts, ThreadLocalRecurseCounts};
pub use rwlock::{ReentrantRwLock, ReentrantRwLockReadGuard, ReentrantRwLockWriteGuard};
pub use thread_id::{GetThreadId, RawThreadId};

/// A reentrant read-write lock whose slow paths spin.
///
/// Suited to short critical sections where a blocked thread is expected to
/// get the lock quickly.
pub type SpinReentrantRwLock<T> = ReentrantRwLock<RawSpinMutex, RecurseCountMap, T>;

/// A reentrant read-write lock whose slow paths sleep in the kernel.
///
/// The default choice: contended threads park on a futex instead of burning
/// cycles.
pub type FutexReentrantRwLock<T> = ReentrantRwLock<RawFutexMutex, RecurseCountMap, T>;

/// Like [`SpinReentrantRwLock`], but with recursion counts in dedicated
/// thread-local slots.
///
/// Only one lock backed by [`ThreadLocalRecurseCounts`] may be alive in the
/// process at a time; constructing a second one panics.
pub type UniqueSpinReentrantRwLock<T> = ReentrantRwLock<RawSpinMutex, ThreadLocalRecurseCounts, T>;

/// Like [`FutexReentrantRwLock`], but with recursion counts in dedicated
/// thread-local slots.
///
/// Only one lock backed by [`ThreadLocalRecurseCounts`] may be alive in the
/// process at a time; constructing a second one panics.
pub type UniqueFutexReentrantRwLock<T> =
    ReentrantRwLock<RawFutexMutex, ThreadLocalRecurseCounts, T>;
