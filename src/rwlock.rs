// The wrapper and guard APIs follow the lock_api design used by parking_lot
// (MIT licensed, by Amanieu d'Antras).

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;

use crate::raw_mutex::{GuardNoSend, RawMutex};
use crate::raw_rwlock::RawReentrantRwLock;
use crate::recurse::{Hint, RecurseCounts};

/// A reentrant read-write lock protecting a value of type `T`.
///
/// Any number of threads may hold read access at once; write access is
/// exclusive to one thread. Unlike an ordinary read-write lock, though, the
/// *same* thread may freely nest acquisitions in any combination: read
/// inside read, write inside write, read inside write, and write inside
/// read (an upgrade). The lock changes hands only once a thread's recursion
/// depth is back to zero.
///
/// Because write access is reentrant, [`write`] returns a guard that hands
/// out `&T`, not `&mut T`: a second nested write guard on the same thread
/// would otherwise alias a `&mut`. Use interior mutability (atomics, or a
/// sharded structure of them) for the protected data, the same way as with
/// a reentrant mutex.
///
/// [`write`]: ReentrantRwLock::write
pub struct ReentrantRwLock<M, C, T: ?Sized> {
    raw: RawReentrantRwLock<M, C>,
    data: UnsafeCell<T>,
}

unsafe impl<M: RawMutex + Send, C: RecurseCounts + Send, T: ?Sized + Send> Send
    for ReentrantRwLock<M, C, T>
{
}
unsafe impl<M: RawMutex + Sync, C: RecurseCounts + Sync, T: ?Sized + Send + Sync> Sync
    for ReentrantRwLock<M, C, T>
{
}

impl<M: RawMutex, C: RecurseCounts + Default, T> ReentrantRwLock<M, C, T> {
    /// Creates a new lock in an unlocked state ready for use.
    #[inline]
    pub fn new(val: T) -> Self {
        Self {
            raw: RawReentrantRwLock::new(),
            data: UnsafeCell::new(val),
        }
    }
}

impl<M: RawMutex, C: RecurseCounts, T> ReentrantRwLock<M, C, T> {
    /// Consumes this lock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<M: RawMutex, C: RecurseCounts, T: ?Sized> ReentrantRwLock<M, C, T> {
    /// Acquires read access, blocking the current thread until it is able
    /// to do so.
    ///
    /// Never blocks if this thread already holds the write lock, or while no
    /// writer is present. Returns an RAII guard; read access lasts until the
    /// guard is dropped.
    #[inline]
    pub fn read(&self) -> ReentrantRwLockReadGuard<'_, M, C, T> {
        let hint = self.raw.read_lock();
        ReentrantRwLockReadGuard {
            lock: self,
            hint,
            marker: PhantomData,
        }
    }

    /// Acquires write access, blocking the current thread until every other
    /// thread's readers are gone.
    ///
    /// Read locks held by the calling thread do not block the upgrade, and a
    /// thread already holding write access re-enters immediately.
    #[inline]
    pub fn write(&self) -> ReentrantRwLockWriteGuard<'_, M, C, T> {
        self.raw.write_lock();
        ReentrantRwLockWriteGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the lock mutably, no actual locking needs to
    /// take place: the mutable borrow statically guarantees no guards exist.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Returns a raw pointer to the underlying data.
    ///
    /// # Safety
    ///
    /// You must ensure that there are no data races when dereferencing the
    /// returned pointer, for example if the current thread logically owns a
    /// guard but that guard has been discarded using `mem::forget`.
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Returns the underlying raw lock.
    ///
    /// This is where [`save`]/[`restore`] live: parking a thread's holdings
    /// is only sound while no guards from this wrapper are alive, which is
    /// why the accessor is unsafe.
    ///
    /// [`save`]: RawReentrantRwLock::save
    /// [`restore`]: RawReentrantRwLock::restore
    ///
    /// # Safety
    ///
    /// This method allows releasing locks that guards believe they still
    /// hold. The caller must not disturb acquisitions that are owned by a
    /// live guard, except through [`save`]/[`restore`] pairs that fully
    /// restore them before the guard is next used or dropped.
    #[inline]
    pub unsafe fn raw(&self) -> &RawReentrantRwLock<M, C> {
        &self.raw
    }
}

impl<M: RawMutex, C: RecurseCounts + Default, T: Default> Default for ReentrantRwLock<M, C, T> {
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<M: RawMutex, C: RecurseCounts + Default, T> From<T> for ReentrantRwLock<M, C, T> {
    #[inline]
    fn from(t: T) -> Self {
        Self::new(t)
    }
}

impl<M: RawMutex, C: RecurseCounts, T: ?Sized> fmt::Debug for ReentrantRwLock<M, C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // No try_lock in the protocol, so print the counters instead of the
        // data.
        f.debug_struct("ReentrantRwLock")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// RAII structure used to release read access when dropped.
///
/// The data protected by the lock can be accessed through this guard via its
/// `Deref` implementation. The guard carries the hint to this thread's
/// recursion counter, so dropping it releases without a lookup.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ReentrantRwLockReadGuard<'a, M: RawMutex, C: RecurseCounts, T: ?Sized> {
    lock: &'a ReentrantRwLock<M, C, T>,
    hint: Hint,
    marker: PhantomData<(&'a T, GuardNoSend)>,
}

unsafe impl<'a, M: RawMutex + Sync, C: RecurseCounts + Sync, T: ?Sized + Sync + 'a> Sync
    for ReentrantRwLockReadGuard<'a, M, C, T>
{
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a>
    ReentrantRwLockReadGuard<'a, M, C, T>
{
    /// Returns a reference to the original lock object.
    pub fn rwlock(s: &Self) -> &'a ReentrantRwLock<M, C, T> {
        s.lock
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a> Deref
    for ReentrantRwLockReadGuard<'a, M, C, T>
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a> Drop
    for ReentrantRwLockReadGuard<'a, M, C, T>
{
    #[inline]
    fn drop(&mut self) {
        // SAFETY: a read guard always holds one level of read lock, and the
        // hint is the one its acquisition returned on this thread.
        unsafe { self.lock.raw.read_unlock(Some(self.hint)) };
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + fmt::Debug + 'a> fmt::Debug
    for ReentrantRwLockReadGuard<'a, M, C, T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + fmt::Display + 'a> fmt::Display
    for ReentrantRwLockReadGuard<'a, M, C, T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// RAII structure used to release write access when dropped.
///
/// The guard dereferences to `&T`, not `&mut T`: the write lock is
/// reentrant, so the same thread can hold several write guards at once (and
/// read guards besides), and handing out `&mut` from any of them would
/// alias. What the guard *does* guarantee is that no other thread can touch
/// the data while it is alive; mutate through interior mutability.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ReentrantRwLockWriteGuard<'a, M: RawMutex, C: RecurseCounts, T: ?Sized> {
    lock: &'a ReentrantRwLock<M, C, T>,
    marker: PhantomData<(&'a T, GuardNoSend)>,
}

unsafe impl<'a, M: RawMutex + Sync, C: RecurseCounts + Sync, T: ?Sized + Sync + 'a> Sync
    for ReentrantRwLockWriteGuard<'a, M, C, T>
{
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a>
    ReentrantRwLockWriteGuard<'a, M, C, T>
{
    /// Returns a reference to the original lock object.
    pub fn rwlock(s: &Self) -> &'a ReentrantRwLock<M, C, T> {
        s.lock
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a> Deref
    for ReentrantRwLockWriteGuard<'a, M, C, T>
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + 'a> Drop
    for ReentrantRwLockWriteGuard<'a, M, C, T>
{
    #[inline]
    fn drop(&mut self) {
        // SAFETY: a write guard always holds one level of write lock.
        unsafe { self.lock.raw.write_unlock() };
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + fmt::Debug + 'a> fmt::Debug
    for ReentrantRwLockWriteGuard<'a, M, C, T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, M: RawMutex + 'a, C: RecurseCounts + 'a, T: ?Sized + fmt::Display + 'a> fmt::Display
    for ReentrantRwLockWriteGuard<'a, M, C, T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use crate::{FutexReentrantRwLock, SpinReentrantRwLock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn guards_nest_on_one_thread() {
        let lock = FutexReentrantRwLock::new(AtomicUsize::new(7));

        let r1 = lock.read();
        let r2 = lock.read();
        let w = lock.write();
        let r3 = lock.read();

        assert_eq!(r3.load(Ordering::Relaxed), 7);
        w.store(8, Ordering::Relaxed);
        assert_eq!(r1.load(Ordering::Relaxed), 8);

        drop(r3);
        drop(w);
        drop(r2);
        drop(r1);

        let raw = unsafe { lock.raw() };
        assert_eq!(raw.readers(), 0);
        assert!(!raw.is_write_locked());
    }

    #[test]
    fn writers_exclude_each_other() {
        let lock = SpinReentrantRwLock::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let guard = lock.write();
                        let v = guard.load(Ordering::Relaxed);
                        guard.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(lock.into_inner().into_inner(), 4000);
    }

    #[test]
    fn readers_run_in_parallel() {
        let lock = FutexReentrantRwLock::new(AtomicUsize::new(42));

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let guard = lock.read();
                        assert_eq!(guard.load(Ordering::Relaxed), 42);
                    }
                });
            }
        });
    }

    #[test]
    fn get_mut_needs_no_lock() {
        let mut lock = FutexReentrantRwLock::new(AtomicUsize::new(1));
        *lock.get_mut().get_mut() = 5;
        assert_eq!(lock.read().load(Ordering::Relaxed), 5);
    }

    #[test]
    fn guard_accessors_and_fmt() {
        let lock = FutexReentrantRwLock::new(AtomicUsize::new(3));
        let guard = lock.read();
        assert!(core::ptr::eq(
            crate::ReentrantRwLockReadGuard::rwlock(&guard),
            &lock
        ));
        let _ = format!("{guard:?}");
        let _ = format!("{lock:?}");
        drop(guard);

        let guard = lock.write();
        assert!(core::ptr::eq(
            crate::ReentrantRwLockWriteGuard::rwlock(&guard),
            &lock
        ));
        let _ = format!("{guard:?}");
    }
}
