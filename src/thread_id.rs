// The thread-id trait and its thread-local-address implementation follow the
// lock_api design used by parking_lot (MIT licensed, by Amanieu d'Antras).

use core::num::NonZeroUsize;

/// Helper trait which returns a non-zero thread ID.
///
/// The simplest way to implement this trait is to return the address of a
/// thread-local variable.
///
/// # Safety
///
/// Implementations of this trait must ensure that no two active threads share
/// the same thread ID. The ID of a thread that has exited may be re-used,
/// since that thread is no longer active.
pub unsafe trait GetThreadId {
    /// Initial value.
    const INIT: Self;

    /// Returns a non-zero thread ID which identifies the current thread of
    /// execution.
    fn nonzero_thread_id(&self) -> NonZeroUsize;
}

/// The default [`GetThreadId`] implementation.
pub struct RawThreadId;

unsafe impl GetThreadId for RawThreadId {
    const INIT: Self = RawThreadId;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        // The address of a thread-local variable is guaranteed to be unique to
        // the current thread, and is also guaranteed to be non-zero. The
        // variable has to have a non-zero size to guarantee a unique address
        // for each thread.
        thread_local!(static KEY: u8 = 0);
        KEY.with(|x| {
            NonZeroUsize::new(x as *const _ as usize)
                .expect("thread-local variable address is null")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_within_a_thread() {
        let a = RawThreadId.nonzero_thread_id();
        let b = RawThreadId.nonzero_thread_id();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_across_threads() {
        let here = RawThreadId.nonzero_thread_id();
        let there = std::thread::spawn(|| RawThreadId.nonzero_thread_id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }
}
