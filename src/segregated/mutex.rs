//! Provides a mutex container type similar to `std::sync::Mutex<T>` but
//! parameterized over any type `L` that implements the `Lock` trait, for better
//! no-std support.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

#[cfg(feature = "spin")]
use core::mem;
#[cfg(feature = "spin")]
use spin::mutex::SpinMutex;

/// A trait for providing mutual exclusion.
///
/// Use [`SpinLock`] to share a
/// [`SegregatedAllocator`][crate::SegregatedAllocator] between threads. If you
/// only use the allocator, and collections using it, from a single thread, you
/// may use [`SingleThreadedLock`], which is the moral equivalent of a
/// `RefCell`.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an allocator using this locking
///   mechanism will be `Sync`, and therefore this method must provide actual
///   mutual exclusion and prevent against unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking and re-entering the
///   lock when it is already held. The prevention may be a panic, abort,
///   infinite loop, or etc...
pub unsafe trait Lock {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must result in a panic, abort, infinite
    /// loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`. It allows using the `SegregatedAllocator`
/// in single-threaded scenarios.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get());
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A spinning implementation of [`Lock`] that is safe to share between
/// threads, built on [`spin::mutex::SpinMutex`].
///
/// Critical sections in the allocator are short (a free-list push or pop, or
/// carving the arena) except when the arena must grow, so spinning is
/// acceptable. Re-entrant locking from the same thread spins forever.
#[cfg(feature = "spin")]
#[derive(Debug)]
pub struct SpinLock {
    raw: SpinMutex<()>,
}

#[cfg(feature = "spin")]
unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        // The guard's only job would be to unlock on drop; `unlock` does that
        // instead.
        mem::forget(self.raw.lock());
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.raw.is_locked());
        // Safety: `Mutex` only calls `unlock` to release a lock it acquired
        // through `lock`, whose guard was forgotten.
        unsafe { self.raw.force_unlock() };
    }
}

#[cfg(feature = "spin")]
impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "spin")]
impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            raw: SpinMutex::new(()),
        }
    }
}

#[derive(Default)]
pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<'a, T, L> MutexGuard<'a, T, L>
where
    L: Lock,
{
    /// Temporarily release the lock while running `f`, re-acquiring it
    /// afterwards (even if `f` panics).
    ///
    /// Anything read through the guard before this call may be stale after it.
    pub(super) fn unlocked<R>(guard: &mut Self, f: impl FnOnce() -> R) -> R {
        struct Relock<'b, L: Lock>(&'b L);

        impl<L: Lock> Drop for Relock<'_, L> {
            fn drop(&mut self) {
                self.0.lock();
            }
        }

        guard.mutex.lock.unlock();
        let _relock = Relock(&guard.mutex.lock);
        f()
    }
}

impl<'a, T, L> Drop for MutexGuard<'a, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_releases_and_reacquires() {
        let mutex = Mutex::new(1, SingleThreadedLock::new());
        let mut guard = mutex.lock();
        *guard += 1;

        MutexGuard::unlocked(&mut guard, || {
            // The lock is free while we are in here.
            let mut inner = mutex.lock();
            *inner += 1;
        });

        assert_eq!(*guard, 3);
    }

    #[test]
    #[should_panic]
    fn single_threaded_lock_rejects_reentrance() {
        let mutex = Mutex::new((), SingleThreadedLock::new());
        let _a = mutex.lock();
        let _b = mutex.lock();
    }

    #[test]
    #[cfg(feature = "spin")]
    fn spin_lock_round_trip() {
        let lock = SpinLock::new();
        lock.lock();
        assert!(lock.raw.is_locked());
        lock.unlock();
        assert!(!lock.raw.is_locked());
        lock.lock();
        lock.unlock();
    }
}
