//! The fallback allocator.
//!
//! A thin layer over an underlying allocator (typically the system allocator)
//! that, when an allocation fails, gives an installable out-of-memory handler
//! the chance to release memory and then retries. It serves every request
//! that is too large for the free lists, and is the last line of defense when
//! the segregated allocator's arena cannot grow.

use core::{
    mem,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use super::*;

/// An out-of-memory handler.
///
/// It is invoked after an allocation fails and is expected to release memory
/// (for example by dropping caches) so that the retry can succeed. The retry
/// loop keeps calling it for as long as it stays installed and allocation
/// keeps failing, so a handler that cannot help must eventually uninstall
/// itself with [`FallbackAllocator::set_oom_handler`].
pub type OomHandler = fn();

/// An allocator that retries failed allocations through an [`OomHandler`].
///
/// This wraps an underlying, inner allocator of type `A`.
pub struct FallbackAllocator<A>
where
    A: Allocator,
{
    /// The underlying allocator.
    inner: A,

    /// The installed `OomHandler`, or null when there is none.
    oom_handler: AtomicPtr<()>,
}

impl<A> Default for FallbackAllocator<A>
where
    A: Allocator + Default,
{
    #[inline]
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A> FallbackAllocator<A>
where
    A: Allocator,
{
    /// Create a new `FallbackAllocator` that wraps the given `inner`
    /// allocator, with no OOM handler installed.
    #[inline]
    pub const fn new(inner: A) -> Self {
        FallbackAllocator {
            inner,
            oom_handler: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Install `handler` as the OOM handler, returning the previously
    /// installed one.
    ///
    /// Passing `None` uninstalls the current handler, after which allocation
    /// failures are reported immediately.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        let new = handler.map_or(ptr::null_mut(), |f| f as *mut ());
        let old = self.oom_handler.swap(new, Ordering::AcqRel);
        decode_handler(old)
    }

    /// The currently installed OOM handler, if any.
    #[inline]
    pub fn oom_handler(&self) -> Option<OomHandler> {
        decode_handler(self.oom_handler.load(Ordering::Acquire))
    }

    /// Keep invoking the OOM handler and retrying `attempt` until it succeeds,
    /// or until there is no handler installed.
    #[cold]
    fn retry<T>(&self, mut attempt: impl FnMut() -> Result<T, AllocError>) -> Result<T, AllocError> {
        loop {
            let Some(handler) = self.oom_handler() else {
                debug!("allocation failed and no OOM handler is installed");
                return Err(AllocError);
            };
            debug!("allocation failed; invoking OOM handler and retrying");
            handler();
            if let Ok(x) = attempt() {
                return Ok(x);
            }
        }
    }

    /// Allocate `bytes` bytes, aligned to [`ALIGN`].
    pub fn allocate_bytes(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = bytes_layout(bytes)?;
        Ok(Allocator::allocate(self, layout)?.cast())
    }

    /// Deallocate `bytes` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`FallbackAllocator::allocate_bytes`]
    /// or [`FallbackAllocator::reallocate_bytes`] on this allocator with the
    /// same `bytes`, and must not have been deallocated already.
    pub unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, bytes: usize) {
        // Safety: the layout was valid when the block was allocated.
        let layout = Layout::from_size_align_unchecked(bytes, ALIGN);
        self.inner.deallocate(ptr, layout);
    }

    /// Resize the `old_bytes`-byte block at `ptr` to `new_bytes` bytes,
    /// preserving its contents up to the smaller of the two sizes.
    ///
    /// On failure the original block is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`FallbackAllocator::deallocate_bytes`], for `old_bytes`. On
    /// success, `ptr` must no longer be used.
    pub unsafe fn reallocate_bytes(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: the layout was valid when the block was allocated.
        let old_layout = Layout::from_size_align_unchecked(old_bytes, ALIGN);
        let new_layout = bytes_layout(new_bytes)?;

        let new = match new_bytes.cmp(&old_bytes) {
            core::cmp::Ordering::Equal => return Ok(ptr),
            core::cmp::Ordering::Greater => self.grow(ptr, old_layout, new_layout)?,
            core::cmp::Ordering::Less => self.shrink(ptr, old_layout, new_layout)?,
        };
        Ok(new.cast())
    }
}

fn decode_handler(raw: *mut ()) -> Option<OomHandler> {
    if raw.is_null() {
        None
    } else {
        // Safety: the only non-null values ever stored are `OomHandler`s cast
        // to `*mut ()`.
        Some(unsafe { mem::transmute::<*mut (), OomHandler>(raw) })
    }
}

unsafe impl<A> Allocator for FallbackAllocator<A>
where
    A: Allocator,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .allocate(layout)
            .or_else(|_| self.retry(|| self.inner.allocate(layout)))
    }

    #[inline]
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .allocate_zeroed(layout)
            .or_else(|_| self.retry(|| self.inner.allocate_zeroed(layout)))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // NB: a failed `grow` leaves the old block allocated and intact, so it
        // is fine to retry with the same pointer.
        self.inner
            .grow(ptr, old_layout, new_layout)
            .or_else(|_| self.retry(|| self.inner.grow(ptr, old_layout, new_layout)))
    }

    #[inline]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .grow_zeroed(ptr, old_layout, new_layout)
            .or_else(|_| self.retry(|| self.inner.grow_zeroed(ptr, old_layout, new_layout)))
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .shrink(ptr, old_layout, new_layout)
            .or_else(|_| self.retry(|| self.inner.shrink(ptr, old_layout, new_layout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Heap;
    use core::sync::atomic::AtomicUsize;

    fn noop() {}

    #[test]
    fn set_oom_handler_swaps() {
        let fallback = FallbackAllocator::new(Heap::new());
        assert!(fallback.oom_handler().is_none());

        let old = fallback.set_oom_handler(Some(noop));
        assert!(old.is_none());
        assert!(fallback.oom_handler().is_some());

        let old = fallback.set_oom_handler(None);
        assert!(old.is_some_and(|f| f as *const () == noop as OomHandler as *const ()));
        assert!(fallback.oom_handler().is_none());
    }

    #[test]
    fn out_of_memory_without_handler() {
        let fallback = FallbackAllocator::new(Heap::new());
        fallback.inner().refuse_all();
        assert!(fallback.allocate_bytes(64).is_err());
        assert_eq!(fallback.inner().calls(), 1);
    }

    #[test]
    fn handler_is_retried_until_allocation_succeeds() {
        static INVOCATIONS: AtomicUsize = AtomicUsize::new(0);
        fn handler() {
            INVOCATIONS.fetch_add(1, Ordering::SeqCst);
        }

        let fallback = FallbackAllocator::new(Heap::new());
        fallback.set_oom_handler(Some(handler));

        // The first attempt and two retries are refused.
        fallback.inner().refuse(3);
        let ptr = fallback.allocate_bytes(4096).unwrap();
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.inner().calls(), 4);

        unsafe { fallback.deallocate_bytes(ptr, 4096) };
    }

    #[test]
    fn handler_that_uninstalls_itself_ends_the_loop() {
        static FALLBACK: FallbackAllocator<Heap> = FallbackAllocator::new(Heap::new());
        fn give_up() {
            FALLBACK.set_oom_handler(None);
        }

        FALLBACK.set_oom_handler(Some(give_up));
        FALLBACK.inner().refuse_all();
        assert!(FALLBACK.allocate_bytes(1024).is_err());
        // The initial attempt plus the one retry after the handler ran.
        assert_eq!(FALLBACK.inner().calls(), 2);
    }

    #[test]
    fn reallocate_preserves_contents() {
        let fallback = FallbackAllocator::new(Heap::new());
        let ptr = fallback.allocate_bytes(256).unwrap();
        unsafe {
            ptr.write_bytes(0x5A, 256);
            let ptr = fallback.reallocate_bytes(ptr, 256, 1024).unwrap();
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), 256);
            assert!(bytes.iter().all(|b| *b == 0x5A));

            let ptr = fallback.reallocate_bytes(ptr, 1024, 200).unwrap();
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), 200);
            assert!(bytes.iter().all(|b| *b == 0x5A));

            fallback.deallocate_bytes(ptr, 200);
        }
    }
}
