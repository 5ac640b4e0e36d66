//! An instrumented underlying allocator for unit tests.

extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::alloc::{GlobalAlloc, System};

use super::*;

/// A system-backed allocator that counts requests and can be told to refuse
/// them.
pub(crate) struct Heap {
    calls: AtomicUsize,
    last_request: AtomicUsize,
    last_release: AtomicUsize,
    refusals: AtomicUsize,
}

impl Heap {
    pub(crate) const fn new() -> Self {
        Heap {
            calls: AtomicUsize::new(0),
            last_request: AtomicUsize::new(0),
            last_release: AtomicUsize::new(0),
            refusals: AtomicUsize::new(0),
        }
    }

    /// The number of allocation requests seen so far, refused or not.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(SeqCst)
    }

    /// The size of the most recent allocation request.
    pub(crate) fn last_request(&self) -> usize {
        self.last_request.load(SeqCst)
    }

    /// The size of the most recently deallocated block.
    pub(crate) fn last_release(&self) -> usize {
        self.last_release.load(SeqCst)
    }

    /// Refuse the next `n` allocation requests.
    pub(crate) fn refuse(&self, n: usize) {
        self.refusals.store(n, SeqCst);
    }

    /// Refuse every allocation request from now on.
    pub(crate) fn refuse_all(&self) {
        self.refusals.store(usize::MAX, SeqCst);
    }
}

unsafe impl Allocator for Heap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.calls.fetch_add(1, SeqCst);
        self.last_request.store(layout.size(), SeqCst);

        let refused = self
            .refusals
            .fetch_update(SeqCst, SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok();
        if refused {
            return Err(AllocError);
        }

        if layout.size() == 0 {
            // Safety: alignments are non-zero.
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }

        // Safety: the layout has a non-zero size.
        let ptr = unsafe { System.alloc(layout) };
        NonNull::new(ptr)
            .map(|ptr| NonNull::slice_from_raw_parts(ptr, layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.last_release.store(layout.size(), SeqCst);
        if layout.size() != 0 {
            System.dealloc(ptr.as_ptr(), layout);
        }
    }
}
