//! The segregated free-list allocator.
//!
//! Small requests (up to [`MAX_BYTES`]) are rounded up to a multiple of
//! [`ALIGN`] and served from one of [`NUM_SIZE_CLASSES`] free lists, each
//! holding idle blocks of exactly one size. Larger requests go straight to the
//! [`FallbackAllocator`].
//!
//! Idle blocks are chained through their own first word, so the free lists cost
//! no memory beyond the blocks themselves. Deallocation pushes onto the head of
//! a list and allocation pops from it, so the most recently freed block of a
//! size is the next one handed out.
//!
//! When a free list is empty it is refilled with a batch of [`REFILL_BLOCKS`]
//! blocks carved from the arena: a single contiguous range of memory that has
//! not yet been handed out or put in any free list. When the arena cannot
//! supply a whole batch, we take as many whole blocks as it has. When it cannot
//! supply even one, it is regrown, degrading step by step:
//!
//! 1. Whatever fragment is left of the old arena (always smaller than one block,
//!    and a multiple of `ALIGN`) is pushed onto the free list of its exact size,
//!    so that nothing is stranded.
//!
//! 2. A new arena of `2 * batch + round_up(heap_size / 16)` bytes is requested
//!    from the underlying allocator. Growth scales with both the immediate need
//!    and everything requested so far.
//!
//! 3. If that fails, an idle block from this or any larger size class is
//!    removed from its free list and becomes the (small) arena.
//!
//! 4. If there is nothing to take, the request is made once more through the
//!    fallback allocator, which gives the OOM handler a chance to release
//!    memory. If that fails too, we are out of memory.
//!
//! Arena memory is never returned to the underlying allocator, not even when
//! the `SegregatedAllocator` is dropped.

use core::ptr;

use super::*;
use free_list::FreeList;

mod mutex;
pub use mutex::{Lock, SingleThreadedLock};
#[cfg(feature = "spin")]
pub use mutex::SpinLock;
use mutex::{Mutex, MutexGuard};

/// A size-segregated free-list allocator.
///
/// This wraps an underlying, inner allocator of type `A` (for example the
/// system allocator), which it reaches through a [`FallbackAllocator`].
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, the free lists and arena are guarded by a locking
/// mechanism of your choice via the `L` type parameter: [`SpinLock`] to share
/// the allocator between threads, or [`SingleThreadedLock`] otherwise. See the
/// [`Lock`] trait for details.
///
/// The constructor is a `const fn`, so a process-wide instance can live in a
/// `static`:
///
/// ```
/// # #[cfg(all(feature = "allocator_api2", feature = "spin"))]
/// # {
/// use allocator_api2::alloc::{AllocError, Allocator, Layout};
/// use core::ptr::NonNull;
/// use segalloc::{SegregatedAllocator, SpinLock};
///
/// struct System;
///
/// unsafe impl Allocator for System {
///     fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
///         # if layout.size() == 0 { return Err(AllocError); }
///         let ptr = unsafe { std::alloc::alloc(layout) };
///         NonNull::new(ptr)
///             .map(|ptr| NonNull::slice_from_raw_parts(ptr, layout.size()))
///             .ok_or(AllocError)
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
///         std::alloc::dealloc(ptr.as_ptr(), layout)
///     }
/// }
///
/// static ALLOCATOR: SegregatedAllocator<System, SpinLock> =
///     SegregatedAllocator::new(System, SpinLock::new());
///
/// let ptr = ALLOCATOR.allocate_bytes(24)?;
/// unsafe { ALLOCATOR.deallocate_bytes(ptr, 24) };
/// # }
/// # Ok::<(), segalloc::AllocError>(())
/// ```
pub struct SegregatedAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Serves large requests and supplies arena memory.
    fallback: FallbackAllocator<A>,

    /// The free lists and arena.
    state: Mutex<State, L>,
}

struct State {
    /// One free list per size class, indexed by `size_class_index`.
    free_lists: [FreeList; NUM_SIZE_CLASSES],

    /// The start of the arena. Bytes in `arena_start..arena_end` are in no free
    /// list and have not been handed out.
    arena_start: *mut u8,

    /// The end of the arena. `arena_start <= arena_end` always; both are null
    /// when there is no arena.
    arena_end: *mut u8,

    /// The total number of bytes ever obtained for arenas.
    heap_size: usize,
}

// Safety: the raw pointers in `State` refer to memory that the state owns
// exclusively (the arena and idle blocks), so it may move between threads.
unsafe impl Send for State {}

impl State {
    const fn new() -> Self {
        const EMPTY: FreeList = FreeList::new();
        State {
            free_lists: [EMPTY; NUM_SIZE_CLASSES],
            arena_start: ptr::null_mut(),
            arena_end: ptr::null_mut(),
            heap_size: 0,
        }
    }

    #[inline]
    fn arena_len(&self) -> usize {
        debug_assert!(self.arena_start <= self.arena_end);
        self.arena_end as usize - self.arena_start as usize
    }

    /// Take `bytes` bytes off the front of the arena.
    ///
    /// # Safety
    ///
    /// `bytes` must be non-zero and no larger than the arena.
    #[inline]
    unsafe fn carve(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert_ne!(bytes, 0);
        debug_assert!(bytes <= self.arena_len());
        let start = self.arena_start;
        self.arena_start = start.add(bytes);
        NonNull::new_unchecked(start)
    }

    /// Make `len` bytes at `start` the arena.
    ///
    /// # Safety
    ///
    /// The memory must be owned by nobody else, aligned to `ALIGN`, and its
    /// length a multiple of `ALIGN`. The current arena must be empty.
    unsafe fn set_arena(&mut self, start: NonNull<u8>, len: usize) {
        debug_assert_eq!(self.arena_len(), 0);
        debug_assert_eq!(start.as_ptr() as usize % ALIGN, 0);
        debug_assert_eq!(len % ALIGN, 0);
        self.arena_start = start.as_ptr();
        self.arena_end = start.as_ptr().add(len);
    }

    /// Push what is left of the arena onto the free list matching its exact
    /// length, and empty the arena.
    ///
    /// The arena must be no larger than `MAX_BYTES`.
    fn salvage_arena(&mut self) {
        let len = self.arena_len();
        if len > 0 {
            debug_assert!(len <= MAX_BYTES);
            debug_assert_eq!(len % ALIGN, 0);
            debug!("salvaging {len}-byte arena fragment into its free list");
            // Safety: the fragment is owned by the arena, aligned, and exactly
            // one block of its size class.
            unsafe {
                let fragment = NonNull::new_unchecked(self.arena_start);
                self.free_lists[size_class_index(len)].push(fragment);
            }
        }
        self.arena_start = ptr::null_mut();
        self.arena_end = ptr::null_mut();
    }

    /// Remove an idle block of at least `bytes` bytes from the smallest
    /// non-empty size class that fits, returning it with its size.
    fn cannibalize(&mut self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        (size_class_index(bytes)..NUM_SIZE_CLASSES).find_map(|index| {
            self.free_lists[index]
                .pop()
                .map(|block| (block, size_class_bytes(index)))
        })
    }
}

/// The number of bytes to request for a new arena, given the bytes needed for
/// the current batch and the total obtained so far.
#[inline]
fn growth_request(batch_bytes: usize, heap_size: usize) -> usize {
    2 * batch_bytes + round_up(heap_size >> 4)
}

/// Whether allocations with this layout are served from the free lists.
#[inline]
fn is_small(layout: Layout) -> bool {
    layout.align() <= ALIGN && layout.size() <= MAX_BYTES
}

impl<A, L> Default for SegregatedAllocator<A, L>
where
    A: Allocator + Default,
    L: Lock + Default,
{
    #[inline]
    fn default() -> Self {
        Self::new(A::default(), L::default())
    }
}

impl<A, L> SegregatedAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a new `SegregatedAllocator` that wraps the given `inner`
    /// allocator.
    ///
    /// No memory is requested until the first small allocation.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        SegregatedAllocator {
            fallback: FallbackAllocator::new(inner),
            state: Mutex::new(State::new(), lock),
        }
    }

    /// Get a shared reference to the fallback allocator.
    #[inline]
    pub fn fallback(&self) -> &FallbackAllocator<A> {
        &self.fallback
    }

    /// Get a shared reference to the underlying allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        self.fallback.inner()
    }

    /// Install `handler` as the OOM handler, returning the previously
    /// installed one. See [`FallbackAllocator::set_oom_handler`].
    #[inline]
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        self.fallback.set_oom_handler(handler)
    }

    /// The total number of bytes obtained from the underlying allocator for
    /// arenas so far.
    pub fn heap_size(&self) -> usize {
        self.state.lock().heap_size
    }

    /// The number of bytes left in the current arena.
    pub fn arena_len(&self) -> usize {
        self.state.lock().arena_len()
    }

    /// The number of idle blocks in the free list of size class `index`.
    ///
    /// This walks the whole list.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than [`NUM_SIZE_CLASSES`].
    pub fn free_blocks(&self, index: usize) -> usize {
        self.state.lock().free_lists[index].len()
    }

    /// Allocate a block of at least `bytes` bytes, aligned to [`ALIGN`].
    ///
    /// Requests up to [`MAX_BYTES`] are served from the free lists, larger ones
    /// by the fallback allocator.
    pub fn allocate_bytes(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        if bytes > MAX_BYTES {
            return self.fallback.allocate_bytes(bytes);
        }
        self.allocate_small(bytes)
    }

    /// Deallocate the `bytes`-byte block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`SegregatedAllocator::allocate_bytes`]
    /// or [`SegregatedAllocator::reallocate_bytes`] on this allocator with the
    /// same `bytes` (or, up to `MAX_BYTES`, any `bytes` of the same size
    /// class), and must not have been deallocated already. None of this is
    /// checked.
    pub unsafe fn deallocate_bytes(&self, ptr: NonNull<u8>, bytes: usize) {
        if bytes > MAX_BYTES {
            self.fallback.deallocate_bytes(ptr, bytes);
            return;
        }
        self.deallocate_small(ptr, bytes);
    }

    /// Exchange the `old_bytes`-byte block at `ptr` for one of `new_bytes`
    /// bytes.
    ///
    /// This is a deallocation followed by an allocation, not a resize: the
    /// contents of the old block are **not** carried over, and callers that
    /// need them must copy them out first. As an exception, when both sizes
    /// fall in the same size class, `ptr` itself is returned untouched.
    ///
    /// On failure the old block has already been deallocated.
    ///
    /// # Safety
    ///
    /// Same as [`SegregatedAllocator::deallocate_bytes`], for `old_bytes`.
    /// `ptr` must no longer be used unless it is returned again.
    pub unsafe fn reallocate_bytes(
        &self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if old_bytes <= MAX_BYTES
            && new_bytes <= MAX_BYTES
            && size_class_index(old_bytes) == size_class_index(new_bytes)
        {
            return Ok(ptr);
        }
        self.deallocate_bytes(ptr, old_bytes);
        self.allocate_bytes(new_bytes)
    }

    fn allocate_small(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(bytes <= MAX_BYTES);
        let index = size_class_index(bytes);

        let mut state = self.state.lock();
        if let Some(block) = state.free_lists[index].pop() {
            return Ok(block);
        }
        self.refill(&mut state, size_class_bytes(index))
    }

    unsafe fn deallocate_small(&self, ptr: NonNull<u8>, bytes: usize) {
        debug_assert!(bytes <= MAX_BYTES);
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
        let mut state = self.state.lock();
        state.free_lists[size_class_index(bytes)].push(ptr);
    }

    /// Carve a batch of `bytes`-byte blocks from the arena, return the first
    /// one, and put the rest in the (empty) free list for `bytes`.
    fn refill(
        &self,
        state: &mut MutexGuard<'_, State, L>,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let (chunk, supplied) = self.chunk_alloc(state, bytes, REFILL_BLOCKS)?;
        trace!("refilling {bytes}-byte size class with {supplied} blocks");

        if supplied > 1 {
            // Safety: the chunk is `supplied` contiguous, aligned, unused
            // blocks of `bytes` bytes that nothing else references.
            unsafe {
                let rest = chunk.add(bytes);
                state.free_lists[size_class_index(bytes)].push_run(rest, bytes, supplied - 1);
            }
        }
        Ok(chunk)
    }

    /// Carve `requested` blocks of `bytes` bytes from the arena, or as many as
    /// it can supply if that is fewer, growing the arena first if it cannot
    /// supply even one.
    ///
    /// Returns the start of the carved range and the number of blocks in it,
    /// which is at least one.
    fn chunk_alloc(
        &self,
        state: &mut MutexGuard<'_, State, L>,
        bytes: usize,
        requested: usize,
    ) -> Result<(NonNull<u8>, usize), AllocError> {
        debug_assert!(bytes > 0 && bytes <= MAX_BYTES && bytes % ALIGN == 0);
        debug_assert_ne!(requested, 0);

        let batch_bytes = bytes * requested;
        loop {
            let available = state.arena_len();

            if available >= batch_bytes {
                // Safety: the arena holds at least this many bytes.
                let chunk = unsafe { state.carve(batch_bytes) };
                return Ok((chunk, requested));
            }

            if available >= bytes {
                let supplied = available / bytes;
                // Safety: as above.
                let chunk = unsafe { state.carve(supplied * bytes) };
                return Ok((chunk, supplied));
            }

            state.salvage_arena();

            let bytes_to_get = growth_request(batch_bytes, state.heap_size);
            let layout = bytes_layout(bytes_to_get)?;

            if let Ok(arena) = self.fallback.inner().allocate(layout) {
                debug!("growing arena by {bytes_to_get} bytes");
                state.heap_size += bytes_to_get;
                // Safety: fresh memory from the underlying allocator, which we
                // never give back.
                unsafe { state.set_arena(arena.cast(), bytes_to_get) };
                continue;
            }

            if let Some((block, len)) = state.cannibalize(bytes) {
                warn!(
                    "failed to grow arena by {bytes_to_get} bytes; \
                     using an idle {len}-byte block as the arena instead"
                );
                // Safety: the block was just removed from its free list.
                unsafe { state.set_arena(block, len) };
                continue;
            }

            warn!(
                "failed to grow arena by {bytes_to_get} bytes and no idle blocks \
                 are left; retrying through the OOM handler"
            );
            // The OOM handler may want to free memory into this allocator, so
            // do not hold the lock while it runs.
            let arena = MutexGuard::unlocked(state, || self.fallback.allocate(layout))?;

            if state.arena_len() >= bytes {
                // Another thread grew the arena while we were unlocked; use
                // theirs.
                // Safety: `arena` was just allocated with this layout.
                unsafe { self.fallback.deallocate(arena.cast(), layout) };
                continue;
            }

            state.salvage_arena();
            state.heap_size += bytes_to_get;
            // Safety: as above.
            unsafe { state.set_arena(arena.cast(), bytes_to_get) };
        }
    }
}

unsafe impl<A, L> Allocator for SegregatedAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if !is_small(layout) {
            return self.fallback.allocate(layout);
        }

        let block = self.allocate_small(layout.size())?;
        let len = size_class_bytes(size_class_index(layout.size()));
        Ok(NonNull::slice_from_raw_parts(block, len))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if !is_small(layout) {
            self.fallback.deallocate(ptr, layout);
            return;
        }
        self.deallocate_small(ptr, layout.size());
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.resize(ptr, old_layout, new_layout, old_layout.size())
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.resize(ptr, old_layout, new_layout, new_layout.size())
    }
}

impl<A, L> SegregatedAllocator<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Move an allocation to `new_layout`, preserving its first `keep` bytes.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        keep: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        match (is_small(old_layout), is_small(new_layout)) {
            (false, false) if old_layout.align() == new_layout.align() => {
                if new_layout.size() >= old_layout.size() {
                    self.fallback.grow(ptr, old_layout, new_layout)
                } else {
                    self.fallback.shrink(ptr, old_layout, new_layout)
                }
            }
            (true, true)
                if size_class_index(old_layout.size()) == size_class_index(new_layout.size()) =>
            {
                // Same block, nothing to move.
                let len = size_class_bytes(size_class_index(new_layout.size()));
                Ok(NonNull::slice_from_raw_parts(ptr, len))
            }
            _ => {
                let new = Allocator::allocate(self, new_layout)?;
                ptr::copy_nonoverlapping(ptr.as_ptr().cast_const(), new.cast::<u8>().as_ptr(), keep);
                Allocator::deallocate(self, ptr, old_layout);
                Ok(new)
            }
        }
    }
}

mod free_list {
    use super::*;

    /// The header of an idle block.
    ///
    /// It overlays the first word of the block's own storage and links to the
    /// next idle block of the same size class. Once the block is handed out, the
    /// header is just client bytes again.
    #[repr(C)]
    struct FreeBlock {
        next: Option<NonNull<FreeBlock>>,
    }

    impl FreeBlock {
        /// Write a header linking to `next` at `at`.
        ///
        /// # Safety
        ///
        /// `at` must be valid for writes of a `FreeBlock` and aligned for it,
        /// and nothing else may be using the block.
        #[inline]
        unsafe fn write(at: NonNull<u8>, next: Option<NonNull<FreeBlock>>) -> NonNull<FreeBlock> {
            debug_assert_eq!(at.as_ptr() as usize % core::mem::align_of::<FreeBlock>(), 0);
            let block = at.cast::<FreeBlock>();
            block.write(FreeBlock { next });
            block
        }

        /// # Safety
        ///
        /// `block` must point to a header written by `FreeBlock::write`.
        #[inline]
        unsafe fn next(block: NonNull<FreeBlock>) -> Option<NonNull<FreeBlock>> {
            block.as_ref().next
        }
    }

    /// An intrusive, singly linked LIFO list of idle blocks of one size class.
    pub(super) struct FreeList {
        head: Option<NonNull<FreeBlock>>,
    }

    impl FreeList {
        pub(super) const fn new() -> Self {
            FreeList { head: None }
        }

        /// Push the block at `block` onto the front of the list.
        ///
        /// # Safety
        ///
        /// The block must be at least a word large, aligned to `ALIGN`, and
        /// owned by the list from now on.
        #[inline]
        pub(super) unsafe fn push(&mut self, block: NonNull<u8>) {
            self.head = Some(FreeBlock::write(block, self.head));
        }

        /// Push `count` contiguous blocks of `block_size` bytes starting at
        /// `start`, so that they pop off in address order.
        ///
        /// # Safety
        ///
        /// Same as `push`, for each block.
        pub(super) unsafe fn push_run(&mut self, start: NonNull<u8>, block_size: usize, count: usize) {
            // Link back to front: each block points at the one after it, and the
            // last one at the old head.
            let mut next = self.head;
            for i in (0..count).rev() {
                next = Some(FreeBlock::write(start.add(i * block_size), next));
            }
            self.head = next;
        }

        /// Pop the most recently pushed block.
        #[inline]
        pub(super) fn pop(&mut self) -> Option<NonNull<u8>> {
            let block = self.head?;
            // Safety: every block in the list starts with a header.
            self.head = unsafe { FreeBlock::next(block) };
            Some(block.cast())
        }

        pub(super) fn len(&self) -> usize {
            let mut len = 0;
            let mut cursor = self.head;
            while let Some(block) = cursor {
                len += 1;
                // Safety: every block in the list starts with a header.
                cursor = unsafe { FreeBlock::next(block) };
            }
            len
        }
    }
}
