//! Shared fuzzing and testing infrastructure for `segalloc`.

use allocator_api2::alloc::{Allocator, Global};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segalloc::{Lock, SegregatedAllocator, SingleThreadedLock, ALIGN, MAX_BYTES};
use std::{cell::RefCell, collections::BTreeMap, mem, ptr::NonNull};

/// The layout of a test allocation.
//
// Note: it is easier to define our own layout type here than to reuse
// `std::alloc::Layout` because we want to define a default mutator for `Layout`
// but trait orphan rules make that impossible.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Layout {
    size: usize,
    align: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self { size: 0, align: 1 }
    }
}

impl Layout {
    /// Create a new `Layout` from the given size and alignment, panicking if
    /// they do not form a valid layout.
    pub fn unwrap_new(size: usize, align: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(size, align)
            .expect("Layout::unwrap_new on bad size/align");
        Layout {
            size: layout.size(),
            align: layout.align(),
        }
    }

    fn alloc_layout(&self) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(self.size, self.align)
            .expect("should have a valid size and align")
    }
}

impl DefaultMutate for Layout {
    type DefaultMutate = LayoutMutator;
}

/// A mutator for `Layout`s with configurable maximums for size and alignment.
///
/// The defaults straddle `MAX_BYTES` and `ALIGN`, so that both the free lists
/// and the fallback allocator get exercised.
#[derive(Debug)]
pub struct LayoutMutator {
    pub max_size: usize,
    pub max_align: usize,
}

impl Default for LayoutMutator {
    fn default() -> Self {
        Self {
            max_size: 4 * MAX_BYTES,
            max_align: 8 * ALIGN,
        }
    }
}

fn round_down_to_pow2(x: usize) -> usize {
    if x == 0 {
        1
    } else {
        1 << (mem::size_of::<usize>() * 8 - 1 - (x.leading_zeros() as usize))
    }
}

impl Mutate<Layout> for LayoutMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        layout: &mut Layout,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                layout.size
            } else {
                self.max_size
            };
            layout.size = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align_log2 = if ctx.shrink() {
                layout.align.trailing_zeros() as usize
            } else {
                self.max_align.trailing_zeros() as usize
            };
            let align_log2 = ctx.rng().gen_index(max_align_log2 + 1).unwrap();
            layout.align = 1 << align_log2;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Layout> for LayoutMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Layout> {
        let size = m::range(0..=self.max_size).generate(context)?;
        let align = m::range(1..=self.max_align).generate(context)?;
        let align = round_down_to_pow2(align);
        Ok(Layout { size, align })
    }
}

/// A test operation.
///
/// `Alloc`, `Grow`, and `Shrink` go through the `Allocator` trait; `AllocBytes`
/// and `ReallocBytes` through the byte-oriented API. `Dealloc` uses whichever
/// API the allocation was made with.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, layout: Layout },
    Dealloc { id: u32 },
    Grow { id: u32, layout: Layout },
    Shrink { id: u32, layout: Layout },
    AllocBytes { id: u32, size: u16 },
    ReallocBytes { id: u32, size: u16 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Grow {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Shrink {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::AllocBytes {
                    id: ctx.rng().gen_u32(),
                    size: byte_size(ctx),
                })
            },
            |ctx| {
                Ok(Op::ReallocBytes {
                    id: ctx.rng().gen_u32(),
                    size: byte_size(ctx),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A random size for the byte-oriented API, biased towards the free lists.
fn byte_size(ctx: &mut mutatis::Context) -> u16 {
    let max = if ctx.rng().gen_u32() % 2 == 0 {
        MAX_BYTES
    } else {
        4 * MAX_BYTES
    };
    ctx.rng().gen_index(max + 1).unwrap() as u16
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::AllocBytes { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Dealloc { id }
                    | Op::Grow { id, .. }
                    | Op::Shrink { id, .. }
                    | Op::AllocBytes { id, .. }
                    | Op::ReallocBytes { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Deallocate an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let dealloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(dealloc_index, Op::Dealloc { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let resize_op = match &ops.ops[op_index] {
                        Op::AllocBytes { .. } => Op::ReallocBytes {
                            id,
                            size: byte_size(ctx),
                        },
                        _ => {
                            let layout = m::default::<Layout>().generate(ctx)?;
                            if ctx.rng().gen_u32() % 2 == 0 {
                                Op::Grow { id, layout }
                            } else {
                                Op::Shrink { id, layout }
                            }
                        }
                    };
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, resize_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let allocator = SegregatedAllocator::new(ScopedHeap::default(), SingleThreadedLock::new());
        self.run_with_allocator(&allocator, allocation_limit)
    }

    /// Run these test operations with the given allocator and allocation limit.
    pub fn run_with_allocator<A, L>(
        &self,
        allocator: &SegregatedAllocator<A, L>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator,
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Fill an allocation with its id's byte pattern.
        let fill = |ptr: NonNull<[u8]>, byte: u8| unsafe {
            ptr.cast::<u8>().write_bytes(byte, ptr.len());
        };

        // Assert that the first `len` bytes of an allocation still hold the
        // given pattern: nothing else scribbled over it, the allocator
        // included.
        let check_pattern = |ptr: NonNull<[u8]>, len: usize, byte: u8| -> Result<(), String> {
            let slice = unsafe { ptr.as_ref() };
            ensure!(
                slice[..len].iter().all(|b| *b == byte),
                "allocation at {ptr:p} lost its contents (expected {byte:#x})",
            );
            Ok(())
        };

        // Deallocate the allocation with the given id.
        let dealloc = |id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("deallocating id{id} -> {alloc:?}");
            check_pattern(alloc.ptr, alloc.ptr.len(), pattern(id))?;
            fill(alloc.ptr, FREE_POISON_PATTERN);
            unsafe {
                if alloc.bytes_api {
                    allocator.deallocate_bytes(alloc.ptr.cast(), alloc.layout.size());
                } else {
                    allocator.deallocate(alloc.ptr.cast(), alloc.layout);
                }
            }
            Ok(())
        };

        // Assert that the given allocation satisfies its requested layout.
        let assert_fits_layout =
            |ptr: NonNull<[u8]>, layout: std::alloc::Layout| -> Result<(), String> {
                ensure!(
                    layout.size() <= ptr.len(),
                    "actual allocated size is less than expected layout size",
                );
                ensure!(
                    layout.align().trailing_zeros()
                        <= (ptr.cast::<u8>().as_ptr() as usize).trailing_zeros(),
                    "actual allocated alignment is less than expected layout alignment",
                );
                Ok(())
            };

        // Assert that the given allocation is not overlapping with any other
        // live allocations.
        let assert_not_overlapping = |live: &LiveMap, ptr: NonNull<[u8]>| -> Result<(), String> {
            let ptr_start = ptr.cast::<u8>().as_ptr() as usize;
            let ptr_end = ptr_start + ptr.len();
            for other in live.map.values() {
                let other_start = other.ptr.cast::<u8>().as_ptr() as usize;
                let other_end = other_start + other.ptr.len();
                ensure!(
                    ptr_end <= other_start || other_end <= ptr_start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        // Process a new allocation, checking properties and inserting it into
        // the live set.
        let new_alloc = |live: &mut LiveMap,
                         id: u32,
                         alloc: LiveAlloc|
         -> Result<(), String> {
            log::debug!("new allocation: id{id} -> {alloc:?}");

            assert_fits_layout(alloc.ptr, alloc.layout)?;
            assert_not_overlapping(live, alloc.ptr)?;
            fill(alloc.ptr, pattern(id));

            live.insert(id, alloc);
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, layout } => {
                    if live.beyond_allocation_limit(layout.size) {
                        continue;
                    }
                    if let Some(old_alloc) = live.remove(*id) {
                        dealloc(*id, old_alloc)?;
                    }

                    let layout = layout.alloc_layout();
                    if let Ok(ptr) = allocator.allocate(layout) {
                        new_alloc(
                            &mut live,
                            *id,
                            LiveAlloc {
                                ptr,
                                layout,
                                bytes_api: false,
                            },
                        )?;
                    }
                }

                Op::AllocBytes { id, size } => {
                    let size = usize::from(*size);
                    if live.beyond_allocation_limit(size) {
                        continue;
                    }
                    if let Some(old_alloc) = live.remove(*id) {
                        dealloc(*id, old_alloc)?;
                    }

                    if let Ok(ptr) = allocator.allocate_bytes(size) {
                        new_alloc(&mut live, *id, LiveAlloc::from_bytes(ptr, size))?;
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        dealloc(*id, alloc)?;
                    }
                }

                Op::Grow { id, layout } | Op::Shrink { id, layout } => {
                    let grow = matches!(op, Op::Grow { .. });
                    let new_layout = layout.alloc_layout();
                    let Some(old_alloc) = live.remove(*id) else {
                        continue;
                    };

                    let ok_size = if grow {
                        old_alloc.layout.size() <= new_layout.size()
                    } else {
                        old_alloc.layout.size() >= new_layout.size()
                    };
                    if !ok_size || live.beyond_allocation_limit(new_layout.size()) {
                        // Cannot resize in that direction; just put it back
                        // unmodified.
                        live.insert(*id, old_alloc);
                        continue;
                    }

                    let result = unsafe {
                        if grow {
                            allocator.grow(old_alloc.ptr.cast(), old_alloc.layout, new_layout)
                        } else {
                            allocator.shrink(old_alloc.ptr.cast(), old_alloc.layout, new_layout)
                        }
                    };
                    match result {
                        Ok(new_ptr) => {
                            let kept = old_alloc.layout.size().min(new_layout.size());
                            check_pattern(new_ptr, kept, pattern(*id))?;
                            new_alloc(
                                &mut live,
                                *id,
                                LiveAlloc {
                                    ptr: new_ptr,
                                    layout: new_layout,
                                    bytes_api: false,
                                },
                            )?;
                        }
                        Err(_) => {
                            // Resizing failed; just put it back unmodified.
                            live.insert(*id, old_alloc);
                        }
                    }
                }

                Op::ReallocBytes { id, size } => {
                    let size = usize::from(*size);
                    let Some(old_alloc) = live.remove(*id) else {
                        continue;
                    };
                    if !old_alloc.bytes_api || live.beyond_allocation_limit(size) {
                        live.insert(*id, old_alloc);
                        continue;
                    }

                    // The old contents are not carried over, so poison them
                    // first to make sure nothing relies on them.
                    check_pattern(old_alloc.ptr, old_alloc.ptr.len(), pattern(*id))?;
                    fill(old_alloc.ptr, FREE_POISON_PATTERN);
                    let old_size = old_alloc.layout.size();
                    // On failure the old block is gone too, so there is nothing
                    // to put back.
                    let result =
                        unsafe { allocator.reallocate_bytes(old_alloc.ptr.cast(), old_size, size) };
                    if let Ok(ptr) = result {
                        new_alloc(&mut live, *id, LiveAlloc::from_bytes(ptr, size))?;
                    }
                }
            }
        }

        // Finally, deallocate any remaining live allocations.
        for (id, alloc) in mem::take(&mut live.map) {
            dealloc(id, alloc)?;
        }

        Ok(())
    }
}

/// An underlying allocator that releases everything still allocated from it
/// when it is dropped.
///
/// `SegregatedAllocator` never gives its arenas back, so without this every
/// test run would leak them.
#[derive(Default)]
pub struct ScopedHeap {
    live: RefCell<BTreeMap<usize, std::alloc::Layout>>,
}

impl ScopedHeap {
    /// The number of blocks currently allocated from this heap.
    pub fn live_blocks(&self) -> usize {
        self.live.borrow().len()
    }
}

unsafe impl Allocator for ScopedHeap {
    fn allocate(
        &self,
        layout: std::alloc::Layout,
    ) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        let ptr = Global.allocate(layout)?;
        if layout.size() != 0 {
            self.live
                .borrow_mut()
                .insert(ptr.cast::<u8>().as_ptr() as usize, layout);
        }
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: std::alloc::Layout) {
        if layout.size() != 0 {
            let removed = self.live.borrow_mut().remove(&(ptr.as_ptr() as usize));
            debug_assert_eq!(removed, Some(layout), "deallocating an unknown block");
        }
        Global.deallocate(ptr, layout);
    }
}

impl Drop for ScopedHeap {
    fn drop(&mut self) {
        for (addr, layout) in mem::take(self.live.get_mut()) {
            // Safety: every entry was allocated by `Global` with this layout
            // and has not been deallocated.
            unsafe { Global.deallocate(NonNull::new_unchecked(addr as *mut u8), layout) };
        }
    }
}

/// The byte pattern a live allocation with the given id is filled with.
///
/// Never equal to `FREE_POISON_PATTERN`.
fn pattern(id: u32) -> u8 {
    (id as u8) & 0x7F
}

// Freed memory is filled with a poison pattern, to catch the allocator handing
// out a block that is still live somewhere else.
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    /// Pointer and usable length.
    ptr: NonNull<[u8]>,
    /// Requested layout at allocation time.
    layout: std::alloc::Layout,
    /// Was this allocated with the byte-oriented API?
    bytes_api: bool,
}

impl LiveAlloc {
    fn from_bytes(ptr: NonNull<u8>, size: usize) -> Self {
        LiveAlloc {
            ptr: NonNull::slice_from_raw_parts(ptr, size),
            layout: std::alloc::Layout::from_size_align(size, ALIGN)
                .expect("byte sizes in tests are small"),
            bytes_api: true,
        }
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc {
            ptr,
            layout,
            bytes_api,
        } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &ptr.len())
            .field("layout", &layout)
            .field("bytes_api", &bytes_api)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include the size of any extra bytes that the allocator may have
    /// included.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.layout.size();
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.layout.size();
        Some(alloc)
    }
}
