#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

// Without the `log` feature, logging compiles away but still type-checks its
// arguments.
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {
        if false {
            let _ = core::format_args!($($arg)*);
        }
    };
}

#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => { debug!($($arg)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => { debug!($($arg)*) };
}

mod fallback;
pub use fallback::{FallbackAllocator, OomHandler};

mod segregated;
pub use segregated::{Lock, SegregatedAllocator, SingleThreadedLock};
#[cfg(feature = "spin")]
pub use segregated::SpinLock;

#[cfg(test)]
mod test_util;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// The alignment unit. Every small block size is a multiple of this, and every
/// small block is aligned to it.
pub const ALIGN: usize = 8;

/// The largest request, in bytes, served from the free lists. Anything larger
/// goes straight to the [`FallbackAllocator`].
pub const MAX_BYTES: usize = 128;

/// The number of size classes: one per multiple of [`ALIGN`] up to
/// [`MAX_BYTES`].
pub const NUM_SIZE_CLASSES: usize = MAX_BYTES / ALIGN;

/// How many blocks a refill asks the arena for at once.
pub const REFILL_BLOCKS: usize = 20;

/// Round `bytes` up to the next multiple of [`ALIGN`].
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// The index of the size class that serves requests of `bytes` bytes.
///
/// Zero-byte requests share the smallest class.
///
/// `bytes` must not exceed [`MAX_BYTES`].
#[inline]
pub const fn size_class_index(bytes: usize) -> usize {
    debug_assert!(bytes <= MAX_BYTES);
    if bytes == 0 {
        0
    } else {
        (bytes + ALIGN - 1) / ALIGN - 1
    }
}

/// The block size of the size class at `index`.
#[inline]
pub const fn size_class_bytes(index: usize) -> usize {
    debug_assert!(index < NUM_SIZE_CLASSES);
    (index + 1) * ALIGN
}

/// The layout used for byte-oriented requests of `bytes` bytes.
#[inline]
fn bytes_layout(bytes: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(bytes, ALIGN).map_err(|_| AllocError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(size_class_index(0), 0);
        assert_eq!(size_class_index(1), 0);
        assert_eq!(size_class_index(8), 0);
        assert_eq!(size_class_index(9), 1);
        assert_eq!(size_class_index(24), 2);
        assert_eq!(size_class_index(MAX_BYTES), NUM_SIZE_CLASSES - 1);

        for index in 0..NUM_SIZE_CLASSES {
            assert_eq!(size_class_index(size_class_bytes(index)), index);
        }
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(13), 16);
        assert_eq!(round_up(121), 128);
    }
}
