//! # Helix Memory Subsystem
//!
//! Page frames and kernel virtual address ranges.
//!
//! ## Components
//!
//! - **Addresses**: Type-safe physical and virtual addresses
//! - **Frames**: Page frame ownership tokens and the [`PageAllocator`] seam
//! - **Ranges**: Virtual range reservation behind [`VirtualRangeAllocator`]
//!
//! The traits are what the rest of the kernel programs against. The
//! concrete allocators in this crate back them with the global heap and a
//! first-fit extent list, which is what the page cache uses before the
//! physical memory manager comes up and in host tests.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod error;
pub mod frame;
pub mod range;

pub use addr::{pages_for, PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use error::{MemoryError, MemoryResult};
pub use frame::{FrameStats, HeapFrameAllocator, PageAllocator, PageHandle};
pub use range::{RangeAllocator, RangeStats, VaRange, VirtualRangeAllocator};
