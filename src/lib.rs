#![cfg_attr(not(test), no_std)]

//! A best-fit block allocator.
//!
//! Small requests are carved out of a single, contiguous arena that only ever
//! grows at its end. Every block in the arena carries a header, and the
//! headers form an address-ordered list: freed blocks are merged with their
//! free neighbours, and reused by later requests. Requests whose block would
//! be at least [`MMAP_THRESHOLD`](block/constant.MMAP_THRESHOLD.html) bytes
//! get a page mapping of their own, which is handed straight back to the
//! operating system when released.
//!
//! The memory itself comes from an [`AddressSpace`](allocators/trait.AddressSpace.html):
//! [`UnixAddressSpace`](unix/struct.UnixAddressSpace.html) on Unix, or
//! [`ToyHeap`](allocators/struct.ToyHeap.html) over plain buffers.
//!
//! ## Usage
//!
//! ```no_run
//! use blockheap::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1000).collect();
//!     println!("{:?}", ALLOCATOR.stats());
//!     drop(v);
//! }
//! ```
//!
//! The allocator logs through the `log` crate. A logger that allocates must
//! not be installed in a program that uses this allocator globally, as the
//! allocator lock is held while logging.

pub mod allocators;
pub mod block;
pub mod blocklist;
pub mod directory;
pub mod error;
mod realloc;
#[cfg(feature = "use_libc")]
pub mod unix;

pub use allocators::{
    AddressSpace, Config, Fit, GenericAllocator, RawAlloc, ToyHeap, ToyHeapError, ZeroedRouting,
};
#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use block::{Block, Status, ALIGNMENT, HEADER_SIZE, MMAP_THRESHOLD};
pub use directory::{Directory, Stats, Validity};
pub use error::AllocError;
#[cfg(feature = "use_libc")]
pub use unix::UnixAddressSpace;
