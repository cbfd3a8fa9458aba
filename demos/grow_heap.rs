//! This is a very minimal example to show using the UnixAddressSpace
//! functions directly.

use blockheap::{AddressSpace, UnixAddressSpace};

fn main() {
    let mut space = UnixAddressSpace::default();
    println!("Page size: {}", space.page_size());

    // The arena grows byte by byte, without gaps
    let first = unsafe { space.extend_heap(8).unwrap() };
    let second = unsafe { space.extend_heap(4096).unwrap() };
    println!("Arena: {:p}, then {:p}", first, second);
    println!("{} bytes in {} pages", space.heap_size(), space.pages());

    // Large blocks get a mapping of their own
    let region = unsafe { space.map_region(256 * 1024).unwrap() };
    println!("Mapped: {:p}", region);
    unsafe { space.unmap_region(region, 256 * 1024).unwrap() };
}
