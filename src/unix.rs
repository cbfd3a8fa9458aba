//! The Unix address space: anonymous mappings for large blocks, and a
//! reserved range of virtual memory for the arena.
//!
//! The arena is not grown with `sbrk`: the C library's own `malloc` may move
//! the program break too, which would break contiguity. Instead a large range
//! is reserved with no access rights on first use, and pages are made
//! readable and writable as the arena's break moves through it.

use core::ptr::{null_mut, NonNull};

use errno::Errno;
use libc::c_void;

use crate::allocators::{round_up, AddressSpace};

// Virtual address space set aside for the arena.
#[cfg(target_pointer_width = "64")]
const ARENA_RESERVATION: usize = 1 << 30;
#[cfg(not(target_pointer_width = "64"))]
const ARENA_RESERVATION: usize = 64 << 20;

/// UnixAddressSpace uses virtual memory to back both the arena and mapped
/// blocks.
///
/// Dropping it releases the whole arena. Mapped regions are not tracked here,
/// and are only given back by `unmap_region`.
#[derive(Default)]
pub struct UnixAddressSpace {
    arena: Option<NonNull<u8>>,
    reserved: usize,
    // Bytes at the start of the arena that are readable and writable
    committed: usize,
    brk: usize,
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
}

// The arena is only ever touched through the allocator that owns this.
unsafe impl Send for UnixAddressSpace {}

unsafe fn mmap(len: usize, prot: libc::c_int) -> Result<NonNull<u8>, Errno> {
    let ptr = libc::mmap(
        // Address we want the memory at. We don't care, so null it is.
        null_mut(),
        len,
        prot,
        // MAP_ANON: We don't want a file descriptor, we're just going to
        //   use the memory.
        //
        // MAP_PRIVATE: We're not sharing this with any other process.
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );

    if ptr == libc::MAP_FAILED {
        return Err(errno::errno());
    }
    NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
}

impl UnixAddressSpace {
    /// Bytes of the arena handed out so far.
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    /// Pages of the arena committed so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Regions mapped so far, including released ones.
    pub fn mappings(&self) -> usize {
        self.mappings
    }

    unsafe fn arena(&mut self) -> Result<NonNull<u8>, Errno> {
        if let Some(arena) = self.arena {
            return Ok(arena);
        }

        let reserved =
            round_up(ARENA_RESERVATION, self.page_size()).ok_or(Errno(libc::ENOMEM))?;
        let arena = mmap(reserved, libc::PROT_NONE)?;
        log::debug!("Reserved {} bytes for the arena at {:?}", reserved, arena);
        self.arena = Some(arena);
        self.reserved = reserved;
        Ok(arena)
    }
}

impl Drop for UnixAddressSpace {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take() {
            let rc = unsafe { libc::munmap(arena.as_ptr() as *mut c_void, self.reserved) };
            if rc != 0 {
                log::debug!("Could not release the arena at {:?}: {}", arena, errno::errno());
            }
        }
    }
}

impl AddressSpace for UnixAddressSpace {
    type Err = Errno;

    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let region = mmap(size, libc::PROT_READ | libc::PROT_WRITE)?;
        self.mappings += 1;
        Ok(region)
    }

    unsafe fn unmap_region(&mut self, start: NonNull<u8>, size: usize) -> Result<(), Errno> {
        if libc::munmap(start.as_ptr() as *mut c_void, size) != 0 {
            return Err(errno::errno());
        }
        Ok(())
    }

    unsafe fn extend_heap(&mut self, delta: usize) -> Result<NonNull<u8>, Errno> {
        let arena = self.arena()?;
        let brk = self
            .brk
            .checked_add(delta)
            .filter(|&brk| brk <= self.reserved)
            .ok_or(Errno(libc::ENOMEM))?;

        if brk > self.committed {
            // reserved is a whole number of pages, so this stays inside it
            let committed = round_up(brk, self.page_size()).ok_or(Errno(libc::ENOMEM))?;
            let rc = libc::mprotect(
                arena.as_ptr().add(self.committed) as *mut c_void,
                committed - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if rc != 0 {
                return Err(errno::errno());
            }
            self.pages += (committed - self.committed) / self.page_size();
            self.committed = committed;
        }

        let start = arena.as_ptr().add(self.brk);
        self.brk = brk;
        Ok(NonNull::new_unchecked(start))
    }

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::alloc::{GlobalAlloc, Layout};

    use test_env_log::test;

    use crate::allocators::{RawAlloc, UnixAllocator};
    use crate::block::{HEADER_SIZE, MMAP_THRESHOLD};

    #[test]
    fn test_extend_heap_is_contiguous() {
        let mut space = UnixAddressSpace::default();
        unsafe {
            let first = space.extend_heap(100).unwrap();
            let second = space.extend_heap(space.page_size() * 3).unwrap();
            assert_eq!(first.as_ptr().add(100), second.as_ptr());
            // Every byte handed out is writable
            core::ptr::write_bytes(first.as_ptr(), 0x5A, 100 + space.page_size() * 3);
        }
        assert_eq!(space.heap_size(), 100 + space.page_size() * 3);
        assert_eq!(space.pages(), 4);

        let too_much = unsafe { space.extend_heap(ARENA_RESERVATION) };
        assert_eq!(too_much.err(), Some(Errno(libc::ENOMEM)));
        assert_eq!(space.heap_size(), 100 + space.page_size() * 3);
    }

    #[test]
    fn test_drop_releases_the_arena() {
        // Never used, so nothing was reserved
        drop(UnixAddressSpace::default());

        // More live mappings than a process is allowed to keep at once
        for _ in 0..100_000 {
            let mut space = UnixAddressSpace::default();
            let start = unsafe { space.extend_heap(64).unwrap() };
            unsafe { core::ptr::write_bytes(start.as_ptr(), 7, 64) };
            assert_eq!(space.pages(), 1);
        }
    }

    #[test]
    fn test_map_and_unmap() {
        let mut space = UnixAddressSpace::default();
        unsafe {
            let region = space.map_region(10_000).unwrap();
            core::ptr::write_bytes(region.as_ptr(), 1, 10_000);
            space.unmap_region(region, 10_000).unwrap();
        }
        assert_eq!(space.mappings(), 1);
    }

    #[test]
    fn test_raw_alloc_on_unix() {
        let mut allocator = RawAlloc::new(UnixAddressSpace::default());

        let small = allocator.allocate(1000);
        let large = allocator.allocate(MMAP_THRESHOLD);
        assert!(!small.is_null() && !large.is_null());
        unsafe {
            core::ptr::write_bytes(small, 3, 1000);
            core::ptr::write_bytes(large, 4, MMAP_THRESHOLD);
        }
        assert_eq!(allocator.provider.heap_size(), MMAP_THRESHOLD);

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.heap_bytes, allocator.provider.heap_size());
        assert_eq!(stats.mapped_bytes, MMAP_THRESHOLD + HEADER_SIZE);

        unsafe {
            allocator.release(large);
            allocator.release(small);
        }
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.mapped_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn test_unix_allocator() {
        let allocator = UnixAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(64, 16).unwrap();
            let p = allocator.alloc(layout);
            assert_eq!(p as usize % 16, 0);

            let layout8 = Layout::new::<[u64; 4]>();
            let q = allocator.alloc_zeroed(layout8) as *mut [u64; 4];
            assert_eq!(*q, [0; 4]);
            (*q)[3] = 42;
            let q = allocator.realloc(q as *mut u8, layout8, 4096) as *mut [u64; 4];
            assert_eq!((*q)[3], 42);

            allocator.dealloc(p, layout);
            allocator.dealloc(q as *mut u8, Layout::from_size_align(4096, 8).unwrap());
        }
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.heap_blocks, 1);
    }
}
