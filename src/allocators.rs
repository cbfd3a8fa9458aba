//! Basic allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe allocator context. It
//! owns a [`Directory`](../directory/struct.Directory.html) and an
//! [`AddressSpace`](trait.AddressSpace.html) provider, and decides for each
//! request whether it is served from the arena or from its own mapping.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` over the
//! [`UnixAddressSpace`](../unix/struct.UnixAddressSpace.html), ready to be
//! used as the global allocator.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` carves its arena and its mappings out of caller-provided buffers.
//! It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{null_mut, NonNull};

use log::{debug, trace};
use spin::{Mutex, MutexGuard, Once};

use crate::block::{full_size, Block, Status, ALIGNMENT, HEADER_SIZE, MMAP_THRESHOLD};
use crate::directory::{Direction, Directory, Stats, Validity};
use crate::error::AllocError;
#[cfg(feature = "use_libc")]
use crate::unix::UnixAddressSpace;

// Round up value to the nearest multiple of increment, or None if that does
// not fit in a usize
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

/// The source of raw memory: page mappings for large blocks, and a single
/// arena that only ever grows at its end.
pub trait AddressSpace {
    type Err: fmt::Debug;

    /// Map a fresh region of at least `size` bytes.
    ///
    /// # Safety
    ///
    /// The returned memory must be aligned to at least
    /// [`ALIGNMENT`](../block/constant.ALIGNMENT.html), readable, writable,
    /// and untracked by any other Rust code.
    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a region returned by `map_region`, with the same `size`.
    ///
    /// # Safety
    ///
    /// Nothing may touch the region afterwards.
    unsafe fn unmap_region(&mut self, start: NonNull<u8>, size: usize) -> Result<(), Self::Err>;

    /// Grow the arena by exactly `delta` bytes, and return the start of the
    /// new bytes.
    ///
    /// # Safety
    ///
    /// The new bytes must directly follow the ones returned by the previous
    /// call, and the first call must return memory aligned to at least
    /// [`ALIGNMENT`](../block/constant.ALIGNMENT.html).
    unsafe fn extend_heap(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err>;

    fn page_size(&self) -> usize;
}

/// How a free block is picked for reuse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fit {
    /// The smallest free block that is large enough.
    Best,
    /// The lowest-addressed free block that is large enough.
    First,
}

/// Which threshold routes zero-filled allocations to a mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZeroedRouting {
    /// The same `mmap_threshold` as every other allocation.
    Uniform,
    /// The provider's page size. Anything of a page or more gets its own
    /// mapping.
    PageSize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Full block sizes of at least this many bytes are mapped directly. The
    /// arena is seeded with this many bytes on first use.
    pub mmap_threshold: usize,
    pub zeroed_routing: ZeroedRouting,
    pub fit: Fit,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            mmap_threshold: MMAP_THRESHOLD,
            zeroed_routing: ZeroedRouting::Uniform,
            fit: Fit::Best,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// A raw allocator context: routes requests to the arena or to a mapping,
/// reuses and merges freed arena blocks, and resizes allocations.
///
/// Every operation runs to completion without locking; wrap it in a
/// [`GenericAllocator`](struct.GenericAllocator.html) to share it.
pub struct RawAlloc<G> {
    pub provider: G,
    pub directory: Directory,
    pub(crate) config: Config,
}

impl<G: AddressSpace + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

// Collapse a fallible result into the null-on-failure convention.
fn into_raw<E: fmt::Debug>(result: Result<Option<NonNull<u8>>, AllocError<E>>) -> *mut u8 {
    match result {
        Ok(Some(payload)) => payload.as_ptr(),
        Ok(None) => null_mut(),
        Err(err) => {
            trace!("Allocation failed: {}", err);
            null_mut()
        }
    }
}

impl<G: AddressSpace> RawAlloc<G> {
    /// Create a new `RawAlloc` with the default configuration.
    pub fn new(provider: G) -> Self {
        RawAlloc::with_config(provider, Config::default())
    }

    /// Create a new `RawAlloc`.
    ///
    /// Panics if `config.mmap_threshold` is not a multiple of the alignment,
    /// or too small to hold a header and a minimal payload.
    pub fn with_config(provider: G, config: Config) -> Self {
        assert!(
            config.mmap_threshold % ALIGNMENT == 0
                && config.mmap_threshold > HEADER_SIZE + ALIGNMENT,
            "Unusable mmap threshold {}",
            config.mmap_threshold
        );
        RawAlloc {
            provider,
            directory: Directory::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get statistics on this allocator, and verify validity of the Directory
    pub fn stats(&self) -> (Validity, Stats) {
        self.directory.stats()
    }

    /// Allocate `size` bytes. Returns `Ok(None)` for a zero-sized request,
    /// without touching the directory.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError<G::Err>> {
        let limit = self.config.mmap_threshold;
        self.allocate_below(size, limit)
    }

    /// Allocate `size` bytes, returning null for a zero-sized request or on
    /// failure.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        into_raw(self.try_allocate(size))
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn try_zero_allocate(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError<G::Err>> {
        let bytes = count.checked_mul(size).ok_or(AllocError::Overflow)?;
        let limit = match self.config.zeroed_routing {
            ZeroedRouting::Uniform => self.config.mmap_threshold,
            ZeroedRouting::PageSize => self.provider.page_size(),
        };

        let payload = self.allocate_below(bytes, limit)?;
        if let Some(payload) = payload {
            unsafe { core::ptr::write_bytes(payload.as_ptr(), 0, bytes) };
        }
        Ok(payload)
    }

    /// Allocate `count * size` zeroed bytes, returning null for a zero-sized
    /// request or on failure.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        into_raw(self.try_zero_allocate(count, size))
    }

    /// Release an allocation. Null pointers and blocks that are already free
    /// are ignored.
    ///
    /// Arena blocks are merged with any free neighbours; mapped blocks are
    /// handed back to the provider.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator. Foreign
    /// pointers are usually detected, but reading their would-be header must
    /// at least be possible.
    pub unsafe fn try_release(&mut self, ptr: *mut u8) -> Result<(), AllocError<G::Err>> {
        let payload = match NonNull::new(ptr) {
            None => return Ok(()),
            Some(p) => p,
        };
        let block = self
            .directory
            .block_of(payload)
            .ok_or(AllocError::InvalidPointer)?;

        match block.status() {
            Status::Free => Ok(()),
            Status::Allocated => {
                block.set_status(Status::Free);
                self.directory.coalesce(block, Direction::Both, 0);
                Ok(())
            }
            Status::Mapped => {
                let full = block.full_size();
                self.directory.remove(block);
                if let Err(err) = self.provider.unmap_region(block.start(), full) {
                    self.directory.relink_mapped(block);
                    return Err(AllocError::Unmap(err));
                }
                debug!("Unmapped {} bytes at {:?}", full, block.start());
                Ok(())
            }
        }
    }

    /// Release an allocation, ignoring failures.
    ///
    /// # Safety
    ///
    /// See [`try_release`](#method.try_release).
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if let Err(err) = self.try_release(ptr) {
            trace!("Ignoring release of {:?}: {}", ptr, err);
        }
    }

    fn allocate_below(
        &mut self,
        size: usize,
        limit: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError<G::Err>> {
        if size == 0 {
            return Ok(None);
        }

        let full = full_size(size).ok_or(AllocError::Overflow)?;
        let block = if full >= limit {
            trace!("{} bytes ({} with header) routed to a mapping", size, full);
            self.map_block(full)?
        } else {
            self.heap_block(full)?
        };
        Ok(Some(block.payload()))
    }

    fn map_block(&mut self, full: usize) -> Result<Block, AllocError<G::Err>> {
        let start = unsafe { self.provider.map_region(full) }.map_err(AllocError::Exhausted)?;
        debug!("Mapped {} bytes at {:?}", full, start);
        unsafe {
            let block = Block::write(start, full - HEADER_SIZE, Status::Mapped);
            Ok(self.directory.insert(block, None))
        }
    }

    fn heap_block(&mut self, full: usize) -> Result<Block, AllocError<G::Err>> {
        if !self.directory.is_seeded() {
            self.seed()?;
        }
        let size = full - HEADER_SIZE;

        let fit = match self.config.fit {
            Fit::Best => self.directory.find_best_free(size),
            Fit::First => self.directory.find_first_free(size),
        };
        if let Some(block) = fit {
            unsafe {
                if let Some(rest) = self.directory.split(block, size) {
                    self.directory.coalesce(rest, Direction::Forward, 0);
                }
            }
            block.set_status(Status::Allocated);
            trace!("Reusing {:?}", block);
            return Ok(block);
        }

        // A free tail is always too small here, or the search would have
        // found it. Growing it beats stacking a new block behind it.
        if let Some(tail) = self.directory.tail().filter(Block::is_free) {
            self.extend_block(tail, size)?;
            tail.set_status(Status::Allocated);
            trace!("Grew the free tail into {:?}", tail);
            return Ok(tail);
        }

        let start = self.extend_heap(full)?;
        unsafe {
            let block = Block::write(start, size, Status::Allocated);
            Ok(self.directory.insert(block, None))
        }
    }

    // The very first arena request claims a whole threshold's worth of arena
    // up front, as a single free block.
    fn seed(&mut self) -> Result<(), AllocError<G::Err>> {
        let bytes = self.config.mmap_threshold;
        let start = self.extend_heap(bytes)?;
        debug!("Seeded the arena with {} bytes at {:?}", bytes, start);
        unsafe {
            let block = Block::write(start, bytes - HEADER_SIZE, Status::Free);
            self.directory.insert(block, None);
        }
        Ok(())
    }

    fn extend_heap(&mut self, delta: usize) -> Result<NonNull<u8>, AllocError<G::Err>> {
        let start = unsafe { self.provider.extend_heap(delta) }.map_err(AllocError::Exhausted)?;
        debug_assert!(
            self.directory
                .tail()
                .map_or(true, |tail| tail.end() == start.as_ptr() as *const u8),
            "The arena must grow contiguously"
        );
        trace!("Extended the arena by {} bytes at {:?}", delta, start);
        Ok(start)
    }

    /// Grow the arena's tail block in place to hold `size` payload bytes.
    /// On failure the block is unchanged.
    pub(crate) fn extend_block(
        &mut self,
        tail: Block,
        size: usize,
    ) -> Result<(), AllocError<G::Err>> {
        debug_assert_eq!(Some(tail), self.directory.tail());
        debug_assert!(size > tail.size());
        self.extend_heap(size - tail.size())?;
        unsafe { tail.set_size(size) };
        Ok(())
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator.
/// Every entry point holds the lock for the whole call, and the `RawAlloc` is
/// created on first use.
pub struct GenericAllocator<G> {
    raw: Once<Mutex<RawAlloc<G>>>,
}

impl<G: AddressSpace + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator { raw: Once::new() }
    }
}

impl<G: AddressSpace + Default> GenericAllocator<G> {
    /// Lock the underlying RawAlloc.
    ///
    /// Allocation blocks, on every thread, while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, RawAlloc<G>> {
        self.raw
            .call_once(|| Mutex::new(RawAlloc::default()))
            .lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }
}

// Payloads are only ALIGNMENT-aligned. Larger alignments are served by
// over-allocating, and stashing the real payload pointer in the word just
// before the aligned address.
#[allow(clippy::cast_ptr_alignment)]
unsafe fn alloc_over_aligned<G: AddressSpace>(
    raw: &mut RawAlloc<G>,
    layout: Layout,
    zeroed: bool,
) -> *mut u8 {
    let padded = match layout.size().checked_add(layout.align()) {
        Some(padded) => padded,
        None => return null_mut(),
    };
    let base = if zeroed {
        raw.zero_allocate(1, padded)
    } else {
        raw.allocate(padded)
    };
    if base.is_null() {
        return base;
    }

    // base is ALIGNMENT-aligned, so this leaves at least one word in front
    let aligned = base.add(layout.align() - base as usize % layout.align());
    (aligned as *mut *mut u8).sub(1).write(base);
    aligned
}

#[allow(clippy::cast_ptr_alignment)]
unsafe fn over_aligned_base(ptr: *mut u8) -> *mut u8 {
    (ptr as *mut *mut u8).sub(1).read()
}

unsafe impl<G: AddressSpace + Default> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.lock();
        if layout.align() <= ALIGNMENT {
            raw.allocate(layout.size())
        } else {
            alloc_over_aligned(&mut raw, layout, false)
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.lock();
        if layout.align() <= ALIGNMENT {
            raw.zero_allocate(1, layout.size())
        } else {
            alloc_over_aligned(&mut raw, layout, true)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut raw = self.lock();
        if layout.align() <= ALIGNMENT {
            raw.release(ptr)
        } else {
            raw.release(over_aligned_base(ptr))
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.lock().reallocate(ptr, new_size);
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let fresh = self.alloc(new_layout);
        if !fresh.is_null() {
            core::ptr::copy_nonoverlapping(ptr, fresh, core::cmp::min(layout.size(), new_size));
            self.dealloc(ptr, layout);
        }
        fresh
    }
}

/// The allocator to install with `#[global_allocator]` on Unix.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<UnixAddressSpace>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

/// An address space over two borrowed buffers: one for the arena, one for
/// mapped regions.
pub struct ToyHeap<'a> {
    heap: NonNull<u8>,
    heap_capacity: usize,
    brk: usize,
    maps: NonNull<u8>,
    maps_capacity: usize,
    maps_used: usize,
    pub page_size: usize,
    /// Bytes currently mapped, as requested.
    pub mapped_bytes: usize,
    pub mappings: usize,
    pub unmappings: usize,
    _storage: PhantomData<&'a mut [u64]>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ToyHeapError {
    /// The buffer backing the arena or the mappings is used up.
    Overflow,
    /// The region being unmapped was never mapped.
    UnknownRegion,
}

impl<'a> ToyHeap<'a> {
    pub fn new(heap: &'a mut [u64], maps: &'a mut [u64]) -> Self {
        let heap_capacity = core::mem::size_of_val(heap);
        let maps_capacity = core::mem::size_of_val(maps);
        ToyHeap {
            heap: NonNull::from(heap).cast(),
            heap_capacity,
            brk: 0,
            maps: NonNull::from(maps).cast(),
            maps_capacity,
            maps_used: 0,
            page_size: 4096,
            mapped_bytes: 0,
            mappings: 0,
            unmappings: 0,
            _storage: PhantomData,
        }
    }

    /// How far the arena has been extended.
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    pub fn heap_start(&self) -> *const u8 {
        self.heap.as_ptr()
    }
}

unsafe impl Send for ToyHeap<'_> {}

impl AddressSpace for ToyHeap<'_> {
    type Err = ToyHeapError;

    unsafe fn map_region(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let claimed = round_up(size, self.page_size).ok_or(ToyHeapError::Overflow)?;
        let used = self
            .maps_used
            .checked_add(claimed)
            .filter(|&used| used <= self.maps_capacity)
            .ok_or(ToyHeapError::Overflow)?;

        let start = self.maps.as_ptr().add(self.maps_used);
        self.maps_used = used;
        self.mapped_bytes += size;
        self.mappings += 1;
        Ok(NonNull::new_unchecked(start))
    }

    unsafe fn unmap_region(&mut self, start: NonNull<u8>, size: usize) -> Result<(), Self::Err> {
        let offset = (start.as_ptr() as usize).wrapping_sub(self.maps.as_ptr() as usize);
        if offset >= self.maps_used || size > self.mapped_bytes {
            return Err(ToyHeapError::UnknownRegion);
        }

        // Only the most recent region can be handed out again
        let claimed = round_up(size, self.page_size).ok_or(ToyHeapError::UnknownRegion)?;
        if offset + claimed == self.maps_used {
            self.maps_used = offset;
        }
        self.mapped_bytes -= size;
        self.unmappings += 1;
        Ok(())
    }

    unsafe fn extend_heap(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err> {
        let brk = self
            .brk
            .checked_add(delta)
            .filter(|&brk| brk <= self.heap_capacity)
            .ok_or(ToyHeapError::Overflow)?;

        let start = self.heap.as_ptr().add(self.brk);
        self.brk = brk;
        Ok(NonNull::new_unchecked(start))
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
