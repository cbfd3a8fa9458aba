//! Resizing allocations.
//!
//! An arena block is resized in place whenever possible: by growing the arena
//! under it when it is the last block, or by absorbing the free blocks that
//! follow it. Only when neither works, or when the block is (or becomes) big
//! enough to be mapped, is the data copied to a new block.

use core::cmp::min;
use core::ptr::NonNull;

use log::trace;

use crate::allocators::{AddressSpace, RawAlloc};
use crate::block::{full_size, pad, Block, Status};
use crate::directory::Direction;
use crate::error::AllocError;

impl<G: AddressSpace> RawAlloc<G> {
    /// Resize an allocation to `size` bytes, preserving its first
    /// `min(old, new)` bytes.
    ///
    /// A null `ptr` behaves as [`try_allocate`](#method.try_allocate); a zero
    /// `size` releases `ptr` and returns `Ok(None)`. The returned pointer is
    /// the same as `ptr` whenever the block could be resized in place. A
    /// pointer to an already free block gives `Ok(None)` and changes nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator.
    pub unsafe fn try_reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError<G::Err>> {
        let payload = match NonNull::new(ptr) {
            None => return self.try_allocate(size),
            Some(p) => p,
        };
        if size == 0 {
            self.try_release(ptr)?;
            return Ok(None);
        }

        let block = self
            .directory
            .block_of(payload)
            .ok_or(AllocError::InvalidPointer)?;
        let full = full_size(size).ok_or(AllocError::Overflow)?;
        match block.status() {
            Status::Free => return Ok(None),
            Status::Mapped => return self.relocate(block, size),
            Status::Allocated if full >= self.config.mmap_threshold => {
                return self.relocate(block, size)
            }
            Status::Allocated => {}
        }

        let needed = pad(size);
        let extent = block.size();
        if self.grow_in_place(block, needed) || self.refit_forward(block, needed) {
            return Ok(Some(payload));
        }
        // Absorbing its neighbours may have made it the tail
        if self.grow_in_place(block, needed) {
            return Ok(Some(payload));
        }

        self.restore_extent(block, extent);
        self.relocate(block, size)
    }

    /// Resize an allocation, returning null when `size` is zero or on
    /// failure. On failure the original allocation is untouched.
    ///
    /// # Safety
    ///
    /// See [`try_reallocate`](#method.try_reallocate).
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.try_reallocate(ptr, size) {
            Ok(Some(payload)) => payload.as_ptr(),
            Ok(None) => core::ptr::null_mut(),
            Err(err) => {
                trace!("Reallocation of {:?} to {} bytes failed: {}", ptr, size, err);
                core::ptr::null_mut()
            }
        }
    }

    // Grow the arena under the tail block. Anything else, including a tail
    // that is already large enough, is left to the other strategies.
    fn grow_in_place(&mut self, block: Block, needed: usize) -> bool {
        if block.next().is_some() || block.size() >= needed {
            return false;
        }
        match self.extend_block(block, needed) {
            Ok(()) => {
                trace!("Grew {:?} in place", block);
                true
            }
            Err(err) => {
                trace!("Could not grow {:?} in place: {}", block, err);
                false
            }
        }
    }

    // Absorb just enough of the following free blocks to hold `needed` bytes,
    // and hand any excess back as a free block. This also shrinks blocks.
    //
    // When the following blocks are not enough, the block keeps whatever it
    // absorbed; see restore_extent.
    fn refit_forward(&mut self, block: Block, needed: usize) -> bool {
        block.set_status(Status::Free);
        let fits = unsafe {
            self.directory.coalesce(block, Direction::Forward, needed);
            if block.size() >= needed {
                self.split_excess(block, needed);
                true
            } else {
                false
            }
        };
        block.set_status(Status::Allocated);
        fits
    }

    // Give back what refit_forward absorbed, so the block covers `extent`
    // bytes again.
    fn restore_extent(&mut self, block: Block, extent: usize) {
        if block.size() > extent {
            block.set_status(Status::Free);
            unsafe { self.split_excess(block, extent) };
            block.set_status(Status::Allocated);
        }
    }

    // Split a free block down to `size` bytes, merging the remainder with
    // whatever free space follows it.
    unsafe fn split_excess(&mut self, block: Block, size: usize) {
        if let Some(rest) = self.directory.split(block, size) {
            self.directory.coalesce(rest, Direction::Forward, 0);
        }
    }

    // Move the data to a fresh allocation and release the old block. If the
    // new allocation fails, the old block is left as it was. If releasing the
    // old block fails, it stays registered and the move still stands.
    fn relocate(
        &mut self,
        block: Block,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError<G::Err>> {
        let fresh = match self.try_allocate(size)? {
            Some(fresh) => fresh,
            None => return Ok(None),
        };

        let old = block.payload();
        trace!("Relocating {:?} to {:?}", block, fresh);
        unsafe {
            core::ptr::copy_nonoverlapping(
                old.as_ptr(),
                fresh.as_ptr(),
                min(block.size(), pad(size)),
            );
            if let Err(err) = self.try_release(old.as_ptr()) {
                trace!("Keeping {:?} after moving out of it: {}", block, err);
            }
        }
        Ok(Some(fresh))
    }
}
