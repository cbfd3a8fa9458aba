//! Block headers and the `Block` handle.
//!
//! Every region the allocator hands out is prefixed by a [`BlockHeader`],
//! stored in-line immediately before the payload. The header records the
//! padded payload size, whether the block is free, allocated from the arena,
//! or mapped on its own, and the links to its neighbours in the
//! [`Directory`](../directory/struct.Directory.html).

use core::fmt;
use core::ops::Range;
use core::ptr::{addr_of, NonNull};

use static_assertions::const_assert;

/// Payload sizes are always padded up to a multiple of this many bytes, and
/// every payload starts at an address that is a multiple of it.
pub const ALIGNMENT: usize = 8;

/// Requests whose full block size (header included) reaches this many bytes
/// are mapped on their own instead of being carved out of the arena. The
/// arena is also seeded with exactly this many bytes on first use.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// The space reserved in front of every payload for its header.
pub const HEADER_SIZE: usize = pad(core::mem::size_of::<BlockHeader>());

// Written into every live header. Payload pointers whose header does not carry
// it were not handed out by us (or were merged away).
const HEADER_TAG: u32 = 0xB10C_4EAD;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::align_of::<BlockHeader>() <= ALIGNMENT);
const_assert!(MMAP_THRESHOLD > HEADER_SIZE + ALIGNMENT);

/// Round `size` up to the next multiple of [`ALIGNMENT`].
pub const fn pad(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// The full size (header plus padded payload) of a block holding `size`
/// bytes, or `None` if that does not fit in a `usize`.
pub fn full_size(size: usize) -> Option<usize> {
    size.checked_add(HEADER_SIZE + ALIGNMENT - 1)
        .map(|s| s & !(ALIGNMENT - 1))
}

/// What a block is currently used for.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Arena memory available for reuse.
    Free = 0,
    /// Arena memory handed out to a caller.
    Allocated = 1,
    /// A region mapped for a single large request. Never split or merged.
    Mapped = 2,
}

impl Status {
    fn from_raw(raw: u8) -> Option<Status> {
        match raw {
            0 => Some(Status::Free),
            1 => Some(Status::Allocated),
            2 => Some(Status::Mapped),
            _ => None,
        }
    }
}

/// The header in front of every payload.
///
/// `size` is the padded payload size, not counting the header itself.
#[repr(C, align(8))]
pub struct BlockHeader {
    size: usize,
    prev: Option<Block>,
    next: Option<Block>,
    status: Status,
    tag: u32,
}

/// An enum for easy comparison of blocks and their order
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a header living in arena or mapped memory.
///
/// Handles are plain pointers and are freely copied; the
/// [`Directory`](../directory/struct.Directory.html) that links a block owns
/// it, and is the only thing that should splice or resize it.
///
/// Invariant: `header` points to a header written by [`Block::write`] whose
/// memory has not been given back to the address space provider.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

impl Block {
    /// Write a fresh, unlinked header at `start` and return a handle to it.
    ///
    /// # Safety
    ///
    /// `start` must be aligned to [`ALIGNMENT`] and point to at least
    /// `HEADER_SIZE + size` bytes of memory owned by the allocator and not
    /// covered by any other block. `size` must already be padded.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn write(start: NonNull<u8>, size: usize, status: Status) -> Block {
        debug_assert_eq!(size, pad(size), "block sizes are always padded");
        debug_assert_eq!(start.as_ptr() as usize % ALIGNMENT, 0);
        let header: NonNull<BlockHeader> = start.cast();
        core::ptr::write(
            header.as_ptr(),
            BlockHeader {
                size,
                prev: None,
                next: None,
                status,
                tag: HEADER_TAG,
            },
        );
        Block { header }
    }

    /// Recover the block in front of a payload pointer.
    ///
    /// This is the single place payload/header offset arithmetic happens. It
    /// rejects misaligned pointers and headers that do not carry our tag or a
    /// valid status.
    ///
    /// # Safety
    ///
    /// The `HEADER_SIZE` bytes in front of `payload` must be readable.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Option<Block> {
        let addr = payload.as_ptr() as usize;
        if addr % ALIGNMENT != 0 || addr < HEADER_SIZE {
            return None;
        }

        let header = payload.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        // Read field by field: the memory may not hold a header at all.
        if addr_of!((*header).tag).read() != HEADER_TAG {
            return None;
        }
        Status::from_raw((addr_of!((*header).status) as *const u8).read())?;

        Some(Block {
            header: NonNull::new_unchecked(header),
        })
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut BlockHeader {
        &mut *self.header.as_ptr()
    }

    /// The padded payload size, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    /// Header plus payload, in bytes.
    pub fn full_size(&self) -> usize {
        HEADER_SIZE + self.size()
    }

    pub fn status(&self) -> Status {
        self.header_view().status
    }

    pub fn is_free(&self) -> bool {
        self.status() == Status::Free
    }

    /// The first byte of the header.
    pub fn start(&self) -> NonNull<u8> {
        self.header.cast()
    }

    /// The first byte handed out to callers.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.start().as_ptr().add(HEADER_SIZE)) }
    }

    /// One past the last byte of the payload.
    pub fn end(&self) -> *const u8 {
        unsafe { self.start().as_ptr().add(self.full_size()) }
    }

    /// The memory covered by this block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        self.start().as_ptr() as *const u8..self.end()
    }

    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Block) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// # Safety
    ///
    /// The new size must be padded and the memory it covers must belong to
    /// this block.
    pub(crate) unsafe fn set_size(&self, size: usize) {
        debug_assert_eq!(size, pad(size));
        self.header_mut().size = size;
    }

    pub(crate) fn set_status(&self, status: Status) {
        unsafe { self.header_mut().status = status }
    }

    pub(crate) unsafe fn set_next(&self, next: Option<Block>) {
        self.header_mut().next = next;
    }

    pub(crate) unsafe fn set_prev(&self, prev: Option<Block>) {
        self.header_mut().prev = prev;
    }

    /// Clear the tag of a header that has been merged into a neighbour, so a
    /// stale payload pointer into it is no longer recognised.
    pub(crate) unsafe fn retire(&self) {
        self.header_mut().tag = 0;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:?}, {:?}, {})",
            self.header,
            self.status(),
            self.size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_pad() {
        assert_eq!(pad(0), 0);
        for size in 1..=8 {
            assert_eq!(pad(size), 8);
        }
        assert_eq!(pad(9), 16);
        assert_eq!(pad(100), 104);
        assert_eq!(full_size(100), Some(HEADER_SIZE + 104));
        assert_eq!(full_size(usize::MAX), None);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut memory = [0u64; 32];
        let start = NonNull::new(memory.as_mut_ptr() as *mut u8).unwrap();

        let block = unsafe { Block::write(start, 64, Status::Allocated) };
        assert_eq!(block.full_size(), HEADER_SIZE + 64);
        assert_eq!(block.payload().as_ptr() as usize - start.as_ptr() as usize, HEADER_SIZE);

        let found = unsafe { Block::from_payload(block.payload()) };
        assert_eq!(found, Some(block));

        // Misaligned payloads are rejected outright
        let crooked = unsafe { NonNull::new_unchecked(block.payload().as_ptr().add(1)) };
        assert_eq!(unsafe { Block::from_payload(crooked) }, None);

        // Once retired, the header is no longer recognised
        unsafe { block.retire() };
        assert_eq!(unsafe { Block::from_payload(block.payload()) }, None);
    }

    #[test]
    fn test_relation() {
        let mut memory = [0u64; 64];
        let base = memory.as_mut_ptr() as *mut u8;
        let (first, second) = unsafe {
            let first = Block::write(NonNull::new_unchecked(base), 32, Status::Free);
            let second = Block::write(
                NonNull::new_unchecked(base.add(HEADER_SIZE + 32)),
                32,
                Status::Free,
            );
            (first, second)
        };

        assert!(matches!(first.relation(&second), Relation::AdjacentBefore));
        assert!(matches!(second.relation(&first), Relation::AdjacentAfter));
        assert!(matches!(first.relation(&first), Relation::Overlapping));
        assert_eq!(first.end(), second.start().as_ptr() as *const u8);
    }
}
