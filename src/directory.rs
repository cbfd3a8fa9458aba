//! The block directory: every live block the allocator knows about.
//!
//! Arena blocks live in one list ordered by address. Since the arena is a
//! single contiguous region and every byte of it belongs to exactly one block,
//! list neighbours are also address neighbours, which is what makes splitting
//! and coalescing a matter of relinking headers.
//!
//! Mapped blocks are kept in a separate, unordered list. They are only
//! tracked so they can be counted, validated and unlinked on release.

use core::fmt;
use core::ptr::NonNull;

use crate::block::{pad, Block, Relation, Status, ALIGNMENT, HEADER_SIZE};
use crate::blocklist::{BlockIter, BlockList};

/// Which neighbours [`Directory::coalesce`] may absorb.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Only the free blocks following the start block.
    Forward,
    /// Walk back over free predecessors first, then merge forward from there.
    Both,
}

/// Validity contains a representation of all invalid states found in a
/// Directory.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of address-adjacent arena blocks that are both free. Coalescing
    /// should have merged them.
    pub adjacent_frees: usize,
    /// Number of arena blocks that do not start after their predecessor.
    ///
    /// This shouldn't occur.
    pub out_of_orders: usize,
    /// Number of arena blocks overlapping their predecessor.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of arena blocks not starting exactly where their predecessor
    /// ends. The arena is contiguous, so this means memory went missing.
    pub gaps: usize,
    /// Link inconsistencies across both lists.
    pub broken_links: usize,
    /// Blocks whose size is not a multiple of the alignment.
    pub unpadded: usize,
    /// Blocks whose status does not match the list they are in.
    pub misplaced: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.adjacent_frees == 0
            && self.out_of_orders == 0
            && self.overlaps == 0
            && self.gaps == 0
            && self.broken_links == 0
            && self.unpadded == 0
            && self.misplaced == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Sizes are full sizes: header included.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub heap_blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub heap_bytes: usize,
    pub mapped_blocks: usize,
    pub mapped_bytes: usize,
}

/// The registry of every arena and mapped block.
///
/// All splicing goes through here; no other component links or unlinks
/// blocks. Failed lookups, splits and merges are reported as `None` and never
/// leave the directory half-modified.
#[derive(Default)]
pub struct Directory {
    heap: BlockList,
    mapped: BlockList,
    // Blocks inserted into the arena from fresh heap growth.
    heap_allocations: usize,
    // Regions ever mapped.
    mappings: usize,
}

impl Directory {
    pub const fn new() -> Self {
        Directory {
            heap: BlockList::new(),
            mapped: BlockList::new(),
            heap_allocations: 0,
            mappings: 0,
        }
    }

    /// The first (lowest) arena block.
    pub fn head(&self) -> Option<Block> {
        self.heap.head()
    }

    /// The last (highest) arena block.
    pub fn tail(&self) -> Option<Block> {
        self.heap.tail()
    }

    /// Arena blocks, in address order.
    pub fn heap_blocks(&self) -> BlockIter<'_> {
        self.heap.iter()
    }

    /// Mapped blocks, most recent first.
    pub fn mapped_blocks(&self) -> BlockIter<'_> {
        self.mapped.iter()
    }

    pub fn heap_allocations(&self) -> usize {
        self.heap_allocations
    }

    pub fn mappings(&self) -> usize {
        self.mappings
    }

    /// Whether the arena has been seeded.
    pub fn is_seeded(&self) -> bool {
        self.heap_allocations > 0
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.mapped.is_empty()
    }

    /// Register a new block and return it.
    ///
    /// Mapped blocks go to the front of the mapped list. Arena blocks are
    /// linked directly after `after`, or at the tail when no predecessor is
    /// given; on an empty arena the block becomes both head and tail.
    ///
    /// # Safety
    ///
    /// `block` must be a freshly written block not in any list. For arena
    /// blocks, its memory must directly follow `after` (or the current tail).
    pub unsafe fn insert(&mut self, block: Block, after: Option<Block>) -> Block {
        if block.status() == Status::Mapped {
            self.mappings += 1;
            self.mapped.push_front(block);
            return block;
        }

        self.heap_allocations += 1;
        match after {
            Some(prev) => self.heap.insert_after(prev, block),
            None => self.heap.push_back(block),
        }
        block
    }

    /// Unlink a block. Returns `None` if the list it belongs to is empty.
    ///
    /// # Safety
    ///
    /// `block` must be a member of this directory.
    pub unsafe fn remove(&mut self, block: Block) -> Option<Block> {
        match block.status() {
            Status::Mapped => self.mapped.remove(block),
            Status::Free | Status::Allocated => self.heap.remove(block),
        }
    }

    /// Put back a mapped block that was removed, without counting it as a
    /// new mapping.
    pub(crate) unsafe fn relink_mapped(&mut self, block: Block) {
        debug_assert_eq!(block.status(), Status::Mapped);
        self.mapped.push_front(block);
    }

    /// The first free block, in address order, with at least `size` bytes of
    /// (padded) payload.
    pub fn find_first_free(&self, size: usize) -> Option<Block> {
        let size = pad(size);
        self.heap
            .iter()
            .find(|block| block.is_free() && block.size() >= size)
    }

    /// The smallest free block with at least `size` bytes of (padded) payload.
    /// Ties go to the lowest address.
    pub fn find_best_free(&self, size: usize) -> Option<Block> {
        let size = pad(size);
        let mut best: Option<Block> = None;
        for block in self.heap.iter() {
            if !block.is_free() || block.size() < size {
                continue;
            }
            match best {
                Some(b) if b.size() <= block.size() => {}
                _ => best = Some(block),
            }
        }
        best
    }

    /// Shrink a free block to `size` bytes of payload and register the rest as
    /// a new free block directly after it.
    ///
    /// Returns the remainder, or `None` if the block is not free or is too
    /// small to host `size` bytes plus another header and at least
    /// [`ALIGNMENT`] bytes of payload. The status of `block` is left alone.
    ///
    /// # Safety
    ///
    /// `block` must be an arena block in this directory.
    pub unsafe fn split(&mut self, block: Block, size: usize) -> Option<Block> {
        if !block.is_free() {
            return None;
        }
        let size = pad(size);
        let needed = size.checked_add(HEADER_SIZE + ALIGNMENT)?;
        if block.size() < needed {
            return None;
        }

        let rest_size = block.size() - size - HEADER_SIZE;
        let rest_start = NonNull::new_unchecked(block.payload().as_ptr().add(size));
        block.set_size(size);
        let rest = Block::write(rest_start, rest_size, Status::Free);
        self.heap.insert_after(block, rest);
        Some(rest)
    }

    /// Merge a free block with its contiguous free neighbours, and return the
    /// surviving block.
    ///
    /// With [`Direction::Both`] the merge starts from the first free block of
    /// the run containing `start`. When `target` is non-zero, merging is
    /// forward-only and stops as soon as the surviving block holds `target`
    /// (padded) bytes. Returns `None` if `start` is not free.
    ///
    /// # Safety
    ///
    /// `start` must be an arena block in this directory.
    pub unsafe fn coalesce(
        &mut self,
        start: Block,
        direction: Direction,
        target: usize,
    ) -> Option<Block> {
        if !start.is_free() {
            return None;
        }
        let target = pad(target);

        let mut survivor = start;
        if direction == Direction::Both && target == 0 {
            while let Some(prev) = survivor.prev().filter(Block::is_free) {
                survivor = prev;
            }
        }

        while target == 0 || survivor.size() < target {
            let next = match survivor.next() {
                Some(next) if next.is_free() => next,
                _ => break,
            };
            self.heap.remove(next);
            survivor.set_size(survivor.size() + next.full_size());
            next.retire();
        }

        Some(survivor)
    }

    /// Recover the block behind a payload pointer handed out earlier.
    ///
    /// Arena blocks must additionally lie inside the arena.
    ///
    /// # Safety
    ///
    /// The `HEADER_SIZE` bytes before `payload` must be readable.
    pub unsafe fn block_of(&self, payload: NonNull<u8>) -> Option<Block> {
        let block = Block::from_payload(payload)?;
        if block.status() == Status::Mapped {
            return Some(block);
        }

        let (head, tail) = (self.heap.head()?, self.heap.tail()?);
        let start = block.start().as_ptr() as *const u8;
        if start < head.start().as_ptr() as *const u8 || start >= tail.end() {
            return None;
        }
        Some(block)
    }

    /// Check current size of the directory, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity {
            broken_links: self.heap.broken_links() + self.mapped.broken_links(),
            ..Default::default()
        };
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for block in self.heap.iter() {
            match previous.map(|p| p.relation(&block)) {
                Some(Relation::AdjacentBefore) => {
                    // The normal case
                }
                Some(Relation::Before) => {
                    // Right order, but memory between them is unaccounted for
                    validity.gaps += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                    validity.out_of_orders += 1;
                }
                None => {}
            }

            if block.is_free() && previous.map_or(false, |p| p.is_free()) {
                validity.adjacent_frees += 1;
            }
            if block.status() == Status::Mapped {
                validity.misplaced += 1;
            }
            if block.size() != pad(block.size()) {
                validity.unpadded += 1;
            }

            stats.heap_blocks += 1;
            stats.heap_bytes += block.full_size();
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += block.full_size();
            }
            previous = Some(block);
        }

        for block in self.mapped.iter() {
            if block.status() != Status::Mapped {
                validity.misplaced += 1;
            }
            if block.size() != pad(block.size()) {
                validity.unpadded += 1;
            }
            stats.mapped_blocks += 1;
            stats.mapped_bytes += block.full_size();
        }

        (validity, stats)
    }
}

// The directory only holds handles into memory it owns exclusively.
unsafe impl Send for Directory {}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Directory(heap: {}, mapped: {})", self.heap, self.mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec::Vec;

    use test_env_log::test;

    // Lay out back-to-back arena blocks with the given payload sizes and
    // statuses, and register them in order.
    fn layout(memory: &mut [u64], blocks: &[(usize, Status)]) -> (Directory, Vec<Block>) {
        let mut directory = Directory::new();
        let mut cursor = memory.as_mut_ptr() as *mut u8;
        let mut placed = Vec::new();
        for &(size, status) in blocks {
            unsafe {
                let block = Block::write(NonNull::new_unchecked(cursor), size, status);
                directory.insert(block, None);
                cursor = cursor.add(block.full_size());
                placed.push(block);
            }
        }
        (directory, placed)
    }

    #[test]
    fn test_find_best_free() {
        let mut memory = [0u64; 128];
        let (directory, b) = layout(
            &mut memory,
            &[
                (16, Status::Free),
                (8, Status::Allocated),
                (64, Status::Free),
                (8, Status::Allocated),
                (32, Status::Free),
            ],
        );

        assert_eq!(directory.find_best_free(10), Some(b[0]));
        assert_eq!(directory.find_best_free(17), Some(b[4]));
        assert_eq!(directory.find_best_free(33), Some(b[2]));
        assert_eq!(directory.find_best_free(65), None);

        assert_eq!(directory.find_first_free(17), Some(b[2]));
        assert_eq!(directory.find_first_free(64), Some(b[2]));
        assert_eq!(directory.find_first_free(72), None);
    }

    #[test]
    fn test_find_best_free_ties_go_first() {
        let mut memory = [0u64; 128];
        let (directory, b) = layout(
            &mut memory,
            &[
                (32, Status::Free),
                (8, Status::Allocated),
                (32, Status::Free),
            ],
        );
        assert_eq!(directory.find_best_free(24), Some(b[0]));
    }

    #[test]
    fn test_split() {
        let mut memory = [0u64; 128];
        let (mut directory, b) = layout(&mut memory, &[(256, Status::Free), (8, Status::Allocated)]);

        let rest = unsafe { directory.split(b[0], 100) }.expect("large enough to split");
        assert_eq!(b[0].size(), 104);
        assert_eq!(rest.size(), 256 - 104 - HEADER_SIZE);
        assert!(rest.is_free());
        assert_eq!(b[0].next(), Some(rest));
        assert_eq!(rest.next(), Some(b[1]));
        assert_eq!(b[0].end(), rest.start().as_ptr() as *const u8);

        let (validity, stats) = directory.stats();
        // Both halves are free until the caller marks one allocated.
        assert_eq!(validity.adjacent_frees, 1);
        assert_eq!(stats.heap_bytes, HEADER_SIZE * 2 + 256 + 8);
    }

    #[test]
    fn test_split_refusals() {
        let mut memory = [0u64; 128];
        let (mut directory, b) = layout(&mut memory, &[(64, Status::Free), (64, Status::Allocated)]);

        // Allocated blocks are never split
        assert_eq!(unsafe { directory.split(b[1], 8) }, None);
        // Leaving fewer than ALIGNMENT bytes after a new header is refused...
        assert_eq!(
            unsafe { directory.split(b[0], 64 - HEADER_SIZE - ALIGNMENT + 1) },
            None
        );
        // ...but exactly ALIGNMENT bytes is fine.
        let rest = unsafe { directory.split(b[0], 64 - HEADER_SIZE - ALIGNMENT) };
        assert_eq!(rest.map(|r| r.size()), Some(ALIGNMENT));
    }

    #[test]
    fn test_coalesce_both() {
        let mut memory = [0u64; 256];
        let (mut directory, b) = layout(
            &mut memory,
            &[
                (16, Status::Allocated),
                (16, Status::Free),
                (24, Status::Free),
                (32, Status::Free),
                (8, Status::Allocated),
            ],
        );

        let merged = unsafe { directory.coalesce(b[2], Direction::Both, 0) };
        assert_eq!(merged, Some(b[1]));
        assert_eq!(b[1].size(), 16 + 24 + 32 + 2 * HEADER_SIZE);
        assert_eq!(directory.heap_blocks().collect::<Vec<_>>(), [b[0], b[1], b[4]]);

        let (validity, _) = directory.stats();
        assert!(validity.is_valid(), "{:?}", validity);

        // The absorbed headers are gone for good
        assert_eq!(unsafe { directory.block_of(b[2].payload()) }, None);
        assert_eq!(unsafe { directory.block_of(b[1].payload()) }, Some(b[1]));
    }

    #[test]
    fn test_coalesce_forward_with_target() {
        let mut memory = [0u64; 256];
        let (mut directory, b) = layout(
            &mut memory,
            &[
                (16, Status::Free),
                (16, Status::Free),
                (16, Status::Free),
                (16, Status::Free),
            ],
        );

        // Forward never looks back
        let merged = unsafe { directory.coalesce(b[1], Direction::Forward, 40) };
        assert_eq!(merged, Some(b[1]));
        // One neighbour is enough to reach 40 bytes
        assert_eq!(b[1].size(), 16 + HEADER_SIZE + 16);
        assert_eq!(b[1].next(), Some(b[3]));
        assert_eq!(directory.head(), Some(b[0]));

        // Not free, nothing to do
        b[0].set_status(Status::Allocated);
        assert_eq!(unsafe { directory.coalesce(b[0], Direction::Both, 0) }, None);
    }

    #[test]
    fn test_coalesce_both_with_target_stays_forward() {
        let mut memory = [0u64; 256];
        let (mut directory, b) = layout(
            &mut memory,
            &[
                (16, Status::Free),
                (16, Status::Free),
                (16, Status::Free),
            ],
        );

        // A target bounds the merge, and a bounded merge never walks back
        let merged = unsafe { directory.coalesce(b[1], Direction::Both, 40) };
        assert_eq!(merged, Some(b[1]));
        assert_eq!(b[0].size(), 16);
        assert_eq!(b[1].size(), 16 + HEADER_SIZE + 16);
        assert_eq!(directory.heap_blocks().collect::<Vec<_>>(), [b[0], b[1]]);
    }

    #[test]
    fn test_insert_after_predecessor() {
        let mut memory = [0u64; 128];
        let mut directory = Directory::new();
        let base = memory.as_mut_ptr() as *mut u8;

        unsafe {
            let a = Block::write(NonNull::new_unchecked(base), 16, Status::Allocated);
            let b_start = base.add(a.full_size());
            let c_start = b_start.add(HEADER_SIZE + 24);
            let c = Block::write(NonNull::new_unchecked(c_start), 8, Status::Allocated);
            directory.insert(a, None);
            directory.insert(c, None);
            assert_eq!(directory.stats().0.gaps, 1);

            // Fill the hole between them
            let b = Block::write(NonNull::new_unchecked(b_start), 24, Status::Free);
            assert_eq!(directory.insert(b, Some(a)), b);

            assert_eq!(directory.heap_blocks().collect::<Vec<_>>(), [a, b, c]);
            assert_eq!(b.prev(), Some(a));
            assert_eq!(b.next(), Some(c));
            assert_eq!(directory.tail(), Some(c));
        }

        let (validity, stats) = directory.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.heap_blocks, 3);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(directory.heap_allocations(), 3);
    }

    #[test]
    fn test_mapped_blocks_are_segregated() {
        let mut arena = [0u64; 64];
        let mut region = [0u64; 64];
        let (mut directory, b) = layout(&mut arena, &[(64, Status::Free)]);

        let mapped = unsafe {
            let start = NonNull::new_unchecked(region.as_mut_ptr() as *mut u8);
            directory.insert(Block::write(start, 256, Status::Mapped), None)
        };
        assert_eq!(directory.mappings(), 1);
        assert_eq!(directory.heap_allocations(), 1);
        assert_eq!(directory.tail(), Some(b[0]));
        assert_eq!(directory.mapped_blocks().collect::<Vec<_>>(), [mapped]);

        // Mapped blocks never take part in reuse or merging
        assert_eq!(directory.find_best_free(128), None);
        assert_eq!(unsafe { directory.coalesce(mapped, Direction::Both, 0) }, None);
        assert_eq!(unsafe { directory.split(mapped, 8) }, None);
        assert_eq!(unsafe { directory.block_of(mapped.payload()) }, Some(mapped));

        let (validity, stats) = directory.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.mapped_blocks, 1);
        assert_eq!(stats.mapped_bytes, HEADER_SIZE + 256);

        unsafe {
            assert_eq!(directory.remove(mapped), Some(mapped));
            assert_eq!(directory.remove(mapped), None);
        }
        assert_eq!(directory.mapped_blocks().count(), 0);
        log::info!("after unmapping: {}", directory);
    }

    #[test]
    fn test_block_of_rejects_foreign_pointers() {
        let mut arena = [0u64; 64];
        let mut elsewhere = [0u64; 64];
        let (directory, _) = layout(&mut arena, &[(64, Status::Allocated)]);

        // A well-formed header outside the arena is still not ours
        let stranger = unsafe {
            let start = NonNull::new_unchecked(elsewhere.as_mut_ptr() as *mut u8);
            Block::write(start, 64, Status::Allocated)
        };
        assert_eq!(unsafe { directory.block_of(stranger.payload()) }, None);
    }
}
