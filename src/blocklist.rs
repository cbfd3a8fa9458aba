use core::fmt;
use core::marker::PhantomData;

use crate::block::Block;

/// A `BlockList` is an intrusive, doubly-linked list of blocks.
///
/// The links live in the block headers themselves, so the list needs no
/// memory of its own. Each block should be considered "owned" by the list
/// once inserted: it is the list that rewrites the `prev` and `next` links of
/// its members.
///
/// It maintains a few internal invariants:
///
/// - `head.prev` and `tail.next` are always `None`.
/// - For every member `b`, `b.next.prev == b`.
/// - `len` is the number of members.
///
/// Ordering is left to the caller; the [`Directory`](../directory/struct.Directory.html)
/// keeps its arena list sorted by address.
#[derive(Default)]
pub struct BlockList {
    head: Option<Block>,
    tail: Option<Block>,
    len: usize,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;

        self.next = block.next();

        Some(block)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// A BlockList is sendable - as long as the whole "chain" is maintained across
// threads, its fine. It is not Sync: nothing here is atomic.
unsafe impl Send for BlockList {}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, "]")
    }
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            _list: PhantomData,
        }
    }

    /// Add a block to the front of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block that is not a member of any list.
    pub unsafe fn push_front(&mut self, block: Block) {
        block.set_prev(None);
        block.set_next(self.head);
        match self.head {
            Some(old_head) => old_head.set_prev(Some(block)),
            None => self.tail = Some(block),
        }
        self.head = Some(block);
        self.len += 1;
    }

    /// Add a block to the back of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block that is not a member of any list.
    pub unsafe fn push_back(&mut self, block: Block) {
        match self.tail {
            Some(tail) => self.insert_after(tail, block),
            None => self.push_front(block),
        }
    }

    /// Splice `block` in directly after `anchor`.
    ///
    /// # Safety
    ///
    /// `anchor` must be a member of this list, and `block` a valid block that
    /// is not a member of any list.
    pub unsafe fn insert_after(&mut self, anchor: Block, block: Block) {
        let next = anchor.next();
        block.set_prev(Some(anchor));
        block.set_next(next);
        anchor.set_next(Some(block));
        match next {
            Some(next) => next.set_prev(Some(block)),
            None => self.tail = Some(block),
        }
        self.len += 1;
    }

    /// Unlink `block`, repairing its neighbours' links and the cached head and
    /// tail. Returns `None` if the list is empty.
    ///
    /// # Safety
    ///
    /// `block` must be a member of this list.
    pub unsafe fn remove(&mut self, block: Block) -> Option<Block> {
        if self.is_empty() {
            return None;
        }

        let (prev, next) = (block.prev(), block.next());
        match prev {
            Some(prev) => prev.set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => next.set_prev(prev),
            None => self.tail = prev,
        }

        block.set_prev(None);
        block.set_next(None);
        self.len -= 1;
        Some(block)
    }

    /// Count the link inconsistencies in the list. Zero for a healthy list.
    pub fn broken_links(&self) -> usize {
        let mut broken = 0;
        if self.head.and_then(|b| b.prev()).is_some() {
            broken += 1;
        }
        if self.tail.and_then(|b| b.next()).is_some() {
            broken += 1;
        }

        let mut count = 0;
        let mut last = None;
        for block in self {
            if block.prev() != last {
                broken += 1;
            }
            last = Some(block);
            count += 1;
        }

        if last != self.tail {
            broken += 1;
        }
        if count != self.len {
            broken += 1;
        }
        broken
    }
}
