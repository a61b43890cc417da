//! The segregated free-list registry.
//!
//! Small blocks get one class per exact size (`8, 16, ..., 256` bytes). Larger
//! blocks are filed into exponentially growing classes: large class `j` holds
//! sizes in `[256 << j, 256 << (j + 1))`. Each class is a doubly-linked list
//! rooted at a sentinel node that lives in the heap itself, in front of the
//! first user block, and is marked allocated so it is never merged or handed
//! out.
//!
//! ```text
//!   class 2    [S]  -> block(24)  -> block(24)  -> nil
//!   class 3    [S]  -> nil
//!   ...
//!   large 0    [S]  -> block(264) -> nil
//! ```

use super::block::{links, FreeBlock, Header, Offset, ALIGNMENT, MIN_BLOCK_SIZE};
use core::ops::Range;
use memory_units::Bytes;

/// Largest size that has an exact class.
pub const SMALL_LIMIT: Bytes = Bytes(256);

/// Number of exact-size classes, including the unused ones below
/// `MIN_BLOCK_SIZE`.
pub const NUM_SMALL_CLASSES: usize = SMALL_LIMIT.0 / ALIGNMENT;

/// Number of exponential classes.
pub const NUM_LARGE_CLASSES: usize = 23;

/// Total number of classes.
pub const NUM_CLASSES: usize = NUM_SMALL_CLASSES + NUM_LARGE_CLASSES;

/// The first exact class that can hold a block.
pub(crate) const FIRST_CLASS: usize = MIN_BLOCK_SIZE.0 / ALIGNMENT - 1;

/// Bytes taken by the sentinels at the front of the heap.
pub const SENTINEL_AREA: Bytes = Bytes((NUM_CLASSES - FIRST_CLASS) * MIN_BLOCK_SIZE.0);

/// Index of a free-list class. Small classes come first, in size order,
/// followed by the large classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(pub(crate) usize);

impl SizeClass {
    /// The class a free block of `size` bytes is filed into.
    ///
    /// Sizes past the upper bound of the last large class are filed into the
    /// last large class.
    pub fn of(size: Bytes) -> SizeClass {
        extra_assert!(size >= MIN_BLOCK_SIZE);
        if size <= SMALL_LIMIT {
            return SizeClass(size.0 / ALIGNMENT - 1);
        }
        for j in 0..NUM_LARGE_CLASSES {
            if SMALL_LIMIT.0 << (j + 1) > size.0 {
                return SizeClass::large(j);
            }
        }
        SizeClass::large(NUM_LARGE_CLASSES - 1)
    }

    #[inline]
    pub(crate) fn large(j: usize) -> SizeClass {
        SizeClass(NUM_SMALL_CLASSES + j)
    }

    /// Every class that can hold blocks, in ascending size order.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        (FIRST_CLASS..NUM_CLASSES).map(SizeClass)
    }

    /// The exact classes from `self` upwards.
    pub(crate) fn small_from(self) -> impl Iterator<Item = SizeClass> {
        (self.0..NUM_SMALL_CLASSES).map(SizeClass)
    }

    /// The large classes from `self` upwards.
    pub(crate) fn large_from(self) -> impl Iterator<Item = SizeClass> {
        (self.0.max(NUM_SMALL_CLASSES)..NUM_CLASSES).map(SizeClass)
    }

    /// Whether this is one of the exact-size classes.
    #[inline]
    pub fn is_small(self) -> bool {
        self.0 < NUM_SMALL_CLASSES
    }

    /// The block sizes this class accepts.
    pub fn sizes(self) -> Range<usize> {
        if self.is_small() {
            let size = (self.0 + 1) * ALIGNMENT;
            size..size + 1
        } else {
            let j = self.0 - NUM_SMALL_CLASSES;
            let start = if j == 0 { SMALL_LIMIT.0 + 1 } else { SMALL_LIMIT.0 << j };
            let end = if j == NUM_LARGE_CLASSES - 1 {
                usize::MAX
            } else {
                SMALL_LIMIT.0 << (j + 1)
            };
            start..end
        }
    }

    /// Position of this class in the flat class table.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Class table: one sentinel per usable class.
#[derive(Clone, Copy)]
pub(crate) struct Registry {
    sentinels: [Option<Offset>; NUM_CLASSES],
}

impl Registry {
    /// Write the sentinels at `start`, returning the table and the first
    /// offset after them.
    pub(crate) fn layout(mem: &mut [u8], start: Offset) -> (Registry, Offset) {
        let mut sentinels = [None; NUM_CLASSES];
        let mut at = start;
        for class in SizeClass::all() {
            Header::new(MIN_BLOCK_SIZE, true).write(mem, at);
            links::set_next(mem, at, None);
            links::set_prev(mem, at, None);
            sentinels[class.0] = Some(at);
            at += MIN_BLOCK_SIZE.0;
        }
        extra_assert_eq!(at - start, SENTINEL_AREA.0);
        (Registry { sentinels }, at)
    }

    #[inline]
    pub(crate) fn sentinel(&self, class: SizeClass) -> Option<Offset> {
        self.sentinels[class.0]
    }

    /// File `block` right after the sentinel of its class.
    pub(crate) fn insert(&self, mem: &mut [u8], block: FreeBlock) {
        extra_assert!(!Header::read(mem, block.0).is_allocated());
        let class = SizeClass::of(block.size(mem));
        let head = match self.sentinel(class) {
            Some(head) => head,
            None => unreachable!("blocks are never smaller than MIN_BLOCK_SIZE"),
        };

        let next = links::next(mem, head);
        block.set_prev_free(mem, Some(head));
        links::set_next(mem, head, Some(block.0));
        block.set_next_free(mem, next);
        if let Some(next) = next {
            links::set_prev(mem, next, Some(block.0));
        }
    }

    /// Splice `block` out of whichever list holds it.
    pub(crate) fn remove(mem: &mut [u8], block: FreeBlock) {
        let prev = block.prev_free(mem);
        let next = block.next_free(mem);
        extra_assert!(prev.is_some(), "only list members are removed");

        if let Some(prev) = prev {
            links::set_next(mem, prev, next);
        }
        if let Some(next) = next {
            links::set_prev(mem, next, prev);
        }
        block.set_next_free(mem, None);
        block.set_prev_free(mem, None);
    }

    /// Whether `class` has no members.
    #[inline]
    pub(crate) fn is_empty(&self, mem: &[u8], class: SizeClass) -> bool {
        self.first(mem, class).is_none()
    }

    /// The most recently filed member of `class`.
    #[inline]
    pub(crate) fn first(&self, mem: &[u8], class: SizeClass) -> Option<FreeBlock> {
        self.sentinel(class)
            .and_then(|head| links::next(mem, head))
            .map(FreeBlock)
    }

    /// Members of `class` in list order.
    pub(crate) fn iter<'a>(&self, mem: &'a [u8], class: SizeClass) -> Members<'a> {
        Members {
            mem,
            cur: self.first(mem, class),
        }
    }
}

pub(crate) struct Members<'a> {
    mem: &'a [u8],
    cur: Option<FreeBlock>,
}

impl<'a> Iterator for Members<'a> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let cur = self.cur?;
        self.cur = cur.next_free(self.mem).map(FreeBlock);
        Some(cur)
    }
}
