//! Block headers and the typed views over them.
//!
//! Every block starts with one header word holding its total size (header
//! included) with the allocated flag packed into the low bit. Sizes are always
//! multiples of `ALIGNMENT`, so the low bit is otherwise unused.
//!
//! ```text
//!   allocated block                    free block
//!   +--------+-----------------+       +--------+------+------+--------+
//!   | size|1 | payload ...     |       | size|0 | next | prev | ...    |
//!   +--------+-----------------+       +--------+------+------+--------+
//!   ^        ^                         ^        ^
//!   offset   payload offset            offset   links live in the payload
//! ```

use memory_units::Bytes;

/// Byte index into the heap arena.
pub type Offset = usize;

/// Every payload handed out is aligned to this many bytes.
pub const ALIGNMENT: usize = 8;

/// Width of the header word, and of each free-list link.
pub const HEADER: Bytes = Bytes(WORD);

/// A free block must hold its header plus the two free-list links.
pub const MIN_BLOCK_SIZE: Bytes = Bytes(3 * WORD);

pub(crate) const WORD: usize = 8;

// Encoded value of a missing link.
pub(crate) const NIL: u64 = u64::MAX;

/// Round `size` up to the next multiple of `ALIGNMENT`.
///
/// Returns `None` on overflow.
#[inline]
pub fn align(size: Bytes) -> Option<Bytes> {
    size.0
        .checked_add(ALIGNMENT - 1)
        .map(|n| Bytes(n & !(ALIGNMENT - 1)))
}

/// The block size needed to serve a request for `size` payload bytes.
#[inline]
pub fn block_size_for(size: usize) -> Option<Bytes> {
    let size = size.checked_add(HEADER.0)?;
    let size = align(Bytes(size))?;
    Some(if size < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { size })
}

#[inline]
pub(crate) fn read_word(mem: &[u8], at: Offset) -> u64 {
    let mut word = [0; WORD];
    word.copy_from_slice(&mem[at..at + WORD]);
    u64::from_le_bytes(word)
}

#[inline]
pub(crate) fn write_word(mem: &mut [u8], at: Offset, value: u64) {
    mem[at..at + WORD].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn decode_link(word: u64) -> Option<Offset> {
    if word == NIL {
        None
    } else {
        Some(word as Offset)
    }
}

#[inline]
pub(crate) fn encode_link(link: Option<Offset>) -> u64 {
    link.map_or(NIL, |at| at as u64)
}

/// A decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(u64);

impl Header {
    const IS_ALLOCATED: u64 = 0b1;
    const SIZE_MASK: u64 = !Self::IS_ALLOCATED;

    #[inline]
    pub(crate) fn new(size: Bytes, allocated: bool) -> Header {
        extra_assert_eq!(size.0 % ALIGNMENT, 0);
        let word = size.0 as u64;
        Header(if allocated {
            word | Self::IS_ALLOCATED
        } else {
            word
        })
    }

    #[inline]
    pub(crate) fn read(mem: &[u8], at: Offset) -> Header {
        Header(read_word(mem, at))
    }

    #[inline]
    pub(crate) fn write(self, mem: &mut [u8], at: Offset) {
        write_word(mem, at, self.0)
    }

    #[inline]
    pub(crate) fn size(self) -> Bytes {
        Bytes((self.0 & Self::SIZE_MASK) as usize)
    }

    #[inline]
    pub(crate) fn is_allocated(self) -> bool {
        self.0 & Self::IS_ALLOCATED != 0
    }

    #[inline]
    pub(crate) fn allocated(self) -> Header {
        Header(self.0 | Self::IS_ALLOCATED)
    }

    #[inline]
    pub(crate) fn free(self) -> Header {
        Header(self.0 & Self::SIZE_MASK)
    }

    #[inline]
    pub(crate) fn with_size(self, size: Bytes) -> Header {
        Header::new(size, self.is_allocated())
    }
}

/// A block whose state has not been looked at yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(pub(crate) Offset);

/// What a block turned out to be once its header was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    Free(FreeBlock),
    Allocated(AllocatedBlock),
}

impl Block {
    #[inline]
    pub(crate) fn header(self, mem: &[u8]) -> Header {
        Header::read(mem, self.0)
    }

    #[inline]
    pub(crate) fn size(self, mem: &[u8]) -> Bytes {
        self.header(mem).size()
    }

    /// The block that follows this one in address order. It may lie at or
    /// beyond the heap's high bound.
    #[inline]
    pub(crate) fn next(self, mem: &[u8]) -> Block {
        Block(self.0 + self.size(mem).0)
    }

    #[inline]
    pub(crate) fn state(self, mem: &[u8]) -> BlockState {
        if self.header(mem).is_allocated() {
            BlockState::Allocated(AllocatedBlock(self.0))
        } else {
            BlockState::Free(FreeBlock(self.0))
        }
    }

    /// The following block, if it is inside the heap, free, and big enough to
    /// be a list member. Only such neighbours are ever merged.
    pub(crate) fn mergeable_successor(self, mem: &[u8]) -> Option<FreeBlock> {
        let next = self.next(mem);
        if next.0 + HEADER.0 > mem.len() {
            return None;
        }
        match next.state(mem) {
            BlockState::Free(free) if free.size(mem) >= MIN_BLOCK_SIZE => Some(free),
            _ => None,
        }
    }
}

/// A block that is not handed out. It carries free-list links in its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FreeBlock(pub(crate) Offset);

impl FreeBlock {
    /// Format `size` bytes at `at` as a fresh, unlinked free block.
    pub(crate) fn format(mem: &mut [u8], at: Offset, size: Bytes) -> FreeBlock {
        extra_assert!(size >= MIN_BLOCK_SIZE);
        Header::new(size, false).write(mem, at);
        let block = FreeBlock(at);
        block.set_next_free(mem, None);
        block.set_prev_free(mem, None);
        block
    }

    #[inline]
    pub(crate) fn size(self, mem: &[u8]) -> Bytes {
        Block(self.0).size(mem)
    }

    /// Rewrite the recorded size, keeping the block free.
    #[inline]
    pub(crate) fn set_size(self, mem: &mut [u8], size: Bytes) {
        Header::new(size, false).write(mem, self.0)
    }

    #[inline]
    pub(crate) fn as_block(self) -> Block {
        Block(self.0)
    }

    #[inline]
    pub(crate) fn next_free(self, mem: &[u8]) -> Option<Offset> {
        links::next(mem, self.0)
    }

    #[inline]
    pub(crate) fn prev_free(self, mem: &[u8]) -> Option<Offset> {
        links::prev(mem, self.0)
    }

    #[inline]
    pub(crate) fn set_next_free(self, mem: &mut [u8], next: Option<Offset>) {
        links::set_next(mem, self.0, next)
    }

    #[inline]
    pub(crate) fn set_prev_free(self, mem: &mut [u8], prev: Option<Offset>) {
        links::set_prev(mem, self.0, prev)
    }

    /// Flip the flag. The caller must already have unlinked the block.
    #[inline]
    pub(crate) fn into_allocated(self, mem: &mut [u8]) -> AllocatedBlock {
        let header = Header::read(mem, self.0);
        extra_assert!(!header.is_allocated());
        header.allocated().write(mem, self.0);
        AllocatedBlock(self.0)
    }
}

/// A block owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocatedBlock(pub(crate) Offset);

impl AllocatedBlock {
    #[inline]
    pub(crate) fn from_payload(payload: Offset) -> AllocatedBlock {
        AllocatedBlock(payload - HEADER.0)
    }

    #[inline]
    pub(crate) fn payload(self) -> Offset {
        self.0 + HEADER.0
    }

    #[inline]
    pub(crate) fn size(self, mem: &[u8]) -> Bytes {
        Block(self.0).size(mem)
    }

    #[inline]
    pub(crate) fn set_size(self, mem: &mut [u8], size: Bytes) {
        Header::new(size, true).write(mem, self.0)
    }

    #[inline]
    pub(crate) fn as_block(self) -> Block {
        Block(self.0)
    }

    /// Usable payload bytes.
    #[inline]
    pub(crate) fn capacity(self, mem: &[u8]) -> Bytes {
        self.size(mem) - HEADER
    }

    /// Clear the flag and reset the links so the block can be filed.
    pub(crate) fn into_free(self, mem: &mut [u8]) -> FreeBlock {
        let header = Header::read(mem, self.0);
        extra_assert!(header.is_allocated());
        header.free().write(mem, self.0);
        let free = FreeBlock(self.0);
        free.set_next_free(mem, None);
        free.set_prev_free(mem, None);
        free
    }
}

/// Raw link access shared by free blocks and list sentinels.
pub(crate) mod links {
    use super::{decode_link, encode_link, read_word, write_word, Offset, WORD};

    const NEXT: usize = WORD;
    const PREV: usize = 2 * WORD;

    #[inline]
    pub(crate) fn next(mem: &[u8], node: Offset) -> Option<Offset> {
        decode_link(read_word(mem, node + NEXT))
    }

    #[inline]
    pub(crate) fn prev(mem: &[u8], node: Offset) -> Option<Offset> {
        decode_link(read_word(mem, node + PREV))
    }

    #[inline]
    pub(crate) fn set_next(mem: &mut [u8], node: Offset, next: Option<Offset>) {
        write_word(mem, node + NEXT, encode_link(next))
    }

    #[inline]
    pub(crate) fn set_prev(mem: &mut [u8], node: Offset, prev: Option<Offset>) {
        write_word(mem, node + PREV, encode_link(prev))
    }
}

#[test]
fn header_packs_flag_into_low_bit() {
    let h = Header::new(Bytes(48), false);
    assert_eq!(h.size(), Bytes(48));
    assert!(!h.is_allocated());

    let h = h.allocated();
    assert_eq!(h.size(), Bytes(48));
    assert!(h.is_allocated());
    assert_eq!(h.0, 49);

    let h = h.free();
    assert_eq!(h.0, 48);
    assert_eq!(h.allocated().with_size(Bytes(64)).0, 65);
}

#[test]
fn block_sizes_are_aligned_and_clamped() {
    assert_eq!(block_size_for(0), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size_for(1), Some(MIN_BLOCK_SIZE));
    assert_eq!(block_size_for(16), Some(Bytes(24)));
    assert_eq!(block_size_for(17), Some(Bytes(32)));
    assert_eq!(block_size_for(100), Some(Bytes(112)));
    assert_eq!(block_size_for(usize::MAX), None);
    assert_eq!(block_size_for(usize::MAX - 8), None);
    assert_eq!(align(Bytes(13)), Some(Bytes(16)));
    assert_eq!(align(Bytes(16)), Some(Bytes(16)));
}

#[test]
fn navigation_and_state_transitions() {
    let mut mem = [0u8; 96];
    let free = FreeBlock::format(&mut mem, 0, Bytes(48));
    FreeBlock::format(&mut mem, 48, Bytes(48));

    assert_eq!(free.as_block().next(&mem), Block(48));
    assert_eq!(free.next_free(&mem), None);
    assert_eq!(free.as_block().mergeable_successor(&mem), Some(FreeBlock(48)));

    let allocated = free.into_allocated(&mut mem);
    assert_eq!(allocated.payload(), 8);
    assert_eq!(AllocatedBlock::from_payload(8), allocated);
    assert_eq!(allocated.capacity(&mem), Bytes(40));
    assert_eq!(
        Block(48).state(&mem),
        BlockState::Free(FreeBlock(48)),
    );
    assert_eq!(Block(0).state(&mem), BlockState::Allocated(allocated));

    // The last block's successor is past the end of the heap.
    assert_eq!(Block(48).mergeable_successor(&mem), None);

    let free = allocated.into_free(&mut mem);
    assert!(!Block(0).header(&mem).is_allocated());
    assert_eq!(free.prev_free(&mem), None);
}

#[test]
fn links_round_trip_through_the_payload() {
    let mut mem = [0u8; 48];
    let block = FreeBlock::format(&mut mem, 0, Bytes(24));
    block.set_next_free(&mut mem, Some(24));
    block.set_prev_free(&mut mem, Some(4096));
    assert_eq!(block.next_free(&mem), Some(24));
    assert_eq!(block.prev_free(&mem), Some(4096));
    block.set_next_free(&mut mem, None);
    assert_eq!(read_word(&mem, 8), NIL);
}
