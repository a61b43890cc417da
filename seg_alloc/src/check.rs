//! Heap consistency checking and inspection.

use super::block::{links, Block, Header, Offset, ALIGNMENT, MIN_BLOCK_SIZE};
use super::memory::Memory;
use super::size_classes::{Registry, SizeClass};
use super::SegAlloc;
use alloc::collections::{BTreeMap, BTreeSet};
use core::fmt;
use memory_units::Bytes;

/// The first inconsistency found by `SegAlloc::check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    /// Offset of the block or list node at fault.
    pub offset: Offset,
    /// What is wrong with it.
    pub kind: ViolationKind,
}

/// The kinds of inconsistency `SegAlloc::check` detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A block is smaller than `MIN_BLOCK_SIZE`.
    Undersized {
        /// Its recorded size.
        size: Bytes,
    },
    /// A block's size is not a multiple of `ALIGNMENT`.
    Misaligned {
        /// Its recorded size.
        size: Bytes,
    },
    /// A block runs past the end of the heap.
    Overrun {
        /// Its recorded size.
        size: Bytes,
        /// Where the heap ends.
        high_bound: Offset,
    },
    /// A list sentinel was overwritten.
    CorruptSentinel {
        /// The class it heads.
        class: SizeClass,
    },
    /// A list member is marked allocated.
    AllocatedInList {
        /// The list it was found in.
        class: SizeClass,
    },
    /// A list member is not the start of any block.
    NotABlock {
        /// The list it was found in.
        class: SizeClass,
    },
    /// A list member's size does not belong to the list's class.
    WrongClass {
        /// The list it was found in.
        class: SizeClass,
        /// Its recorded size.
        size: Bytes,
    },
    /// A member's back link does not point at its predecessor.
    BrokenLink {
        /// The list it was found in.
        class: SizeClass,
    },
    /// A list reaches one of its own members twice.
    Cycle {
        /// The list it was found in.
        class: SizeClass,
    },
    /// A block is a member of two lists.
    FiledTwice {
        /// The list it was found in second.
        class: SizeClass,
        /// The list it was found in first.
        first: SizeClass,
    },
    /// The free blocks in the heap and the members of all lists differ in
    /// number.
    Unfiled {
        /// Free blocks found walking the heap.
        free_blocks: usize,
        /// Members found walking the lists.
        members: usize,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "block at {}: ", self.offset)?;
        match self.kind {
            ViolationKind::Undersized { size } => write!(
                f,
                "size {} is below the minimum of {}",
                size.0, MIN_BLOCK_SIZE.0
            ),
            ViolationKind::Misaligned { size } => {
                write!(f, "size {} is not a multiple of {}", size.0, ALIGNMENT)
            }
            ViolationKind::Overrun { size, high_bound } => write!(
                f,
                "size {} runs past the end of the heap at {}",
                size.0, high_bound
            ),
            ViolationKind::CorruptSentinel { class } => {
                write!(f, "sentinel of class {} was overwritten", class.index())
            }
            ViolationKind::AllocatedInList { class } => {
                write!(f, "marked allocated but filed in class {}", class.index())
            }
            ViolationKind::NotABlock { class } => {
                write!(f, "filed in class {} but is not a block", class.index())
            }
            ViolationKind::WrongClass { class, size } => {
                write!(f, "size {} does not belong in class {}", size.0, class.index())
            }
            ViolationKind::BrokenLink { class } => {
                write!(f, "back link in class {} is broken", class.index())
            }
            ViolationKind::Cycle { class } => write!(f, "class {} is cyclic", class.index()),
            ViolationKind::FiledTwice { class, first } => write!(
                f,
                "filed in class {} and again in class {}",
                first.index(),
                class.index()
            ),
            ViolationKind::Unfiled {
                free_blocks,
                members,
            } => write!(
                f,
                "{} free blocks in the heap but {} list members",
                free_blocks, members
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Violation {}

/// One block, as seen walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Where the block starts.
    pub offset: Offset,
    /// Its total size, header included.
    pub size: Bytes,
    /// Whether it is handed out.
    pub allocated: bool,
}

/// Iterator over the blocks of a heap in address order.
///
/// Stops early at a block whose size would not move the walk forward or
/// would run past the end of the heap.
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    mem: &'a [u8],
    at: Offset,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.at >= self.mem.len() {
            return None;
        }
        let header = Block(self.at).header(self.mem);
        let info = BlockInfo {
            offset: self.at,
            size: header.size(),
            allocated: header.is_allocated(),
        };
        self.at = match self.at.checked_add(info.size.0) {
            Some(next) if info.size.0 > 0 && next <= self.mem.len() => next,
            _ => self.mem.len(),
        };
        Some(info)
    }
}

impl<M: Memory> SegAlloc<M> {
    /// Every block after the sentinels, in address order.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            mem: self.memory.bytes(),
            at: self.memory_start,
        }
    }

    /// Check the whole heap.
    ///
    /// Walks every block from the first one after the sentinels to the end of
    /// the heap, then every free list, and reports the first inconsistency.
    /// Every free block must be filed in exactly one list.
    pub fn check(&self) -> Result<(), Violation> {
        let mem = self.memory.bytes();

        for class in SizeClass::all() {
            let sentinel = match self.registry.sentinel(class) {
                Some(sentinel) => sentinel,
                None => continue,
            };
            let header = Header::read(mem, sentinel);
            if !header.is_allocated() || header.size() != MIN_BLOCK_SIZE {
                return Err(Violation {
                    offset: sentinel,
                    kind: ViolationKind::CorruptSentinel { class },
                });
            }
        }

        let high_bound = mem.len();
        let mut starts = BTreeSet::new();
        let mut free_blocks = 0;
        let mut at = self.memory_start;
        while at < high_bound {
            let header = Header::read(mem, at);
            let size = header.size();
            let fail = |kind| Err(Violation { offset: at, kind });
            if size < MIN_BLOCK_SIZE {
                return fail(ViolationKind::Undersized { size });
            }
            if size.0 % ALIGNMENT != 0 {
                return fail(ViolationKind::Misaligned { size });
            }
            if size.0 > high_bound - at {
                return fail(ViolationKind::Overrun { size, high_bound });
            }
            if !header.is_allocated() {
                free_blocks += 1;
            }
            starts.insert(at);
            at += size.0;
        }

        let mut filed = BTreeMap::new();
        for class in SizeClass::all() {
            check_class(&self.registry, mem, class, &starts, &mut filed)?;
        }

        // Members are distinct free block starts, so equal counts mean every
        // free block is filed.
        let members = filed.len();
        if members != free_blocks {
            return Err(Violation {
                offset: self.memory_start,
                kind: ViolationKind::Unfiled {
                    free_blocks,
                    members,
                },
            });
        }
        Ok(())
    }
}

// Walk one list, recording each member and the class it was found in.
fn check_class(
    registry: &Registry,
    mem: &[u8],
    class: SizeClass,
    starts: &BTreeSet<Offset>,
    filed: &mut BTreeMap<Offset, SizeClass>,
) -> Result<(), Violation> {
    let mut prev = match registry.sentinel(class) {
        Some(sentinel) => sentinel,
        None => return Ok(()),
    };

    while let Some(member) = links::next(mem, prev) {
        let fail = |kind| Err(Violation {
            offset: member,
            kind,
        });
        if !starts.contains(&member) {
            return fail(ViolationKind::NotABlock { class });
        }
        if let Some(&first) = filed.get(&member) {
            if first == class {
                return fail(ViolationKind::Cycle { class });
            }
            return fail(ViolationKind::FiledTwice { class, first });
        }
        let header = Header::read(mem, member);
        if header.is_allocated() {
            return fail(ViolationKind::AllocatedInList { class });
        }
        if !class.sizes().contains(&header.size().0) {
            return fail(ViolationKind::WrongClass {
                class,
                size: header.size(),
            });
        }
        if links::prev(mem, member) != Some(prev) {
            return fail(ViolationKind::BrokenLink { class });
        }
        filed.insert(member, class);
        prev = member;
    }

    Ok(())
}

impl<M: Memory> fmt::Debug for SegAlloc<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SegAlloc")
            .field("heap_size", &self.heap_size().0)
            .field("memory_start", &self.memory_start)
            .field("stats", &self.stats)
            .field(
                "free_lists",
                &FreeLists {
                    registry: &self.registry,
                    mem: self.memory.bytes(),
                },
            )
            .finish()
    }
}

// Non-empty classes, each as a list of `(offset, size)` pairs.
struct FreeLists<'a> {
    registry: &'a Registry,
    mem: &'a [u8],
}

impl<'a> fmt::Debug for FreeLists<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        for class in SizeClass::all() {
            if self.registry.is_empty(self.mem, class) {
                continue;
            }
            map.entry(
                &class.index(),
                &Members {
                    registry: self.registry,
                    mem: self.mem,
                    class,
                },
            );
        }
        map.finish()
    }
}

struct Members<'a> {
    registry: &'a Registry,
    mem: &'a [u8],
    class: SizeClass,
}

impl<'a> fmt::Debug for Members<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mem = self.mem;
        f.debug_list()
            .entries(
                self.registry
                    .iter(mem, self.class)
                    .map(|block| (block.0, block.size(mem).0)),
            )
            .finish()
    }
}
