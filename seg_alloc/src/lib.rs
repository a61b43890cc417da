/*!

`seg_alloc`: a **seg**regated free-list **alloc**ator with lazy coalescing.

- **Segregated:** free blocks are filed by size. Small blocks (up to 256
  bytes) get one list per exact size, so most small requests are served by
  popping the first member of a list. Larger blocks go into exponentially
  growing classes that are searched first-fit.

- **Lazy:** freeing never merges neighbours. Merging happens in one sweep over
  all free lists, and only when a request cannot be served any other way.
  Frees are *O(1)*.

- **Arena based:** the heap is a byte arena behind the [`Memory`] trait, and
  every block is named by its offset into it. Independent allocators can live
  side by side, and every reference into the heap is bounds checked.

`seg_alloc` is a teaching-sized allocator in the style of a systems course
malloc lab: simple, checkable, and fast enough to replay allocation traces.

- [Using `seg_alloc`](#using-seg_alloc)
- [Using `seg_alloc` as the Global Allocator](#using-seg_alloc-as-the-global-allocator)
- [`cargo` Features](#cargo-features)
- [Implementation Notes and Constraints](#implementation-notes-and-constraints)

## Using `seg_alloc`

```
use seg_alloc::{SegAlloc, VecHeap};

let mut heap = SegAlloc::new(VecHeap::new())?;

let a = heap.malloc(100)?;
heap.payload_mut(a)[..5].copy_from_slice(b"hello");

let a = heap.realloc(a, 400)?.expect("a non-zero size keeps the block");
assert_eq!(&heap.payload(a)[..5], b"hello");

heap.free(a);
heap.check()?;
# Ok::<(), Box<dyn std::error::Error>>(())
```

## Using `seg_alloc` as the Global Allocator

With the `global` feature on unix targets, `GlobalSegAlloc` wraps one
allocator over an `mmap`ed heap behind a spin lock:

```ignore
#[global_allocator]
static ALLOC: seg_alloc::GlobalSegAlloc = seg_alloc::GlobalSegAlloc::INIT;
```

## `cargo` Features

- **std**: On by default. Implements `std::error::Error` for the error types.
  Without it the crate is `#![no_std]` and only needs `alloc`.

- **extra_assertions**: Run the full consistency check after every `malloc`,
  `free` and `realloc`, and panic on the first violation. This turns every
  operation into an *O(heap)* one. It is useful when debugging a use-after-free
  or `seg_alloc` itself.

- **global**: Expose `GlobalSegAlloc` (unix only).

The build script reads `SEG_ALLOC_MAX_HEAP_BYTES` to set
[`DEFAULT_MAX_HEAP`], the cap on how far a `VecHeap` or the global heap may
grow. It defaults to 64 MiB.

## Implementation Notes and Constraints

- Every block carries one 8-byte header word: its size, with the allocated flag
  in the low bit. Free blocks keep their two list links in the payload, so no
  block is smaller than 24 bytes.

- The maximum alignment supported is 8 bytes.

- Deallocation is an *O(1)* operation.

- The heap only ever grows. When it runs dry it is extended by an increment
  that starts at the initial heap size and doubles until it fits the request.

- Each list is headed by a sentinel block stored at the front of the heap.
  Sentinels are marked allocated, so they are never merged or handed out.

```text
+------------------------------------------------------------------------------+
| Memory source (Vec<u8>, mmap)                                                |
+------------------------------------------------------------------------------+
                   |
                   | extend(increment), doubling
                   V
+------------------------------------------------------------------------------+
| Heap arena                                                                   |
|                                                                              |
| +-----------+---------+-------+-------+----------+-------+---------------    |
| | sentinels | block   | block | block | block    | block | ...               |
| +-----------+---------+-------+-------+----------+-------+---------------    |
+------------------------------------------------------------------------------+
        |                 ^                       |
        |                 |  split / merge        |
        V                 |                       V
+---------------------------------------------+   +-----------------------------+
| Exact classes (24, 32, ..., 256 bytes)      |   | Large classes               |
|                                             |   |                             |
| [S] --> block --> block --> ...             |   | [S] --> block --> ...       |
| [S] --> block --> ...                       |   |   [257, 512)                |
| ...                                         |   | [S] --> block --> ...       |
|                                             |   |   [512, 1024) ...           |
+---------------------------------------------+   +-----------------------------+
                   |        ^                            |        ^
         first fit |        | free                 first |        | free
                   V        |                        fit V        |
+------------------------------------------------------------------------------+
| User Application                                                             |
+------------------------------------------------------------------------------+
```

 */

#![warn(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
#[macro_use]
extern crate cfg_if;

#[macro_use]
mod extra_assert;

mod block;
mod check;
mod coalesce;
mod const_init;
mod growth;
mod imp_vec;
mod memory;
mod size_classes;

cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        pub use imp_unix::MmapHeap;

        cfg_if! {
            if #[cfg(feature = "global")] {
                mod global;
                pub use global::GlobalSegAlloc;
            }
        }
    }
}

pub use block::{align, block_size_for, Offset, ALIGNMENT, HEADER, MIN_BLOCK_SIZE};
pub use check::{BlockInfo, Blocks, Violation, ViolationKind};
pub use const_init::ConstInit;
pub use imp_vec::{VecHeap, DEFAULT_MAX_HEAP};
pub use memory::{Counted, Memory};
pub use memory_units::Bytes;
pub use size_classes::{SizeClass, NUM_CLASSES, NUM_LARGE_CLASSES, SENTINEL_AREA, SMALL_LIMIT};

use block::{AllocatedBlock, FreeBlock};
use coalesce::Sweep;
use core::cmp;
use core::fmt;
use growth::Growth;
use log::{debug, trace, warn};
use size_classes::Registry;

/// The error type for allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocErr {
    /// The memory source could not supply `request` more bytes.
    Exhausted {
        /// How many bytes were asked for.
        request: Bytes,
    },
    /// The allocator cannot be used the way it was asked to.
    Unsupported {
        /// What was not supported.
        details: &'static str,
    },
}

impl fmt::Display for AllocErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AllocErr::Exhausted { request } => {
                write!(f, "memory exhausted while requesting {} bytes", request.0)
            }
            AllocErr::Unsupported { details } => write!(f, "unsupported: {}", details),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocErr {}

/// Size of the region laid out by `SegAlloc::new`, and the first growth
/// increment.
pub const INITIAL_HEAP: Bytes = Bytes(1536);

/// Tunables for a new allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes to take from the memory source up front. Rounded up to
    /// `ALIGNMENT`, and raised if it cannot fit the sentinels plus one block.
    pub initial_heap: Bytes,
}

impl ConstInit for Config {
    const INIT: Config = Config {
        initial_heap: INITIAL_HEAP,
    };
}

impl Config {
    /// The default configuration, usable in `const` contexts.
    pub const INIT: Self = <Self as ConstInit>::INIT;

    /// The region size `SegAlloc::with_config` will actually request.
    pub fn initial_heap_size(&self) -> Option<Bytes> {
        let floor = SENTINEL_AREA + MIN_BLOCK_SIZE;
        align(self.initial_heap).map(|size| if size < floor { floor } else { size })
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::INIT
    }
}

/// A handle to an allocated payload: the offset of its first usable byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(Offset);

impl Payload {
    /// Offset of the payload in the heap arena.
    #[inline]
    pub fn offset(self) -> Offset {
        self.0
    }

    /// Rebuild a handle from `Payload::offset`.
    ///
    /// The offset must have come from a live allocation of the same heap.
    #[inline]
    pub fn from_offset(offset: Offset) -> Payload {
        Payload(offset)
    }
}

/// Counters describing what an allocator has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Times the heap was extended.
    pub grows: usize,
    /// Coalescing sweeps run.
    pub sweeps: usize,
    /// Pairs of blocks merged, by sweeps and by `realloc`.
    pub merges: usize,
    /// Blocks split to hand out only part of them.
    pub splits: usize,
    /// `realloc` calls served without moving the payload.
    pub in_place_resizes: usize,
}

/// A segregated free-list allocator over the memory source `M`.
pub struct SegAlloc<M: Memory> {
    memory: M,
    registry: Registry,
    heap_start: Offset,
    memory_start: Offset,
    growth: Growth,
    stats: Stats,
}

impl<M: Memory> SegAlloc<M> {
    /// Lay out a new heap in `memory` with the default `Config`.
    pub fn new(memory: M) -> Result<SegAlloc<M>, AllocErr> {
        SegAlloc::with_config(memory, Config::default())
    }

    /// Lay out a new heap at the current high bound of `memory`: the class
    /// sentinels first, then one free block spanning the rest of the initial
    /// region.
    pub fn with_config(mut memory: M, config: Config) -> Result<SegAlloc<M>, AllocErr> {
        if memory.high_bound() % ALIGNMENT != 0 {
            return Err(AllocErr::Unsupported {
                details: "the memory source must end on an 8-byte boundary",
            });
        }
        let initial = config
            .initial_heap_size()
            .ok_or(AllocErr::Exhausted {
                request: config.initial_heap,
            })?;

        let heap_start = memory.extend(initial)?;
        let end = memory.high_bound();
        extra_assert_eq!(end - heap_start, initial.0);

        let mem = memory.bytes_mut();
        let (registry, memory_start) = Registry::layout(mem, heap_start);
        let first = FreeBlock::format(mem, memory_start, Bytes(end - memory_start));
        registry.insert(mem, first);
        debug!(
            "laid out {} byte heap at {}; first block of {} bytes at {}",
            initial.0,
            heap_start,
            end - memory_start,
            memory_start
        );

        let heap = SegAlloc {
            memory,
            registry,
            heap_start,
            memory_start,
            growth: Growth::new(initial),
            stats: Stats::default(),
        };
        extra_check!(heap, "init");
        Ok(heap)
    }

    /// Allocate at least `size` payload bytes.
    ///
    /// Tries the free lists, then a coalescing sweep, then grows the heap.
    /// Fails only if the memory source cannot be extended. A zero `size` still
    /// yields a minimum-sized block.
    pub fn malloc(&mut self, size: usize) -> Result<Payload, AllocErr> {
        let target = match block_size_for(size) {
            Some(target) => target,
            None => {
                warn!("malloc({}) overflows the block size", size);
                return Err(AllocErr::Exhausted {
                    request: Bytes(size),
                });
            }
        };

        let block = match self.find_free(target) {
            Some(block) => block,
            None => match self.coalesce(Some(target)) {
                Sweep::Satisfied(block) => block,
                Sweep::Completed => self.grow(target)?,
            },
        };

        let block = self.allocate(block, target);
        trace!("malloc({}) -> {}", size, block.payload());
        extra_check!(self, "malloc");
        Ok(Payload(block.payload()))
    }

    /// Return `payload` to the free lists. Neighbours are not merged.
    ///
    /// `payload` must be live: freeing twice, or freeing something this heap
    /// did not hand out, corrupts the heap.
    pub fn free(&mut self, payload: Payload) {
        let mem = self.memory.bytes_mut();
        let block = AllocatedBlock::from_payload(payload.0);
        extra_assert!(block.as_block().header(mem).is_allocated());
        let block = block.into_free(mem);
        self.registry.insert(mem, block);
        trace!("free({}): {} bytes", payload.0, block.size(mem).0);
        extra_check!(self, "free");
    }

    /// Resize `payload` to hold `size` bytes.
    ///
    /// The block first absorbs free blocks that directly follow it. If that is
    /// enough the payload stays where it is; otherwise the contents move to a
    /// fresh allocation. A zero `size` frees the block and returns `Ok(None)`.
    ///
    /// On failure the payload stays allocated with its contents intact, though
    /// it may have absorbed some of its free neighbours.
    pub fn realloc(&mut self, payload: Payload, size: usize) -> Result<Option<Payload>, AllocErr> {
        if size == 0 {
            self.free(payload);
            return Ok(None);
        }
        let target = block_size_for(size).ok_or(AllocErr::Exhausted {
            request: Bytes(size),
        })?;

        let block = AllocatedBlock::from_payload(payload.0);
        let mem = self.memory.bytes_mut();
        let capacity = block.capacity(mem);
        let mut current = block.size(mem);

        while current < target {
            match block.as_block().mergeable_successor(mem) {
                Some(next) => {
                    Registry::remove(mem, next);
                    current = current + next.size(mem);
                    block.set_size(mem, current);
                    self.stats.merges += 1;
                }
                None => break,
            }
        }

        if current < target {
            let moved = self.malloc(size)?;
            let len = cmp::min(capacity.0, size);
            self.memory
                .bytes_mut()
                .copy_within(payload.0..payload.0 + len, moved.0);
            self.free(payload);
            trace!("realloc({}, {}) -> {} (moved)", payload.0, size, moved.0);
            return Ok(Some(moved));
        }

        let mem = self.memory.bytes_mut();
        if current - target >= MIN_BLOCK_SIZE {
            block.set_size(mem, target);
            let rest = FreeBlock::format(mem, block.0 + target.0, current - target);
            self.registry.insert(mem, rest);
            self.stats.splits += 1;
        }
        self.stats.in_place_resizes += 1;
        trace!("realloc({}, {}) -> {} (in place)", payload.0, size, payload.0);
        extra_check!(self, "realloc");
        Ok(Some(payload))
    }

    /// Merge every run of address-adjacent free blocks. Returns the number of
    /// merges performed.
    pub fn coalesce_all(&mut self) -> usize {
        let before = self.stats.merges;
        let sweep = self.coalesce(None);
        extra_assert_eq!(sweep, Sweep::Completed);
        self.stats.merges - before
    }

    /// The usable bytes of `payload`.
    pub fn payload(&self, payload: Payload) -> &[u8] {
        let mem = self.memory.bytes();
        let block = AllocatedBlock::from_payload(payload.0);
        &mem[payload.0..block.0 + block.size(mem).0]
    }

    /// The usable bytes of `payload`, mutably.
    pub fn payload_mut(&mut self, payload: Payload) -> &mut [u8] {
        let mem = self.memory.bytes_mut();
        let block = AllocatedBlock::from_payload(payload.0);
        let end = block.0 + block.size(mem).0;
        &mut mem[payload.0..end]
    }

    /// How many bytes `payload` can hold. At least what was asked for.
    pub fn usable_size(&self, payload: Payload) -> Bytes {
        AllocatedBlock::from_payload(payload.0).capacity(self.memory.bytes())
    }

    /// The memory source.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Give back the memory source, heap contents included.
    pub fn into_memory(self) -> M {
        self.memory
    }

    /// Bytes obtained from the memory source so far, sentinels included.
    pub fn heap_size(&self) -> Bytes {
        Bytes(self.memory.high_bound() - self.heap_start)
    }

    /// Offset of the first block after the sentinels.
    pub fn memory_start(&self) -> Offset {
        self.memory_start
    }

    /// What the allocator has done so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// How much the heap will be extended by the next time it runs dry,
    /// unless the request needs more.
    pub fn next_increment(&self) -> Bytes {
        self.growth.next_increment()
    }

    /// First fit: the first non-empty exact class at or above `target`, else
    /// the first large enough member of the large classes, smallest first.
    fn find_free(&self, target: Bytes) -> Option<FreeBlock> {
        let mem = self.memory.bytes();
        let registry = &self.registry;
        let class = SizeClass::of(target);

        if class.is_small() {
            if let Some(class) = class.small_from().find(|c| !registry.is_empty(mem, *c)) {
                return registry.first(mem, class);
            }
        }

        class
            .large_from()
            .flat_map(move |c| registry.iter(mem, c))
            .find(|block| block.size(mem) >= target)
    }

    /// Unfile `block` and hand out its first `target` bytes, splitting off the
    /// rest if it can stand as a block of its own.
    fn allocate(&mut self, block: FreeBlock, target: Bytes) -> AllocatedBlock {
        let mem = self.memory.bytes_mut();
        let size = block.size(mem);
        extra_assert!(size >= target);

        Registry::remove(mem, block);
        if size - target >= MIN_BLOCK_SIZE {
            block.set_size(mem, target);
            let rest = FreeBlock::format(mem, block.0 + target.0, size - target);
            self.registry.insert(mem, rest);
            self.stats.splits += 1;
        }
        block.into_allocated(mem)
    }

    fn coalesce(&mut self, target: Option<Bytes>) -> Sweep {
        let before = self.stats.merges;
        let sweep = coalesce::sweep(
            &self.registry,
            self.memory.bytes_mut(),
            target,
            &mut self.stats.merges,
        );
        self.stats.sweeps += 1;
        debug!(
            "coalescing sweep for {:?}: {} merges, {:?}",
            target.map(|t| t.0),
            self.stats.merges - before,
            sweep
        );
        sweep
    }

    /// Extend the heap by enough to hold a block of `needed` bytes, filing the
    /// new span as one free block.
    fn grow(&mut self, needed: Bytes) -> Result<FreeBlock, AllocErr> {
        let increment = self
            .growth
            .increment_for(needed)
            .ok_or(AllocErr::Exhausted { request: needed })?;

        let start = match self.memory.extend(increment) {
            Ok(start) => start,
            Err(e) => {
                warn!("could not grow the heap by {} bytes: {}", increment.0, e);
                return Err(e);
            }
        };
        self.growth.commit(increment);
        let end = self.memory.high_bound();
        extra_assert_eq!(end - start, increment.0);

        let mem = self.memory.bytes_mut();
        let block = FreeBlock::format(mem, start, Bytes(end - start));
        self.registry.insert(mem, block);
        self.stats.grows += 1;
        debug!(
            "grew the heap by {} bytes for a {} byte block; heap ends at {}",
            increment.0, needed.0, end
        );
        Ok(block)
    }
}
