//! Delayed coalescing.
//!
//! Freeing a block never merges it with its neighbours. Instead, when an
//! allocation cannot be served from the free lists, one sweep walks every
//! class and folds each member together with the free blocks that directly
//! follow it in memory. Frees stay *O(1)*; the cost is paid in occasional
//! sweeps that are linear in the number of free blocks.

use super::block::FreeBlock;
use super::size_classes::{Registry, SizeClass};
use memory_units::Bytes;

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sweep {
    /// A merge produced a block of at least the requested size. It is filed in
    /// the registry like any other free block. The rest of the heap was not
    /// swept.
    Satisfied(FreeBlock),
    /// Every class was swept.
    Completed,
}

/// Sweep all classes in ascending order, merging address-adjacent free
/// blocks. With a `target`, stop at the first merge that reaches it.
pub(crate) fn sweep(
    registry: &Registry,
    mem: &mut [u8],
    target: Option<Bytes>,
    merges: &mut usize,
) -> Sweep {
    for class in SizeClass::all() {
        let mut cur = registry.first(mem, class);

        while let Some(block) = cur {
            // The member to visit after this one. A merge re-files `block`
            // elsewhere, so remember where this class's walk continues, and
            // keep it pointing at a live member if it gets absorbed.
            let mut after = block.next_free(mem).map(FreeBlock);
            let mut unlinked = false;

            while let Some(next) = block.as_block().mergeable_successor(mem) {
                if !unlinked {
                    Registry::remove(mem, block);
                    unlinked = true;
                }
                if after == Some(next) {
                    after = next.next_free(mem).map(FreeBlock);
                }

                let merged = block.size(mem) + next.size(mem);
                Registry::remove(mem, next);
                block.set_size(mem, merged);
                *merges += 1;

                if let Some(target) = target {
                    if merged >= target {
                        registry.insert(mem, block);
                        return Sweep::Satisfied(block);
                    }
                }
            }

            if unlinked {
                registry.insert(mem, block);
            }
            cur = after;
        }
    }

    Sweep::Completed
}
