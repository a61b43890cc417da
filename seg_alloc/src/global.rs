use super::block::ALIGNMENT;
use super::const_init::ConstInit;
use super::imp_unix::MmapHeap;
use super::imp_vec::DEFAULT_MAX_HEAP;
use super::{AllocErr, Payload, SegAlloc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;
use std::alloc::System;

pub(crate) struct Exclusive<T> {
    inner: Mutex<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: Mutex::new(T::INIT),
    };
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// `f` must not re-enter this method for the same `Exclusive`, or it will
    /// spin forever.
    #[inline]
    pub(crate) fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let mut guard = self.inner.lock();
        f(&mut *guard)
    }
}

/// A `SegAlloc` over an `mmap`ed heap, usable as the global allocator.
///
/// The heap is reserved on first use, sized by `DEFAULT_MAX_HEAP`. Every call
/// takes a spin lock, so the allocator itself stays single-threaded.
///
/// Requests aligned to more than 8 bytes are passed on to the system
/// allocator. A logger that allocates must not be installed while this is the
/// global allocator, since `seg_alloc` logs from inside the lock. For the same
/// reason `extra_assertions` cannot be combined with this: the heap check
/// allocates.
pub struct GlobalSegAlloc {
    heap: Exclusive<Option<SegAlloc<MmapHeap>>>,
}

impl ConstInit for GlobalSegAlloc {
    const INIT: GlobalSegAlloc = GlobalSegAlloc {
        heap: Exclusive::INIT,
    };
}

impl GlobalSegAlloc {
    /// An initial `const` default construction of a `GlobalSegAlloc`.
    ///
    /// This is usable for initializing `static`s that get set as the global
    /// allocator.
    pub const INIT: Self = <Self as ConstInit>::INIT;

    fn with_heap<F, U>(&self, f: F) -> Result<U, AllocErr>
    where
        F: FnOnce(&mut SegAlloc<MmapHeap>, *mut u8) -> Result<U, AllocErr>,
    {
        self.heap.with_exclusive_access(|slot| {
            if slot.is_none() {
                let memory = MmapHeap::reserve(DEFAULT_MAX_HEAP)?;
                *slot = Some(SegAlloc::new(memory)?);
            }
            match slot.as_mut() {
                Some(heap) => {
                    let base = heap.memory().base();
                    f(heap, base)
                }
                None => Err(AllocErr::Unsupported {
                    details: "the global heap could not be set up",
                }),
            }
        })
    }
}

unsafe impl GlobalAlloc for GlobalSegAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return System.alloc(layout);
        }
        self.with_heap(|heap, base| {
            let payload = heap.malloc(layout.size())?;
            Ok(base.add(payload.offset()))
        })
        .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > ALIGNMENT {
            return System.dealloc(ptr, layout);
        }
        if ptr.is_null() {
            return;
        }
        let freed = self.with_heap(|heap, base| {
            heap.free(Payload::from_offset(ptr as usize - base as usize));
            Ok(())
        });
        extra_assert!(freed.is_ok(), "dealloc before the global heap was set up");
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return System.realloc(ptr, layout, new_size);
        }
        self.with_heap(|heap, base| {
            let payload = Payload::from_offset(ptr as usize - base as usize);
            Ok(match heap.realloc(payload, new_size)? {
                Some(payload) => base.add(payload.offset()),
                None => ptr::null_mut(),
            })
        })
        .unwrap_or(ptr::null_mut())
    }
}
