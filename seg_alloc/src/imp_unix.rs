use super::block::Offset;
use super::memory::Memory;
use super::AllocErr;
use core::ptr::{self, NonNull};
use core::slice;
use libc;
use memory_units::{Bytes, Pages, RoundUpTo};

/// A heap in its own `mmap`ed address range.
///
/// The whole range is reserved up front with no access rights, and pages are
/// made readable and writable as the break advances past them. The base
/// address never changes, so payload offsets can be turned into pointers that
/// stay valid for the life of the heap.
#[derive(Debug)]
pub struct MmapHeap {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    brk: usize,
}

// The mapping is exclusively owned.
unsafe impl Send for MmapHeap {}

impl MmapHeap {
    /// Reserve room for a heap of up to `limit` bytes.
    pub fn reserve(limit: Bytes) -> Result<MmapHeap, AllocErr> {
        let pages: Pages = limit.round_up_to();
        let reserved: Bytes = pages.into();
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                reserved.0,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(AllocErr::Exhausted { request: reserved });
        }
        let base = NonNull::new(addr as *mut u8).ok_or(AllocErr::Exhausted { request: reserved })?;
        Ok(MmapHeap {
            base,
            reserved: reserved.0,
            committed: 0,
            brk: 0,
        })
    }

    /// Address of offset zero.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Address space set aside for this heap.
    pub fn reserved(&self) -> Bytes {
        Bytes(self.reserved)
    }

    fn commit_through(&mut self, end: usize) -> Result<(), AllocErr> {
        if end <= self.committed {
            return Ok(());
        }
        let pages: Pages = Bytes(end - self.committed).round_up_to();
        let grow: Bytes = pages.into();
        extra_assert!(self.committed + grow.0 <= self.reserved);
        let code = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(self.committed) as *mut libc::c_void,
                grow.0,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if code != 0 {
            return Err(AllocErr::Exhausted { request: grow });
        }
        self.committed += grow.0;
        Ok(())
    }
}

impl Memory for MmapHeap {
    fn extend(&mut self, bytes: Bytes) -> Result<Offset, AllocErr> {
        let end = match self.brk.checked_add(bytes.0) {
            Some(end) if end <= self.reserved => end,
            _ => return Err(AllocErr::Exhausted { request: bytes }),
        };
        self.commit_through(end)?;
        let start = self.brk;
        self.brk = end;
        Ok(start)
    }

    fn high_bound(&self) -> Offset {
        self.brk
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.brk) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.brk) }
    }
}

impl Drop for MmapHeap {
    fn drop(&mut self) {
        let code = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.reserved) };
        extra_assert_eq!(code, 0, "munmap should run OK");
    }
}

#[test]
fn commits_pages_as_the_break_moves() {
    let mut heap = MmapHeap::reserve(Bytes(1 << 20)).unwrap();
    assert_eq!(heap.reserved(), Bytes(1 << 20));
    assert_eq!(heap.high_bound(), 0);

    assert_eq!(heap.extend(Bytes(1536)), Ok(0));
    assert_eq!(heap.committed, 65536);
    heap.bytes_mut()[1535] = 7;

    assert_eq!(heap.extend(Bytes(65536)), Ok(1536));
    assert_eq!(heap.committed, 2 * 65536);
    heap.bytes_mut()[1536 + 65535] = 9;
    assert_eq!(heap.bytes()[1535], 7);
    assert_eq!(heap.bytes().len(), 1536 + 65536);

    assert!(heap.extend(Bytes(1 << 20)).is_err());
    assert_eq!(heap.high_bound(), 1536 + 65536);
}
