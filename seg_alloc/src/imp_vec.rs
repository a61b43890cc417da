use super::block::Offset;
use super::memory::Memory;
use super::AllocErr;
use alloc::vec::Vec;
use memory_units::Bytes;

/// The default cap on how large a heap may grow, set at build time through
/// the `SEG_ALLOC_MAX_HEAP_BYTES` environment variable.
pub const DEFAULT_MAX_HEAP: Bytes = Bytes(include!(concat!(
    env!("OUT_DIR"),
    "/seg_alloc_max_heap_bytes.txt"
)));

/// A heap kept in a `Vec<u8>`, refusing to grow past a fixed limit.
///
/// The backing buffer may move when it grows, so payloads are only reachable
/// through their offsets.
#[derive(Debug, Clone)]
pub struct VecHeap {
    buf: Vec<u8>,
    limit: usize,
}

impl VecHeap {
    /// An empty heap that may grow up to `DEFAULT_MAX_HEAP`.
    pub fn new() -> VecHeap {
        VecHeap::with_limit(DEFAULT_MAX_HEAP)
    }

    /// An empty heap that may grow up to `limit` bytes.
    pub fn with_limit(limit: Bytes) -> VecHeap {
        VecHeap {
            buf: Vec::new(),
            limit: limit.0,
        }
    }

    /// The most this heap will ever hold.
    pub fn limit(&self) -> Bytes {
        Bytes(self.limit)
    }
}

impl Default for VecHeap {
    fn default() -> VecHeap {
        VecHeap::new()
    }
}

impl Memory for VecHeap {
    fn extend(&mut self, bytes: Bytes) -> Result<Offset, AllocErr> {
        let start = self.buf.len();
        match start.checked_add(bytes.0) {
            Some(end) if end <= self.limit => {
                self.buf.resize(end, 0);
                Ok(start)
            }
            _ => Err(AllocErr::Exhausted { request: bytes }),
        }
    }

    fn high_bound(&self) -> Offset {
        self.buf.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[test]
fn grows_contiguously_up_to_the_limit() {
    let mut heap = VecHeap::with_limit(Bytes(4096));
    assert_eq!(heap.extend(Bytes(1536)), Ok(0));
    assert_eq!(heap.extend(Bytes(1536)), Ok(1536));
    assert_eq!(heap.high_bound(), 3072);
    assert_eq!(heap.bytes().len(), 3072);
    assert_eq!(
        heap.extend(Bytes(1536)),
        Err(AllocErr::Exhausted { request: Bytes(1536) })
    );
    assert_eq!(heap.high_bound(), 3072);
}
