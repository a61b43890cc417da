//! The memory source a `SegAlloc` manages.

use super::block::Offset;
use super::AllocErr;
use memory_units::Bytes;

/// A contiguous, growable region of raw memory.
///
/// The region only ever grows at its high end, and `bytes` always covers
/// exactly `0..high_bound()`.
pub trait Memory {
    /// Append `bytes` to the region, contiguous with the current high bound.
    /// Returns the offset of the first new byte.
    fn extend(&mut self, bytes: Bytes) -> Result<Offset, AllocErr>;

    /// One past the last byte of the region.
    fn high_bound(&self) -> Offset;

    /// The whole region.
    fn bytes(&self) -> &[u8];

    /// The whole region, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl<'a, M: Memory + ?Sized> Memory for &'a mut M {
    fn extend(&mut self, bytes: Bytes) -> Result<Offset, AllocErr> {
        (**self).extend(bytes)
    }

    fn high_bound(&self) -> Offset {
        (**self).high_bound()
    }

    fn bytes(&self) -> &[u8] {
        (**self).bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        (**self).bytes_mut()
    }
}

/// Counts the calls made to the wrapped memory source.
#[derive(Debug, Default)]
pub struct Counted<M> {
    inner: M,
    extends: usize,
    failed_extends: usize,
    obtained: usize,
}

impl<M: Memory> Counted<M> {
    /// Wrap `inner`.
    pub fn new(inner: M) -> Counted<M> {
        Counted {
            inner,
            extends: 0,
            failed_extends: 0,
            obtained: 0,
        }
    }

    /// Successful calls to `extend`.
    pub fn extends(&self) -> usize {
        self.extends
    }

    /// Calls to `extend` that the inner source refused.
    pub fn failed_extends(&self) -> usize {
        self.failed_extends
    }

    /// Total bytes handed out by the inner source.
    pub fn obtained(&self) -> Bytes {
        Bytes(self.obtained)
    }

    /// The wrapped source.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Unwrap the inner source.
    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Memory> Memory for Counted<M> {
    fn extend(&mut self, bytes: Bytes) -> Result<Offset, AllocErr> {
        match self.inner.extend(bytes) {
            Ok(start) => {
                self.extends += 1;
                self.obtained += bytes.0;
                Ok(start)
            }
            Err(e) => {
                self.failed_extends += 1;
                Err(e)
            }
        }
    }

    fn high_bound(&self) -> Offset {
        self.inner.high_bound()
    }

    fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.inner.bytes_mut()
    }
}
