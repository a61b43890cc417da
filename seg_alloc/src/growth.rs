//! Heap growth policy.

use memory_units::Bytes;

/// Tracks how much to ask the memory source for next time the heap runs dry.
///
/// The increment starts at the initial heap size and is doubled until it
/// covers the request. It never shrinks, so a run of large requests makes all
/// later growths large too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Growth {
    next_increment: Bytes,
}

impl Growth {
    pub(crate) fn new(initial: Bytes) -> Growth {
        extra_assert!(initial.0 > 0);
        Growth {
            next_increment: initial,
        }
    }

    /// The number of bytes to extend the heap by to fit a block of `needed`
    /// bytes. Returns `None` if doubling would overflow.
    ///
    /// Nothing is recorded until the extension succeeds and is passed to
    /// `commit`.
    pub(crate) fn increment_for(&self, needed: Bytes) -> Option<Bytes> {
        let mut increment = self.next_increment;
        while increment < needed {
            increment = Bytes(increment.0.checked_mul(2)?);
        }
        Some(increment)
    }

    /// Record that the heap was extended by `increment`.
    pub(crate) fn commit(&mut self, increment: Bytes) {
        extra_assert!(increment >= self.next_increment);
        self.next_increment = increment;
    }

    pub(crate) fn next_increment(&self) -> Bytes {
        self.next_increment
    }
}

#[test]
fn doubles_only_when_needed() {
    let mut g = Growth::new(Bytes(1536));
    assert_eq!(g.increment_for(Bytes(24)), Some(Bytes(1536)));
    assert_eq!(g.increment_for(Bytes(1536)), Some(Bytes(1536)));
    assert_eq!(g.increment_for(Bytes(1544)), Some(Bytes(3072)));

    let increment = g.increment_for(Bytes(10_000)).unwrap();
    assert_eq!(increment, Bytes(12288));
    g.commit(increment);
    assert_eq!(g.increment_for(Bytes(24)), Some(Bytes(12288)));
    assert_eq!(g.next_increment(), Bytes(12288));
}

#[test]
fn uncommitted_increments_are_forgotten() {
    let g = Growth::new(Bytes(1536));
    assert_eq!(g.increment_for(Bytes(100_000)), Some(Bytes(196608)));
    assert_eq!(g.next_increment(), Bytes(1536));
    assert_eq!(g.increment_for(Bytes(24)), Some(Bytes(1536)));
}

#[test]
fn overflow_is_reported() {
    let g = Growth::new(Bytes(1536));
    assert_eq!(g.increment_for(Bytes(usize::MAX)), None);
    assert_eq!(g.next_increment(), Bytes(1536));
}
