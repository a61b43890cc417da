#[macro_use]
extern crate cfg_if;
#[macro_use]
extern crate quickcheck;

use log::debug;
use quickcheck::{Arbitrary, Gen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seg_alloc::{
    AllocErr, Bytes, Counted, Memory, Offset, Payload, SegAlloc, VecHeap, Violation, ALIGNMENT,
    SMALL_LIMIT,
};
use std::cmp;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),

    // Resize the n^th allocation to this many bytes, or no-op if it has
    // already been freed. Resizing to zero frees it.
    Realloc(usize, usize),
}

pub use crate::Operation::*;

impl Operation {
    #[inline]
    fn arbitrary_alloc<R: Rng>(
        rng: &mut R,
        active_allocs: &mut Vec<usize>,
        num_allocs: &mut usize,
    ) -> Self {
        active_allocs.push(*num_allocs);
        *num_allocs += 1;

        // Zero sized allocation 1/1000 times.
        if rng.gen_ratio(1, 1000) {
            return Alloc(0);
        }

        let max_small_alloc_size = SMALL_LIMIT.0;

        // Do a large allocation with probability P = 1/20.
        if rng.gen_ratio(1, 20) {
            let n = rng.gen_range(1..10usize) * max_small_alloc_size
                + rng.gen_range(0..max_small_alloc_size);
            return Alloc(n);
        }

        // Small allocation.
        if rng.gen() {
            Alloc(rng.gen_range(12..17))
        } else {
            Alloc(rng.gen_range(17..=max_small_alloc_size))
        }
    }

    #[inline]
    fn arbitrary_free<R: Rng>(rng: &mut R, active_allocs: &mut Vec<usize>) -> Self {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Free(active_allocs.swap_remove(i))
    }

    #[inline]
    fn arbitrary_realloc<R: Rng>(rng: &mut R, active_allocs: &[usize]) -> Self {
        assert!(!active_allocs.is_empty());
        let idx = active_allocs[rng.gen_range(0..active_allocs.len())];
        let size = if rng.gen() {
            rng.gen_range(1..=SMALL_LIMIT.0)
        } else {
            rng.gen_range(SMALL_LIMIT.0..4 * SMALL_LIMIT.0)
        };
        Realloc(idx, size)
    }
}

/// A trace file that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number, or 0 when the error is not tied to a line.
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new<S: Into<String>>(line: usize, message: S) -> ParseError {
        ParseError {
            line,
            message: message.into(),
        }
    }

    fn at_line(self, line: usize) -> ParseError {
        ParseError { line, ..self }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "line {}: {}", self.line, self.message)
        }
    }
}

impl Error for ParseError {}

fn parse_number(line: usize, word: Option<&str>, what: &str) -> Result<usize, ParseError> {
    match word {
        Some(word) => word
            .parse()
            .map_err(|_| ParseError::new(line, format!("bad {} `{}`", what, word))),
        None => Err(ParseError::new(line, format!("missing {}", what))),
    }
}

// The comma separated arguments of `s`, if it reads `{prefix}args),`.
fn call_args<'a>(s: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    if s.starts_with(prefix) && s.ends_with("),") {
        let inner = &s[prefix.len()..s.len() - "),".len()];
        Some(inner.split(',').map(str::trim).collect())
    } else {
        None
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();

        if let Some(args) = call_args(s, "Alloc(") {
            return Ok(Alloc(parse_number(0, args.get(0).cloned(), "size")?));
        }
        if let Some(args) = call_args(s, "Free(") {
            return Ok(Free(parse_number(0, args.get(0).cloned(), "index")?));
        }
        if let Some(args) = call_args(s, "Realloc(") {
            let idx = parse_number(0, args.get(0).cloned(), "index")?;
            let size = parse_number(0, args.get(1).cloned(), "size")?;
            return Ok(Realloc(idx, size));
        }

        Err(ParseError::new(0, format!("unknown operation `{}`", s)))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Alloc(size) => write!(f, "Alloc({}),", size),
            Free(idx) => write!(f, "Free({}),", idx),
            Realloc(idx, size) => write!(f, "Realloc({}, {}),", idx, size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operations(pub Vec<Operation>);

impl FromStr for Operations {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut ops = vec![];
        for (i, line) in s.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            ops.push(line.parse().map_err(|e: ParseError| e.at_line(i + 1))?);
        }
        Ok(Operations(ops))
    }
}

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 500;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 10_000;

impl Arbitrary for Operations {
    #[inline(never)]
    fn arbitrary(g: &mut Gen) -> Self {
        // `Gen` only hands out values through `Arbitrary`, so seed a real RNG
        // from it.
        let mut rng = StdRng::seed_from_u64(u64::arbitrary(g));
        let rng = &mut rng;

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 so that the heap keeps growing and the
            // coalescing and growth paths get exercised.
            if !active_allocs.is_empty() && rng.gen_ratio(1, 4) {
                operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
            } else if !active_allocs.is_empty() && rng.gen_ratio(1, 20) {
                operations.push(Operation::arbitrary_realloc(rng, &active_allocs));
            } else {
                operations.push(Operation::arbitrary_alloc(
                    rng,
                    &mut active_allocs,
                    &mut num_allocs,
                ));
            }
        }

        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
        }

        Operations(operations)
    }

    #[inline(never)]
    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        let prefixes =
            (0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect()));

        let free_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match *op {
                Free(_) | Realloc(..) => Some(i),
                Alloc(_) => None,
            })
            .collect();

        let ops = self.0.clone();
        let without_frees = free_indices.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        let num_allocs = self.0.iter().filter(|op| matches!(op, Alloc(_))).count();

        let ops = self.0.clone();
        let without_allocs = (0..num_allocs).map(move |n| Operations::without_alloc(&ops, n));

        let ops = self.0.clone();
        let smaller_allocs = (0..self.0.len())
            .filter(move |i| matches!(ops[*i], Alloc(size) if size > 0))
            .map({
                let ops = self.0.clone();
                move |i| {
                    let mut ops = ops.clone();
                    if let Alloc(size) = ops[i] {
                        ops[i] = Alloc(size / 2);
                    }
                    Operations(ops)
                }
            });

        Box::new(
            prefixes
                .chain(without_frees)
                .chain(without_allocs)
                .chain(smaller_allocs),
        )
    }
}

// Which slot a `Free`/`Realloc` of `idx` refers to once the `n`th allocation
// is gone.
fn reindex(idx: usize, n: usize) -> Option<usize> {
    if idx == n {
        None
    } else if idx > n {
        Some(idx - 1)
    } else {
        Some(idx)
    }
}

/// The outcome of a successful replay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Replay {
    pub ops: usize,
    /// Most requested bytes live at once.
    pub peak_payload: Bytes,
    /// Heap size once the trace finished, sentinels included.
    pub heap_size: Bytes,
    pub grows: usize,
}

impl Replay {
    /// Peak payload over final heap size.
    pub fn utilization(&self) -> f64 {
        if self.heap_size.0 == 0 {
            return 0.0;
        }
        self.peak_payload.0 as f64 / self.heap_size.0 as f64
    }
}

/// What to verify while replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    /// Check alignment, bounds and overlap of every payload, and fill payloads
    /// with a pattern that must survive until they are freed.
    pub check_payloads: bool,
    /// Run `SegAlloc::check` after every operation.
    pub check_heap: bool,
}

impl Validation {
    pub const NONE: Validation = Validation {
        check_payloads: false,
        check_heap: false,
    };

    pub const PAYLOADS: Validation = Validation {
        check_payloads: true,
        check_heap: false,
    };

    pub const FULL: Validation = Validation {
        check_payloads: true,
        check_heap: true,
    };
}

impl Default for Validation {
    fn default() -> Validation {
        Validation::PAYLOADS
    }
}

/// Why a replay stopped. `op` is the index of the offending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    Alloc { op: usize, error: AllocErr },
    Misaligned { op: usize, offset: Offset },
    OutOfHeap { op: usize, offset: Offset, len: usize },
    Overlap { op: usize, offset: Offset, other: Offset },
    Corrupted { op: usize, slot: usize },
    Inconsistent { op: usize, violation: Violation },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReplayError::Alloc { op, ref error } => write!(f, "op {}: {}", op, error),
            ReplayError::Misaligned { op, offset } => {
                write!(f, "op {}: payload at {} is not {}-byte aligned", op, offset, ALIGNMENT)
            }
            ReplayError::OutOfHeap { op, offset, len } => write!(
                f,
                "op {}: payload of {} bytes at {} lies outside the heap",
                op, len, offset
            ),
            ReplayError::Overlap { op, offset, other } => write!(
                f,
                "op {}: payload at {} overlaps the live payload at {}",
                op, offset, other
            ),
            ReplayError::Corrupted { op, slot } => {
                write!(f, "op {}: contents of allocation {} were clobbered", op, slot)
            }
            ReplayError::Inconsistent { op, ref violation } => {
                write!(f, "op {}: {}", op, violation)
            }
        }
    }
}

impl Error for ReplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ReplayError::Alloc { ref error, .. } => Some(error),
            ReplayError::Inconsistent { ref violation, .. } => Some(violation),
            _ => None,
        }
    }
}

fn pattern(slot: usize, k: usize) -> u8 {
    (slot.wrapping_mul(31).wrapping_add(k) % 251) as u8
}

struct Replayer<'a, M: Memory> {
    heap: &'a mut SegAlloc<M>,
    validation: Validation,
    slots: Vec<Option<(Payload, usize)>>,
    // Live payload ranges, start to end.
    live: BTreeMap<Offset, Offset>,
    payload: usize,
    peak: usize,
}

impl<'a, M: Memory> Replayer<'a, M> {
    fn step(&mut self, op: usize, operation: Operation) -> Result<(), ReplayError> {
        match operation {
            Alloc(size) => {
                let payload = self
                    .heap
                    .malloc(size)
                    .map_err(|error| ReplayError::Alloc { op, error })?;
                self.slots.push(Some((payload, size)));
                self.placed(op, self.slots.len() - 1)
            }
            Free(slot) => {
                if let Some((payload, _)) = self.take(op, slot)? {
                    self.heap.free(payload);
                }
                Ok(())
            }
            Realloc(slot, size) => {
                let (payload, old_size) = match self.take(op, slot)? {
                    Some(entry) => entry,
                    None => return Ok(()),
                };
                let moved = self
                    .heap
                    .realloc(payload, size)
                    .map_err(|error| ReplayError::Alloc { op, error })?;
                if let Some(moved) = moved {
                    self.slots[slot] = Some((moved, size));
                    if self.validation.check_payloads
                        && !self.intact(slot, moved, cmp::min(old_size, size))
                    {
                        return Err(ReplayError::Corrupted { op, slot });
                    }
                    self.placed(op, slot)?;
                }
                Ok(())
            }
        }
    }

    // Check a payload that was just handed out, then fill it.
    fn placed(&mut self, op: usize, slot: usize) -> Result<(), ReplayError> {
        let (payload, size) = match self.slots[slot] {
            Some(entry) => entry,
            None => return Ok(()),
        };
        self.payload += size;
        self.peak = cmp::max(self.peak, self.payload);
        if !self.validation.check_payloads {
            return Ok(());
        }

        let start = payload.offset();
        let end = start + cmp::max(size, 1);
        if start % ALIGNMENT != 0 {
            return Err(ReplayError::Misaligned { op, offset: start });
        }
        if start < self.heap.memory_start() || end > self.heap.memory().high_bound() {
            return Err(ReplayError::OutOfHeap {
                op,
                offset: start,
                len: size,
            });
        }
        if let Some((&other, &other_end)) = self.live.range(..end).next_back() {
            if other_end > start {
                return Err(ReplayError::Overlap {
                    op,
                    offset: start,
                    other,
                });
            }
        }
        self.live.insert(start, end);

        for (k, byte) in self.heap.payload_mut(payload)[..size].iter_mut().enumerate() {
            *byte = pattern(slot, k);
        }
        Ok(())
    }

    // Unregister a live slot, checking its contents on the way out.
    fn take(&mut self, op: usize, slot: usize) -> Result<Option<(Payload, usize)>, ReplayError> {
        let entry = match self.slots.get_mut(slot) {
            Some(entry) => entry.take(),
            None => None,
        };
        if let Some((payload, size)) = entry {
            self.payload -= size;
            if self.validation.check_payloads {
                self.live.remove(&payload.offset());
                if !self.intact(slot, payload, size) {
                    return Err(ReplayError::Corrupted { op, slot });
                }
            }
        }
        Ok(entry)
    }

    fn intact(&self, slot: usize, payload: Payload, len: usize) -> bool {
        self.heap.payload(payload)[..len]
            .iter()
            .enumerate()
            .all(|(k, byte)| *byte == pattern(slot, k))
    }
}

impl Operations {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a trace in the malloclab `.rep` format: four header numbers
    /// (suggested heap size, number of ids, number of operations, weight),
    /// then one `a id size`, `f id` or `r id size` per line.
    pub fn from_rep(s: &str) -> Result<Operations, ParseError> {
        let mut lines = s
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        for field in &[
            "suggested heap size",
            "number of ids",
            "number of operations",
            "weight",
        ] {
            match lines.next() {
                Some((n, line)) => {
                    line.parse::<f64>().map_err(|_| {
                        ParseError::new(n, format!("expected the {}, found `{}`", field, line))
                    })?;
                }
                None => return Err(ParseError::new(0, format!("missing the {}", field))),
            }
        }

        let mut ops = vec![];
        let mut slots = HashMap::new();
        let mut num_allocs = 0;
        for (n, line) in lines {
            let mut words = line.split_whitespace();
            let kind = words.next();
            let id = parse_number(n, words.next(), "id")?;
            let slot = |slots: &HashMap<usize, usize>| {
                slots
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| ParseError::new(n, format!("id {} was never allocated", id)))
            };
            match kind {
                Some("a") => {
                    let size = parse_number(n, words.next(), "size")?;
                    slots.insert(id, num_allocs);
                    num_allocs += 1;
                    ops.push(Alloc(size));
                }
                Some("f") => ops.push(Free(slot(&slots)?)),
                Some("r") => {
                    let size = parse_number(n, words.next(), "size")?;
                    ops.push(Realloc(slot(&slots)?, size));
                }
                _ => return Err(ParseError::new(n, format!("unknown operation `{}`", line))),
            }
        }
        Ok(Operations(ops))
    }

    /// Parse `contents`, picking the format from `name`'s extension: `.rep`
    /// for malloclab traces, anything else for one `Alloc(n),` per line.
    pub fn parse_trace(name: &str, contents: &str) -> Result<Operations, ParseError> {
        if name.ends_with(".rep") {
            Operations::from_rep(contents)
        } else {
            contents.parse()
        }
    }

    /// Replay every operation against `heap`.
    pub fn replay<M: Memory>(
        &self,
        heap: &mut SegAlloc<M>,
        validation: Validation,
    ) -> Result<Replay, ReplayError> {
        let mut replayer = Replayer {
            heap,
            validation,
            slots: vec![],
            live: BTreeMap::new(),
            payload: 0,
            peak: 0,
        };

        for (op, operation) in self.0.iter().enumerate() {
            replayer.step(op, *operation)?;
            if validation.check_heap {
                replayer
                    .heap
                    .check()
                    .map_err(|violation| ReplayError::Inconsistent { op, violation })?;
            }
        }

        let replay = Replay {
            ops: self.0.len(),
            peak_payload: Bytes(replayer.peak),
            heap_size: replayer.heap.heap_size(),
            grows: replayer.heap.stats().grows,
        };
        debug!("replayed {:?}", replay);
        Ok(replay)
    }

    pub fn run_single_threaded(&self) -> Replay {
        let mut heap = SegAlloc::new(Counted::new(VecHeap::new()))
            .expect("a fresh heap fits its initial region");
        match self.replay(&mut heap, Validation::default()) {
            Ok(replay) => replay,
            Err(e) => panic!("replay failed: {}", e),
        }
    }

    /// Replay four traces at once, each on its own heap.
    pub fn run_multi_threaded(ops0: Self, ops1: Self, ops2: Self, ops3: Self) {
        use std::thread;

        let handle0 = thread::spawn(move || ops0.run_single_threaded());
        let handle1 = thread::spawn(move || ops1.run_single_threaded());
        let handle2 = thread::spawn(move || ops2.run_single_threaded());
        let handle3 = thread::spawn(move || ops3.run_single_threaded());

        handle0.join().expect("Thread 0 Failed");
        handle1.join().expect("Thread 1 Failed");
        handle2.join().expect("Thread 2 Failed");
        handle3.join().expect("Thread 3 Failed");
    }

    // Drop the `n`th allocation, and every free or resize of it.
    fn without_alloc(ops: &[Operation], n: usize) -> Operations {
        let mut seen = 0;
        Operations(
            ops.iter()
                .filter_map(|op| match *op {
                    Alloc(size) => {
                        seen += 1;
                        if seen - 1 == n {
                            None
                        } else {
                            Some(Alloc(size))
                        }
                    }
                    Free(idx) => reindex(idx, n).map(Free),
                    Realloc(idx, size) => reindex(idx, n).map(|idx| Realloc(idx, size)),
                })
                .collect(),
        )
    }

    const NUM_BUCKETS: u64 = 20;

    pub fn size_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        for op in &self.0 {
            if let Alloc(n) | Realloc(_, n) = *op {
                let n = n as f64;
                let n = n.log2().round();
                histogram.add(n as u64);
            }
        }
        histogram
    }

    /// How many operations each allocation stayed live for.
    pub fn lifetime_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        let mut born = vec![];
        for (i, op) in self.0.iter().enumerate() {
            match *op {
                Alloc(_) => born.push(i),
                Free(idx) | Realloc(idx, 0) => {
                    if let Some(&start) = born.get(idx) {
                        histogram.add((i - start) as u64);
                    }
                }
                Realloc(..) => {}
            }
        }
        histogram
    }

    pub fn read_trace(trace: &str) -> Self {
        let trace_dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/traces"));
        let contents = fs::read_to_string(trace_dir.join(trace))
            .unwrap_or_else(|e| panic!("could not read {}: {}", trace, e));
        Operations::parse_trace(trace, &contents)
            .unwrap_or_else(|e| panic!("could not parse {}: {}", trace, e))
    }
}

impl fmt::Display for Operations {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for op in &self.0 {
            writeln!(f, "{}", op)?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ($name:ident) => {
        #[test]
        fn $name() {
            fn single_threaded(ops: Operations) {
                ops.run_single_threaded();
            }

            quickcheck::QuickCheck::new()
                .tests(1)
                .quickcheck(single_threaded as fn(Operations) -> ());
        }
    };
}

// Let the test harness run each of our single threaded quickchecks concurrently
// with each other.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
// Every operation already runs a full heap check with extra assertions on.
cfg_if! {
    if #[cfg(not(feature = "extra_assertions"))] {
        run_quickchecks!(quickchecks_2);
        run_quickchecks!(quickchecks_3);
        run_quickchecks!(quickchecks_4);
        run_quickchecks!(quickchecks_5);
        run_quickchecks!(quickchecks_6);
        run_quickchecks!(quickchecks_7);
    }
}

#[test]
fn multi_threaded_quickchecks() {
    quickcheck::QuickCheck::new().tests(1).quickcheck(
        Operations::run_multi_threaded as fn(Operations, Operations, Operations, Operations) -> (),
    );
}

quickcheck! {
    fn single_allocation_with_size(size: usize) -> bool {
        let size = size % 65536;
        let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
        let p = heap.malloc(size).unwrap();
        p.offset() % ALIGNMENT == 0 && heap.usable_size(p).0 >= size && heap.check().is_ok()
    }

    fn realloc_keeps_the_common_prefix(size: usize, new_size: usize) -> bool {
        let size = size % 4096;
        let new_size = new_size % 4096 + 1;
        let ops = Operations(vec![Alloc(16), Alloc(size), Alloc(16), Realloc(1, new_size), Free(1)]);
        let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
        ops.replay(&mut heap, Validation::FULL).is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! test_trace {
    ($name:ident, $trace:expr) => {
        #[test]
        fn $name() {
            let ops = Operations::read_trace($trace);
            let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
            if let Err(e) = ops.replay(&mut heap, Validation::FULL) {
                panic!("{}: {}", $trace, e);
            }
        }
    };
}

test_trace!(test_trace_short1, "short1.rep");
test_trace!(test_trace_short2, "short2.rep");
test_trace!(test_trace_binary, "binary.rep");
test_trace!(test_trace_coalescing, "coalescing.rep");
test_trace!(test_trace_realloc, "realloc.rep");
test_trace!(test_trace_random, "random.rep");
test_trace!(test_trace_mixed, "mixed.trace");

////////////////////////////////////////////////////////////////////////////////

#[test]
fn regression_test_0() {
    Operations(vec![Alloc(1)]).run_single_threaded();
}

#[test]
fn regression_test_1() {
    // Exact-class boundary, then the first large size.
    Operations(vec![Alloc(248), Free(0), Alloc(249), Alloc(248), Free(1), Free(2)])
        .run_single_threaded();
}

#[test]
fn regression_test_2() {
    Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run_single_threaded();
}

#[test]
fn regression_test_3() {
    Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run_single_threaded();
}

#[test]
fn regression_test_4() {
    // Grow in place into a freed neighbour, then shrink back.
    Operations(vec![
        Alloc(40),
        Alloc(40),
        Alloc(40),
        Free(1),
        Realloc(0, 80),
        Realloc(0, 8),
        Free(0),
        Free(2),
    ])
    .run_single_threaded();
}

#[test]
fn allocate_size_zero() {
    use std::iter;
    Operations(
        iter::repeat(Alloc(0))
            .take(1000)
            .chain((0..1000).map(|i| Free(i)))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn allocate_many_small() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(16))
            .take(100)
            .chain((0..100).map(|i| Free(i)))
            .chain(iter::repeat(Alloc(SMALL_LIMIT.0 - 8)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn allocate_many_large() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(SMALL_LIMIT.0 + 1))
            .take(100)
            .chain((0..100).map(|i| Free(i)))
            .chain(iter::repeat(Alloc(8 * SMALL_LIMIT.0)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run_single_threaded();
}

#[test]
fn replay_reports_utilization() {
    let replay = Operations(vec![Alloc(100), Alloc(200)]).run_single_threaded();
    assert_eq!(replay.ops, 2);
    assert_eq!(replay.peak_payload, Bytes(300));
    assert_eq!(replay.heap_size, Bytes(3072));
    assert_eq!(replay.grows, 1);
    assert!((replay.utilization() - 300.0 / 3072.0).abs() < f64::EPSILON);
}

#[test]
fn exhaustion_stops_the_replay() {
    let ops = Operations(vec![Alloc(100), Alloc(100_000)]);
    let mut heap = SegAlloc::new(VecHeap::with_limit(Bytes(8192))).unwrap();
    match ops.replay(&mut heap, Validation::FULL) {
        Err(ReplayError::Alloc { op: 1, .. }) => {}
        otherwise => panic!("expected exhaustion at op 1, got {:?}", otherwise),
    }
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn parses_line_traces() {
    let ops: Operations = "Alloc(12),\nFree(0),\n\nRealloc(3, 40),\n".parse().unwrap();
    assert_eq!(ops, Operations(vec![Alloc(12), Free(0), Realloc(3, 40)]));
    assert_eq!(ops.to_string(), "Alloc(12),\nFree(0),\nRealloc(3, 40),\n");

    let err = "Alloc(12),\nAlloc(x),\n".parse::<Operations>().unwrap_err();
    assert_eq!(err.line, 2);
    assert_eq!(err.to_string(), "line 2: bad size `x`");
}

#[test]
fn parses_malloclab_traces() {
    let rep = "20000\n3\n6\n1\na 0 512\na 1 128\nr 0 640\nf 1\na 2 16\nf 0\n";
    let ops = Operations::from_rep(rep).unwrap();
    assert_eq!(
        ops,
        Operations(vec![
            Alloc(512),
            Alloc(128),
            Realloc(0, 640),
            Free(1),
            Alloc(16),
            Free(0),
        ])
    );

    let err = Operations::from_rep("20000\n1\n1\n1\nf 7\n").unwrap_err();
    assert_eq!(err.line, 5);

    let err = Operations::from_rep("20000\n1\n").unwrap_err();
    assert_eq!(err.to_string(), "missing the number of operations");
}

#[test]
fn shrinking_keeps_indices_consistent() {
    let ops = Operations(vec![Alloc(1), Alloc(2), Free(0), Realloc(1, 8), Free(1)]);
    assert_eq!(
        Operations::without_alloc(&ops.0, 0),
        Operations(vec![Alloc(2), Realloc(0, 8), Free(0)])
    );
    for smaller in ops.shrink() {
        let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
        smaller.replay(&mut heap, Validation::FULL).unwrap();
    }
}

#[test]
fn histograms_count_every_allocation() {
    let ops = Operations(vec![Alloc(16), Alloc(1024), Free(0), Free(1)]);
    let sizes = ops.size_histogram().to_string();
    let lifetimes = ops.lifetime_histogram().to_string();
    assert!(!sizes.is_empty());
    assert!(!lifetimes.is_empty());
}

////////////////////////////////////////////////////////////////////////////////

// Tests taken from
// https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/smoke.rs and
// modified.

#[test]
fn smoke() {
    let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
    let p = heap.malloc(1).unwrap();
    heap.payload_mut(p)[0] = 9;
    assert_eq!(heap.payload(p)[0], 9);
    heap.free(p);

    let p = heap.malloc(1).unwrap();
    heap.payload_mut(p)[0] = 10;
    assert_eq!(heap.payload(p)[0], 10);
    heap.free(p);
}

// This takes too long with our extra assertion checks enabled.
#[test]
#[cfg(not(feature = "extra_assertions"))]
fn stress() {
    let mut heap = SegAlloc::new(VecHeap::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5e6a_110c);
    let mut ptrs: Vec<(Payload, usize)> = Vec::new();

    for _ in 0..100_000 {
        let free = !ptrs.is_empty()
            && ((ptrs.len() < 1_000 && rng.gen_ratio(1, 3)) || rng.gen());
        if free {
            let idx = rng.gen_range(0..ptrs.len());
            let (p, _) = ptrs.swap_remove(idx);
            heap.free(p);
            continue;
        }

        if !ptrs.is_empty() && rng.gen_ratio(1, 100) {
            let idx = rng.gen_range(0..ptrs.len());
            let (p, old) = ptrs.swap_remove(idx);
            let new = if rng.gen() {
                rng.gen_range(old..old * 2 + 1)
            } else if old > 10 {
                rng.gen_range(old / 2..old)
            } else {
                ptrs.push((p, old));
                continue;
            };
            let kept = heap.payload(p)[..cmp::min(old, new)].to_vec();
            let p = heap.realloc(p, new).unwrap().unwrap();
            assert_eq!(&heap.payload(p)[..kept.len()], &kept[..]);
            ptrs.push((p, new));
        }

        let size = if rng.gen() {
            rng.gen_range(1..128)
        } else {
            rng.gen_range(1..128 * 1024)
        };
        let p = heap.malloc(size).unwrap();
        for byte in &mut heap.payload_mut(p)[..size] {
            *byte = 0xce;
        }
        ptrs.push((p, size));
    }

    heap.check().unwrap();
}
