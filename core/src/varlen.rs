/// Variable-length segments packed into one batch-of-one sequence.
///
/// Segments are described by cumulative offsets (`[0, l0, l0+l1, ..., T]`)
/// into the flat time axis. Inputs stay in one buffer; only the offsets
/// array is per-segment. Each segment owns one initial-state slot and one
/// final state, and no state flows across a boundary.
///
/// A work unit is one (sequence or segment, head) pair. Units are
/// independent, so every evaluator maps over them in parallel.

use serde::{Serialize, Deserialize};

use crate::error::{RecurrenceError, Result};

/// Cumulative segment offsets. Always starts at 0 and never decreases.
/// Zero-length segments are allowed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct SegmentBoundaries {
    offsets: Vec<usize>,
}

impl SegmentBoundaries {
    pub fn new(offsets: Vec<usize>) -> Result<Self> {
        if offsets.len() < 2 {
            return Err(RecurrenceError::InvalidBoundaries(format!(
                "need at least two offsets, got {}", offsets.len()
            )));
        }
        if offsets[0] != 0 {
            return Err(RecurrenceError::InvalidBoundaries(format!(
                "first offset must be 0, got {}", offsets[0]
            )));
        }
        for (i, w) in offsets.windows(2).enumerate() {
            if w[1] < w[0] {
                return Err(RecurrenceError::InvalidBoundaries(format!(
                    "offsets decrease at index {}: {} -> {}", i + 1, w[0], w[1]
                )));
            }
        }
        Ok(SegmentBoundaries { offsets })
    }

    /// Build offsets from per-segment lengths.
    pub fn from_lengths(lengths: &[usize]) -> Result<Self> {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        let mut acc = 0usize;
        offsets.push(0);
        for &l in lengths {
            acc += l;
            offsets.push(acc);
        }
        Self::new(offsets)
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn num_segments(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn total_len(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    /// `[start, end)` of segment `i`.
    pub fn segment(&self, i: usize) -> (usize, usize) {
        (self.offsets[i], self.offsets[i + 1])
    }

    /// Fails unless the last offset equals the sequence length.
    pub fn check_total(&self, time: usize) -> Result<()> {
        if self.total_len() != time {
            return Err(RecurrenceError::InvalidBoundaries(format!(
                "last offset {} does not equal sequence length {}", self.total_len(), time
            )));
        }
        Ok(())
    }

    /// (segment index, position within segment) for every token.
    pub fn token_indices(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.total_len());
        for s in 0..self.num_segments() {
            let (start, end) = self.segment(s);
            for t in start..end {
                out.push((s, t - start));
            }
        }
        out
    }
}

impl TryFrom<Vec<usize>> for SegmentBoundaries {
    type Error = RecurrenceError;

    fn try_from(offsets: Vec<usize>) -> Result<Self> {
        SegmentBoundaries::new(offsets)
    }
}

impl From<SegmentBoundaries> for Vec<usize> {
    fn from(b: SegmentBoundaries) -> Vec<usize> {
        b.offsets
    }
}

/// Contiguous run of time steps evaluated from one state slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub batch: usize,
    pub start: usize,
    pub end: usize,
    /// Index into the initial/final state tensors.
    pub slot: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// One (span, head) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    pub span: Span,
    pub head: usize,
}

impl WorkUnit {
    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// Row index of this unit's state in a `[slots, heads, ..]` state tensor.
    pub fn state_index(&self, heads: usize) -> usize {
        self.span.slot * heads + self.head
    }
}

/// Spans for a batch, one per sequence or one per segment.
///
/// With boundaries the batch must be 1 and the offsets must cover `time`.
pub fn spans(batch: usize, time: usize, boundaries: Option<&SegmentBoundaries>) -> Result<Vec<Span>> {
    match boundaries {
        None => Ok((0..batch)
            .map(|b| Span { batch: b, start: 0, end: time, slot: b })
            .collect()),
        Some(bounds) => {
            if batch != 1 {
                return Err(RecurrenceError::VarlenBatch(batch));
            }
            bounds.check_total(time)?;
            Ok((0..bounds.num_segments())
                .map(|s| {
                    let (start, end) = bounds.segment(s);
                    Span { batch: 0, start, end, slot: s }
                })
                .collect())
        }
    }
}

/// Number of initial/final state slots.
pub fn num_state_slots(batch: usize, boundaries: Option<&SegmentBoundaries>) -> usize {
    boundaries.map_or(batch, |b| b.num_segments())
}

/// Every (span, head) pair, span-major.
pub fn work_units(spans: &[Span], heads: usize) -> Vec<WorkUnit> {
    spans
        .iter()
        .flat_map(|&span| (0..heads).map(move |head| WorkUnit { span, head }))
        .collect()
}

/// `[start, end)` of each chunk of a unit of length `len`, relative to the unit start.
pub fn chunk_ranges(len: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    debug_assert!(chunk_size > 0);
    (0..len)
        .step_by(chunk_size)
        .map(|s| (s, (s + chunk_size).min(len)))
        .collect()
}
