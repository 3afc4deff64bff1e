//! Interpolation search over segment byte ranges
//!
//! Resolves an absolute byte offset to the segment that contains it without
//! touching the segments in between: the index is estimated proportionally,
//! the oracle (a yEnc header fetch) reports the guessed segment's byte
//! range, and whichever bound was wrong narrows. Termination is guaranteed
//! for monotonically non-decreasing, contiguous ranges; anything else is a
//! corruption error, surfaced and never retried.

use crate::error::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Half-open range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start
    pub start: u64,
    /// Exclusive end
    pub end: u64,
}

impl ByteRange {
    /// Build a range; `start` must not exceed `end`
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start {} exceeds end {}", start, end);
        Self { start, end }
    }

    /// Build from a start offset and a length
    pub fn from_start_and_len(start: u64, len: u64) -> Self {
        Self::new(start, start + len)
    }

    /// Number of values covered
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers nothing
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `value` falls inside the range
    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains_range(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A located segment: its index and the byte range it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Index of the segment containing the target byte
    pub index: u64,
    /// That segment's byte range
    pub range: ByteRange,
}

/// Find the index whose byte range contains `target`
///
/// `index_range` spans the candidate indices, `byte_range` the bytes they
/// jointly cover; `oracle` maps an index to its byte range.
///
/// # Errors
///
/// [`Error::Corrupt`] when the target cannot be bracketed: the byte range
/// does not contain the target, the index range empties out, or the oracle
/// reports a range outside the current bracket — all of which mean the
/// declared segment offsets are inconsistent with the file layout.
pub async fn interpolation_search<F, Fut>(
    target: u64,
    mut index_range: ByteRange,
    mut byte_range: ByteRange,
    mut oracle: F,
    cancel: &CancellationToken,
) -> Result<SearchResult>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<ByteRange>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !byte_range.contains(target) || index_range.is_empty() {
            return Err(Error::Corrupt(format!(
                "Cannot find byte position {}",
                target
            )));
        }

        // Estimate proportionally: the wider the byte span per index, the
        // closer the guess lands. u128 keeps the product from overflowing.
        let offset_from_start = (target - byte_range.start) as u128;
        let guess_from_start =
            (offset_from_start * index_range.len() as u128 / byte_range.len() as u128) as u64;
        let guess = index_range.start + guess_from_start;

        let guessed = oracle(guess).await?;
        if !byte_range.contains_range(&guessed) {
            return Err(Error::Corrupt(format!(
                "Cannot find byte position {}: segment {} reports range {} outside search bracket {}",
                target, guess, guessed, byte_range
            )));
        }

        if guessed.end <= target {
            // Guessed too low; search above the guess.
            index_range = ByteRange::new(guess + 1, index_range.end);
            byte_range = ByteRange::new(guessed.end, byte_range.end);
        } else if guessed.start > target {
            // Guessed too high; search below the guess.
            index_range = ByteRange::new(index_range.start, guess);
            byte_range = ByteRange::new(byte_range.start, guessed.start);
        } else {
            return Ok(SearchResult {
                index: guess,
                range: guessed,
            });
        }
    }
}
