//! Key spans
//!
//! A span is a half-open key interval `[key, end_key)`. A span with no end
//! key addresses the single key `key`. Spans accumulate per transaction as
//! writes flow through the coordinator and are merged before being attached
//! to a commit.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A half-open key interval. `end_key == None` denotes a point key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub key: Bytes,
    pub end_key: Option<Bytes>,
}

impl Span {
    /// Span addressing a single key.
    pub fn point(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            end_key: None,
        }
    }

    /// Span covering `[key, end_key)`.
    pub fn range(key: impl Into<Bytes>, end_key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            end_key: Some(end_key.into()),
        }
    }

    pub fn is_point(&self) -> bool {
        self.end_key.is_none()
    }

    /// Exclusive end of the interval. For a point key this is the key's
    /// immediate successor.
    fn effective_end(&self) -> Bytes {
        match &self.end_key {
            Some(end) => end.clone(),
            None => next_key(&self.key),
        }
    }
}

// Lossy UTF-8 display so binary keys stay loggable.
impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.end_key {
            Some(end) => write!(
                f,
                "[{},{})",
                String::from_utf8_lossy(&self.key),
                String::from_utf8_lossy(end)
            ),
            None => write!(f, "{}", String::from_utf8_lossy(&self.key)),
        }
    }
}

/// The immediate key successor: `key` with a zero byte appended.
fn next_key(key: &Bytes) -> Bytes {
    let mut next = BytesMut::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.put_u8(0);
    next.freeze()
}

/// Sort and coalesce a set of possibly-overlapping spans.
///
/// Returns the merged spans in key order along with a flag that is true iff
/// the input contained no true overlaps (duplicates count as overlaps;
/// merely adjacent ranges do not).
pub fn merge_spans(spans: &[Span]) -> (Vec<Span>, bool) {
    if spans.is_empty() {
        return (Vec::new(), true);
    }

    let mut intervals: Vec<(Bytes, Bytes)> = spans
        .iter()
        .map(|s| (s.key.clone(), s.effective_end()))
        .collect();
    intervals.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut distinct = true;
    let mut merged: Vec<(Bytes, Bytes)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some((_, prev_end)) if start <= *prev_end => {
                if start < *prev_end {
                    distinct = false;
                }
                if end > *prev_end {
                    *prev_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }

    let spans = merged
        .into_iter()
        .map(|(start, end)| {
            if end == next_key(&start) {
                Span::point(start)
            } else {
                Span::range(start, end)
            }
        })
        .collect();
    (spans, distinct)
}
