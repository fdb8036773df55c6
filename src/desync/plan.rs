//! Fragment planning
//!
//! Pure functions turning a chunk length and settings into the ordered list
//! of byte ranges to send. Both the socket writer and the packet-filter
//! adapter consume the same plan.

use std::ops::Range;

use crate::config::{DesyncMethod, DpiSettings};

/// Smallest and largest DISORDER piece count
pub const MIN_SPLIT_COUNT: usize = 2;
/// Upper clamp for DISORDER piece count
pub const MAX_SPLIT_COUNT: usize = 20;

/// One write in send order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Byte range of the original chunk
    pub range: Range<usize>,
    /// Sleep after this write
    pub delay_after: bool,
}

impl Fragment {
    fn new(range: Range<usize>, delay_after: bool) -> Self {
        Self { range, delay_after }
    }

    /// Length of the fragment
    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the fragment is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split offset clamped to `[1, len-1]`; a 1-byte chunk yields 1.
#[must_use]
pub fn split_point(first_packet_size: usize, len: usize) -> usize {
    first_packet_size.clamp(1, len.saturating_sub(1).max(1))
}

/// Partition `len` bytes into `count` pieces (clamped to `[2, 20]` and to
/// `len`), each `len / count` long with the last taking the remainder.
#[must_use]
pub fn partition(len: usize, count: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let pieces = count.clamp(MIN_SPLIT_COUNT, MAX_SPLIT_COUNT).min(len);
    let size = len / pieces;
    (0..pieces)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == pieces { len } else { start + size };
            start..end
        })
        .collect()
}

/// Ordered writes for `method` over a chunk of `len` bytes.
///
/// FAKE plans like SPLIT; the decoy record is written separately.
#[must_use]
pub fn plan(method: DesyncMethod, len: usize, settings: &DpiSettings) -> Vec<Fragment> {
    if len == 0 {
        return Vec::new();
    }

    match method {
        DesyncMethod::Split | DesyncMethod::Fake | DesyncMethod::SplitReverse => {
            let k = split_point(settings.first_packet_size, len);
            if k >= len {
                return vec![Fragment::new(0..len, false)];
            }
            if method == DesyncMethod::SplitReverse {
                vec![Fragment::new(k..len, true), Fragment::new(0..k, false)]
            } else {
                vec![Fragment::new(0..k, true), Fragment::new(k..len, false)]
            }
        }
        DesyncMethod::Disorder => partition(len, settings.split_count)
            .into_iter()
            .map(|range| Fragment::new(range, true))
            .collect(),
        DesyncMethod::DisorderReverse => {
            let mut pieces: Vec<Fragment> = partition(len, settings.split_count)
                .into_iter()
                .rev()
                .map(|range| Fragment::new(range, true))
                .collect();
            if let Some(last) = pieces.last_mut() {
                last.delay_after = false;
            }
            pieces
        }
    }
}
