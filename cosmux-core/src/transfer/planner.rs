//! Part planning
//!
//! Splits an object into contiguous byte ranges of at most one part each.

/// Inclusive byte range `[offset, end]` of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRange {
    pub offset: u64,
    pub end: u64,
}

impl TransferRange {
    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.offset + 1
    }

    /// Never true; a range covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for an HTTP `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end)
    }
}

/// Cover `[0, total_size)` with ranges of `part_size` bytes
///
/// Every range except the last is exactly `part_size` long. Zero-sized
/// objects and a zero part size yield an empty plan.
pub fn plan_ranges(total_size: u64, part_size: u64) -> Vec<TransferRange> {
    if total_size == 0 || part_size == 0 {
        return Vec::new();
    }

    let count = total_size.div_ceil(part_size);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut offset = 0;
    while offset < total_size {
        let end = offset.saturating_add(part_size - 1).min(total_size - 1);
        ranges.push(TransferRange { offset, end });
        offset = end + 1;
    }
    ranges
}
