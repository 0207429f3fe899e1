//! Single byte-range requests over a stream of known length.

use bytes::Bytes;

/// Inclusive byte range within a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a resource of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }

    /// The part of `chunk` inside this range, given that the chunk begins at
    /// absolute offset `chunk_start`.
    pub fn slice(&self, chunk_start: u64, chunk: Bytes) -> Option<Bytes> {
        let chunk_end = chunk_start + chunk.len() as u64;
        if chunk_end <= self.start || chunk_start > self.end {
            return None;
        }
        let from = self.start.saturating_sub(chunk_start) as usize;
        let to = ((self.end + 1).min(chunk_end) - chunk_start) as usize;
        Some(chunk.slice(from..to))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeRequest {
    Satisfiable(ByteRange),
    Unsatisfiable,
    /// Malformed or multi-range headers; the full body is served.
    Ignored,
}

/// Interpret a `Range` header against a resource of `length` bytes.
///
/// Supports `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`.
pub fn parse_range(header: &str, length: u64) -> RangeRequest {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return RangeRequest::Ignored;
    };
    if ranges.contains(',') {
        return RangeRequest::Ignored;
    }
    let Some((first, last)) = ranges.trim().split_once('-') else {
        return RangeRequest::Ignored;
    };

    let (start, end) = match (first.trim(), last.trim()) {
        ("", "") => return RangeRequest::Ignored,
        ("", suffix) => {
            let Ok(n) = suffix.parse::<u64>() else {
                return RangeRequest::Ignored;
            };
            if n == 0 || length == 0 {
                return RangeRequest::Unsatisfiable;
            }
            (length.saturating_sub(n), length - 1)
        }
        (first, last) => {
            let Ok(start) = first.parse::<u64>() else {
                return RangeRequest::Ignored;
            };
            let end = if last.is_empty() {
                u64::MAX
            } else {
                match last.parse::<u64>() {
                    Ok(end) if end >= start => end,
                    _ => return RangeRequest::Ignored,
                }
            };
            if start >= length {
                return RangeRequest::Unsatisfiable;
            }
            (start, end.min(length - 1))
        }
    };

    RangeRequest::Satisfiable(ByteRange { start, end })
}
