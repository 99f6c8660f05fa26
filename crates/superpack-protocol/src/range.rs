//! HTTP byte range helpers
//!
//! Ranges are half-open internally (`offset..offset + size`) and converted to
//! the inclusive form HTTP uses only at the header boundary.

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

/// A contiguous slice of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte
    pub offset: u64,
    /// Number of bytes, never zero for a sendable range
    pub size: u64,
}

impl ByteRange {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Range covering the last `size` bytes of a resource of `total` bytes
    pub fn tail(total: u64, size: u64) -> Option<Self> {
        total.checked_sub(size).map(|offset| Self { offset, size })
    }

    /// One past the last byte
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The part of this range not yet received after `done` bytes
    pub fn remaining(&self, done: u64) -> Self {
        let done = done.min(self.size);
        Self {
            offset: self.offset + done,
            size: self.size - done,
        }
    }

    /// `Range` header value: `bytes=first-last`
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }
}

/// Parsed `Content-Range: bytes first-last/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first: u64,
    pub last: u64,
    /// `None` when the server sent `*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse a header value
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || DownloadError::InvalidContentRange(value.to_string());

        let bytes_part = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, total) = bytes_part.split_once('/').ok_or_else(invalid)?;
        let (first, last) = range.split_once('-').ok_or_else(invalid)?;
        let first: u64 = first.trim().parse().map_err(|_| invalid())?;
        let last: u64 = last.trim().parse().map_err(|_| invalid())?;
        if last < first {
            return Err(invalid());
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().map_err(|_| invalid())?),
        };
        Ok(Self { first, last, total })
    }

    pub const fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether the server answered exactly the requested range
    pub fn matches(&self, requested: &ByteRange) -> bool {
        self.first == requested.offset && self.len() == requested.size
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_is_inclusive() {
        // Offset 100, length 50 should request bytes 100-149
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
        assert_eq!(ByteRange::new(0, 1).header_value(), "bytes=0-0");
    }

    #[test]
    fn test_tail_and_remaining() {
        let tail = ByteRange::tail(1000, 36).expect("Operation should succeed");
        assert_eq!(tail, ByteRange::new(964, 36));
        assert_eq!(tail.end(), 1000);
        assert!(ByteRange::tail(10, 36).is_none());

        let rest = ByteRange::new(200, 100).remaining(40);
        assert_eq!(rest, ByteRange::new(240, 60));
        assert!(ByteRange::new(200, 100).remaining(500).is_empty());
    }

    #[test]
    fn test_validate_content_range() {
        let parsed = ContentRange::parse("bytes 200-1023/2048").expect("Operation should succeed");
        assert_eq!(parsed.total, Some(2048));
        assert!(parsed.matches(&ByteRange::new(200, 824)));

        // Invalid start
        assert!(!ContentRange::parse("bytes 100-1023/2048")
            .expect("Operation should succeed")
            .matches(&ByteRange::new(200, 824)));

        // Invalid length
        assert!(!ContentRange::parse("bytes 200-999/2048")
            .expect("Operation should succeed")
            .matches(&ByteRange::new(200, 824)));

        let unknown = ContentRange::parse("bytes 0-0/*").expect("Operation should succeed");
        assert_eq!(unknown.total, None);
        assert_eq!(unknown.len(), 1);
    }

    #[test]
    fn test_invalid_content_range() {
        for value in ["invalid", "bytes 10-5/20", "bytes a-b/c", "bytes 0-1", "items 0-1/2"] {
            assert!(
                matches!(
                    ContentRange::parse(value),
                    Err(DownloadError::InvalidContentRange(_))
                ),
                "{value}"
            );
        }
    }
}
