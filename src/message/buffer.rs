//! Fixed-capacity receive buffer

use bytes::{Bytes, BytesMut};

/// Result of filling a [`BoundedBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The whole source fit
    Complete,
    /// Only a prefix fit; `total` is the full source length
    Truncated { total: usize },
}

/// A byte container with a hard capacity that reports, rather than hides, truncation
#[derive(Debug)]
pub struct BoundedBuffer {
    data: BytesMut,
    capacity: usize,
    original_length: usize,
}

impl BoundedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity.min(64 * 1024)),
            capacity,
            original_length: 0,
        }
    }

    /// Replace the contents with as much of `source` as fits
    pub fn fill(&mut self, source: &[u8]) -> Fill {
        self.data.clear();
        self.original_length = source.len();
        let take = source.len().min(self.capacity);
        self.data.extend_from_slice(&source[..take]);
        self.status()
    }

    pub fn status(&self) -> Fill {
        if self.original_length > self.capacity {
            Fill::Truncated {
                total: self.original_length,
            }
        } else {
            Fill::Complete
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self.status(), Fill::Truncated { .. })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the last source, which exceeds `len()` when truncated
    pub fn original_length(&self) -> usize {
        self.original_length
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits() {
        let mut buffer = BoundedBuffer::with_capacity(8);
        assert_eq!(buffer.fill(b"hello"), Fill::Complete);
        assert_eq!(buffer.len(), 5);
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.freeze().as_ref(), b"hello");
    }

    #[test]
    fn test_exact_capacity_is_not_truncated() {
        let mut buffer = BoundedBuffer::with_capacity(5);
        assert_eq!(buffer.fill(b"hello"), Fill::Complete);
    }

    #[test]
    fn test_truncation_is_reported() {
        let mut buffer = BoundedBuffer::with_capacity(3);
        assert_eq!(buffer.fill(b"hello"), Fill::Truncated { total: 5 });
        assert_eq!(buffer.original_length(), 5);
        assert_eq!(buffer.freeze().as_ref(), b"hel");
    }

    #[test]
    fn test_zero_capacity() {
        let mut buffer = BoundedBuffer::with_capacity(0);
        assert_eq!(buffer.fill(b"x"), Fill::Truncated { total: 1 });
        assert!(buffer.is_empty());
        assert_eq!(buffer.fill(b""), Fill::Complete);
    }
}
