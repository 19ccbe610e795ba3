use crate::rollhash::RollingHash;

/// Fixed-capacity byte ring used as the chunker's staging buffer.
///
/// The chunker owns all cursor bookkeeping; the ring only provides
/// wrap-aware reads, writable spans, and region views. A region is
/// returned as at most two contiguous slices (tail part, wrapped part).
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn get(&self, pos: usize) -> u8 {
        self.buf[pos]
    }

    /// The position one byte past `pos`, wrapped.
    #[inline]
    pub fn next(&self, pos: usize) -> usize {
        let pos = pos + 1;
        if pos == self.buf.len() {
            0
        } else {
            pos
        }
    }

    /// The longest contiguous writable span starting at `head` that does
    /// not run into `tail`. With `tail <= head` the in-use region wraps
    /// (or is empty), so writing may continue to the physical end.
    pub fn free_span(&mut self, head: usize, tail: usize) -> &mut [u8] {
        if tail <= head {
            &mut self.buf[head..]
        } else {
            &mut self.buf[head..tail]
        }
    }

    /// A `length`-byte region starting at `offset`, split at the wrap
    /// point. The second slice is empty when the region is contiguous.
    pub fn region(&self, offset: usize, length: usize) -> (&[u8], &[u8]) {
        debug_assert!(length <= self.buf.len());
        if offset + length <= self.buf.len() {
            (&self.buf[offset..offset + length], &[])
        } else {
            let first = self.buf.len() - offset;
            (&self.buf[offset..], &self.buf[..length - first])
        }
    }

    pub fn copy_region(&self, offset: usize, length: usize) -> Vec<u8> {
        let (a, b) = self.region(offset, length);
        let mut out = Vec::with_capacity(length);
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Rolling-hash digest of a region, replayed across the wrap point.
    pub fn digest_region(&self, offset: usize, length: usize) -> u64 {
        RollingHash::digest_buffer(&self.buf, offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity);
        let span = ring.free_span(0, 0);
        for (i, b) in span.iter_mut().enumerate() {
            *b = i as u8;
        }
        ring
    }

    #[test]
    fn next_wraps() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.next(6), 7);
        assert_eq!(ring.next(7), 0);
    }

    #[test]
    fn free_span_extents() {
        let mut ring = RingBuffer::new(16);
        assert_eq!(ring.free_span(0, 0).len(), 16);
        assert_eq!(ring.free_span(12, 0).len(), 4);
        assert_eq!(ring.free_span(4, 12).len(), 8);
        assert_eq!(ring.free_span(12, 4).len(), 4);
    }

    #[test]
    fn region_splits_at_wrap() {
        let ring = filled(16);
        let (a, b) = ring.region(4, 8);
        assert_eq!(a, &[4, 5, 6, 7, 8, 9, 10, 11]);
        assert!(b.is_empty());

        let (a, b) = ring.region(12, 8);
        assert_eq!(a, &[12, 13, 14, 15]);
        assert_eq!(b, &[0, 1, 2, 3]);
        assert_eq!(ring.copy_region(12, 8), vec![12, 13, 14, 15, 0, 1, 2, 3]);
    }

    #[test]
    fn digest_region_matches_copy() {
        let ring = filled(32);
        let copied = ring.copy_region(24, 16);
        assert_eq!(
            ring.digest_region(24, 16),
            RollingHash::digest_buffer(&copied, 0, 16)
        );
    }
}
