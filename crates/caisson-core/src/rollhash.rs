/// Positional rolling hash over a fixed-width byte window.
///
/// Every byte is weighted by a power of 257 determined by its position
/// in the stream, all arithmetic wrapping in u64. Because the weights
/// are positional rather than relative, a window can be advanced with
/// `rotate` without renormalizing, and `digest` folds in the window
/// width so windows of different lengths hash differently.
#[derive(Debug, Clone)]
pub struct RollingHash {
    factor: u64,
    next_factor: u64,
    value: u64,
}

#[inline(always)]
fn mul257(x: u64) -> u64 {
    (x << 8).wrapping_add(x)
}

impl RollingHash {
    pub fn new() -> Self {
        RollingHash {
            factor: 0,
            next_factor: 1,
            value: 0,
        }
    }

    /// Grows the window by one byte at the head.
    #[inline]
    pub fn roll_in(&mut self, byte: u8) {
        self.factor = self.next_factor;
        self.next_factor = mul257(self.next_factor);
        self.value = mul257(self.value).wrapping_add(byte as u64);
    }

    /// Slides a full window one byte forward: `out` leaves at the tail,
    /// `in` enters at the head.
    #[inline]
    pub fn rotate(&mut self, incoming: u8, outgoing: u8) {
        self.value = self
            .value
            .wrapping_sub((outgoing as u64).wrapping_mul(self.factor));
        self.value = mul257(self.value).wrapping_add(incoming as u64);
    }

    #[inline]
    pub fn digest(&self) -> u64 {
        self.value.wrapping_add(self.next_factor)
    }

    /// Hashes a region of a circular buffer by replaying it byte by
    /// byte, wrapping at the buffer end.
    pub fn digest_buffer(buffer: &[u8], offset: usize, length: usize) -> u64 {
        let mut hash = RollingHash::new();
        let mut pos = offset;
        for _ in 0..length {
            hash.roll_in(buffer[pos]);
            pos += 1;
            if pos == buffer.len() {
                pos = 0;
            }
        }
        hash.digest()
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        RollingHash::new()
    }
}
