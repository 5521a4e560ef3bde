//! Additive byte checksum used by every firmware transfer command.
//!
//! The device sums the byte values of what it received and compares the
//! total with the value announced by the host. There is no modulus: the sum
//! is carried in a `u64`, which cannot overflow for any image that fits the
//! device's memory.

/// Sum of all byte values in `data`.
pub fn checksum(data: &[u8]) -> u64 {
    data.iter()
        .map(|&b| u64::from(b))
        .sum()
}

/// Sum `data` in `chunk_size` pieces, the way images are streamed.
///
/// Always equal to [`checksum`] over the whole buffer.
pub fn checksum_chunked(data: &[u8], chunk_size: usize) -> u64 {
    let mut sum = Checksum::new();
    for chunk in data.chunks(chunk_size.max(1)) {
        sum.update(chunk);
    }
    sum.value()
}

/// Incremental checksum accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u64);

impl Checksum {
    /// Start a new, empty sum.
    pub fn new() -> Self {
        Self(0)
    }

    /// Add the bytes of `data`.
    pub fn update(&mut self, data: &[u8]) {
        self.0 += checksum(data);
    }

    /// Current total.
    pub fn value(&self) -> u64 {
        self.0
    }
}
