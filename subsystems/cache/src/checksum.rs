//! # Page Checksums
//!
//! Fletcher-16 over page contents, used only to notice that a page changed
//! since its last checkpoint. It is not an integrity check.
//!
//! An all-zero page sums to 0, so a freshly zeroed page with a stored
//! checksum of 0 reads as clean. Fletcher sums are taken modulo 255, which
//! makes 0x00 and 0xFF bytes indistinguishable; such false "unchanged"
//! verdicts only delay a write-back until an explicit sync or eviction.

use core::sync::atomic::{AtomicU8, Ordering};

/// Bytes that can be summed before the 32-bit accumulators need reducing.
/// sum2 grows quadratically; 5802 is the largest block that cannot overflow.
const BLOCK: usize = 5802;

/// Fletcher-16 calculator
#[derive(Clone, Debug)]
pub struct Fletcher16 {
    sum1: u32,
    sum2: u32,
    pending: usize,
}

impl Fletcher16 {
    /// Create new calculator
    #[inline]
    pub const fn new() -> Self {
        Self {
            sum1: 0,
            sum2: 0,
            pending: 0,
        }
    }

    /// Add one byte
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.sum1 += u32::from(byte);
        self.sum2 += self.sum1;
        self.pending += 1;
        if self.pending == BLOCK {
            self.reduce();
        }
    }

    /// Update with data
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.push(byte);
        }
    }

    /// Update with bytes that may be written concurrently
    #[inline]
    pub fn update_atomic(&mut self, data: &[AtomicU8]) {
        for byte in data {
            self.push(byte.load(Ordering::Relaxed));
        }
    }

    #[inline]
    fn reduce(&mut self) {
        self.sum1 %= 255;
        self.sum2 %= 255;
        self.pending = 0;
    }

    /// Finalize and return checksum
    #[inline]
    pub fn finish(mut self) -> u16 {
        self.reduce();
        ((self.sum2 as u16) << 8) | self.sum1 as u16
    }

    /// One-shot checksum
    #[inline]
    pub fn hash(data: &[u8]) -> u16 {
        let mut f = Self::new();
        f.update(data);
        f.finish()
    }
}

impl Default for Fletcher16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a live page
pub fn calculate_checksum(page: &[AtomicU8]) -> u16 {
    let mut f = Fletcher16::new();
    f.update_atomic(page);
    f.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_memory::PAGE_SIZE;
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn test_known_vectors() {
        // Reference values for Fletcher-16
        assert_eq!(Fletcher16::hash(b"abcde"), 0xC8F0);
        assert_eq!(Fletcher16::hash(b"abcdef"), 0x2057);
        assert_eq!(Fletcher16::hash(b"abcdefgh"), 0x0627);
    }

    #[test]
    fn test_zero_page_is_zero() {
        assert_eq!(Fletcher16::hash(&[0u8; PAGE_SIZE]), 0);
    }

    #[test]
    fn test_large_input_matches_reference() {
        // Reduce after every byte to get the textbook result
        let data: Vec<u8> = (0..3 * BLOCK).map(|i| (i * 7 + 3) as u8).collect();
        let (mut s1, mut s2) = (0u32, 0u32);
        for &b in &data {
            s1 = (s1 + u32::from(b)) % 255;
            s2 = (s2 + s1) % 255;
        }
        assert_eq!(Fletcher16::hash(&data), ((s2 as u16) << 8) | s1 as u16);
    }

    #[test]
    fn test_atomic_matches_plain() {
        let plain: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let atomic: Vec<AtomicU8> = plain.iter().map(|&b| AtomicU8::new(b)).collect();
        assert_eq!(calculate_checksum(&atomic), Fletcher16::hash(&plain));
    }

    #[test]
    fn test_detects_changes() {
        let a = vec![0xAAu8; PAGE_SIZE];
        let mut b = a.clone();
        b[100] = 0x55;
        assert_ne!(Fletcher16::hash(&a), Fletcher16::hash(&b));

        // Order sensitive, unlike a plain additive sum
        let mut c = a.clone();
        c[0] = 0x01;
        c[1] = 0x02;
        let mut d = a;
        d[0] = 0x02;
        d[1] = 0x01;
        assert_ne!(Fletcher16::hash(&c), Fletcher16::hash(&d));
    }
}
