//! Bloom prefilter for large rule sets.
//!
//! A fixed-size bloom filter with double hashing. Membership is a necessary
//! but not sufficient condition: a hit must still be confirmed against the
//! exact set or the wildcard tree, while a miss proves the item was never
//! inserted.
//!
//! Sizing follows the standard formulas: `m = -n * ln(p) / (ln 2)^2` bits and
//! `k = (m / n) * ln 2` hash functions for `n` expected items at false
//! positive rate `p`.

use std::hash::{Hash, Hasher};

/// A bloom filter over string items.
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at the given false
    /// positive rate.
    ///
    /// `expected_items` is clamped to at least 1 and `fp_rate` to a sane
    /// open interval so degenerate inputs cannot produce a zero-size filter.
    #[must_use]
    pub fn with_capacity(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-12, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        let words = usize::try_from(num_bits.div_ceil(64)).unwrap_or(1);
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
        }
    }

    /// Insert an item.
    pub fn insert(&mut self, item: &str) {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Probe for an item. `false` means definitely absent; `true` means
    /// possibly present.
    #[must_use]
    pub fn contains(&self, item: &str) -> bool {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of bits in the filter.
    #[must_use]
    pub fn bit_len(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions applied per item.
    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.num_hashes
    }

    // Two independent hashes derived from differently-seeded SipHash states.
    fn hash_pair(item: &str) -> (u64, u64) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut hasher);
        let h1 = hasher.finish();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        0xdeadu16.hash(&mut hasher);
        item.hash(&mut hasher);
        let h2 = hasher.finish() | 1;

        (h1, h2)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_items_are_found() {
        let mut filter = BloomFilter::with_capacity(1000, 1e-4);
        filter.insert("example.com");
        filter.insert("ads.net");

        assert!(filter.contains("example.com"));
        assert!(filter.contains("ads.net"));
    }

    #[test]
    fn absent_items_mostly_miss() {
        let mut filter = BloomFilter::with_capacity(10_000, 1e-4);
        for i in 0..10_000 {
            filter.insert(&format!("domain{i}.example.com"));
        }

        // At 1e-4 FP rate, 1000 absent probes should essentially all miss.
        let false_positives = (0..1000)
            .filter(|i| filter.contains(&format!("absent{i}.other.org")))
            .count();
        assert!(
            false_positives <= 2,
            "too many false positives: {false_positives}"
        );
    }

    #[test]
    fn empty_filter_rejects_everything() {
        let filter = BloomFilter::with_capacity(100, 1e-4);
        assert!(!filter.contains("anything.com"));
    }

    #[test]
    fn sizing_tracks_capacity() {
        let small = BloomFilter::with_capacity(100, 1e-4);
        let large = BloomFilter::with_capacity(100_000, 1e-4);
        assert!(large.bit_len() > small.bit_len());
        assert!(small.hash_count() >= 1);
    }

    #[test]
    fn degenerate_inputs_do_not_panic() {
        let mut filter = BloomFilter::with_capacity(0, 0.0);
        filter.insert("x");
        assert!(filter.contains("x"));
    }
}
