// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod bit_array;

use bit_array::BitArray;

/// Two hashes that are used for double hashing
pub type CompositeHash = (u64, u64);

/// On-disk encoding version of the filter
pub const BLOOM_VERSION: u64 = 1;

/// A standard bloom filter using double hashing instead of
/// `k` hash functions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BloomFilter {
    /// Raw bytes exposed as bit array
    inner: BitArray,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilter {
    /// Reconstructs a filter from its on-disk parts.
    #[must_use]
    pub fn from_parts(m: usize, k: usize, bytes: Box<[u8]>) -> Self {
        Self {
            inner: BitArray::from_bytes(bytes),
            m,
            k,
        }
    }

    fn with_size(m: usize, k: usize) -> Self {
        Self {
            inner: BitArray::with_capacity(m / 8),
            m,
            k,
        }
    }

    /// Returns the size of the filter table in bytes.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.inner.len()
    }

    /// Returns the amount of hashes used per lookup.
    #[must_use]
    pub fn hash_fn_count(&self) -> usize {
        self.k
    }

    /// Returns the raw table bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    /// Returns `true` if the hash may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains_hash(&self, (mut h1, mut h2): CompositeHash) -> bool {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            if !self.inner.get(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }

        true
    }

    /// Returns `true` if the key may be contained.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    fn set_with_hash(&mut self, (mut h1, mut h2): CompositeHash) {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            self.inner.enable(idx as usize);

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }
    }

    /// Gets the hash of a key.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h0 = xxhash_rust::xxh3::xxh3_128(key);
        let h1 = (h0 >> 64) as u64;
        let h2 = h0 as u64;
        (h1, h2)
    }
}

/// Buffers key hashes while a run is written, then constructs the
/// smallest filter table that satisfies the configured false
/// positive rate - the item count is unknown until the run is
/// finished, so the table cannot be sized upfront.
#[derive(Default)]
pub struct BloomSpectrum {
    hashes: Vec<CompositeHash>,
}

impl BloomSpectrum {
    /// Hashes and buffers a key.
    pub fn insert(&mut self, key: &[u8]) {
        self.hashes.push(BloomFilter::get_hash(key));
    }

    /// Returns the number of buffered hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns `true` if no key was hashed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Expected false positive rate of a table with `m` bits holding
    /// `n` items under `k` hashes.
    fn fp_rate(m: usize, n: usize, k: usize) -> f64 {
        let exponent = -((k * n) as f64) / (m as f64);
        (1.0 - exponent.exp()).powi(k as i32)
    }

    /// Builds the filter, choosing the smallest power-of-two table
    /// whose expected false positive rate stays below `fpr`.
    #[must_use]
    pub fn build(&self, fpr: f32) -> BloomFilter {
        use std::f64::consts::LN_2;

        let n = self.hashes.len().max(1);
        let fpr = f64::from(fpr).max(0.000_001);

        // Smallest table considered: 64 bytes
        let mut m = 512usize;
        let mut k;

        loop {
            k = (((m as f64 / n as f64) * LN_2) as usize).clamp(1, 16);

            if Self::fp_rate(m, n, k) <= fpr || m >= 1 << 32 {
                break;
            }

            m *= 2;
        }

        let mut filter = BloomFilter::with_size(m, k);

        for hash in &self.hashes {
            filter.set_with_hash(*hash);
        }

        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_basic() {
        let mut spectrum = BloomSpectrum::default();

        let keys: [&[u8]; 5] = [b"a", b"ab", b"abc", b"zzz", b"another key"];

        for key in keys {
            spectrum.insert(key);
        }

        let filter = spectrum.build(0.01);

        for key in keys {
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn bloom_fpr_bound() {
        let mut spectrum = BloomSpectrum::default();

        for i in 0u64..10_000 {
            spectrum.insert(&i.to_be_bytes());
        }

        let filter = spectrum.build(0.01);

        let mut false_positives = 0;

        for i in 10_000u64..20_000 {
            if filter.contains(&i.to_be_bytes()) {
                false_positives += 1;
            }
        }

        // 1% target, allow some slack
        assert!(false_positives < 300, "too many false positives: {false_positives}");
    }

    #[test]
    fn bloom_spectrum_picks_larger_tables_for_more_keys() {
        let mut small = BloomSpectrum::default();
        small.insert(b"a");

        let mut big = BloomSpectrum::default();
        for i in 0u64..100_000 {
            big.insert(&i.to_be_bytes());
        }

        assert!(small.build(0.01).table_size() < big.build(0.01).table_size());
    }

    #[test]
    fn bloom_roundtrip_parts() {
        let mut spectrum = BloomSpectrum::default();
        spectrum.insert(b"hello");
        spectrum.insert(b"world");

        let filter = spectrum.build(0.001);

        let restored = BloomFilter::from_parts(
            filter.table_size() * 8,
            filter.hash_fn_count(),
            filter.bytes().into(),
        );

        assert_eq!(filter, restored);
        assert!(restored.contains(b"hello"));
        assert!(restored.contains(b"world"));
    }
}
