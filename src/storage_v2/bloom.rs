//! Per-segment bloom filter over u128 keys.
//!
//! Keys are node ids (already BLAKE3 output), so no re-hashing happens:
//! the low and high 64-bit halves of the key drive double hashing
//! directly. `maybe_contains == false` is a definite miss and lets the
//! read path skip the whole segment.
//!
//! Binary format:
//! ```text
//! [num_bits: u64 LE]
//! [num_hashes: u32 LE]
//! [reserved: u32 LE = 0]
//! [words: u64 LE x ceil(num_bits / 64)]
//! ```

use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage_v2::types::{read_u32, read_u64, BLOOM_BITS_PER_KEY, BLOOM_NUM_HASHES};

const BLOOM_HEADER_SIZE: usize = 16;

/// Upper bound accepted when decoding; anything larger is corruption.
const MAX_NUM_HASHES: usize = 32;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

/// Bit positions tested for `key`. The step is forced odd so it never
/// shares a factor with a power-of-two table size.
#[inline]
fn bit_positions(key: u128, num_hashes: usize, num_bits: usize) -> impl Iterator<Item = usize> {
    let h1 = key as u64;
    let h2 = ((key >> 64) as u64) | 1;
    let m = num_bits as u64;
    (0..num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
}

impl BloomFilter {
    /// Filter sized for `num_keys` insertions: BLOOM_BITS_PER_KEY bits per
    /// key rounded up to whole words, at least one word.
    pub fn new(num_keys: usize) -> Self {
        let wanted = num_keys.saturating_mul(BLOOM_BITS_PER_KEY).max(64);
        let num_bits = (wanted + 63) & !63;
        Self {
            words: vec![0u64; num_bits / 64],
            num_bits,
            num_hashes: BLOOM_NUM_HASHES,
        }
    }

    /// Build a filter holding every key yielded by `keys`.
    pub fn from_keys<I>(num_keys: usize, keys: I) -> Self
    where
        I: IntoIterator<Item = u128>,
    {
        let mut filter = Self::new(num_keys);
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    pub fn insert(&mut self, key: u128) {
        for pos in bit_positions(key, self.num_hashes, self.num_bits) {
            self.words[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// `false` means definitely absent; `true` means possibly present.
    pub fn maybe_contains(&self, key: u128) -> bool {
        bit_positions(key, self.num_hashes, self.num_bits)
            .all(|pos| self.words[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.num_bits as u64).to_le_bytes())?;
        writer.write_all(&(self.num_hashes as u32).to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        for word in &self.words {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOOM_HEADER_SIZE {
            return Err(GraphError::InvalidFormat("Bloom filter too small".into()));
        }
        let num_bits = read_u64(bytes, 0) as usize;
        let num_hashes = read_u32(bytes, 8) as usize;

        if num_bits == 0 || num_bits % 64 != 0 {
            return Err(GraphError::InvalidFormat(format!(
                "Bloom filter has invalid bit count {}",
                num_bits
            )));
        }
        if num_hashes == 0 || num_hashes > MAX_NUM_HASHES {
            return Err(GraphError::InvalidFormat(format!(
                "Bloom filter has invalid hash count {}",
                num_hashes
            )));
        }

        let word_count = num_bits / 64;
        let needed = word_count
            .checked_mul(8)
            .and_then(|b| b.checked_add(BLOOM_HEADER_SIZE))
            .ok_or_else(|| GraphError::InvalidFormat("Bloom filter size overflow".into()))?;
        if bytes.len() < needed {
            return Err(GraphError::InvalidFormat("Bloom filter data truncated".into()));
        }

        let words = (0..word_count)
            .map(|i| read_u64(bytes, BLOOM_HEADER_SIZE + i * 8))
            .collect();

        Ok(Self {
            words,
            num_bits,
            num_hashes,
        })
    }

    pub fn serialized_size(&self) -> usize {
        BLOOM_HEADER_SIZE + self.words.len() * 8
    }
}
