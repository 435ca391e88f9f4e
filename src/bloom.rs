//! Per-segment Bloom filters for merge containers.
//!
//! A filter answers "definitely absent" for a hash so a lookup can skip a
//! whole segment. Filters are an optimization only: a filter that failed to
//! allocate reports every hash as possibly present.

use crate::error::Result;

/// Capability contract for a segment filter.
pub trait BloomFilter: Default {
    /// `true` for filters that never hold bits; lookups then skip hashing
    /// for the filter's sake.
    const IS_ALWAYS_EMPTY: bool;

    /// Allocate storage sized for `2^log_max_count` hashes.
    fn init(&mut self, log_max_count: u32) -> Result<()>;

    /// Record `hash`. No-op on an empty filter.
    fn set(&mut self, hash: u64);

    /// `false` only if `hash` was never set. Empty filters return `true`.
    fn test(&self, hash: u64) -> bool;

    /// Release storage.
    fn clear(&mut self);

    fn is_empty(&self) -> bool;

    /// Copy of the filter; allocation failure yields an empty filter.
    fn duplicate(&self) -> Self;
}

/// Filter that holds nothing and never rules a segment out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoBloom;

impl BloomFilter for NoBloom {
    const IS_ALWAYS_EMPTY: bool = true;

    #[inline]
    fn init(&mut self, _log_max_count: u32) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn set(&mut self, _hash: u64) {}

    #[inline]
    fn test(&self, _hash: u64) -> bool {
        true
    }

    #[inline]
    fn clear(&mut self) {}

    #[inline]
    fn is_empty(&self) -> bool {
        true
    }

    #[inline]
    fn duplicate(&self) -> Self {
        NoBloom
    }
}

/// Two-probe Bloom filter with `2^(log_max_count + LOG_MULT)` bits. One probe
/// takes the low bits of the hash, the other the high bits.
#[derive(Debug, Default)]
pub struct Bloom<const LOG_MULT: u32 = 3> {
    bits: Option<Box<[u8]>>,
    log_bits: u32,
}

impl<const LOG_MULT: u32> Bloom<LOG_MULT> {
    fn byte_size(log_bits: u32) -> usize {
        1 << (log_bits.max(3) - 3)
    }

    #[inline]
    fn bit_indices(&self, hash: u64) -> (usize, usize) {
        let low = hash & ((1u64 << self.log_bits) - 1);
        let high = hash >> (u64::BITS - self.log_bits);
        (low as usize, high as usize)
    }

    #[inline]
    fn get_bit(bits: &[u8], index: usize) -> bool {
        bits[index / 8] & (1 << (index % 8)) != 0
    }
}

impl<const LOG_MULT: u32> BloomFilter for Bloom<LOG_MULT> {
    const IS_ALWAYS_EMPTY: bool = false;

    fn init(&mut self, log_max_count: u32) -> Result<()> {
        debug_assert!(self.is_empty());
        let log_bits = (log_max_count + LOG_MULT).clamp(1, 48);
        let size = Self::byte_size(log_bits);
        let mut bits = Vec::new();
        bits.try_reserve_exact(size)?;
        bits.resize(size, 0u8);
        self.bits = Some(bits.into_boxed_slice());
        self.log_bits = log_bits;
        Ok(())
    }

    fn set(&mut self, hash: u64) {
        if self.bits.is_none() {
            return;
        }
        let (a, b) = self.bit_indices(hash);
        if let Some(bits) = self.bits.as_deref_mut() {
            bits[a / 8] |= 1 << (a % 8);
            bits[b / 8] |= 1 << (b % 8);
        }
    }

    fn test(&self, hash: u64) -> bool {
        match self.bits.as_deref() {
            Some(bits) => {
                let (a, b) = self.bit_indices(hash);
                Self::get_bit(bits, a) && Self::get_bit(bits, b)
            }
            None => true,
        }
    }

    fn clear(&mut self) {
        self.bits = None;
    }

    fn is_empty(&self) -> bool {
        self.bits.is_none()
    }

    fn duplicate(&self) -> Self {
        let mut copy = Self::default();
        if let Some(bits) = self.bits.as_deref() {
            let mut v = Vec::new();
            if v.try_reserve_exact(bits.len()).is_ok() {
                v.extend_from_slice(bits);
                copy.bits = Some(v.into_boxed_slice());
                copy.log_bits = self.log_bits;
            } else {
                log::debug!("bloom filter copy failed to allocate; continuing without it");
            }
        }
        copy
    }
}
