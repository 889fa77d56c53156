//! # Erasure Codec Adapter
//!
//! Systematic Reed-Solomon block code behind a small trait so the frame
//! encoder and reassembler never touch the library directly.
//!
//! A block is `data_shards` equally sized data shards followed by
//! `parity_shards` parity shards. Any `data_shards` of the
//! `data_shards + parity_shards` shards are enough to rebuild the data.
//!
//! The default implementation uses `reed-solomon-simd` (GF(2^16), O(n log n)),
//! which requires an even, non-zero shard size and at least one parity shard.
//! Blocks with zero parity never reach the library.

use crate::error::{Result, TransportError};

/// Block erasure code used for video frames.
pub trait ErasureCodec: Send {
    /// Compute `parity_shards` parity shards of `block_size` bytes each.
    ///
    /// `shards` must hold exactly `data_shards` slices of `block_size` bytes.
    fn encode(
        &self,
        data_shards: usize,
        parity_shards: usize,
        block_size: usize,
        shards: &[&[u8]],
    ) -> Result<Vec<Vec<u8>>>;

    /// Restore missing data shards in place.
    ///
    /// `shards` has `data_shards + parity_shards` slots; `None` marks a lost
    /// shard. On success every data slot is `Some`. Parity slots are left as
    /// they were.
    fn reconstruct(
        &self,
        data_shards: usize,
        parity_shards: usize,
        block_size: usize,
        shards: &mut [Option<Vec<u8>>],
    ) -> Result<()>;
}

// ─── Reed-Solomon (reed-solomon-simd) ───────────────────────────────────────

/// Reed-Solomon codec backed by `reed-solomon-simd`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReedSolomonCodec;

impl ReedSolomonCodec {
    pub fn new() -> Self {
        ReedSolomonCodec
    }
}

fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % 2 != 0 {
        return Err(TransportError::Codec(format!(
            "shard size {block_size} must be even and non-zero"
        )));
    }
    Ok(())
}

impl ErasureCodec for ReedSolomonCodec {
    fn encode(
        &self,
        data_shards: usize,
        parity_shards: usize,
        block_size: usize,
        shards: &[&[u8]],
    ) -> Result<Vec<Vec<u8>>> {
        if shards.len() != data_shards {
            return Err(TransportError::Codec(format!(
                "expected {data_shards} data shards, got {}",
                shards.len()
            )));
        }
        if let Some(bad) = shards.iter().find(|s| s.len() != block_size) {
            return Err(TransportError::Codec(format!(
                "shard of {} bytes in a {block_size}-byte block",
                bad.len()
            )));
        }
        if parity_shards == 0 {
            return Ok(Vec::new());
        }
        check_block_size(block_size)?;

        reed_solomon_simd::encode(data_shards, parity_shards, shards.iter().copied())
            .map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn reconstruct(
        &self,
        data_shards: usize,
        parity_shards: usize,
        block_size: usize,
        shards: &mut [Option<Vec<u8>>],
    ) -> Result<()> {
        if shards.len() != data_shards + parity_shards {
            return Err(TransportError::Codec(format!(
                "expected {} shard slots, got {}",
                data_shards + parity_shards,
                shards.len()
            )));
        }
        if shards[..data_shards].iter().all(Option::is_some) {
            return Ok(());
        }

        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < data_shards {
            return Err(TransportError::Codec(format!(
                "only {present} of {data_shards} required shards available"
            )));
        }
        check_block_size(block_size)?;

        let originals = shards[..data_shards]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_deref().map(|s| (i, s)));
        let recovery = shards[data_shards..]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_deref().map(|s| (i, s)));

        let restored = reed_solomon_simd::decode(data_shards, parity_shards, originals, recovery)
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        for (idx, shard) in restored {
            if idx < data_shards && shards[idx].is_none() {
                shards[idx] = Some(shard);
            }
        }

        if shards[..data_shards].iter().any(Option::is_none) {
            return Err(TransportError::Codec(
                "decoder did not restore every missing shard".into(),
            ));
        }
        Ok(())
    }
}
