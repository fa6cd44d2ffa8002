//! The compressed-block packer.
//!
//! Writes whose data deflates below the packing threshold queue here. The
//! packer batches fragments into one shared physical block: the first vio
//! of a batch is the agent and takes the single allocation; every client
//! maps to `compressed_in_slot(k)` of that block and makes its own journal
//! entry. A batch that closes with only one member is aborted and its vio
//! falls through to a normal uncompressed write.

use bytes::Bytes;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use serde::Serialize;
use std::io::Read;

use crate::compressed_block::{
    compressed_block_capacity, initialize_compressed_block, put_fragment,
};
use crate::data_vio::DataVioId;
use crate::error::{Result, VdoError};
use crate::types::{BLOCK_SIZE, MAX_COMPRESSION_SLOTS};

/// A fragment only packs if it leaves room for at least one companion.
pub const MAX_FRAGMENT_SIZE: usize = compressed_block_capacity() / 2;

/// Deflate a block; None when it does not beat the packing threshold.
pub fn compress_block(data: &[u8]) -> Option<Bytes> {
    let mut encoder = DeflateEncoder::new(data, Compression::fast());
    let mut compressed = Vec::with_capacity(MAX_FRAGMENT_SIZE + 1);
    let mut chunk = [0u8; 1024];
    loop {
        match encoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                compressed.extend_from_slice(&chunk[..n]);
                if compressed.len() > MAX_FRAGMENT_SIZE {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
    Some(Bytes::from(compressed))
}

/// Inflate one fragment back to a full block.
pub fn decompress_fragment(fragment: &[u8]) -> Result<Bytes> {
    let mut decoder = DeflateDecoder::new(fragment);
    let mut out = Vec::with_capacity(BLOCK_SIZE);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| VdoError::InvalidFragment)?;
    if out.len() != BLOCK_SIZE {
        return Err(VdoError::InvalidFragment);
    }
    Ok(Bytes::from(out))
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PackerStatistics {
    pub fragments_queued: u64,
    pub batches_issued: u64,
    pub fragments_packed: u64,
    pub batches_aborted: u64,
}

struct PendingFragment {
    vio: DataVioId,
    data: Bytes,
}

/// A closed batch, ready for the caller to allocate a block for. The
/// `block` buffer is fully assembled; `placements` maps each member vio to
/// its fragment slot. An aborted batch has exactly one member and no
/// assembled block.
pub struct ClosedBatch {
    pub block: Option<Box<[u8]>>,
    pub placements: Vec<(DataVioId, u8)>,
    pub aborted: bool,
}

pub struct Packer {
    pending: Vec<PendingFragment>,
    used: usize,
    enabled: bool,
    pub stats: PackerStatistics,
}

impl Packer {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            used: 0,
            enabled: true,
            stats: PackerStatistics::default(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a compressed fragment. Returns a closed batch when this
    /// fragment filled the block (the new fragment goes into the next
    /// batch in that case) or completed the slot table.
    pub fn add(&mut self, vio: DataVioId, data: Bytes) -> Option<ClosedBatch> {
        debug_assert!(data.len() <= MAX_FRAGMENT_SIZE);
        self.stats.fragments_queued += 1;
        let mut closed = None;
        if self.used + data.len() > compressed_block_capacity() {
            closed = self.flush();
        }
        self.used += data.len();
        self.pending.push(PendingFragment { vio, data });
        if self.pending.len() == MAX_COMPRESSION_SLOTS {
            let full = self.flush();
            debug_assert!(closed.is_none());
            closed = full;
        }
        closed
    }

    /// Close the current batch. A single-member batch is aborted: the vio
    /// reverts to the uncompressed path.
    pub fn flush(&mut self) -> Option<ClosedBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.used = 0;
        if self.pending.len() == 1 {
            let only = self.pending.remove(0);
            self.stats.batches_aborted += 1;
            return Some(ClosedBatch {
                block: None,
                placements: vec![(only.vio, 0)],
                aborted: true,
            });
        }
        let mut block = vec![0u8; BLOCK_SIZE].into_boxed_slice();
        initialize_compressed_block(&mut block);
        let mut placements = Vec::with_capacity(self.pending.len());
        let mut offset = 0;
        for (slot, fragment) in self.pending.drain(..).enumerate() {
            put_fragment(&mut block, slot as u8, offset, &fragment.data);
            offset += fragment.data.len();
            placements.push((fragment.vio, slot as u8));
        }
        self.stats.batches_issued += 1;
        self.stats.fragments_packed += placements.len() as u64;
        Some(ClosedBatch {
            block: Some(block),
            placements,
            aborted: false,
        })
    }

    /// Pull every pending vio out of the batch (read-only entry).
    pub fn take_pending(&mut self) -> Vec<DataVioId> {
        self.used = 0;
        self.pending.drain(..).map(|fragment| fragment.vio).collect()
    }

    /// Remove a vio from the pending batch (error paths, read-only entry).
    pub fn remove(&mut self, vio: DataVioId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|fragment| fragment.vio != vio);
        let removed = before != self.pending.len();
        if removed {
            self.used = self.pending.iter().map(|f| f.data.len()).sum();
        }
        removed
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressed_block::get_fragment;
    use crate::types::BlockMappingState;

    fn compressible_block(tag: u8) -> Vec<u8> {
        // Long runs deflate well.
        let mut data = vec![tag; BLOCK_SIZE];
        data[0] = tag.wrapping_add(1);
        data
    }

    #[test]
    fn compress_and_decompress_round_trip() {
        let data = compressible_block(7);
        let compressed = compress_block(&data).expect("run-heavy block compresses");
        assert!(compressed.len() <= MAX_FRAGMENT_SIZE);
        let restored = decompress_fragment(&compressed).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn incompressible_data_is_refused() {
        // A pseudo-random block should not deflate below half capacity.
        let mut data = vec![0u8; BLOCK_SIZE];
        let mut state = 0x12345678u32;
        for byte in data.iter_mut() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *byte = (state >> 24) as u8;
        }
        assert!(compress_block(&data).is_none());
    }

    #[test]
    fn batch_closes_at_slot_limit() {
        let mut packer = Packer::new();
        let fragment = Bytes::from_static(b"abcdef");
        let mut closed = None;
        for vio in 0..MAX_COMPRESSION_SLOTS {
            closed = packer.add(vio, fragment.clone());
            if vio + 1 < MAX_COMPRESSION_SLOTS {
                assert!(closed.is_none());
            }
        }
        let batch = closed.expect("fourteenth fragment closes the batch");
        assert!(!batch.aborted);
        assert_eq!(batch.placements.len(), MAX_COMPRESSION_SLOTS);
        let block = batch.block.unwrap();
        for (vio, slot) in &batch.placements {
            assert_eq!(*vio, *slot as usize);
            let frag = get_fragment(BlockMappingState::Compressed(*slot), &block).unwrap();
            assert_eq!(frag, b"abcdef");
        }
    }

    #[test]
    fn size_one_batch_aborts() {
        let mut packer = Packer::new();
        packer.add(5, Bytes::from_static(b"lonely"));
        let batch = packer.flush().unwrap();
        assert!(batch.aborted);
        assert_eq!(batch.placements, vec![(5, 0)]);
        assert_eq!(packer.stats.batches_aborted, 1);
    }

    #[test]
    fn capacity_overflow_closes_previous_batch() {
        let mut packer = Packer::new();
        let half = Bytes::from(vec![1u8; MAX_FRAGMENT_SIZE]);
        assert!(packer.add(1, half.clone()).is_none());
        assert!(packer.add(2, half.clone()).is_none());
        // A third half-block fragment cannot fit with the first two.
        let closed = packer.add(3, half).expect("previous batch closes");
        assert!(!closed.aborted);
        assert_eq!(closed.placements.len(), 2);
        assert_eq!(packer.pending_count(), 1);
    }
}
