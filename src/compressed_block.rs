//! The on-disk format of shared compressed blocks.
//!
//! A compressed block holds up to fourteen deflated fragments packed back
//! to back after a header of the format version and the fourteen fragment
//! sizes, all little-endian. A logical block mapped with state
//! `compressed_in_slot(k)` reads fragment `k`.

use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::types::{BlockMappingState, BLOCK_SIZE, MAX_COMPRESSION_SLOTS};

/// Version (4+4 bytes) plus one u16 size per slot.
pub const COMPRESSED_BLOCK_HEADER_SIZE: usize = 8 + 2 * MAX_COMPRESSION_SLOTS;

const VERSION_MAJOR: u32 = 1;
const VERSION_MINOR: u32 = 0;

/// Payload bytes available to fragments.
pub const fn compressed_block_capacity() -> usize {
    BLOCK_SIZE - COMPRESSED_BLOCK_HEADER_SIZE
}

/// Start a compressed block buffer: version header, all sizes zero.
pub fn initialize_compressed_block(buf: &mut [u8]) {
    buf.fill(0);
    let mut writer = FieldWriter::new(buf);
    writer.put_u32(VERSION_MAJOR);
    writer.put_u32(VERSION_MINOR);
}

/// Place a fragment in the given slot at the given payload offset. The
/// caller packs fragments contiguously in slot order.
pub fn put_fragment(buf: &mut [u8], slot: u8, offset: usize, data: &[u8]) {
    debug_assert!((slot as usize) < MAX_COMPRESSION_SLOTS);
    debug_assert!(offset + data.len() <= compressed_block_capacity());
    let size_offset = 8 + slot as usize * 2;
    buf[size_offset..size_offset + 2].copy_from_slice(&(data.len() as u16).to_le_bytes());
    let start = COMPRESSED_BLOCK_HEADER_SIZE + offset;
    buf[start..start + data.len()].copy_from_slice(data);
}

/// Locate the fragment a mapping state names. Returns its byte range
/// within the block, validating the header version, slot, and bounds.
pub fn get_fragment(state: BlockMappingState, buf: &[u8]) -> Result<&[u8]> {
    let BlockMappingState::Compressed(slot) = state else {
        return Err(VdoError::InvalidFragment);
    };
    if slot as usize >= MAX_COMPRESSION_SLOTS {
        return Err(VdoError::InvalidFragment);
    }
    let mut reader = FieldReader::new(buf);
    let major = reader.get_u32().map_err(|_| VdoError::InvalidFragment)?;
    let minor = reader.get_u32().map_err(|_| VdoError::InvalidFragment)?;
    if (major, minor) != (VERSION_MAJOR, VERSION_MINOR) {
        return Err(VdoError::InvalidFragment);
    }
    let mut sizes = [0usize; MAX_COMPRESSION_SLOTS];
    for size in sizes.iter_mut() {
        *size = reader.get_u16().map_err(|_| VdoError::InvalidFragment)? as usize;
    }
    let fragment_size = sizes[slot as usize];
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for &size in sizes.iter().take(slot as usize) {
        offset += size;
        if offset >= BLOCK_SIZE {
            return Err(VdoError::InvalidFragment);
        }
    }
    if offset + fragment_size > BLOCK_SIZE {
        return Err(VdoError::InvalidFragment);
    }
    Ok(&buf[offset..offset + fragment_size])
}
