//! On-disk block map pages.
//!
//! A page is a 32-byte header, an array of five-byte entries, and a
//! trailing generation footer. The generation is bumped on every write and
//! stored at both ends of the page, so a torn write can never be mistaken
//! for a valid older page: readers compare the header generation with the
//! footer and treat any mismatch as a bad page.

use crate::error::Result;
use crate::packing::{FieldReader, FieldWriter};
use crate::types::{DataLocation, PhysicalBlockNumber, BLOCK_SIZE};

pub const PAGE_HEADER_SIZE: usize = 32;
const GENERATION_FOOTER_SIZE: usize = 4;

/// Mappings per leaf page; also the branching factor of interior pages.
pub const ENTRIES_PER_PAGE: usize =
    (BLOCK_SIZE - PAGE_HEADER_SIZE - GENERATION_FOOTER_SIZE) / 5;

const FLAG_INITIALISED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidity {
    /// Proper header, matching generations, expected PBN.
    Valid { initialised: bool },
    /// Never written (or written by someone else): nonce mismatch.
    Blank,
    /// Recognisably ours but damaged: torn generation, wrong PBN.
    Bad(&'static str),
}

/// Initialise a buffer as an empty page owned by `pbn`.
pub fn format_page(buf: &mut [u8], nonce: u64, pbn: PhysicalBlockNumber, initialised: bool) {
    buf.fill(0);
    let mut writer = FieldWriter::new(buf);
    writer.put_u64(nonce);
    writer.put_u64(pbn);
    writer.put_u32(0); // generation
    writer.put_u8(if initialised { FLAG_INITIALISED } else { 0 });
    write_generation_footer(buf, 0);
}

fn write_generation_footer(buf: &mut [u8], generation: u32) {
    buf[BLOCK_SIZE - GENERATION_FOOTER_SIZE..].copy_from_slice(&generation.to_le_bytes());
}

fn read_generation_footer(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[BLOCK_SIZE - GENERATION_FOOTER_SIZE..]);
    u32::from_le_bytes(raw)
}

pub fn generation(buf: &[u8]) -> u32 {
    let mut reader = FieldReader::new(buf);
    let _ = reader.skip(16);
    reader.get_u32().unwrap_or(0)
}

/// Bump the write generation in header and footer ahead of a write.
pub fn advance_generation(buf: &mut [u8]) {
    let next = generation(buf).wrapping_add(1);
    buf[16..20].copy_from_slice(&next.to_le_bytes());
    write_generation_footer(buf, next);
}

pub fn is_initialised(buf: &[u8]) -> bool {
    buf[20] & FLAG_INITIALISED != 0
}

pub fn set_initialised(buf: &mut [u8]) {
    buf[20] |= FLAG_INITIALISED;
}

/// The read hook's validation: run on every page the cache loads.
pub fn validate_page(buf: &[u8], nonce: u64, expected_pbn: PhysicalBlockNumber) -> PageValidity {
    let mut reader = FieldReader::new(buf);
    let page_nonce = match reader.get_u64() {
        Ok(value) => value,
        Err(_) => return PageValidity::Bad("short page"),
    };
    if page_nonce != nonce {
        return PageValidity::Blank;
    }
    let pbn = match reader.get_u64() {
        Ok(value) => value,
        Err(_) => return PageValidity::Bad("short page"),
    };
    if pbn != expected_pbn {
        return PageValidity::Bad("page declares another physical block");
    }
    let header_generation = match reader.get_u32() {
        Ok(value) => value,
        Err(_) => return PageValidity::Bad("short page"),
    };
    if header_generation != read_generation_footer(buf) {
        return PageValidity::Bad("torn write: generation fence mismatch");
    }
    PageValidity::Valid {
        initialised: is_initialised(buf),
    }
}

pub fn get_entry(buf: &[u8], slot: usize) -> Result<DataLocation> {
    debug_assert!(slot < ENTRIES_PER_PAGE);
    let offset = PAGE_HEADER_SIZE + slot * 5;
    let mut raw = [0u8; 5];
    raw.copy_from_slice(&buf[offset..offset + 5]);
    DataLocation::unpack(&raw)
}

pub fn set_entry(buf: &mut [u8], slot: usize, location: DataLocation) {
    debug_assert!(slot < ENTRIES_PER_PAGE);
    let offset = PAGE_HEADER_SIZE + slot * 5;
    buf[offset..offset + 5].copy_from_slice(&location.pack());
    set_initialised(buf);
}
