//! On-disk format of recovery journal blocks.
//!
//! Each block is a 64-byte header, a run of packed entries, and a trailing
//! sequence number used with the header's check byte to detect stale and
//! torn blocks when the circular log wraps.

use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::types::{
    DataLocation, JournalOperation, LogicalBlockNumber, MetadataType, SequenceNumber, BLOCK_SIZE,
};

pub const RECOVERY_BLOCK_HEADER_SIZE: usize = 64;
pub const RECOVERY_ENTRY_SIZE: usize = 26;
const TRAILER_SIZE: usize = 8;

/// Entries that fit in one journal block.
pub const RECOVERY_ENTRIES_PER_BLOCK: u16 =
    ((BLOCK_SIZE - RECOVERY_BLOCK_HEADER_SIZE - TRAILER_SIZE) / RECOVERY_ENTRY_SIZE) as u16;

/// The check byte changes on each trip around the circular journal, so a
/// block left over from a previous pass is never mistaken for current.
pub fn compute_check_byte(sequence: SequenceNumber, journal_size: u64) -> u8 {
    (((sequence / journal_size) & 0x7F) as u8) | 0x80
}

/// One logical mapping change: the old and new locations for a logical
/// block, or a block-map page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    pub operation: JournalOperation,
    pub lbn: LogicalBlockNumber,
    pub old_location: DataLocation,
    pub new_location: DataLocation,
}

impl RecoveryJournalEntry {
    pub fn encode(&self, buf: &mut [u8]) {
        let mut writer = FieldWriter::new(buf);
        writer.put_u8(self.operation.to_byte());
        writer.put_u8((self.old_location.state.to_nibble() << 4) | self.new_location.state.to_nibble());
        writer.put_u64(self.lbn);
        writer.put_u64(self.old_location.pbn);
        writer.put_u64(self.new_location.pbn);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(buf);
        let operation = JournalOperation::from_byte(reader.get_u8()?)?;
        let states = reader.get_u8()?;
        let old_state = crate::types::BlockMappingState::from_nibble(states >> 4)?;
        let new_state = crate::types::BlockMappingState::from_nibble(states & 0x0F)?;
        let lbn = reader.get_u64()?;
        let old_pbn = reader.get_u64()?;
        let new_pbn = reader.get_u64()?;
        Ok(Self {
            operation,
            lbn,
            old_location: DataLocation::new(old_pbn, old_state),
            new_location: DataLocation::new(new_pbn, new_state),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBlockHeader {
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub entry_count: u16,
    pub check_byte: u8,
    pub recovery_count: u8,
    pub block_map_head: SequenceNumber,
    pub slab_journal_head: SequenceNumber,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

impl RecoveryBlockHeader {
    fn encode(&self, buf: &mut [u8]) {
        let mut writer = FieldWriter::new(buf);
        writer.put_u64(self.sequence_number);
        writer.put_u64(self.nonce);
        writer.put_u8(MetadataType::RecoveryJournal.to_byte());
        writer.put_u16(self.entry_count);
        writer.put_u8(self.check_byte);
        writer.put_u8(self.recovery_count);
        writer.put_u64(self.block_map_head);
        writer.put_u64(self.slab_journal_head);
        writer.put_u64(self.logical_blocks_used);
        writer.put_u64(self.block_map_data_blocks);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(buf);
        let sequence_number = reader.get_u64()?;
        let nonce = reader.get_u64()?;
        let metadata_type = MetadataType::from_byte(reader.get_u8()?)?;
        if metadata_type != MetadataType::RecoveryJournal {
            return Err(VdoError::CorruptJournal(format!(
                "expected recovery journal block, found {metadata_type:?}"
            )));
        }
        let entry_count = reader.get_u16()?;
        let check_byte = reader.get_u8()?;
        let recovery_count = reader.get_u8()?;
        Ok(Self {
            sequence_number,
            nonce,
            entry_count,
            check_byte,
            recovery_count,
            block_map_head: reader.get_u64()?,
            slab_journal_head: reader.get_u64()?,
            logical_blocks_used: reader.get_u64()?,
            block_map_data_blocks: reader.get_u64()?,
        })
    }
}

/// Serialise a full journal block.
pub fn pack_journal_block(
    header: &RecoveryBlockHeader,
    entries: &[RecoveryJournalEntry],
) -> [u8; BLOCK_SIZE] {
    debug_assert!(entries.len() <= RECOVERY_ENTRIES_PER_BLOCK as usize);
    let mut block = [0u8; BLOCK_SIZE];
    header.encode(&mut block[..RECOVERY_BLOCK_HEADER_SIZE]);
    for (index, entry) in entries.iter().enumerate() {
        let offset = RECOVERY_BLOCK_HEADER_SIZE + index * RECOVERY_ENTRY_SIZE;
        entry.encode(&mut block[offset..offset + RECOVERY_ENTRY_SIZE]);
    }
    block[BLOCK_SIZE - TRAILER_SIZE..]
        .copy_from_slice(&header.sequence_number.to_le_bytes());
    block
}

/// Decode and self-validate a journal block: type, nonce, check byte
/// against its own sequence, and the torn-write trailer. Used by the
/// replay scan, which does not know in advance which sequence a slot
/// holds.
pub fn unpack_journal_block_any(
    block: &[u8],
    nonce: u64,
    journal_size: u64,
) -> Result<(RecoveryBlockHeader, Vec<RecoveryJournalEntry>)> {
    let header = RecoveryBlockHeader::decode(&block[..RECOVERY_BLOCK_HEADER_SIZE])?;
    unpack_with_header(block, header, nonce, journal_size)
}

/// Decode and validate a journal block that must hold `expected_sequence`.
pub fn unpack_journal_block(
    block: &[u8],
    nonce: u64,
    journal_size: u64,
    expected_sequence: SequenceNumber,
) -> Result<(RecoveryBlockHeader, Vec<RecoveryJournalEntry>)> {
    let header = RecoveryBlockHeader::decode(&block[..RECOVERY_BLOCK_HEADER_SIZE])?;
    if header.sequence_number != expected_sequence {
        return Err(VdoError::CorruptJournal(format!(
            "sequence {} where {} expected",
            header.sequence_number, expected_sequence
        )));
    }
    unpack_with_header(block, header, nonce, journal_size)
}

fn unpack_with_header(
    block: &[u8],
    header: RecoveryBlockHeader,
    nonce: u64,
    journal_size: u64,
) -> Result<(RecoveryBlockHeader, Vec<RecoveryJournalEntry>)> {
    if header.nonce != nonce {
        return Err(VdoError::NonceMismatch {
            expected: nonce,
            found: header.nonce,
        });
    }
    let check_byte = compute_check_byte(header.sequence_number, journal_size);
    if header.check_byte != check_byte {
        return Err(VdoError::CorruptJournal(format!(
            "check byte {:#x} does not match sequence {}",
            header.check_byte, header.sequence_number
        )));
    }
    let mut trailer = [0u8; 8];
    trailer.copy_from_slice(&block[BLOCK_SIZE - TRAILER_SIZE..]);
    let trailing_sequence = u64::from_le_bytes(trailer);
    if trailing_sequence != header.sequence_number {
        return Err(VdoError::CorruptJournal(format!(
            "torn block: header sequence {}, trailer {}",
            header.sequence_number, trailing_sequence
        )));
    }
    if header.entry_count > RECOVERY_ENTRIES_PER_BLOCK {
        return Err(VdoError::CorruptJournal(format!(
            "entry count {} exceeds capacity",
            header.entry_count
        )));
    }
    let mut entries = Vec::with_capacity(header.entry_count as usize);
    for index in 0..header.entry_count as usize {
        let offset = RECOVERY_BLOCK_HEADER_SIZE + index * RECOVERY_ENTRY_SIZE;
        entries.push(RecoveryJournalEntry::decode(
            &block[offset..offset + RECOVERY_ENTRY_SIZE],
        )?);
    }
    Ok((header, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockMappingState;

    fn sample_entries() -> Vec<RecoveryJournalEntry> {
        vec![
            RecoveryJournalEntry {
                operation: JournalOperation::DataIncrement,
                lbn: 0,
                old_location: DataLocation::UNMAPPED,
                new_location: DataLocation::uncompressed(1234),
            },
            RecoveryJournalEntry {
                operation: JournalOperation::DataIncrement,
                lbn: 77,
                old_location: DataLocation::uncompressed(1234),
                new_location: DataLocation::new(555, BlockMappingState::Compressed(3)),
            },
            RecoveryJournalEntry {
                operation: JournalOperation::BlockMapIncrement,
                lbn: 9,
                old_location: DataLocation::UNMAPPED,
                new_location: DataLocation::uncompressed(800),
            },
        ]
    }

    fn sample_header(entry_count: u16) -> RecoveryBlockHeader {
        RecoveryBlockHeader {
            sequence_number: 130,
            nonce: 0xABCD,
            entry_count,
            check_byte: compute_check_byte(130, 64),
            recovery_count: 1,
            block_map_head: 100,
            slab_journal_head: 101,
            logical_blocks_used: 42,
            block_map_data_blocks: 7,
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let entries = sample_entries();
        let header = sample_header(entries.len() as u16);
        let block = pack_journal_block(&header, &entries);
        let (decoded_header, decoded_entries) =
            unpack_journal_block(&block, 0xABCD, 64, 130).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn check_byte_changes_per_lap() {
        let size = 64;
        assert_eq!(compute_check_byte(0, size), compute_check_byte(63, size));
        assert_ne!(compute_check_byte(63, size), compute_check_byte(64, size));
        // Bit 7 is always set so a zeroed block never validates.
        assert_ne!(compute_check_byte(0, size), 0);
    }

    #[test]
    fn stale_block_rejected_by_sequence() {
        let entries = sample_entries();
        let header = sample_header(entries.len() as u16);
        let block = pack_journal_block(&header, &entries);
        // The same slot one lap later.
        assert!(unpack_journal_block(&block, 0xABCD, 64, 130 + 64).is_err());
    }

    #[test]
    fn torn_block_rejected_by_trailer() {
        let entries = sample_entries();
        let header = sample_header(entries.len() as u16);
        let mut block = pack_journal_block(&header, &entries);
        block[BLOCK_SIZE - 1] ^= 0x40;
        let error = unpack_journal_block(&block, 0xABCD, 64, 130).unwrap_err();
        assert!(matches!(error, VdoError::CorruptJournal(_)));
    }

    #[test]
    fn wrong_nonce_rejected() {
        let entries = sample_entries();
        let header = sample_header(entries.len() as u16);
        let block = pack_journal_block(&header, &entries);
        assert!(matches!(
            unpack_journal_block(&block, 0xDCBA, 64, 130),
            Err(VdoError::NonceMismatch { .. })
        ));
    }

    #[test]
    fn capacity_is_sane() {
        assert!(RECOVERY_ENTRIES_PER_BLOCK >= 100);
        assert_eq!(
            RECOVERY_BLOCK_HEADER_SIZE
                + RECOVERY_ENTRIES_PER_BLOCK as usize * RECOVERY_ENTRY_SIZE
                <= BLOCK_SIZE - TRAILER_SIZE,
            true
        );
    }
}
