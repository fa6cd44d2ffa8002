//! Fundamental identifiers and on-disk primitives shared by every engine.

use serde::Serialize;

use crate::error::{Result, VdoError};

/// Physical block number. Block 0 is the conventional zero block: logical
/// blocks mapped to it read back as zeros and consume no storage.
pub type PhysicalBlockNumber = u64;

/// Logical block number within the device's thin-provisioned address space.
pub type LogicalBlockNumber = u64;

/// Monotonic recovery-journal sequence number; doubles as the era used to
/// age dirty metadata pages.
pub type SequenceNumber = u64;

/// Block offset within a single slab.
pub type SlabBlockNumber = u32;

/// Index of a slab within the depot.
pub type SlabNumber = u32;

/// Zone index within a zone type.
pub type ZoneId = u8;

/// Cooperative zone-thread identifier.
pub type ThreadId = usize;

pub const BLOCK_SIZE: usize = 4096;
pub const ZERO_BLOCK: PhysicalBlockNumber = 0;

/// Home PBN of a block-map page that has not been allocated yet.
pub const INVALID_PBN: PhysicalBlockNumber = u64::MAX;

/// The number of compressed fragments that can share one physical block.
pub const MAX_COMPRESSION_SLOTS: usize = 14;

/// Zone types which may hold per-entry locks on recovery journal blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneType {
    Logical,
    Physical,
}

/// The operations recorded in the recovery journal and slab journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalOperation {
    DataDecrement,
    DataIncrement,
    BlockMapDecrement,
    BlockMapIncrement,
}

impl JournalOperation {
    pub fn is_increment(self) -> bool {
        matches!(
            self,
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement
        )
    }

    pub fn is_block_map(self) -> bool {
        matches!(
            self,
            JournalOperation::BlockMapIncrement | JournalOperation::BlockMapDecrement
        )
    }

    pub fn to_byte(self) -> u8 {
        match self {
            JournalOperation::DataDecrement => 0,
            JournalOperation::DataIncrement => 1,
            JournalOperation::BlockMapDecrement => 2,
            JournalOperation::BlockMapIncrement => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(JournalOperation::DataDecrement),
            1 => Ok(JournalOperation::DataIncrement),
            2 => Ok(JournalOperation::BlockMapDecrement),
            3 => Ok(JournalOperation::BlockMapIncrement),
            other => Err(VdoError::CorruptJournal(format!(
                "unknown journal operation {other}"
            ))),
        }
    }
}

/// A position in a journal: which block, and which entry within it.
/// Ordered so that replay can tell whether a recorded update has already
/// been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalPoint {
    pub sequence_number: SequenceNumber,
    pub entry_count: u16,
}

impl JournalPoint {
    pub fn new(sequence_number: SequenceNumber, entry_count: u16) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    /// Whether this point is strictly before `other` in journal order.
    pub fn before(&self, other: &JournalPoint) -> bool {
        (self.sequence_number < other.sequence_number)
            || ((self.sequence_number == other.sequence_number)
                && (self.entry_count < other.entry_count))
    }

    pub fn is_valid(&self) -> bool {
        self.sequence_number > 0
    }

    /// The sub-point for the increment half of a recovery journal entry.
    /// Each entry can touch two slabs (new and old locations); the halves
    /// get distinct, ordered points so per-slab absorption tracking can
    /// tell them apart.
    pub fn increment_half(&self) -> JournalPoint {
        JournalPoint::new(self.sequence_number, self.entry_count * 2)
    }

    /// The sub-point for the decrement half of a recovery journal entry.
    pub fn decrement_half(&self) -> JournalPoint {
        JournalPoint::new(self.sequence_number, self.entry_count * 2 + 1)
    }
}

/// The mapping state stored in four bits of each five-byte block map entry.
/// Unmapped must be zero so that a zeroed page decodes as fully unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMappingState {
    Unmapped,
    Uncompressed,
    Compressed(u8),
}

const MAPPING_STATE_UNCOMPRESSED: u8 = 1;
const MAPPING_STATE_COMPRESSED_BASE: u8 = 2;

impl BlockMappingState {
    pub fn for_slot(slot: u8) -> Self {
        BlockMappingState::Compressed(slot)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, BlockMappingState::Compressed(_))
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            BlockMappingState::Unmapped => 0,
            BlockMappingState::Uncompressed => MAPPING_STATE_UNCOMPRESSED,
            BlockMappingState::Compressed(slot) => MAPPING_STATE_COMPRESSED_BASE + slot,
        }
    }

    pub fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0 => Ok(BlockMappingState::Unmapped),
            MAPPING_STATE_UNCOMPRESSED => Ok(BlockMappingState::Uncompressed),
            n if (n as usize) < MAPPING_STATE_COMPRESSED_BASE as usize + MAX_COMPRESSION_SLOTS => {
                Ok(BlockMappingState::Compressed(n - MAPPING_STATE_COMPRESSED_BASE))
            }
            other => Err(VdoError::InvalidMapping(format!(
                "mapping state nibble {other} out of range"
            ))),
        }
    }
}

/// A logical block's mapping: the physical block holding its data and how
/// the data is stored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    pub pbn: PhysicalBlockNumber,
    pub state: BlockMappingState,
}

impl DataLocation {
    pub const UNMAPPED: DataLocation = DataLocation {
        pbn: ZERO_BLOCK,
        state: BlockMappingState::Unmapped,
    };

    pub fn new(pbn: PhysicalBlockNumber, state: BlockMappingState) -> Self {
        Self { pbn, state }
    }

    pub fn uncompressed(pbn: PhysicalBlockNumber) -> Self {
        Self::new(pbn, BlockMappingState::Uncompressed)
    }

    pub fn is_mapped(&self) -> bool {
        self.state != BlockMappingState::Unmapped
    }

    /// A mapped location naming a real (non-zero) physical block.
    pub fn references_storage(&self) -> bool {
        self.is_mapped() && self.pbn != ZERO_BLOCK
    }

    /// Pack into the five-byte on-disk entry: four bits of mapping state,
    /// four high bits of PBN, then the low 32 PBN bits little-endian.
    pub fn pack(&self) -> [u8; 5] {
        let mut bytes = [0u8; 5];
        bytes[0] = (self.state.to_nibble() << 4) | (((self.pbn >> 32) & 0x0F) as u8);
        bytes[1..5].copy_from_slice(&((self.pbn & 0xFFFF_FFFF) as u32).to_le_bytes());
        bytes
    }

    pub fn unpack(bytes: &[u8; 5]) -> Result<Self> {
        let state = BlockMappingState::from_nibble(bytes[0] >> 4)?;
        let high = (bytes[0] & 0x0F) as u64;
        let low = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as u64;
        let pbn = (high << 32) | low;
        if state == BlockMappingState::Unmapped && pbn != ZERO_BLOCK {
            return Err(VdoError::InvalidMapping(format!(
                "unmapped entry names physical block {pbn}"
            )));
        }
        Ok(Self { pbn, state })
    }
}

/// Metadata block type tags, stored in journal block headers so that stale
/// or misdirected blocks are never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    RecoveryJournal,
    SlabJournal,
}

impl MetadataType {
    pub fn to_byte(self) -> u8 {
        match self {
            MetadataType::RecoveryJournal => 1,
            MetadataType::SlabJournal => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(MetadataType::RecoveryJournal),
            2 => Ok(MetadataType::SlabJournal),
            other => Err(VdoError::CorruptJournal(format!(
                "unknown metadata type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_point_ordering() {
        let a = JournalPoint::new(3, 5);
        let b = JournalPoint::new(3, 6);
        let c = JournalPoint::new(4, 0);
        assert!(a.before(&b));
        assert!(b.before(&c));
        assert!(!b.before(&a));
        assert!(!a.before(&a));
    }

    #[test]
    fn mapping_entry_round_trip() {
        let cases = [
            DataLocation::UNMAPPED,
            DataLocation::uncompressed(1),
            DataLocation::uncompressed(0xF_FFFF_FFFF),
            DataLocation::new(42, BlockMappingState::Compressed(0)),
            DataLocation::new(42, BlockMappingState::Compressed(13)),
        ];
        for location in cases {
            let unpacked = DataLocation::unpack(&location.pack()).unwrap();
            assert_eq!(unpacked, location);
        }
    }

    #[test]
    fn zeroed_entry_is_unmapped() {
        let entry = DataLocation::unpack(&[0u8; 5]).unwrap();
        assert_eq!(entry, DataLocation::UNMAPPED);
        assert!(!entry.is_mapped());
    }

    #[test]
    fn mapping_state_nibble_range() {
        assert!(BlockMappingState::from_nibble(15).is_ok());
        assert!(BlockMappingState::from_nibble(16).is_err());
        assert_eq!(
            BlockMappingState::from_nibble(2).unwrap(),
            BlockMappingState::Compressed(0)
        );
    }
}
