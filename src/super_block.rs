//! The super block: the durable root of every metadata engine's saved
//! state, rewritten at clean shutdown, recovery milestones, and read-only
//! transitions.

use crate::config::VdoConfig;
use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::types::{PhysicalBlockNumber, SequenceNumber, BLOCK_SIZE};

const SUPER_BLOCK_MAGIC: &[u8; 8] = b"tvdSUPER";
const SUPER_BLOCK_VERSION: u32 = 1;

/// The device lifecycle state recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdoState {
    New,
    Clean,
    Dirty,
    ReadOnly,
    ForceRebuild,
    Recovering,
    Replaying,
    RebuildForUpgrade,
}

impl VdoState {
    pub fn to_byte(self) -> u8 {
        match self {
            VdoState::New => 0,
            VdoState::Clean => 1,
            VdoState::Dirty => 2,
            VdoState::ReadOnly => 3,
            VdoState::ForceRebuild => 4,
            VdoState::Recovering => 5,
            VdoState::Replaying => 6,
            VdoState::RebuildForUpgrade => 7,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(VdoState::New),
            1 => Ok(VdoState::Clean),
            2 => Ok(VdoState::Dirty),
            3 => Ok(VdoState::ReadOnly),
            4 => Ok(VdoState::ForceRebuild),
            5 => Ok(VdoState::Recovering),
            6 => Ok(VdoState::Replaying),
            7 => Ok(VdoState::RebuildForUpgrade),
            other => Err(VdoError::CorruptPage(format!(
                "unknown device state {other}"
            ))),
        }
    }

    /// Whether loading in this state requires journal replay.
    pub fn requires_recovery(self) -> bool {
        matches!(
            self,
            VdoState::Dirty | VdoState::Recovering | VdoState::Replaying
        )
    }

    pub fn requires_rebuild(self) -> bool {
        matches!(self, VdoState::ForceRebuild | VdoState::RebuildForUpgrade)
    }
}

/// The recovery journal's saved position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalComponentState {
    pub journal_start: SequenceNumber,
    pub block_map_head: SequenceNumber,
    pub slab_journal_head: SequenceNumber,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

/// Everything needed to reopen the device without external configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub nonce: u64,
    pub state: VdoState,
    pub recovery_count: u8,
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub journal_blocks: u64,
    pub slab_blocks: u32,
    pub slab_journal_blocks: u32,
    pub root_count: u32,
    pub block_map_root_origin: PhysicalBlockNumber,
    pub journal: JournalComponentState,
}

impl SuperBlock {
    pub fn new(nonce: u64, config: &VdoConfig, root_origin: PhysicalBlockNumber) -> Self {
        Self {
            nonce,
            state: VdoState::New,
            recovery_count: 0,
            logical_blocks: config.logical_blocks,
            physical_blocks: config.physical_blocks,
            journal_blocks: config.journal_blocks,
            slab_blocks: config.slab_blocks,
            slab_journal_blocks: config.slab_journal_blocks,
            root_count: config.root_count,
            block_map_root_origin: root_origin,
            journal: JournalComponentState::default(),
        }
    }

    /// Reconstruct a configuration from the saved state, using runtime-only
    /// tunables from `base`.
    pub fn to_config(&self, base: &VdoConfig) -> VdoConfig {
        VdoConfig {
            logical_blocks: self.logical_blocks,
            physical_blocks: self.physical_blocks,
            journal_blocks: self.journal_blocks,
            slab_blocks: self.slab_blocks,
            slab_journal_blocks: self.slab_journal_blocks,
            root_count: self.root_count,
            ..base.clone()
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let mut writer = FieldWriter::new(&mut block);
        writer.put_bytes(SUPER_BLOCK_MAGIC);
        writer.put_u32(SUPER_BLOCK_VERSION);
        writer.put_u64(self.nonce);
        writer.put_u8(self.state.to_byte());
        writer.put_u8(self.recovery_count);
        writer.put_u64(self.logical_blocks);
        writer.put_u64(self.physical_blocks);
        writer.put_u64(self.journal_blocks);
        writer.put_u32(self.slab_blocks);
        writer.put_u32(self.slab_journal_blocks);
        writer.put_u32(self.root_count);
        writer.put_u64(self.block_map_root_origin);
        writer.put_u64(self.journal.journal_start);
        writer.put_u64(self.journal.block_map_head);
        writer.put_u64(self.journal.slab_journal_head);
        writer.put_u64(self.journal.logical_blocks_used);
        writer.put_u64(self.journal.block_map_data_blocks);
        let end = writer.offset();
        let checksum = crc32fast::hash(&block[..end]);
        FieldWriter::new(&mut block[end..]).put_u32(checksum);
        block
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(block);
        if reader.get_bytes(8)? != SUPER_BLOCK_MAGIC {
            return Err(VdoError::CorruptPage(
                "super block magic mismatch".to_string(),
            ));
        }
        let version = reader.get_u32()?;
        if version != SUPER_BLOCK_VERSION {
            return Err(VdoError::UnsupportedVersion(format!(
                "super block version {version}"
            )));
        }
        let nonce = reader.get_u64()?;
        let state = VdoState::from_byte(reader.get_u8()?)?;
        let recovery_count = reader.get_u8()?;
        let logical_blocks = reader.get_u64()?;
        let physical_blocks = reader.get_u64()?;
        let journal_blocks = reader.get_u64()?;
        let slab_blocks = reader.get_u32()?;
        let slab_journal_blocks = reader.get_u32()?;
        let root_count = reader.get_u32()?;
        let block_map_root_origin = reader.get_u64()?;
        let journal = JournalComponentState {
            journal_start: reader.get_u64()?,
            block_map_head: reader.get_u64()?,
            slab_journal_head: reader.get_u64()?,
            logical_blocks_used: reader.get_u64()?,
            block_map_data_blocks: reader.get_u64()?,
        };
        let end = reader.offset();
        let stored = FieldReader::new(&block[end..]).get_u32()?;
        let computed = crc32fast::hash(&block[..end]);
        if stored != computed {
            return Err(VdoError::ChecksumMismatch(format!(
                "super block: stored {stored:#x}, computed {computed:#x}"
            )));
        }
        Ok(Self {
            nonce,
            state,
            recovery_count,
            logical_blocks,
            physical_blocks,
            journal_blocks,
            slab_blocks,
            slab_journal_blocks,
            root_count,
            block_map_root_origin,
            journal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        let config = VdoConfig::default();
        let mut sb = SuperBlock::new(0xFEED_F00D, &config, 74);
        sb.state = VdoState::Dirty;
        sb.recovery_count = 3;
        sb.journal = JournalComponentState {
            journal_start: 17,
            block_map_head: 12,
            slab_journal_head: 14,
            logical_blocks_used: 999,
            block_map_data_blocks: 21,
        };
        sb
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = sample();
        let decoded = SuperBlock::decode(&sb.encode()).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn checksum_guards_every_field() {
        let sb = sample();
        let mut block = sb.encode();
        block[40] ^= 1;
        assert!(SuperBlock::decode(&block).is_err());
    }

    #[test]
    fn state_recovery_classes() {
        assert!(VdoState::Dirty.requires_recovery());
        assert!(VdoState::Replaying.requires_recovery());
        assert!(!VdoState::Clean.requires_recovery());
        assert!(VdoState::ForceRebuild.requires_rebuild());
        assert!(!VdoState::Dirty.requires_rebuild());
    }

    #[test]
    fn config_round_trip() {
        let base = VdoConfig::default();
        let sb = SuperBlock::new(1, &base, 74);
        let config = sb.to_config(&base);
        assert_eq!(config.logical_blocks, base.logical_blocks);
        assert_eq!(config.journal_blocks, base.journal_blocks);
    }
}
