//! The geometry block: the first block of the backing store, identifying
//! the device and locating its regions.

use rand::RngCore;
use uuid::Uuid;

use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::types::BLOCK_SIZE;

const GEOMETRY_MAGIC: &[u8; 8] = b"tvdGEOM1";
pub const RELEASE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Index,
    Data,
}

impl RegionKind {
    fn to_byte(self) -> u8 {
        match self {
            RegionKind::Index => 0,
            RegionKind::Data => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(RegionKind::Index),
            1 => Ok(RegionKind::Data),
            other => Err(VdoError::CorruptPage(format!(
                "unknown region kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub start_block: u64,
    pub block_count: u64,
}

/// Identity and region table for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub release_version: u32,
    pub nonce: u64,
    pub uuid: Uuid,
    /// Offset applied to user bios before they reach the data region.
    pub bio_offset: u64,
    pub index_region: Region,
    pub data_region: Region,
}

impl Geometry {
    /// Create a fresh geometry with a random nonce and UUID. The index
    /// region is reserved for the external dedup index; the data region is
    /// everything the storage core owns.
    pub fn generate(index_blocks: u64, data_blocks: u64) -> Self {
        let mut rng = rand::rng();
        Self {
            release_version: RELEASE_VERSION,
            nonce: rng.next_u64(),
            uuid: Uuid::new_v4(),
            bio_offset: 0,
            index_region: Region {
                kind: RegionKind::Index,
                start_block: 0,
                block_count: index_blocks,
            },
            data_region: Region {
                kind: RegionKind::Data,
                start_block: index_blocks,
                block_count: data_blocks,
            },
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let mut writer = FieldWriter::new(&mut block);
        writer.put_bytes(GEOMETRY_MAGIC);
        writer.put_u32(self.release_version);
        writer.put_u64(self.nonce);
        writer.put_bytes(self.uuid.as_bytes());
        writer.put_u64(self.bio_offset);
        for region in [&self.index_region, &self.data_region] {
            writer.put_u8(region.kind.to_byte());
            writer.put_u64(region.start_block);
            writer.put_u64(region.block_count);
        }
        let end = writer.offset();
        let checksum = crc32fast::hash(&block[..end]);
        let mut writer = FieldWriter::new(&mut block[end..]);
        writer.put_u32(checksum);
        block
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(block);
        let magic = reader.get_bytes(8)?;
        if magic != GEOMETRY_MAGIC {
            return Err(VdoError::CorruptPage(
                "geometry block magic mismatch".to_string(),
            ));
        }
        let release_version = reader.get_u32()?;
        if release_version != RELEASE_VERSION {
            return Err(VdoError::UnsupportedVersion(format!(
                "geometry release {release_version}"
            )));
        }
        let nonce = reader.get_u64()?;
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(reader.get_bytes(16)?);
        let bio_offset = reader.get_u64()?;
        let mut regions = [Region {
            kind: RegionKind::Index,
            start_block: 0,
            block_count: 0,
        }; 2];
        for region in regions.iter_mut() {
            region.kind = RegionKind::from_byte(reader.get_u8()?)?;
            region.start_block = reader.get_u64()?;
            region.block_count = reader.get_u64()?;
        }
        let end = reader.offset();
        let stored = FieldReader::new(&block[end..]).get_u32()?;
        let computed = crc32fast::hash(&block[..end]);
        if stored != computed {
            return Err(VdoError::ChecksumMismatch(format!(
                "geometry block: stored {stored:#x}, computed {computed:#x}"
            )));
        }
        Ok(Self {
            release_version,
            nonce,
            uuid: Uuid::from_bytes(uuid_bytes),
            bio_offset,
            index_region: regions[0],
            data_region: regions[1],
        })
    }
}
