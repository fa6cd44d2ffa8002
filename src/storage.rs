//! Backing block stores.
//!
//! Every engine does I/O through [`BlockStore`]. `FileStore` backs a real
//! device file; `MemStore` backs tests and models crash consistency by
//! keeping volatile writes separate from durable ones until a flush or a
//! forced-unit-access write promotes them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, VdoError};
use crate::types::{PhysicalBlockNumber, BLOCK_SIZE};

pub trait BlockStore: Send {
    fn block_count(&self) -> u64;

    fn read_block(&mut self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()>;

    fn write_block(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()>;

    /// Write a block and make it durable immediately, without waiting for a
    /// full-device flush.
    fn write_block_fua(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        self.write_block(pbn, buf)?;
        self.flush()
    }

    /// Make every completed write durable.
    fn flush(&mut self) -> Result<()>;

    /// Extend the device to `new_block_count` blocks of zeros.
    fn grow(&mut self, new_block_count: u64) -> Result<()>;
}

fn check_bounds(pbn: PhysicalBlockNumber, count: u64) -> Result<()> {
    if pbn >= count {
        return Err(VdoError::Internal(format!(
            "physical block {pbn} beyond device end {count}"
        )));
    }
    Ok(())
}

// ============================================================================
// In-memory store with crash modeling
// ============================================================================

#[derive(Default, Clone)]
pub struct MemStore {
    block_count: u64,
    durable: HashMap<PhysicalBlockNumber, Box<[u8]>>,
    volatile: HashMap<PhysicalBlockNumber, Box<[u8]>>,
    fail_writes_after: Option<u64>,
    pub writes: u64,
    pub flushes: u64,
}

impl MemStore {
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            ..Default::default()
        }
    }

    /// Arrange for every write after the next `remaining` to fail, for
    /// read-only-mode tests.
    pub fn fail_writes_after(&mut self, remaining: u64) {
        self.fail_writes_after = Some(remaining);
    }

    /// Discard everything that was never flushed, as a power loss would.
    pub fn crash(&mut self) {
        self.volatile.clear();
    }

    fn lookup(&self, pbn: PhysicalBlockNumber) -> Option<&[u8]> {
        self.volatile
            .get(&pbn)
            .or_else(|| self.durable.get(&pbn))
            .map(|data| &data[..])
    }
}

impl BlockStore for MemStore {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        match self.lookup(pbn) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        if let Some(remaining) = self.fail_writes_after.as_mut() {
            if *remaining == 0 {
                return Err(VdoError::Io(std::io::Error::other("injected write error")));
            }
            *remaining -= 1;
        }
        self.writes += 1;
        self.volatile.insert(pbn, buf.to_vec().into_boxed_slice());
        Ok(())
    }

    fn write_block_fua(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        self.write_block(pbn, buf)?;
        if let Some(data) = self.volatile.remove(&pbn) {
            self.durable.insert(pbn, data);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        for (pbn, data) in self.volatile.drain() {
            self.durable.insert(pbn, data);
        }
        Ok(())
    }

    fn grow(&mut self, new_block_count: u64) -> Result<()> {
        if new_block_count < self.block_count {
            return Err(VdoError::Internal(
                "cannot shrink the backing store".to_string(),
            ));
        }
        self.block_count = new_block_count;
        Ok(())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

pub struct FileStore {
    file: File,
    block_count: u64,
}

impl FileStore {
    pub fn create<P: AsRef<Path>>(path: P, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            block_count: len / BLOCK_SIZE as u64,
        })
    }
}

impl BlockStore for FileStore {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        self.file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count)?;
        self.file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn grow(&mut self, new_block_count: u64) -> Result<()> {
        if new_block_count < self.block_count {
            return Err(VdoError::Internal(
                "cannot shrink the backing store".to_string(),
            ));
        }
        self.file.set_len(new_block_count * BLOCK_SIZE as u64)?;
        self.block_count = new_block_count;
        Ok(())
    }
}
