//! Shared fixtures for the integration suites.

use std::sync::Arc;

use parking_lot::Mutex;
use thinvd::error::Result;
use thinvd::storage::{BlockStore, MemStore};
use thinvd::types::{PhysicalBlockNumber, BLOCK_SIZE};
use thinvd::VdoConfig;

/// A MemStore that outlives the device using it, so tests can crash the
/// device and reopen the surviving bytes.
pub struct SharedStore {
    inner: Arc<Mutex<MemStore>>,
}

impl SharedStore {
    pub fn create(blocks: u64) -> (Box<dyn BlockStore>, Arc<Mutex<MemStore>>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let inner = Arc::new(Mutex::new(MemStore::new(blocks)));
        (
            Box::new(SharedStore {
                inner: inner.clone(),
            }),
            inner,
        )
    }

    pub fn reopen(inner: &Arc<Mutex<MemStore>>) -> Box<dyn BlockStore> {
        Box::new(SharedStore {
            inner: inner.clone(),
        })
    }
}

impl BlockStore for SharedStore {
    fn block_count(&self) -> u64 {
        self.inner.lock().block_count()
    }

    fn read_block(&mut self, pbn: PhysicalBlockNumber, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().read_block(pbn, buf)
    }

    fn write_block(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        self.inner.lock().write_block(pbn, buf)
    }

    fn write_block_fua(&mut self, pbn: PhysicalBlockNumber, buf: &[u8]) -> Result<()> {
        self.inner.lock().write_block_fua(pbn, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flush()
    }

    fn grow(&mut self, new_block_count: u64) -> Result<()> {
        self.inner.lock().grow(new_block_count)
    }
}

pub fn test_config() -> VdoConfig {
    VdoConfig {
        logical_blocks: 1 << 16,
        physical_blocks: 8192,
        ..VdoConfig::default()
    }
}

/// A block of pseudo-random (incompressible) data derived from a tag.
pub fn random_block(tag: u64) -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    let mut state = tag.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    for byte in data.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = (state >> 32) as u8;
    }
    data
}

/// A run-heavy block that deflates far below the packing threshold.
pub fn compressible_block(tag: u8) -> Vec<u8> {
    let mut data = vec![tag; BLOCK_SIZE];
    data[0] = tag.wrapping_add(1);
    data
}
