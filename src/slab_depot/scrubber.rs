//! The slab scrubber: replays the journal of any slab that was not
//! cleanly saved, rebuilding its reference counts before the slab can
//! serve allocations again.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, VdoError};
use crate::packing::FieldReader;
use crate::storage::BlockStore;
use crate::types::{JournalPoint, SequenceNumber, SlabNumber, BLOCK_SIZE};

use crate::vio::VioPool;

use super::slab::{Slab, SlabStatus};
use super::slab_journal::{unpack_slab_journal_block, SlabJournalBlockHeader, SlabJournalEntry};

/// Metadata read buffers shared by scrub passes.
const SCRUB_POOL_SIZE: usize = 8;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScrubberStatistics {
    pub slabs_scrubbed: u64,
    pub blocks_replayed: u64,
    pub entries_applied: u64,
    pub corrupt_journals: u64,
}

/// How a journal slot reads back during a scrub. A slot that was never
/// written (or belongs to another device) is blank; a slot carrying this
/// slab's nonce but failing any other check is corruption.
enum BlockClass {
    Blank,
    Valid(SlabJournalBlockHeader, Vec<SlabJournalEntry>),
    Corrupt(String),
}

fn classify_block(buf: &[u8], nonce: u64) -> BlockClass {
    // The nonce lives at a fixed offset in the header; if it does not
    // match, the slot was never written by this journal.
    let mut reader = FieldReader::new(buf);
    let _ = reader.skip(16);
    let block_nonce = match reader.get_u64() {
        Ok(value) => value,
        Err(_) => return BlockClass::Blank,
    };
    if block_nonce != nonce {
        return BlockClass::Blank;
    }
    match unpack_slab_journal_block(buf, nonce) {
        Ok((header, entries)) => BlockClass::Valid(header, entries),
        Err(error) => BlockClass::Corrupt(error.to_string()),
    }
}

pub struct SlabScrubber {
    high_priority: VecDeque<SlabNumber>,
    normal: VecDeque<SlabNumber>,
    vio_pool: VioPool<SlabNumber>,
    pub stats: ScrubberStatistics,
}

impl SlabScrubber {
    pub fn new() -> Self {
        Self {
            high_priority: VecDeque::new(),
            normal: VecDeque::new(),
            vio_pool: VioPool::new(SCRUB_POOL_SIZE),
            stats: ScrubberStatistics::default(),
        }
    }

    pub fn register(&mut self, slab: SlabNumber, high_priority: bool) {
        if high_priority {
            self.high_priority.push_back(slab);
        } else {
            self.normal.push_back(slab);
        }
    }

    pub fn has_slabs_to_scrub(&self) -> bool {
        !self.high_priority.is_empty() || !self.normal.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.high_priority.len() + self.normal.len()
    }

    /// The next slab to scrub: the high-priority queue drains first.
    pub fn next_slab(&mut self) -> Option<SlabNumber> {
        self.high_priority
            .pop_front()
            .or_else(|| self.normal.pop_front())
    }

    /// Rebuild one slab's ref counts from its journal. The whole live
    /// range is validated before any entry is applied, so a corrupt
    /// journal applies nothing.
    pub fn scrub_slab(&mut self, slab: &mut Slab, store: &mut dyn BlockStore) -> Result<()> {
        slab.status = SlabStatus::Rebuilding;
        let journal_blocks = slab.ref_counts_origin - slab.origin;
        // Journal reads go through the pooled metadata buffers; a scrub
        // that cannot get one parks until a buffer is returned.
        let Ok(mut vio) = self.vio_pool.acquire(slab.number) else {
            return Ok(());
        };
        let scan = (|| -> Result<HashMap<SequenceNumber, (SlabJournalBlockHeader, Vec<SlabJournalEntry>)>> {
            let mut blocks = HashMap::new();
            let buf = vio.data_mut();
            for slot in 0..journal_blocks {
                store.read_block(slab.origin + slot, buf)?;
                match classify_block(buf, slab.journal_nonce()) {
                    BlockClass::Blank => continue,
                    BlockClass::Corrupt(reason) => {
                        return Err(VdoError::CorruptJournal(format!(
                            "slab {} journal slot {slot}: {reason}",
                            slab.number
                        )));
                    }
                    BlockClass::Valid(header, entries) => {
                        if header.sequence_number % journal_blocks != slot {
                            return Err(VdoError::CorruptJournal(format!(
                                "slab {} journal sequence {} in wrong slot {slot}",
                                slab.number, header.sequence_number
                            )));
                        }
                        blocks.insert(header.sequence_number, (header, entries));
                    }
                }
            }
            Ok(blocks)
        })();
        self.vio_pool.release(vio);
        let journal_map = match scan {
            Ok(blocks) => blocks,
            Err(error) => {
                self.stats.corrupt_journals += 1;
                return Err(error);
            }
        };

        let Some(newest_sequence) = journal_map.keys().copied().max() else {
            // Nothing was ever journalled; the zeroed counts stand.
            slab.status = SlabStatus::Rebuilt;
            self.stats.slabs_scrubbed += 1;
            return Ok(());
        };
        let head = journal_map
            .get(&newest_sequence)
            .map(|(header, _)| header.head)
            .unwrap_or(newest_sequence);

        // Validate the complete live range before applying anything.
        for sequence in head..=newest_sequence {
            if !journal_map.contains_key(&sequence) {
                self.stats.corrupt_journals += 1;
                return Err(VdoError::CorruptJournal(format!(
                    "slab {} journal missing sequence {sequence} in live range {head}..={newest_sequence}",
                    slab.number
                )));
            }
        }

        for sequence in head..=newest_sequence {
            let (_, entries) = &journal_map[&sequence];
            for (index, entry) in entries.iter().enumerate() {
                let point = JournalPoint::new(sequence, index as u16);
                if slab.replay_entry(entry.sbn, entry.operation, point)? {
                    self.stats.entries_applied += 1;
                }
            }
            self.stats.blocks_replayed += 1;
        }

        let ceiling = journal_map[&newest_sequence].0.recovery_ceiling;
        slab.journal.reset_after_rebuild(newest_sequence + 1);
        slab.journal.set_recovery_ceiling(ceiling);
        slab.ref_counts
            .save_dirty(store, slab.ref_counts_origin)
            .map(|_| ())?;
        slab.ref_counts_saved = true;
        slab.status = SlabStatus::Rebuilt;
        self.stats.slabs_scrubbed += 1;
        info!(slab = slab.number, "slab scrubbed");
        Ok(())
    }

    /// Drain both queues against the slab array. Returns the first
    /// corruption error, leaving remaining slabs unscrubbed.
    pub fn scrub_all(&mut self, slabs: &mut [Slab], store: &mut dyn BlockStore) -> Result<()> {
        while let Some(number) = self.next_slab() {
            if let Err(error) = self.scrub_slab(&mut slabs[number as usize], store) {
                warn!(slab = number, %error, "scrub failed");
                return Err(error);
            }
        }
        Ok(())
    }
}

impl Default for SlabScrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlabConfig;
    use crate::storage::MemStore;
    use crate::types::JournalOperation;

    fn make_slab(store_blocks: u64) -> (Slab, MemStore) {
        let config = SlabConfig::compute(64, 4).unwrap();
        let store = MemStore::new(store_blocks);
        (Slab::new(0, 0, 100, &config, 0x5AB), store)
    }

    fn journalled_increment(slab: &mut Slab, store: &mut MemStore, sbn: u32) {
        let pbn = slab.pbn_for_sbn(sbn);
        slab.adjust_reference(
            pbn,
            JournalOperation::DataIncrement,
            crate::types::JournalPoint::new(1, 0),
            1,
            store,
        )
        .unwrap();
    }

    #[test]
    fn scrub_replays_unsaved_journal() {
        let (mut slab, mut store) = make_slab(1024);
        journalled_increment(&mut slab, &mut store, 0);
        journalled_increment(&mut slab, &mut store, 3);
        journalled_increment(&mut slab, &mut store, 3);
        // Commit the journal but crash before the ref counts were saved.
        slab.journal.commit_tail(&mut store).unwrap();

        let config = SlabConfig::compute(64, 4).unwrap();
        let mut recovered = Slab::new(0, 0, 100, &config, 0x5AB);
        recovered.status = SlabStatus::RequiresScrubbing;
        let mut scrubber = SlabScrubber::new();
        scrubber.scrub_slab(&mut recovered, &mut store).unwrap();

        assert_eq!(recovered.ref_counts.count(0), 1);
        assert_eq!(recovered.ref_counts.count(3), 2);
        assert_eq!(recovered.status, SlabStatus::Rebuilt);
        assert_eq!(scrubber.stats.entries_applied, 3);
    }

    #[test]
    fn corrupt_journal_applies_nothing() {
        let (mut slab, mut store) = make_slab(1024);
        journalled_increment(&mut slab, &mut store, 0);
        slab.journal.commit_tail(&mut store).unwrap();

        // Corrupt the entry count in the committed block's header while
        // leaving the nonce intact.
        let mut buf = [0u8; BLOCK_SIZE];
        let pbn = 100 + 1; // sequence 1 lands in slot 1 of 4
        store.read_block(pbn, &mut buf).unwrap();
        buf[26] = 0xFF;
        buf[27] = 0xFF;
        store.write_block(pbn, &buf).unwrap();
        store.flush().unwrap();

        let config = SlabConfig::compute(64, 4).unwrap();
        let mut recovered = Slab::new(0, 0, 100, &config, 0x5AB);
        let mut scrubber = SlabScrubber::new();
        let error = scrubber.scrub_slab(&mut recovered, &mut store).unwrap_err();
        assert!(matches!(error, VdoError::CorruptJournal(_)));
        assert_eq!(scrubber.stats.corrupt_journals, 1);
        // None of the entries were applied.
        assert_eq!(recovered.ref_counts.count(0), 0);
    }

    #[test]
    fn high_priority_queue_drains_first() {
        let mut scrubber = SlabScrubber::new();
        scrubber.register(5, false);
        scrubber.register(9, true);
        scrubber.register(6, false);
        assert_eq!(scrubber.next_slab(), Some(9));
        assert_eq!(scrubber.next_slab(), Some(5));
        assert_eq!(scrubber.next_slab(), Some(6));
        assert_eq!(scrubber.next_slab(), None);
    }

    #[test]
    fn blank_journal_scrubs_clean() {
        let (mut slab, mut store) = make_slab(1024);
        slab.status = SlabStatus::RequiresHighPriorityScrubbing;
        let mut scrubber = SlabScrubber::new();
        scrubber.scrub_slab(&mut slab, &mut store).unwrap();
        assert_eq!(slab.status, SlabStatus::Rebuilt);
    }
}
