//! Crash recovery, clean shutdown, scrub corruption handling, and the
//! read-only rebuild.

mod common;

use common::{random_block, test_config, SharedStore};
use thinvd::dedup::MemoryIndex;
use thinvd::error::VdoError;
use thinvd::registry;
use thinvd::types::BLOCK_SIZE;
use thinvd::BlockStore;
use thinvd::Device;

#[test]
fn clean_shutdown_and_reopen() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-clean",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    let data: Vec<Vec<u8>> = (0..20).map(random_block).collect();
    for (lbn, block) in data.iter().enumerate() {
        device.write(lbn as u64, block).unwrap();
    }
    device.close().unwrap();

    let reopened = Device::open(
        "recovery-clean-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for (lbn, block) in data.iter().enumerate() {
        assert_eq!(&reopened.read(lbn as u64).unwrap()[..], &block[..]);
    }
    // A clean load scrubs nothing.
    assert_eq!(reopened.statistics().scrubber.slabs_scrubbed, 0);
}

#[test]
fn crash_recovery_replays_acknowledged_writes() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-crash",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    let data: Vec<Vec<u8>> = (0..40).map(random_block).collect();
    for (lbn, block) in data.iter().enumerate() {
        device.write(lbn as u64, block).unwrap();
    }
    let allocated_before = device.allocated_blocks();
    drop(device);
    // Power loss: everything that was not flushed or journalled is gone.
    inner.lock().crash();

    let recovered = Device::open(
        "recovery-crash-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();

    // Every acknowledged write reads back the written value.
    for (lbn, block) in data.iter().enumerate() {
        assert_eq!(
            &recovered.read(lbn as u64).unwrap()[..],
            &block[..],
            "lbn {lbn}"
        );
    }
    // Reference counts match the mappings exactly.
    assert_eq!(recovered.allocated_blocks(), allocated_before);
    assert_eq!(recovered.statistics().logical_blocks_used, 40);

    // Recovered state keeps working.
    recovered.write(100, &random_block(999)).unwrap();
    assert_eq!(
        &recovered.read(100).unwrap()[..],
        &random_block(999)[..]
    );
}

#[test]
fn crash_recovery_preserves_dedupe_counts() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-dedupe",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    let data = random_block(77);
    for lbn in 0..5 {
        device.write(lbn, &data).unwrap();
    }
    drop(device);
    inner.lock().crash();

    let recovered = Device::open(
        "recovery-dedupe-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for lbn in 0..5 {
        assert_eq!(&recovered.read(lbn).unwrap()[..], &data[..]);
    }
    let handle = registry::lookup("recovery-dedupe-2").unwrap();
    let vdo = handle.lock();
    let data_origin = vdo.depot.slabs[0].data_origin;
    assert_eq!(vdo.depot.reference_count(data_origin), Some(5));
}

#[test]
fn replay_is_deterministic_from_the_same_disk_state() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-idempotent",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for lbn in 0..30 {
        device.write(lbn, &random_block(lbn + 500)).unwrap();
    }
    drop(device);
    inner.lock().crash();

    // Replay twice from identical on-disk images.
    let snapshot = inner.lock().clone();
    let first = Device::open(
        "recovery-idempotent-a",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();

    let second_inner = std::sync::Arc::new(parking_lot::Mutex::new(snapshot));
    let second = Device::open(
        "recovery-idempotent-b",
        SharedStore::reopen(&second_inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();

    assert_eq!(first.allocated_blocks(), second.allocated_blocks());
    let stats_a = first.statistics();
    let stats_b = second.statistics();
    assert_eq!(stats_a.logical_blocks_used, stats_b.logical_blocks_used);
    assert_eq!(
        stats_a.block_map_data_blocks,
        stats_b.block_map_data_blocks
    );
    for lbn in 0..30 {
        assert_eq!(
            first.read(lbn).unwrap(),
            second.read(lbn).unwrap(),
            "lbn {lbn}"
        );
    }
}

#[test]
fn corrupt_slab_journal_enters_read_only() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-corrupt",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for lbn in 0..8 {
        device.write(lbn, &random_block(lbn + 40)).unwrap();
    }
    // Force the slab journal tail out so there is a block to corrupt.
    {
        let handle = registry::lookup("recovery-corrupt").unwrap();
        let mut guard = handle.lock();
        let vdo = &mut *guard;
        vdo.depot
            .release_recovery_locks_before(u64::MAX, vdo.store.as_mut())
            .unwrap();
    }
    device.flush().unwrap();
    drop(device);

    // Corrupt the committed slab journal block's entry count, leaving the
    // nonce intact so it reads as damage rather than blank space.
    {
        let mut store = inner.lock();
        let slab_journal_pbn = 2 + 64 + 8 + 4 + 1; // slab 0, sequence 1
        let mut block = [0u8; BLOCK_SIZE];
        store.read_block(slab_journal_pbn, &mut block).unwrap();
        block[26] = 0xFF;
        block[27] = 0xFF;
        store.write_block(slab_journal_pbn, &block).unwrap();
        store.flush().unwrap();
        store.crash();
    }

    let recovered = Device::open(
        "recovery-corrupt-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    assert!(recovered.is_read_only());
    assert!(matches!(
        recovered.write(0, &random_block(1)),
        Err(VdoError::ReadOnly)
    ));
    // None of the corrupt journal's entries were applied.
    {
        let handle = registry::lookup("recovery-corrupt-2").unwrap();
        let vdo = handle.lock();
        assert_eq!(vdo.depot.scrubber.stats.corrupt_journals, 1);
        assert_eq!(vdo.depot.slabs[0].ref_counts.allocated_count(), 0);
    }
    drop(recovered);

    // An operator rebuild brings the device back writable.
    let rebuilt = Device::rebuild(
        "recovery-corrupt-3",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    assert!(!rebuilt.is_read_only());
    rebuilt.write(0, &random_block(2)).unwrap();
    assert_eq!(&rebuilt.read(0).unwrap()[..], &random_block(2)[..]);
}

#[test]
fn rebuild_reconstructs_counts_from_the_block_map() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "recovery-rebuild",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    let data: Vec<Vec<u8>> = (0..10).map(|i| random_block(i + 300)).collect();
    for (lbn, block) in data.iter().enumerate() {
        device.write(lbn as u64, block).unwrap();
    }
    // A clean close makes the block map durable.
    device.close().unwrap();

    let rebuilt = Device::rebuild(
        "recovery-rebuild-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for (lbn, block) in data.iter().enumerate() {
        assert_eq!(&rebuilt.read(lbn as u64).unwrap()[..], &block[..]);
    }
    // Ref count equals mapped count after reconstruction.
    assert_eq!(rebuilt.statistics().logical_blocks_used, 10);
    assert_eq!(rebuilt.allocated_blocks(), 10 + 4);
    rebuilt.write(50, &random_block(555)).unwrap();
    assert_eq!(&rebuilt.read(50).unwrap()[..], &random_block(555)[..]);
}
