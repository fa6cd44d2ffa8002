//! Administrative surface: grow-physical, suspend/resume, dump, the
//! background flusher, and write-error handling.

mod common;

use std::time::Duration;

use common::{random_block, test_config, SharedStore};
use thinvd::dedup::MemoryIndex;
use thinvd::error::VdoError;
use thinvd::registry;
use thinvd::Device;
use thinvd::VdoConfig;

#[test]
fn grow_physical_preserves_data_and_adds_capacity() {
    // Two slabs to start.
    let config = VdoConfig {
        logical_blocks: 1 << 16,
        physical_blocks: 2 + 64 + 8 + 4 + 2 * 256,
        compression: false,
        ..VdoConfig::default()
    };
    let grown_blocks = config.physical_blocks + 3 * 256;
    let (store, _) = SharedStore::create(config.physical_blocks);
    let device = Device::format("admin-grow", store, config, Box::new(MemoryIndex::new())).unwrap();

    let data: Vec<Vec<u8>> = (0..50).map(|i| random_block(i + 7000)).collect();
    for (lbn, block) in data.iter().enumerate() {
        device.write(lbn as u64, block).unwrap();
    }
    let allocated_before = device.allocated_blocks();
    let free_before = device.statistics().depot.free_blocks;

    device.grow_physical(grown_blocks).unwrap();

    // Old data is intact, allocation accounting is continuous, and the
    // new capacity is usable.
    for (lbn, block) in data.iter().enumerate() {
        assert_eq!(&device.read(lbn as u64).unwrap()[..], &block[..]);
    }
    assert_eq!(device.allocated_blocks(), allocated_before);
    let stats = device.statistics();
    assert_eq!(stats.depot.slab_count, 5);
    assert!(stats.depot.free_blocks > free_before);

    for lbn in 100..150 {
        device.write(lbn, &random_block(lbn + 8000)).unwrap();
    }
    for lbn in 100..150 {
        assert_eq!(&device.read(lbn).unwrap()[..], &random_block(lbn + 8000)[..]);
    }
}

#[test]
fn grow_that_adds_nothing_is_rejected() {
    let (store, _) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "admin-grow-noop",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    assert!(device
        .grow_physical(test_config().physical_blocks + 1)
        .is_err());
}

#[test]
fn suspend_blocks_io_until_resume() {
    let (store, _) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "admin-suspend",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    device.write(0, &random_block(1)).unwrap();

    device.suspend().unwrap();
    assert!(matches!(
        device.write(1, &random_block(2)),
        Err(VdoError::ShuttingDown)
    ));
    // At quiescence the journal is fully reaped.
    {
        let handle = registry::lookup("admin-suspend").unwrap();
        let vdo = handle.lock();
        assert_eq!(vdo.journal.head(), vdo.journal.tail());
        assert!(vdo.journal.is_quiescent_now());
    }

    device.resume().unwrap();
    device.write(1, &random_block(2)).unwrap();
    assert_eq!(&device.read(1).unwrap()[..], &random_block(2)[..]);
    assert_eq!(&device.read(0).unwrap()[..], &random_block(1)[..]);
}

#[test]
fn dump_renders_sections() {
    let (store, _) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "admin-dump",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    device.write(0, &random_block(3)).unwrap();

    let full = device.dump("all").unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&full).unwrap();
    assert!(parsed["statistics"]["journal"]["entries_added"].as_u64().unwrap() >= 1);
    assert!(parsed["statistics"]["depot"]["allocated_blocks"].as_u64().unwrap() >= 1);

    let journal_only = device.dump("journal").unwrap();
    assert!(journal_only.contains("blocks_committed"));
    assert!(device.dump("nonsense").is_err());
}

#[test]
fn background_flusher_runs_without_disturbing_io() {
    let (store, _) = SharedStore::create(test_config().physical_blocks);
    let mut device = Device::format(
        "admin-flusher",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    device.start_background_flusher(Duration::from_millis(5));
    for lbn in 0..20 {
        device.write(lbn, &random_block(lbn + 60)).unwrap();
    }
    std::thread::sleep(Duration::from_millis(25));
    for lbn in 0..20 {
        assert_eq!(&device.read(lbn).unwrap()[..], &random_block(lbn + 60)[..]);
    }
    device.close().unwrap();
}

#[test]
fn metadata_write_error_enters_read_only() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "admin-write-error",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    device.write(0, &random_block(1)).unwrap();

    // Every write from here on fails at the store.
    inner.lock().fail_writes_after(0);
    assert!(device.write(1, &random_block(2)).is_err());
    assert!(device.is_read_only());

    // Failing fast now, without touching the store.
    inner.lock().fail_writes_after(u64::MAX);
    assert!(matches!(
        device.write(2, &random_block(3)),
        Err(VdoError::ReadOnly)
    ));
    // Reads still work.
    assert_eq!(&device.read(0).unwrap()[..], &random_block(1)[..]);
}

#[test]
fn era_aging_writes_out_cold_pages() {
    let (store, inner) = SharedStore::create(test_config().physical_blocks);
    let device = Device::format(
        "admin-era",
        store,
        test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    // Each full journal block advances the era; enough writes age the
    // first leaf page out even though nothing flushes it explicitly.
    for lbn in 0..2000 {
        device.write(lbn % 4096, &random_block(lbn + 90_000)).unwrap();
    }
    let cache_writes = device.statistics().page_cache.writes;
    assert!(cache_writes > 0, "aging never wrote a page");
    // The written pages survive a crash without replaying the whole
    // history: recovery starts from the journal head, not block one.
    drop(device);
    inner.lock().crash();
    let recovered = Device::open(
        "admin-era-2",
        SharedStore::reopen(&inner),
        &test_config(),
        Box::new(MemoryIndex::new()),
    )
    .unwrap();
    for lbn in 2000u64.saturating_sub(100)..2000 {
        assert_eq!(
            &recovered.read(lbn % 4096).unwrap()[..],
            &random_block(lbn + 90_000)[..],
            "lbn {lbn}"
        );
    }
}
