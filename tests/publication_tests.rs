//! End-to-end publication tests against real shared memory
//!
//! Every test runs against its own control region (name derived from the
//! pid) but segments share the host-wide key space, so the tests serialize
//! through a file-scoped mutex and clean up the low keys around each run.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use waystore::{
    BlockFileWriter, RegionRegistry, RegionView, Segment, SharedMonitor, Storage, StorageConfig,
    StoreError,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn control_name(tag: &str) -> String {
    format!("waystore-test-{}-{}", std::process::id(), tag)
}

fn cleanup(control: &str) {
    for key in 1..=8u8 {
        let _ = Segment::remove(key);
    }
    let _ = SharedMonitor::<RegionRegistry>::remove(control);
}

/// Write a dataset whose static region has one 1024-byte block "a" and
/// whose updatable region has one 512-byte block "w"
fn write_dataset(base: &std::path::Path) {
    let mut graph = BlockFileWriter::new();
    graph.add_block("a", 1024, vec![0xAB; 1024]).unwrap();
    graph.write_to(&with_extension(base, ".ws.graph")).unwrap();

    let mut weights = BlockFileWriter::new();
    weights.add_block("w", 128, vec![0xCD; 512]).unwrap();
    weights
        .write_to(&with_extension(base, ".ws.weights"))
        .unwrap();
}

fn with_extension(base: &std::path::Path, extension: &str) -> std::path::PathBuf {
    let mut path = base.to_path_buf().into_os_string();
    path.push(extension);
    path.into()
}

fn test_config(dir: &TempDir, control: &str) -> StorageConfig {
    let base = dir.path().join("berlin");
    write_dataset(&base);
    StorageConfig::new(base, "berlin")
        .with_control_region_name(control)
        .with_lock_path(dir.path().join("publisher.lock"))
}

#[test]
fn test_fresh_publication() {
    let _serial = TEST_LOCK.lock().unwrap();
    let control = control_name("fresh");
    cleanup(&control);

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &control);
    Storage::new(config).run(-1).unwrap();

    let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();
    {
        let registry = monitor.lock().unwrap();
        assert_eq!(registry.in_use_count(), 2);

        let slot = registry.find("berlin/static").unwrap();
        let entry = registry.get(slot);
        assert_eq!(entry.shm_key, 1);
        assert_eq!(entry.timestamp, 1);

        let slot = registry.find("berlin/updatable").unwrap();
        let entry = registry.get(slot);
        assert_eq!(entry.shm_key, 2);
        assert_eq!(entry.timestamp, 1);

        assert!(registry.is_key_reserved(1));
        assert!(registry.is_key_reserved(2));
    }

    let view = RegionView::open(&monitor, "berlin/static").unwrap();
    assert_eq!(view.timestamp(), 1);
    assert_eq!(view.shm_key(), 1);
    let bytes: &[u8] = view.block_slice("a").unwrap();
    assert_eq!(bytes.len(), 1024);
    assert!(bytes.iter().all(|&b| b == 0xAB));

    let view = RegionView::open(&monitor, "berlin/updatable").unwrap();
    let weights: &[u8] = view.block_slice("w").unwrap();
    assert_eq!(weights.len(), 128);
    assert_eq!(view.block_slice::<u32>("w").unwrap().len(), 128);

    drop(view);
    cleanup(&control);
}

#[test]
fn test_republication_retires_old_segments() {
    let _serial = TEST_LOCK.lock().unwrap();
    let control = control_name("repub");
    cleanup(&control);

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &control);
    Storage::new(config.clone()).run(-1).unwrap();

    let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();
    let view = RegionView::open(&monitor, "berlin/static").unwrap();
    assert_eq!(view.shm_key(), 1);

    // republish while a consumer is still attached to segment 1; the
    // publisher blocks reclaiming it until the consumer detaches
    let publisher = thread::spawn(move || Storage::new(config).run(-1));

    // wait until the swap committed
    let commit_deadline = Instant::now() + Duration::from_secs(10);
    while view.is_current(&monitor).unwrap() {
        assert!(Instant::now() < commit_deadline, "swap never committed");
        thread::sleep(Duration::from_millis(10));
    }

    // the view keeps reading the retired segment undisturbed
    let bytes: &[u8] = view.block_slice("a").unwrap();
    assert!(bytes.iter().all(|&b| b == 0xAB));
    assert_eq!(view.wait_for_update(&monitor).unwrap(), 2);

    // detaching lets the publisher finish reclamation
    drop(view);
    publisher.join().unwrap().unwrap();

    {
        let registry = monitor.lock().unwrap();
        assert_eq!(registry.in_use_count(), 2);

        let slot = registry.find("berlin/static").unwrap();
        assert_eq!(registry.get(slot).shm_key, 3);
        assert_eq!(registry.get(slot).timestamp, 2);

        let slot = registry.find("berlin/updatable").unwrap();
        assert_eq!(registry.get(slot).shm_key, 4);
        assert_eq!(registry.get(slot).timestamp, 2);

        // old segments destroyed, their keys back in the pool
        assert!(!Segment::exists(1));
        assert!(!Segment::exists(2));
        assert!(!registry.is_key_reserved(1));
        assert!(!registry.is_key_reserved(2));
        assert!(registry.is_key_reserved(3));
        assert!(registry.is_key_reserved(4));
    }

    cleanup(&control);
}

#[test]
fn test_swap_times_out_and_cleans_up() {
    let _serial = TEST_LOCK.lock().unwrap();
    let control = control_name("timeout");
    cleanup(&control);

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &control);

    let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();

    // hold the registry mutex from another thread for the whole attempt
    let holder = {
        let control = control.clone();
        thread::spawn(move || {
            let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();
            let guard = monitor.lock().unwrap();
            thread::sleep(Duration::from_secs(3));
            drop(guard);
        })
    };
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    let err = Storage::new(config).run(1).unwrap_err();
    assert!(matches!(err, StoreError::SwapTimedOut { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));

    holder.join().unwrap();

    let registry = monitor.lock().unwrap();
    assert_eq!(registry.in_use_count(), 0);
    assert!(!registry.is_key_reserved(1));
    assert!(!registry.is_key_reserved(2));
    assert!(!Segment::exists(1));
    assert!(!Segment::exists(2));
    drop(registry);

    cleanup(&control);
}

#[test]
fn test_missing_required_file_fails_without_side_effects() {
    let _serial = TEST_LOCK.lock().unwrap();
    let control = control_name("missing");
    cleanup(&control);

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &control);
    std::fs::remove_file(config.path_for(".ws.weights")).unwrap();

    let err = Storage::new(config).run(-1).unwrap_err();
    assert!(matches!(err, StoreError::MissingRequiredFile { .. }));

    let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();
    let registry = monitor.lock().unwrap();
    assert_eq!(registry.in_use_count(), 0);
    assert!(!registry.is_key_reserved(1));
    assert!(!Segment::exists(1));
    drop(registry);

    cleanup(&control);
}

#[test]
fn test_wait_for_update_wakes_on_publication() {
    let _serial = TEST_LOCK.lock().unwrap();
    let control = control_name("notify");
    cleanup(&control);

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &control);
    Storage::new(config.clone()).run(-1).unwrap();

    let monitor = SharedMonitor::<RegionRegistry>::create_or_open(&control).unwrap();
    let view = RegionView::open(&monitor, "berlin/updatable").unwrap();
    assert_eq!(view.timestamp(), 1);

    let publisher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        Storage::new(config).run(-1)
    });

    // blocks on the registry condition variable until the swap broadcasts
    let new_timestamp = view.wait_for_update(&monitor).unwrap();
    assert_eq!(new_timestamp, 2);

    // detach so the publisher can reclaim the old segment
    drop(view);
    publisher.join().unwrap().unwrap();

    cleanup(&control);
}
