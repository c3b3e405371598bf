//! Whole-engine invariant tests: seed a tree with random pairs, churn it
//! with random inserts, updates and deletes, and require the checker to
//! close the books — zero faults, strictly ordered keys, and page/byte
//! accounting that adds up.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use arbordb_storage::buffer::BufferPool;
use arbordb_storage::key::Key;
use arbordb_storage::tree::TreeOps;
use arbordb_storage::verify::{IntegrityCheck, IntegrityCheckOptions};
use arbordb_storage::volume::Volume;

fn quick_options() -> IntegrityCheckOptions {
    IntegrityCheckOptions {
        freeze_updates: false,
        ..IntegrityCheckOptions::default()
    }
}

fn churn(page_size: usize, seed: u64, seeds: usize, operations: usize) {
    let dir = tempdir().unwrap();
    let volume = Volume::create(dir.path().join("churn.avol"), page_size).unwrap();
    let pool = BufferPool::new(volume);
    let ops = TreeOps::new(&pool);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = ops.create_tree("churn").unwrap();
    let mut shadow = std::collections::BTreeMap::new();

    for _ in 0..seeds {
        let k: u64 = rng.gen_range(0..10_000);
        let len = rng.gen_range(0..64);
        let value = vec![b'a' + (k % 26) as u8; len];
        ops.store(&mut tree, &Key::from_u64(k), &value).unwrap();
        shadow.insert(k, value);
    }
    for _ in 0..operations {
        let k: u64 = rng.gen_range(0..10_000);
        match rng.gen_range(0..3) {
            0 => {
                let len = rng.gen_range(0..64);
                let value = vec![b'b' + (k % 24) as u8; len];
                ops.store(&mut tree, &Key::from_u64(k), &value).unwrap();
                shadow.insert(k, value);
            }
            1 => {
                let removed = ops.remove(&mut tree, &Key::from_u64(k)).unwrap();
                assert_eq!(removed, shadow.remove(&k).is_some());
            }
            _ => {
                let got = ops.fetch(&tree, &Key::from_u64(k)).unwrap();
                assert_eq!(got.as_deref(), shadow.get(&k).map(|v| v.as_slice()));
            }
        }
    }

    let tree = ops.get_tree("churn").unwrap().unwrap();

    // Property 2: left-to-right traversal yields strictly increasing keys,
    // and exactly the shadow's keys.
    let mut previous: Option<Key> = None;
    let mut walked = Vec::new();
    ops.traverse(&tree, |key, _| {
        if let Some(p) = &previous {
            assert!(key > p, "key order regressed at {key}");
        }
        previous = Some(key.clone());
        walked.push(key.clone());
        Ok(())
    })
    .unwrap();
    let expected: Vec<Key> = shadow.keys().map(|&k| Key::from_u64(k)).collect();
    assert_eq!(walked, expected);

    // Property 1: the checker finds nothing wrong.
    let report = IntegrityCheck::new(&pool)
        .with_options(quick_options())
        .run()
        .unwrap();
    assert!(report.is_clean(), "faults: {:?}", report.faults);

    // Property 3: reachable + free pages tile the volume exactly.
    assert_eq!(report.used_page_count, report.next_available - 1);

    // Property 4: byte accounting over reachable tree pages.
    let tree_pages = report.counters.index_pages
        + report.counters.data_pages
        + report.counters.long_record_pages;
    assert_eq!(
        report.counters.index_bytes
            + report.counters.data_bytes
            + report.counters.long_record_bytes
            + report.free_bytes,
        tree_pages * page_size as u64
    );
}

#[test]
fn random_churn_1k_pages() {
    churn(1024, 0xA11CE, 400, 1200);
}

#[test]
fn random_churn_4k_pages() {
    churn(4096, 0xB0B, 800, 2000);
}

#[test]
fn random_churn_16k_pages() {
    churn(16384, 7, 600, 1000);
}

#[test]
fn mixed_plain_versioned_and_long_values() {
    let dir = tempdir().unwrap();
    let volume = Volume::create(dir.path().join("mixed.avol"), 2048).unwrap();
    let pool = BufferPool::new(volume);
    let ops = TreeOps::new(&pool);
    let mut rng = StdRng::seed_from_u64(99);
    let mut tree = ops.create_tree("mixed").unwrap();

    let mut version = 1u64;
    for i in 0..300u64 {
        match i % 3 {
            0 => ops
                .store(&mut tree, &Key::from_u64(i), &vec![7u8; rng.gen_range(0..40)])
                .unwrap(),
            1 => {
                version += 1;
                ops.store_version(&mut tree, &Key::from_u64(i), b"versioned", version)
                    .unwrap()
            }
            _ => {
                let blob = vec![i as u8; rng.gen_range(600..3000)];
                ops.store(&mut tree, &Key::from_u64(i), &blob).unwrap()
            }
        }
    }

    let report = IntegrityCheck::new(&pool)
        .with_options(quick_options())
        .run()
        .unwrap();
    assert!(report.is_clean(), "faults: {:?}", report.faults);
    assert!(report.counters.mvv_pages > 0);
    assert!(report.counters.mvv_records > 0);
    assert!(report.counters.long_record_pages > 0);
    assert_eq!(report.used_page_count, report.next_available - 1);
}
