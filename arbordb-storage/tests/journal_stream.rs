//! End-to-end journal coverage: tree mutations against a journaled pool
//! must leave a stream the scanner can replay in order, with page images
//! written before the pages themselves become durable.

use std::sync::Arc;

use tempfile::tempdir;

use arbordb_storage::buffer::BufferPool;
use arbordb_storage::journal::{
    DEFAULT_BLOCK_SIZE, JournalLink, JournalRecord, JournalScanner, JournalWriter, RecordType,
    ScanFilter,
};
use arbordb_storage::key::Key;
use arbordb_storage::tree::TreeOps;
use arbordb_storage::volume::Volume;

fn journaled_pool(dir: &std::path::Path, page_size: usize) -> (BufferPool, std::path::PathBuf) {
    let volume = Volume::create(dir.join("j.avol"), page_size).unwrap();
    let base = dir.join("journal");
    let writer = JournalWriter::create(&base, DEFAULT_BLOCK_SIZE).unwrap();
    let link = JournalLink::new(writer, "j.avol", volume.volume_id()).unwrap();
    let mut pool = BufferPool::new(volume);
    pool.attach_journal(Arc::new(link));
    (pool, base)
}

#[test]
fn mutations_leave_a_replayable_stream() {
    let dir = tempdir().unwrap();
    let (pool, base) = journaled_pool(dir.path(), 1024);
    {
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("ledger").unwrap();
        for i in 0..50u64 {
            ops.store(&mut tree, &Key::from_u64(i), format!("row{i}").as_bytes())
                .unwrap();
        }
        ops.remove(&mut tree, &Key::from_u64(7)).unwrap();
        pool.journal().unwrap().with_writer(|w| w.sync()).unwrap();
    }

    let mut scanner = JournalScanner::open(&base, 0, None);
    let mut starts = 0u64;
    let mut commits = 0u64;
    let mut stores = 0u64;
    let mut deletes = 0u64;
    let mut images = 0u64;
    let mut identified_tree = false;
    let mut open_tx = false;
    scanner
        .scan(&ScanFilter::default(), |scanned| {
            match &scanned.record {
                JournalRecord::TxStart { .. } => {
                    assert!(!open_tx, "transactions must not nest");
                    open_tx = true;
                    starts += 1;
                }
                JournalRecord::TxCommit => {
                    assert!(open_tx, "commit without a start");
                    open_tx = false;
                    commits += 1;
                }
                JournalRecord::Store { key, value, .. } => {
                    assert!(open_tx, "store outside a transaction");
                    assert!(!key.is_empty());
                    assert!(value.starts_with(b"row"));
                    stores += 1;
                }
                JournalRecord::DeleteRange { key1, key2, .. } => {
                    assert!(open_tx);
                    assert_eq!(key1, key2);
                    deletes += 1;
                }
                JournalRecord::IdentifyTree { name, .. } => {
                    identified_tree |= name == "ledger";
                }
                JournalRecord::PageImage { bytes, .. } => {
                    assert_eq!(bytes.len(), 1024);
                    images += 1;
                }
                _ => {}
            }
            Ok(())
        })
        .unwrap();
    assert!(!open_tx);
    assert_eq!(starts, commits);
    assert_eq!(stores, 50);
    assert_eq!(deletes, 1);
    assert!(identified_tree);
    assert!(images > 0, "page images must precede write-back");
}

#[test]
fn every_durable_page_has_a_prior_image() {
    let dir = tempdir().unwrap();
    let (pool, base) = journaled_pool(dir.path(), 1024);
    {
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("t").unwrap();
        for i in 0..120u64 {
            ops.store(&mut tree, &Key::from_u64(i), &[1u8; 30]).unwrap();
        }
        pool.journal().unwrap().with_writer(|w| w.sync()).unwrap();
    }
    let header = {
        let volume = Volume::open(dir.path().join("j.avol"), true).unwrap();
        let head = volume.read_page(0).unwrap();
        arbordb_storage::volume::VolumeHeader::decode(&head).unwrap()
    };

    let filter = ScanFilter {
        types: ScanFilter::parse_types("PA").unwrap(),
        ..ScanFilter::default()
    };
    let mut imaged = std::collections::BTreeSet::new();
    JournalScanner::open(&base, 0, None)
        .scan(&filter, |scanned| {
            if let JournalRecord::PageImage { page_address, .. } = &scanned.record {
                imaged.insert(*page_address);
            }
            Ok(())
        })
        .unwrap();
    // Every allocated page, the head included, went through the journal.
    for address in 0..header.next_available {
        assert!(imaged.contains(&address), "page {address} has no PA record");
    }
}

#[test]
fn scan_by_type_skips_everything_else() {
    let dir = tempdir().unwrap();
    let (pool, base) = journaled_pool(dir.path(), 1024);
    {
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("x").unwrap();
        ops.store(&mut tree, &Key::from_u64(1), b"one").unwrap();
        pool.journal().unwrap().with_writer(|w| w.sync()).unwrap();
    }
    let filter = ScanFilter {
        types: ScanFilter::parse_types("IV,IT").unwrap(),
        ..ScanFilter::default()
    };
    let mut kinds = Vec::new();
    JournalScanner::open(&base, 0, None)
        .scan(&filter, |scanned| {
            kinds.push(scanned.record.record_type());
            Ok(())
        })
        .unwrap();
    assert!(kinds.contains(&RecordType::IV));
    assert!(kinds.contains(&RecordType::IT));
    assert!(
        kinds
            .iter()
            .all(|k| matches!(k, RecordType::IV | RecordType::IT))
    );
}
