//! Transaction-log recovery scenarios: replay, torn tails, compaction,
//! and catalog reconstruction.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use stratum::catalog::Catalog;
use stratum::wal::{BlockEntry, BlockList, PoolQuery, TagId, TransactionLog, TxnRecord, TxnType};

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stratum-wal-it-{}-{}", name, std::process::id()))
}

// ============================================================================
// Scenario: replay of a mixed sequence
// ============================================================================

/// Write CreateTag, CreateNewBlob, DelBlob; load and expect exactly
/// those three records, types [4, 0, 3], payloads intact.
#[test]
fn replay_returns_exact_sequence() {
    let path = temp_log("sequence");
    {
        let mut wal = TransactionLog::open(&path, 1 << 20).unwrap();
        wal.log(&TxnRecord::CreateTag {
            tag_name: "t".into(),
            tag: TagId::new(1, 2),
        })
        .unwrap();
        wal.log(&TxnRecord::CreateNewBlob {
            tag: TagId::new(1, 2),
            blob_name: "b".into(),
            score: 0.5,
        })
        .unwrap();
        wal.log(&TxnRecord::DelBlob {
            tag: TagId::new(1, 2),
            blob_name: "b".into(),
        })
        .unwrap();
        wal.sync().unwrap();
    }

    let wal = TransactionLog::open(&path, 1 << 20).unwrap();
    let records = wal.load().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(TxnRecord::txn_type).collect::<Vec<_>>(),
        vec![TxnType::CreateTag, TxnType::CreateNewBlob, TxnType::DelBlob]
    );
    assert_eq!(
        records[0],
        TxnRecord::CreateTag {
            tag_name: "t".into(),
            tag: TagId::new(1, 2),
        }
    );
    assert_eq!(
        records[1],
        TxnRecord::CreateNewBlob {
            tag: TagId::new(1, 2),
            blob_name: "b".into(),
            score: 0.5,
        }
    );
    drop(wal);
    std::fs::remove_file(&path).unwrap();
}

// ============================================================================
// Scenario: torn tail
// ============================================================================

/// A record whose declared payload size exceeds the bytes present must
/// be dropped silently, returning everything before it and no error.
#[test]
fn torn_tail_drops_only_final_record() {
    let path = temp_log("torn");
    {
        let mut wal = TransactionLog::open(&path, 1 << 20).unwrap();
        for i in 0..5u32 {
            wal.log(&TxnRecord::CreateTag {
                tag_name: format!("tag-{i}"),
                tag: TagId::new(i, 0),
            })
            .unwrap();
        }
        wal.sync().unwrap();
    }
    {
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[TxnType::ExtendBlob as u8]).unwrap();
        f.write_all(&4096u32.to_ne_bytes()).unwrap();
        f.write_all(b"short").unwrap();
    }

    let wal = TransactionLog::open(&path, 1 << 20).unwrap();
    let records = wal.load().unwrap();
    assert_eq!(records.len(), 5);
    for (i, rec) in records.iter().enumerate() {
        assert!(
            matches!(rec, TxnRecord::CreateTag { tag, .. } if tag.major == i as u32),
            "record {i} altered by torn tail"
        );
    }
    drop(wal);
    std::fs::remove_file(&path).unwrap();
}

// ============================================================================
// Scenario: truncate-then-append
// ============================================================================

#[test]
fn truncate_empties_log_and_appends_resume() {
    let path = temp_log("compaction");
    let mut wal = TransactionLog::open(&path, 1 << 20).unwrap();
    for i in 0..100u32 {
        wal.log(&TxnRecord::CreateTag {
            tag_name: format!("pre-{i}"),
            tag: TagId::new(i, 0),
        })
        .unwrap();
    }
    wal.sync().unwrap();
    assert!(wal.size() > 0);

    // Snapshot taken: compact.
    wal.truncate().unwrap();
    assert_eq!(wal.load().unwrap(), vec![]);

    wal.log(&TxnRecord::CreateTag {
        tag_name: "post".into(),
        tag: TagId::new(1000, 0),
    })
    .unwrap();
    wal.sync().unwrap();
    let records = wal.load().unwrap();
    assert_eq!(records.len(), 1);
    drop(wal);
    std::fs::remove_file(&path).unwrap();
}

// ============================================================================
// Catalog reconstruction equals the writer's final state
// ============================================================================

/// Replaying from empty state yields the same catalog the writer held
/// before "crashing": the log is the recovery oracle.
#[test]
fn catalog_replay_matches_live_state() {
    let path = temp_log("catalog");
    let block = |i: u8| BlockEntry {
        bdev_major: 1,
        bdev_minor: 0,
        query: PoolQuery([i; 16]),
        target_offset: i as u64 * 8192,
        size: 8192,
    };

    let mut live = Catalog::new();
    {
        let mut wal = TransactionLog::open(&path, 1 << 20).unwrap();
        let mutations = vec![
            TxnRecord::CreateTag {
                tag_name: "sensors".into(),
                tag: TagId::new(1, 0),
            },
            TxnRecord::CreateTag {
                tag_name: "logs".into(),
                tag: TagId::new(2, 0),
            },
            TxnRecord::CreateNewBlob {
                tag: TagId::new(1, 0),
                blob_name: "temps".into(),
                score: 0.9,
            },
            TxnRecord::ExtendBlob {
                tag: TagId::new(1, 0),
                blob_name: "temps".into(),
                blocks: BlockList::from_vec(vec![block(1), block(2), block(3)]),
            },
            TxnRecord::CreateNewBlob {
                tag: TagId::new(2, 0),
                blob_name: "boot".into(),
                score: 0.1,
            },
            TxnRecord::ClearBlob {
                tag: TagId::new(1, 0),
                blob_name: "temps".into(),
            },
            TxnRecord::ExtendBlob {
                tag: TagId::new(1, 0),
                blob_name: "temps".into(),
                blocks: BlockList::from_vec(vec![block(4)]),
            },
            TxnRecord::DelTag {
                tag_name: "logs".into(),
                tag: TagId::new(2, 0),
            },
        ];
        // Log first, then mutate memory: write-ahead ordering.
        for m in &mutations {
            wal.log(m).unwrap();
            live.apply(m);
        }
        wal.sync().unwrap();
    }

    let wal = TransactionLog::open(&path, 1 << 20).unwrap();
    let recovered = Catalog::replay(&wal).unwrap();

    assert_eq!(recovered.tag_count(), live.tag_count());
    assert_eq!(recovered.blob_count(), live.blob_count());
    assert_eq!(
        recovered.tag(TagId::new(1, 0)).unwrap().name,
        live.tag(TagId::new(1, 0)).unwrap().name
    );
    let r = recovered.blob(TagId::new(1, 0), "temps").unwrap();
    let l = live.blob(TagId::new(1, 0), "temps").unwrap();
    assert_eq!(r.blocks, l.blocks);
    assert_eq!(r.blocks.len(), 1);
    assert_eq!(r.blocks[0], block(4));
    assert!(recovered.tag(TagId::new(2, 0)).is_none());
    drop(wal);
    std::fs::remove_file(&path).unwrap();
}

// ============================================================================
// Durability ordering across sync points
// ============================================================================

#[test]
fn everything_before_sync_is_loadable() {
    let path = temp_log("durability");
    let mut wal = TransactionLog::open(&path, 1 << 20).unwrap();
    for batch in 0..4u32 {
        for i in 0..50u32 {
            wal.log(&TxnRecord::CreateNewBlob {
                tag: TagId::new(batch, 0),
                blob_name: format!("b{i}"),
                score: i as f32,
            })
            .unwrap();
        }
        wal.sync().unwrap();
        // Every record logged before this sync is visible to a reader.
        let visible = wal.load().unwrap();
        assert_eq!(visible.len(), ((batch + 1) * 50) as usize);
    }
    drop(wal);
    std::fs::remove_file(&path).unwrap();
}
