// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end write path tests
//!
//! Covers the group-commit coordinator across its modes (default,
//! pipelined, unordered, WAL-only), the rotation and stall machinery, and
//! the ordering guarantees the engine promises: assigned sequence ranges
//! are disjoint and contiguous, published never runs ahead of allocated,
//! and a batch write is equivalent to applying its records one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use emberdb_storage::{
    log_file_path, read_log_records, BackgroundErrorReason, BatchOp, CfOptions,
    ConcurrentTaskLimiter, Db, DbOptions, EmberError, EventListener, FlushReason, MemtableInfo,
    MergeOperator, WriteBatch, WriteCallback, WriteOptions, DEFAULT_COLUMN_FAMILY_ID,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::Rng;
use tempfile::tempdir;

const CF: u32 = DEFAULT_COLUMN_FAMILY_ID;

fn open_default(dir: &tempfile::TempDir) -> Db {
    Db::open(dir.path(), DbOptions::default()).unwrap()
}

/// Decode every batch frame of a WAL file into (cf, key, value) puts.
fn wal_puts(db: &Db, wal_number: u64) -> Vec<(u32, Vec<u8>, Vec<u8>)> {
    let records = read_log_records(&log_file_path(db.path(), wal_number)).unwrap();
    let mut puts = Vec::new();
    for frame in records {
        let batch = WriteBatch::from_data(&frame).unwrap();
        for record in batch.iter() {
            let record = record.unwrap();
            if let BatchOp::Put { key, value } = record.op {
                puts.push((record.cf_id, key.to_vec(), value.to_vec()));
            }
        }
    }
    puts
}

// =============================================================================
// Spec scenarios
// =============================================================================

#[test]
fn test_single_solo_writer() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let seq = db.put(&WriteOptions::default(), CF, b"k", b"v").unwrap();
    assert_eq!(seq, 1);
    assert_eq!(db.last_sequence(), 1);

    let puts = wal_puts(&db, db.current_wal_number());
    assert_eq!(puts, vec![(CF, b"k".to_vec(), b"v".to_vec())]);
    assert_eq!(db.get(CF, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_two_concurrent_writers_grouped() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_default(&dir));

    let t1 = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.put(&WriteOptions::default(), CF, b"a", b"1").unwrap())
    };
    let t2 = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.put(&WriteOptions::default(), CF, b"b", b"2").unwrap())
    };
    let mut seqs = vec![t1.join().unwrap(), t2.join().unwrap()];
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(db.last_sequence(), 2);

    let mut keys: Vec<Vec<u8>> = wal_puts(&db, db.current_wal_number())
        .into_iter()
        .map(|(_, k, _)| k)
        .collect();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(db.get(CF, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(CF, b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_no_slowdown_under_stall() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    let stop = db.write_controller().stop_write_token();

    let options = WriteOptions::default().with_no_slowdown(true);
    let err = db.put(&options, CF, b"k", b"v").unwrap_err();
    assert!(matches!(err, EmberError::Incomplete(ref m) if m == "Write stall"));
    assert_eq!(db.last_sequence(), 0);
    assert_eq!(db.current_wal_size(), 0);

    drop(stop);
    assert_eq!(db.put(&WriteOptions::default(), CF, b"k", b"v").unwrap(), 1);
}

struct AppendOperator;

impl MergeOperator for AppendOperator {
    fn name(&self) -> &str {
        "append"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> Option<Vec<u8>> {
        let mut out = existing.map(|e| e.to_vec()).unwrap_or_default();
        for operand in operands {
            out.extend_from_slice(operand);
        }
        Some(out)
    }
}

#[test]
fn test_merge_without_operator() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let err = db
        .merge(&WriteOptions::default(), CF, b"k", b"delta")
        .unwrap_err();
    assert!(matches!(err, EmberError::NotSupported(_)));
    assert_eq!(db.last_sequence(), 0);

    // A family opened with an operator accepts merges and folds them.
    let counters = db
        .create_column_family(
            "counters",
            CfOptions::default().with_merge_operator(Arc::new(AppendOperator)),
        )
        .unwrap();
    db.put(&WriteOptions::default(), counters, b"k", b"a").unwrap();
    db.merge(&WriteOptions::default(), counters, b"k", b"b").unwrap();
    db.merge(&WriteOptions::default(), counters, b"k", b"c").unwrap();
    assert_eq!(db.get(counters, b"k").unwrap(), Some(b"abc".to_vec()));
}

#[test]
fn test_disable_wal() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let options = WriteOptions::default().with_disable_wal(true);
    let seq = db.put(&options, CF, b"k", b"v").unwrap();
    assert_eq!(seq, 1);
    assert_eq!(db.get(CF, b"k").unwrap(), Some(b"v".to_vec()));
    assert!(db.has_unpersisted_data());

    // The log saw nothing; a recovery pass would not find the record.
    assert_eq!(db.current_wal_size(), 0);
    assert!(wal_puts(&db, db.current_wal_number()).is_empty());
}

#[test]
fn test_memtable_switch_under_wal_pressure() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default().with_max_total_wal_size(1),
    )
    .unwrap();

    let first_wal = db.current_wal_number();
    db.put(&WriteOptions::default(), CF, b"k1", b"v1").unwrap();
    // Crossing the threshold is noticed by the next leader.
    db.put(&WriteOptions::default(), CF, b"k2", b"v2").unwrap();

    let second_wal = db.current_wal_number();
    assert_ne!(first_wal, second_wal);

    let cf = db.column_family(CF).unwrap();
    {
        let imm = cf.imm();
        assert_eq!(imm.num_not_flushed(), 1);
        assert!(imm.flush_requested());
        // The sealed memtable knows which log writes moved on to.
        assert_eq!(imm.memtables()[0].next_log_number(), second_wal);
        // The new active memtable starts at or above everything sealed.
        assert!(cf.mem().creation_seq() >= imm.newest_sequence());
    }

    let request = db.take_flush_request().expect("a flush must be scheduled");
    assert_eq!(request.reason, FlushReason::WalFull);
    assert_eq!(request.families.len(), 1);

    // Records split across the logs exactly at the switch point.
    let old_keys: Vec<_> = wal_puts(&db, first_wal).into_iter().map(|(_, k, _)| k).collect();
    let new_keys: Vec<_> = wal_puts(&db, second_wal).into_iter().map(|(_, k, _)| k).collect();
    assert_eq!(old_keys, vec![b"k1".to_vec()]);
    assert_eq!(new_keys, vec![b"k2".to_vec()]);
}

// =============================================================================
// Ordering laws
// =============================================================================

#[test]
fn test_concurrent_writers_get_disjoint_contiguous_ranges() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_default(&dir));
    const THREADS: usize = 8;
    const WRITES: usize = 50;
    const RECORDS: u64 = 3;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut ranges = Vec::new();
            for i in 0..WRITES {
                let mut batch = WriteBatch::new();
                for r in 0..RECORDS {
                    let value = vec![b'x'; rng.gen_range(1..64)];
                    batch.put(CF, format!("t{t}-w{i}-r{r}").as_bytes(), &value);
                }
                let base = db.write(&WriteOptions::default(), batch).unwrap();
                ranges.push((base, base + RECORDS - 1));
            }
            ranges
        }));
    }
    let mut ranges: Vec<(u64, u64)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ranges.sort_unstable();

    // Disjoint and contiguous from 1, no sequence reused or skipped.
    let mut expected_start = 1;
    for (start, end) in ranges {
        assert_eq!(start, expected_start);
        assert_eq!(end, start + RECORDS - 1);
        expected_start = end + 1;
    }
    let total = (THREADS * WRITES) as u64 * RECORDS;
    assert_eq!(db.last_sequence(), total);
    assert_eq!(db.stats().keys_written, total);
}

#[test]
fn test_published_never_exceeds_allocated() {
    let dir = tempdir().unwrap();
    let db = Arc::new(
        Db::open(dir.path(), DbOptions::default().with_two_write_queues(true)).unwrap(),
    );
    let running = Arc::new(AtomicBool::new(true));

    let sampler = {
        let db = Arc::clone(&db);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let published = db.last_sequence();
                let allocated = db.last_allocated_sequence();
                assert!(
                    published <= allocated,
                    "published {published} ran ahead of allocated {allocated}"
                );
            }
        })
    };

    let mut writers = Vec::new();
    for t in 0..4 {
        let db = Arc::clone(&db);
        writers.push(thread::spawn(move || {
            for i in 0..200 {
                db.put(
                    &WriteOptions::default(),
                    CF,
                    format!("t{t}-{i}").as_bytes(),
                    b"v",
                )
                .unwrap();
            }
        }));
    }
    for w in writers {
        w.join().unwrap();
    }
    running.store(false, Ordering::Relaxed);
    sampler.join().unwrap();
    assert_eq!(db.last_sequence(), 4 * 200);
}

// =============================================================================
// Modes
// =============================================================================

#[test]
fn test_pipelined_mode_concurrent_writers() {
    let dir = tempdir().unwrap();
    let db = Arc::new(
        Db::open(
            dir.path(),
            DbOptions::default().with_pipelined_write(true),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for t in 0..6 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let mut seqs = Vec::new();
            for i in 0..100 {
                let key = format!("t{t}-{i}");
                seqs.push(
                    db.put(&WriteOptions::default(), CF, key.as_bytes(), key.as_bytes())
                        .unwrap(),
                );
            }
            seqs
        }));
    }
    let mut seqs: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 600);
    assert_eq!(db.last_sequence(), 600);
    assert_eq!(
        db.get(CF, b"t0-99").unwrap(),
        Some(b"t0-99".to_vec())
    );
}

#[test]
fn test_unordered_mode_writes_are_visible_after_return() {
    let dir = tempdir().unwrap();
    let db = Arc::new(
        Db::open(
            dir.path(),
            DbOptions::default().with_unordered_write(true),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for t in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..100 {
                let key = format!("t{t}-{i}");
                db.put(&WriteOptions::default(), CF, key.as_bytes(), b"v")
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(db.last_sequence(), 400);
    for t in 0..4 {
        assert_eq!(
            db.get(CF, format!("t{t}-99").as_bytes()).unwrap(),
            Some(b"v".to_vec())
        );
    }
}

#[test]
fn test_wal_only_queue_bypasses_memtables() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default().with_two_write_queues(true),
    )
    .unwrap();

    let mut prepare = WriteBatch::new();
    prepare.begin_prepare();
    prepare.put(CF, b"staged", b"v");
    db.write_wal_only(&WriteOptions::default(), prepare, 0).unwrap();

    // Logged, but invisible: no memtable apply, no sequence consumed.
    assert_eq!(db.get(CF, b"staged").unwrap(), None);
    assert_eq!(db.last_sequence(), 0);
    assert_eq!(db.last_allocated_sequence(), 0);
    let puts = wal_puts(&db, db.current_wal_number());
    assert_eq!(puts.len(), 1);

    // Normal traffic continues on the main queue.
    let seq = db.put(&WriteOptions::default(), CF, b"live", b"v").unwrap();
    assert_eq!(seq, 1);
    assert_eq!(wal_puts(&db, db.current_wal_number()).len(), 2);
}

#[test]
fn test_mode_incompatibilities_are_rejected() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default()
            .with_pipelined_write(true)
            .with_two_write_queues(true),
    )
    .unwrap();
    let err = db
        .put(&WriteOptions::default(), CF, b"k", b"v")
        .unwrap_err();
    assert!(matches!(err, EmberError::NotSupported(_)));

    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default()
            .with_pipelined_write(true)
            .with_unordered_write(true),
    )
    .unwrap();
    let err = db
        .put(&WriteOptions::default(), CF, b"k", b"v")
        .unwrap_err();
    assert!(matches!(err, EmberError::NotSupported(_)));

    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    let options = WriteOptions::default()
        .with_sync(true)
        .with_disable_wal(true);
    let err = db.put(&options, CF, b"k", b"v").unwrap_err();
    assert!(matches!(err, EmberError::InvalidArgument(_)));
}

// =============================================================================
// Callbacks
// =============================================================================

struct DecidingCallback {
    allow: bool,
}

impl WriteCallback for DecidingCallback {
    fn callback(&self, _db: &Db) -> emberdb_storage::Result<()> {
        if self.allow {
            Ok(())
        } else {
            Err(EmberError::Busy("conflict detected".into()))
        }
    }
}

#[test]
fn test_write_with_callback_gates_commit() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let mut batch = WriteBatch::new();
    batch.put(CF, b"k", b"rejected");
    let err = db
        .write_with_callback(
            &WriteOptions::default(),
            batch,
            Box::new(DecidingCallback { allow: false }),
        )
        .unwrap_err();
    assert!(matches!(err, EmberError::Busy(_)));
    // The failed callback consumed no sequence and left no trace in memory.
    assert_eq!(db.last_sequence(), 0);
    assert_eq!(db.get(CF, b"k").unwrap(), None);
    assert!(db.background_error().is_none());

    let mut batch = WriteBatch::new();
    batch.put(CF, b"k", b"accepted");
    let seq = db
        .write_with_callback(
            &WriteOptions::default(),
            batch,
            Box::new(DecidingCallback { allow: true }),
        )
        .unwrap();
    assert_eq!(seq, 1);
    assert_eq!(db.get(CF, b"k").unwrap(), Some(b"accepted".to_vec()));
}

// =============================================================================
// Durability and stalls
// =============================================================================

#[test]
fn test_sync_write_runs_durability_cycle() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let options = WriteOptions::default().with_sync(true);
    db.put(&options, CF, b"k", b"v").unwrap();
    assert!(db.stats().wal_files_synced >= 1);
    assert_eq!(wal_puts(&db, db.current_wal_number()).len(), 1);
}

#[test]
fn test_manual_wal_flush_buffers_appends() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::default();
    options.manual_wal_flush = true;
    let db = Db::open(dir.path(), options).unwrap();

    db.put(&WriteOptions::default(), CF, b"k", b"v").unwrap();
    assert!(wal_puts(&db, db.current_wal_number()).is_empty());

    db.flush_wal(false).unwrap();
    assert_eq!(wal_puts(&db, db.current_wal_number()).len(), 1);
}

#[test]
fn test_delay_token_slows_but_does_not_fail_writes() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    // A crawling rate makes even a small group's delay observable.
    db.write_controller().set_delayed_write_rate(1024);
    let delay = db.write_controller().delay_write_token();

    // The first write prices the delay off the previous group size (zero);
    // the second one actually sleeps.
    db.put(&WriteOptions::default(), CF, b"a", b"1").unwrap();
    db.put(&WriteOptions::default(), CF, b"b", b"2").unwrap();
    drop(delay);

    assert_eq!(db.last_sequence(), 2);
    assert!(db.stats().write_stall_micros > 0);
}

#[test]
fn test_stalled_writer_resumes_when_stop_clears() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_default(&dir));
    let stop = db.write_controller().stop_write_token();

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.put(&WriteOptions::default(), CF, b"k", b"v"))
    };
    // The writer must be parked, not failed.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(db.last_sequence(), 0);

    drop(stop);
    assert_eq!(writer.join().unwrap().unwrap(), 1);
    assert_eq!(db.get(CF, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_shutdown_rejects_subsequent_writes() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    db.put(&WriteOptions::default(), CF, b"k", b"v").unwrap();

    db.shutdown();
    let err = db.put(&WriteOptions::default(), CF, b"k2", b"v").unwrap_err();
    assert!(matches!(err, EmberError::ShutdownInProgress));
    assert!(matches!(
        db.background_error(),
        Some(EmberError::ShutdownInProgress)
    ));
    assert_eq!(
        db.background_error_reason(),
        Some(BackgroundErrorReason::Shutdown)
    );
    // The rejected write consumed no sequence and left the log untouched.
    assert_eq!(db.last_sequence(), 1);
    assert_eq!(wal_puts(&db, db.current_wal_number()).len(), 1);

    // Shutdown is an operator decision, not a fenced device: resumable.
    db.resume().unwrap();
    assert_eq!(db.put(&WriteOptions::default(), CF, b"k2", b"v").unwrap(), 2);
}

#[test]
fn test_stalled_writer_surfaces_background_error() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_default(&dir));
    // Keep the stop token held for the whole test: the background error is
    // recorded while the controller still reports stopped.
    let _stop = db.write_controller().stop_write_token();

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.put(&WriteOptions::default(), CF, b"k", b"v"))
    };
    thread::sleep(Duration::from_millis(50));

    // The parked writer must come back with the recorded kind, not a
    // generic stall status.
    db.shutdown();
    let err = writer.join().unwrap().unwrap_err();
    assert!(matches!(err, EmberError::ShutdownInProgress));
    assert_eq!(db.last_sequence(), 0);
}

#[test]
fn test_reported_flush_error_fails_writes_with_its_kind() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    db.report_background_error(
        BackgroundErrorReason::Flush,
        EmberError::Io("flush device gone".into()),
    );
    let err = db.put(&WriteOptions::default(), CF, b"k", b"v").unwrap_err();
    assert!(matches!(err, EmberError::Io(_)));
    assert_eq!(
        db.background_error_reason(),
        Some(BackgroundErrorReason::Flush)
    );
}

#[test]
fn test_low_pri_writes_respect_pressure() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    let pressure = db.write_controller().compaction_pressure_token();

    let options = WriteOptions::default()
        .with_low_pri(true)
        .with_no_slowdown(true);
    let err = db.put(&options, CF, b"k", b"v").unwrap_err();
    assert!(matches!(err, EmberError::Incomplete(ref m) if m.contains("Low priority")));

    // Without no_slowdown the write is paced, not rejected.
    let options = WriteOptions::default().with_low_pri(true);
    assert_eq!(db.put(&options, CF, b"k", b"v").unwrap(), 1);
    drop(pressure);
}

#[test]
fn test_missing_column_family_handling() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);

    let mut batch = WriteBatch::new();
    batch.put(99, b"k", b"v");
    let err = db.write(&WriteOptions::default(), batch).unwrap_err();
    assert!(matches!(err, EmberError::InvalidArgument(_)));
    // WAL and memory diverged, so the failure is sticky until resumed.
    assert!(db.background_error().is_some());
    db.resume().unwrap();

    let mut batch = WriteBatch::new();
    batch.put(99, b"k", b"v");
    batch.put(CF, b"kept", b"v");
    let options = WriteOptions {
        ignore_missing_column_families: true,
        ..Default::default()
    };
    db.write(&options, batch).unwrap();
    assert_eq!(db.get(CF, b"kept").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Rotation, flush scheduling, recycling
// =============================================================================

#[test]
fn test_memtable_budget_schedules_flush() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default().with_column_family(
            "default",
            CfOptions::default().with_write_buffer_size(256),
        ),
    )
    .unwrap();

    // Overflow the 256-byte budget, then let the next leader notice.
    db.put(&WriteOptions::default(), CF, b"big", &[b'x'; 512]).unwrap();
    db.put(&WriteOptions::default(), CF, b"next", b"v").unwrap();

    let cf = db.column_family(CF).unwrap();
    assert_eq!(cf.imm().num_not_flushed(), 1);
    let request = db.take_flush_request().expect("flush must be scheduled");
    assert_eq!(request.reason, FlushReason::WriteBufferFull);
    // Both records remain visible across the switch.
    assert_eq!(db.get(CF, b"big").unwrap(), Some(vec![b'x'; 512]));
    assert_eq!(db.get(CF, b"next").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_write_buffer_manager_picks_oldest_family() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::default();
    options.db_write_buffer_size = 256;
    let db = Db::open(dir.path(), options).unwrap();

    db.put(&WriteOptions::default(), CF, b"big", &[b'y'; 512]).unwrap();
    db.put(&WriteOptions::default(), CF, b"next", b"v").unwrap();

    let cf = db.column_family(CF).unwrap();
    assert!(cf.imm().num_not_flushed() >= 1);
    let request = db.take_flush_request().expect("flush must be scheduled");
    assert_eq!(request.reason, FlushReason::WriteBufferManager);
}

#[test]
fn test_atomic_flush_switches_every_nonempty_family() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::default();
    options.atomic_flush = true;
    options.column_families = vec![(
        "events".to_string(),
        CfOptions::default().with_write_buffer_size(128),
    )];
    let db = Db::open(dir.path(), options).unwrap();
    let events = db.cf_handle("events").unwrap();

    db.put(&WriteOptions::default(), CF, b"d", b"1").unwrap();
    db.put(&WriteOptions::default(), events, b"e", &[b'z'; 256]).unwrap();
    // The overflow was noticed during the previous apply; this leader
    // drains the flush scheduler and, under atomic flush, seals everyone.
    db.put(&WriteOptions::default(), CF, b"d2", b"2").unwrap();

    let default_cf = db.column_family(CF).unwrap();
    let events_cf = db.column_family(events).unwrap();
    assert_eq!(default_cf.imm().num_not_flushed(), 1);
    assert_eq!(events_cf.imm().num_not_flushed(), 1);
    // Sealed together: both lists share the atomic flush sequence.
    let d_seq = default_cf.imm().memtables()[0].atomic_flush_seq();
    let e_seq = events_cf.imm().memtables()[0].atomic_flush_seq();
    assert_eq!(d_seq, e_seq);
    assert!(d_seq > 0);
}

struct SealObserver {
    seen: Mutex<Vec<MemtableInfo>>,
}

impl EventListener for SealObserver {
    fn on_memtable_sealed(&self, info: &MemtableInfo) {
        self.seen.lock().push(info.clone());
    }
}

#[test]
fn test_listener_observes_sealed_memtable() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default().with_max_total_wal_size(1),
    )
    .unwrap();
    let observer = Arc::new(SealObserver {
        seen: Mutex::new(Vec::new()),
    });
    db.register_listener(observer.clone());

    db.put(&WriteOptions::default(), CF, b"k1", b"v1").unwrap();
    db.put(&WriteOptions::default(), CF, b"k2", b"v2").unwrap();

    let seen = observer.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].cf_name, "default");
    assert_eq!(seen[0].num_entries, 1);
    assert_eq!(seen[0].first_seqno, 1);
}

#[test]
fn test_flush_completion_retires_and_recycles_wals() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::default().with_max_total_wal_size(1);
    options.recycle_log_file_num = 1;
    let db = Db::open(dir.path(), options).unwrap();

    db.put(&WriteOptions::default(), CF, b"k1", b"v1").unwrap();
    db.put(&WriteOptions::default(), CF, b"k2", b"v2").unwrap();
    let request = db.take_flush_request().unwrap();
    let (cf_id, memtable_id) = request.families[0];

    assert_eq!(db.recycled_wal_count(), 0);
    db.mark_memtable_flushed(cf_id, memtable_id).unwrap();
    // The first log covered only the flushed memtable; it is recyclable.
    assert_eq!(db.recycled_wal_count(), 1);

    // The next rotation reuses the retired number instead of a fresh file.
    db.put(&WriteOptions::default(), CF, b"k3", b"v3").unwrap();
    assert_eq!(db.recycled_wal_count(), 0);
    assert_eq!(db.get(CF, b"k3").unwrap(), Some(b"v3".to_vec()));
}

#[test]
fn test_flush_task_limiter_gates_requests() {
    let dir = tempdir().unwrap();
    let limiter = ConcurrentTaskLimiter::new("flush", 1);
    let mut options = DbOptions::default().with_column_family(
        "default",
        CfOptions::default().with_write_buffer_size(256),
    );
    options.flush_task_limiter = Some(Arc::clone(&limiter));
    let db = Db::open(dir.path(), options).unwrap();

    // Two memtable overflows, two flush requests.
    db.put(&WriteOptions::default(), CF, b"big1", &[b'x'; 512]).unwrap();
    db.put(&WriteOptions::default(), CF, b"a", b"v").unwrap();
    db.put(&WriteOptions::default(), CF, b"big2", &[b'x'; 512]).unwrap();
    db.put(&WriteOptions::default(), CF, b"b", b"v").unwrap();
    assert!(db.pending_flush_request_count() >= 2);

    let first = db.take_flush_request().expect("first slot available");
    assert!(first.token.is_some());
    assert_eq!(limiter.outstanding_tasks(), 1);
    // The cap is one: the second request stays queued.
    assert!(db.take_flush_request().is_none());

    drop(first);
    assert_eq!(limiter.outstanding_tasks(), 0);
    let second = db.take_flush_request().expect("slot freed");
    assert!(second.token.is_some());
}

// =============================================================================
// Recoverable state and timestamps
// =============================================================================

#[test]
fn test_recoverable_state_survives_memtable_switch() {
    let dir = tempdir().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions::default()
            .with_two_write_queues(true)
            .with_max_total_wal_size(1),
    )
    .unwrap();

    let mut state = WriteBatch::new();
    state.put(CF, b"engine-state", b"epoch-7");
    state.set_latest_persistent_state(true);
    db.write_wal_only(&WriteOptions::default(), state, 0).unwrap();
    // WAL-only: not yet readable.
    assert_eq!(db.get(CF, b"engine-state").unwrap(), None);

    // Force a switch; the cached state is re-persisted into the memtable
    // before the old log can retire.
    db.put(&WriteOptions::default(), CF, b"trigger", b"v").unwrap();
    db.put(&WriteOptions::default(), CF, b"trigger2", b"v").unwrap();
    assert_eq!(
        db.get(CF, b"engine-state").unwrap(),
        Some(b"epoch-7".to_vec())
    );
}

#[test]
fn test_timestamp_stamping() {
    let dir = tempdir().unwrap();
    let db = open_default(&dir);
    let stamped = db
        .create_column_family("stamped", CfOptions::default().with_timestamp_size(8))
        .unwrap();

    let options = WriteOptions {
        timestamp: Some(42u64.to_be_bytes().to_vec()),
        ..Default::default()
    };
    db.put(&options, stamped, b"k", b"v").unwrap();

    // Keys carry the timestamp suffix in storage.
    let mut suffixed = b"k".to_vec();
    suffixed.extend_from_slice(&42u64.to_be_bytes());
    assert_eq!(db.get(stamped, &suffixed).unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(stamped, b"k").unwrap(), None);

    // A mismatched timestamp size is rejected before queueing.
    let options = WriteOptions {
        timestamp: Some(vec![1, 2, 3]),
        ..Default::default()
    };
    let err = db.put(&options, stamped, b"k", b"v").unwrap_err();
    assert!(matches!(err, EmberError::InvalidArgument(_)));
    assert_eq!(db.last_sequence(), 1);
}

// =============================================================================
// Batch-vs-serial equivalence
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(u8, Vec<u8>),
    Delete(u8),
    SingleDelete(u8),
    DeleteRange(u8, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, proptest::collection::vec(any::<u8>(), 0..16)).prop_map(|(k, v)| Op::Put(k, v)),
        (0u8..8).prop_map(Op::Delete),
        (0u8..8).prop_map(Op::SingleDelete),
        (0u8..8, 0u8..8).prop_map(|(a, b)| Op::DeleteRange(a.min(b), a.max(b).saturating_add(1))),
    ]
}

fn key_for(k: u8) -> Vec<u8> {
    vec![b'k', k]
}

fn apply_op(batch: &mut WriteBatch, op: &Op) {
    match op {
        Op::Put(k, v) => batch.put(CF, &key_for(*k), v),
        Op::Delete(k) => batch.delete(CF, &key_for(*k)),
        Op::SingleDelete(k) => batch.single_delete(CF, &key_for(*k)),
        Op::DeleteRange(a, b) => batch.delete_range(CF, &key_for(*a), &key_for(*b)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// One batch of N records leaves the store in exactly the state of N
    /// single-record writes applied in order.
    #[test]
    fn prop_batch_write_equals_serial_application(ops in proptest::collection::vec(op_strategy(), 1..12)) {
        let batched_dir = tempdir().unwrap();
        let serial_dir = tempdir().unwrap();
        let batched = open_default(&batched_dir);
        let serial = open_default(&serial_dir);

        let mut batch = WriteBatch::new();
        for op in &ops {
            apply_op(&mut batch, op);
        }
        batched.write(&WriteOptions::default(), batch).unwrap();

        for op in &ops {
            let mut single = WriteBatch::new();
            apply_op(&mut single, op);
            serial.write(&WriteOptions::default(), single).unwrap();
        }

        prop_assert_eq!(batched.last_sequence(), serial.last_sequence());
        for k in 0u8..8 {
            let key = key_for(k);
            prop_assert_eq!(
                batched.get(CF, &key).unwrap(),
                serial.get(CF, &key).unwrap(),
                "divergence at key {:?}", key
            );
        }
    }
}
