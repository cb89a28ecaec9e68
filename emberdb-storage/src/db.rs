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

//! Write coordinator
//!
//! Orchestrates one end-to-end write: preprocess under the global mutex,
//! append to the WAL, apply to memtables, publish the last sequence. Four
//! paths share the writer queue:
//!
//! - **default**: one leader does WAL and memtable work for its group,
//!   optionally fanning the memtable phase out to the followers;
//! - **pipelined**: WAL leadership and memtable leadership are separate, so
//!   a new group can start logging while the previous one is still applying;
//! - **unordered**: sequences are published right after the WAL write and
//!   memtables are applied asynchronously, traded against read ordering;
//! - **WAL-only**: a second queue for batches that bypass memtables (e.g.
//!   two-phase-commit prepares), allocating sequences under the WAL-write
//!   mutex.
//!
//! ## Lock order
//!
//! Global mutex → WAL-write mutex. The WAL-write mutex is taken on its own
//! by appenders; the global mutex is never acquired while holding it.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use emberdb_core::{EmberError, Result, SequenceNumber, MAX_SEQUENCE_NUMBER};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::column_family::{
    ColumnFamily, ColumnFamilySet, PERSISTENT_STATS_COLUMN_FAMILY_NAME,
};
use crate::flush_scheduler::{FlushScheduler, TrimHistoryScheduler};
use crate::options::{CfOptions, DbOptions, WriteOptions};
use crate::sequence::SequenceAllocator;
use crate::stats::{WriteStats, WriteStatsSnapshot};
use crate::task_limiter::TaskLimiterToken;
use crate::wal::{self, LogWriter, WalSet};
use crate::write_batch::{BatchOp, WriteBatch};
use crate::write_buffer_manager::WriteBufferManager;
use crate::write_controller::WriteController;
use crate::write_queue::{
    WriteGroup, WriteQueue, Writer, STATE_COMPLETED, STATE_GROUP_LEADER,
    STATE_MEMTABLE_WRITER_LEADER, STATE_PARALLEL_MEMTABLE_WRITER,
};

/// Pre-commit hook: invoked once the writer is inside the queue, before any
/// of its records commit. A non-OK result voids this writer without
/// aborting its group.
pub trait WriteCallback: Send + Sync {
    fn callback(&self, db: &Db) -> Result<()>;

    /// Whether the owning writer may share a batch group with others.
    fn allow_write_batching(&self) -> bool {
        false
    }
}

/// Hook invoked after WAL durability and strictly before any memtable
/// apply, once per writer in group order, carrying the assigned sequence.
pub trait PreReleaseCallback: Send + Sync {
    fn callback(
        &self,
        sequence: SequenceNumber,
        disable_memtable: bool,
        log_used: u64,
        index: usize,
        total: usize,
    ) -> Result<()>;
}

/// Observer notified (outside any lock) when a memtable is sealed.
pub trait EventListener: Send + Sync {
    fn on_memtable_sealed(&self, _info: &MemtableInfo) {}
}

/// Optional write tracer, guarded by its own mutex so tracing never
/// contends with write-path locks.
pub trait WriteTracer: Send + Sync {
    fn trace_write(&mut self, batch: &WriteBatch);
}

/// Snapshot of a memtable handed to sealed-memtable listeners.
#[derive(Debug, Clone)]
pub struct MemtableInfo {
    pub cf_name: String,
    pub first_seqno: SequenceNumber,
    pub earliest_seqno: SequenceNumber,
    pub num_entries: u64,
    pub num_deletes: u64,
}

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Total WAL size crossed its threshold.
    WalFull,
    /// The shared write buffer manager demanded memory back.
    WriteBufferManager,
    /// A single memtable outgrew its own budget.
    WriteBufferFull,
}

/// A request for the external flush driver: seal work is done, these
/// families have immutable memtables to persist.
#[derive(Debug)]
pub struct FlushRequest {
    pub reason: FlushReason,
    /// `(column family id, newest immutable memtable id)` pairs.
    pub families: Vec<(u32, u64)>,
    /// Slot claimed from the background task limiter, released on drop.
    pub token: Option<TaskLimiterToken>,
}

/// Where a background error was first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundErrorReason {
    WriteCallback,
    MemTable,
    Flush,
    Shutdown,
}

/// How the coordinator sequences WAL and memtable phases. Resolved once at
/// open; the per-write hot path branches on a plain enum, never through
/// dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One leader runs the whole pipeline for its group.
    Default,
    /// WAL leadership and memtable leadership are decoupled.
    Pipelined,
    /// Publish after the WAL write, apply to memtables asynchronously.
    Unordered,
}

impl WriteMode {
    fn from_options(options: &DbOptions) -> Self {
        if options.enable_pipelined_write {
            WriteMode::Pipelined
        } else if options.unordered_write {
            WriteMode::Unordered
        } else {
            WriteMode::Default
        }
    }
}

/// State under the global mutex.
struct DbState {
    bg_error: Option<EmberError>,
    bg_error_reason: Option<BackgroundErrorReason>,
}

pub(crate) struct WriteExtras {
    pub disable_memtable: bool,
    pub batch_cnt: usize,
    pub pre_release_callback: Option<Box<dyn PreReleaseCallback>>,
}

impl Default for WriteExtras {
    fn default() -> Self {
        Self {
            disable_memtable: false,
            batch_cnt: 0,
            pre_release_callback: None,
        }
    }
}

pub struct Db {
    options: DbOptions,
    mode: WriteMode,
    path: PathBuf,

    /// The global DB mutex: preprocess decisions, background errors,
    /// version installs.
    state: Mutex<DbState>,
    /// Signalled when background conditions may have cleared.
    bg_cv: Condvar,
    /// Signalled when a log sync cycle completes.
    log_sync_cv: Condvar,

    /// The WAL-write mutex and everything it protects.
    wal: Mutex<WalSet>,
    total_log_size: AtomicU64,
    has_unpersisted_data: AtomicBool,
    next_file_number: AtomicU64,

    cfs: ColumnFamilySet,
    seq: SequenceAllocator,
    write_queue: WriteQueue,
    /// Second queue for WAL-only traffic under two-queue mode.
    nonmem_write_queue: WriteQueue,

    write_controller: Arc<WriteController>,
    flush_scheduler: FlushScheduler,
    trim_history_scheduler: TrimHistoryScheduler,
    write_buffer_manager: Arc<WriteBufferManager>,
    stats: WriteStats,

    flush_requests: Mutex<VecDeque<FlushRequest>>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    tracer: Mutex<Option<Box<dyn WriteTracer>>>,
    recoverable_state_pre_release_callback: Mutex<Option<Box<dyn PreReleaseCallback>>>,

    /// Unordered-mode writers that have logged but not yet applied.
    pending_memtable_writes: AtomicUsize,
    switch_mu: Mutex<()>,
    switch_cv: Condvar,

    /// Sum of per-family write buffer budgets; the WAL threshold defaults
    /// to four times this.
    max_total_in_memory_state: AtomicU64,
    last_batch_group_size: AtomicU64,
}

impl Db {
    // =========================================================================
    // Open / setup
    // =========================================================================

    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cfs = ColumnFamilySet::new(
            options
                .column_families
                .iter()
                .find(|(name, _)| name == crate::column_family::DEFAULT_COLUMN_FAMILY_NAME)
                .map(|(_, o)| o.clone())
                .unwrap_or_default(),
        );
        let mut in_memory_state = cfs.default_cf().options().write_buffer_size as u64;
        for (name, cf_options) in &options.column_families {
            if name == crate::column_family::DEFAULT_COLUMN_FAMILY_NAME {
                continue;
            }
            in_memory_state += cf_options.write_buffer_size as u64;
            cfs.create(name, cf_options.clone(), 0, 1);
        }

        let mut wal_set = WalSet::new(path.clone());
        let writer = LogWriter::create(&path, 1, None, 0, options.manual_wal_flush)?;
        wal_set.install_log(writer);

        let db = Db {
            state: Mutex::new(DbState {
                bg_error: None,
                bg_error_reason: None,
            }),
            bg_cv: Condvar::new(),
            log_sync_cv: Condvar::new(),
            wal: Mutex::new(wal_set),
            total_log_size: AtomicU64::new(0),
            has_unpersisted_data: AtomicBool::new(false),
            next_file_number: AtomicU64::new(2),
            cfs,
            seq: SequenceAllocator::new(0),
            write_queue: WriteQueue::new(
                options.enable_pipelined_write,
                options.allow_concurrent_memtable_write,
                options.max_write_batch_group_size_bytes,
            ),
            nonmem_write_queue: WriteQueue::new(
                false,
                options.allow_concurrent_memtable_write,
                options.max_write_batch_group_size_bytes,
            ),
            write_controller: Arc::new(WriteController::default()),
            flush_scheduler: FlushScheduler::new(),
            trim_history_scheduler: TrimHistoryScheduler::new(),
            write_buffer_manager: options
                .write_buffer_manager
                .clone()
                .unwrap_or_else(|| Arc::new(WriteBufferManager::new(options.db_write_buffer_size))),
            stats: WriteStats::default(),
            flush_requests: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            tracer: Mutex::new(None),
            recoverable_state_pre_release_callback: Mutex::new(None),
            pending_memtable_writes: AtomicUsize::new(0),
            switch_mu: Mutex::new(()),
            switch_cv: Condvar::new(),
            max_total_in_memory_state: AtomicU64::new(in_memory_state),
            last_batch_group_size: AtomicU64::new(0),
            mode: WriteMode::from_options(&options),
            options,
            path,
        };
        Ok(db)
    }

    pub fn create_column_family(&self, name: &str, cf_options: CfOptions) -> Result<u32> {
        if self.cfs.get_by_name(name).is_some() {
            return Err(EmberError::InvalidArgument(format!(
                "column family {name} already exists"
            )));
        }
        self.max_total_in_memory_state
            .fetch_add(cf_options.write_buffer_size as u64, Ordering::Relaxed);
        let log_number = self.wal.lock().logfile_number;
        let cf = self
            .cfs
            .create(name, cf_options, self.seq.last_published(), log_number);
        Ok(cf.id())
    }

    pub fn cf_handle(&self, name: &str) -> Option<u32> {
        self.cfs.get_by_name(name).map(|cf| cf.id())
    }

    pub fn column_family(&self, cf_id: u32) -> Option<Arc<ColumnFamily>> {
        self.cfs.get(cf_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.seq.last_published()
    }

    pub fn last_allocated_sequence(&self) -> SequenceNumber {
        self.seq.last_allocated()
    }

    pub fn write_controller(&self) -> &Arc<WriteController> {
        &self.write_controller
    }

    pub fn stats(&self) -> WriteStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn current_wal_number(&self) -> u64 {
        self.wal.lock().logfile_number
    }

    pub fn current_wal_size(&self) -> u64 {
        self.wal.lock().current_log_size()
    }

    pub fn total_wal_size(&self) -> u64 {
        self.total_log_size.load(Ordering::Relaxed)
    }

    pub fn has_unpersisted_data(&self) -> bool {
        self.has_unpersisted_data.load(Ordering::Relaxed)
    }

    /// Retired WAL numbers waiting to be reused; populated only when log
    /// recycling is configured.
    pub fn recycled_wal_count(&self) -> usize {
        self.wal.lock().log_recycle_files.len()
    }

    pub fn background_error(&self) -> Option<EmberError> {
        self.state.lock().bg_error.clone()
    }

    pub fn background_error_reason(&self) -> Option<BackgroundErrorReason> {
        self.state.lock().bg_error_reason
    }

    /// Clear a recoverable background error. Fenced errors are terminal.
    pub fn resume(&self) -> Result<()> {
        let mut guard = self.state.lock();
        match &guard.bg_error {
            Some(err) if err.is_io_fenced() => Err(err.clone()),
            _ => {
                guard.bg_error = None;
                guard.bg_error_reason = None;
                self.bg_cv.notify_all();
                Ok(())
            }
        }
    }

    /// Stop admitting writes: `ShutdownInProgress` becomes the background
    /// state, stalled writers are woken so they observe it, and buffered
    /// WAL frames are pushed down. Every subsequent write fails fast with
    /// the shutdown error until `resume` is called.
    pub fn shutdown(&self) {
        {
            let mut guard = self.state.lock();
            if guard.bg_error.is_none() {
                tracing::info!("shutting down: new writes will be rejected");
                guard.bg_error = Some(EmberError::ShutdownInProgress);
                guard.bg_error_reason = Some(BackgroundErrorReason::Shutdown);
            }
            self.bg_cv.notify_all();
        }
        let mut wal = self.wal.lock();
        if !wal.logs.is_empty() {
            let _ = wal.current_log_mut().writer.flush_buffer();
        }
    }

    /// Contract for background collaborators (e.g. the flush driver):
    /// record a failure so the write path stops accepting traffic and
    /// surfaces the error to callers.
    pub fn report_background_error(&self, reason: BackgroundErrorReason, err: EmberError) {
        let mut guard = self.state.lock();
        self.set_bg_error_locked(&mut guard, err, reason);
    }

    pub fn register_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn set_tracer(&self, tracer: Option<Box<dyn WriteTracer>>) {
        *self.tracer.lock() = tracer;
    }

    pub fn set_recoverable_state_pre_release_callback(
        &self,
        callback: Option<Box<dyn PreReleaseCallback>>,
    ) {
        *self.recoverable_state_pre_release_callback.lock() = callback;
    }

    /// Next flush request for the external flush driver. When a background
    /// task limiter is configured, requests without a claimed slot stay
    /// queued until one frees up.
    pub fn take_flush_request(&self) -> Option<FlushRequest> {
        self.maybe_schedule_flush_or_compaction();
        let mut requests = self.flush_requests.lock();
        if self.options.flush_task_limiter.is_some() {
            if requests.front().is_some_and(|r| r.token.is_none()) {
                return None;
            }
        }
        requests.pop_front()
    }

    pub fn pending_flush_request_count(&self) -> usize {
        self.flush_requests.lock().len()
    }

    /// External flush driver contract: the given immutable memtable is now
    /// durable on disk. Frees its memory accounting, advances the family's
    /// tracked log once nothing unflushed remains, and lets obsolete WAL
    /// files retire.
    pub fn mark_memtable_flushed(&self, cf_id: u32, memtable_id: u64) -> Result<()> {
        let cf = self.lookup_cf(cf_id)?;
        let (flushed, none_left) = {
            let mut imm = cf.imm();
            let flushed = imm.mark_flushed(memtable_id);
            let none_left = imm.num_not_flushed() == 0;
            (flushed, none_left)
        };
        let Some(flushed) = flushed else {
            return Err(EmberError::InvalidArgument(format!(
                "memtable {memtable_id} is not awaiting flush in column family {cf_id}"
            )));
        };
        self.write_buffer_manager
            .free_mem(flushed.approximate_memory_usage());
        if none_left {
            // Everything this family wrote before the seal is on disk; only
            // logs from the seal point on still matter.
            cf.set_log_number(cf.log_number().max(flushed.next_log_number()));
        }
        if cf.options().max_write_buffer_size_to_maintain > 0 {
            self.trim_history_scheduler.schedule_work(cf_id);
        }
        cf.install_super_version();
        self.purge_obsolete_wal_files();
        Ok(())
    }

    /// Point lookup across the family's super-version, for verification and
    /// tooling; the public read surface lives above this crate.
    pub fn get(&self, cf_id: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.lookup_cf(cf_id)?;
        let read_seq = self.seq.last_published();
        let sv = cf.super_version();
        match sv.memtable.get(key, read_seq) {
            crate::memtable::LookupResult::Value(v) => return Ok(Some(v)),
            crate::memtable::LookupResult::Deleted => return Ok(None),
            crate::memtable::LookupResult::NotFound => {}
        }
        for memtable in sv.immutables.iter().rev() {
            match memtable.get(key, read_seq) {
                crate::memtable::LookupResult::Value(v) => return Ok(Some(v)),
                crate::memtable::LookupResult::Deleted => return Ok(None),
                crate::memtable::LookupResult::NotFound => {}
            }
        }
        Ok(None)
    }

    fn lookup_cf(&self, cf_id: u32) -> Result<Arc<ColumnFamily>> {
        self.cfs.get(cf_id).ok_or_else(|| {
            EmberError::InvalidArgument(format!("unknown column family {cf_id}"))
        })
    }

    // =========================================================================
    // Convenience write operations
    // =========================================================================

    pub fn put(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<SequenceNumber> {
        // Header, count, tag, and length prefixes: 24 bytes of overhead.
        let mut batch = WriteBatch::with_capacity(key.len() + value.len() + 24);
        batch.put(cf_id, key, value);
        self.stamp_timestamp(options, cf_id, &mut batch)?;
        self.write(options, batch)
    }

    pub fn delete(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        key: &[u8],
    ) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::with_capacity(key.len() + 24);
        batch.delete(cf_id, key);
        self.stamp_timestamp(options, cf_id, &mut batch)?;
        self.write(options, batch)
    }

    pub fn single_delete(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        key: &[u8],
    ) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::with_capacity(key.len() + 24);
        batch.single_delete(cf_id, key);
        self.write(options, batch)
    }

    pub fn delete_range(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        begin: &[u8],
        end: &[u8],
    ) -> Result<SequenceNumber> {
        let mut batch = WriteBatch::with_capacity(begin.len() + end.len() + 24);
        batch.delete_range(cf_id, begin, end);
        self.write(options, batch)
    }

    pub fn merge(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        key: &[u8],
        operand: &[u8],
    ) -> Result<SequenceNumber> {
        let cf = self.lookup_cf(cf_id)?;
        if cf.merge_operator().is_none() {
            return Err(EmberError::NotSupported(
                "provide a merge operator when opening the column family".into(),
            ));
        }
        let mut batch = WriteBatch::with_capacity(key.len() + operand.len() + 24);
        batch.merge(cf_id, key, operand);
        self.write(options, batch)
    }

    fn stamp_timestamp(
        &self,
        options: &WriteOptions,
        cf_id: u32,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let Some(ts) = &options.timestamp else {
            return Ok(());
        };
        let cf = self.lookup_cf(cf_id)?;
        if ts.len() != cf.timestamp_size() {
            return Err(EmberError::InvalidArgument(format!(
                "timestamp size {} does not match column family timestamp size {}",
                ts.len(),
                cf.timestamp_size()
            )));
        }
        batch.assign_timestamp(ts)
    }

    // =========================================================================
    // Main write entry points
    // =========================================================================

    /// Main entry: commit `batch` under `options`, returning the base
    /// sequence assigned to it.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<SequenceNumber> {
        self.write_impl(options, batch, None, WriteExtras::default())
    }

    /// Like [`write`](Db::write) but `callback` runs inside the queue,
    /// after WAL ordering is fixed, to decide whether this writer commits.
    pub fn write_with_callback(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Box<dyn WriteCallback>,
    ) -> Result<SequenceNumber> {
        self.write_impl(options, batch, Some(callback), WriteExtras::default())
    }

    /// Append to the WAL while bypassing memtables entirely, e.g. prepare
    /// records under a write-committed policy. Requires two-queue mode to
    /// run on the dedicated WAL-only queue.
    pub fn write_wal_only(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        batch_cnt: usize,
    ) -> Result<SequenceNumber> {
        self.write_impl(
            options,
            batch,
            None,
            WriteExtras {
                disable_memtable: true,
                batch_cnt,
                pre_release_callback: None,
            },
        )
    }

    pub(crate) fn write_impl(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<Box<dyn WriteCallback>>,
        extras: WriteExtras,
    ) -> Result<SequenceNumber> {
        {
            let mut tracer = self.tracer.lock();
            if let Some(tracer) = tracer.as_mut() {
                tracer.trace_write(&batch);
            }
        }
        if options.sync && options.disable_wal {
            return Err(EmberError::InvalidArgument(
                "sync writes have to enable the WAL".into(),
            ));
        }
        if self.options.two_write_queues && self.options.enable_pipelined_write {
            return Err(EmberError::NotSupported(
                "pipelined writes are not compatible with concurrent WAL queues".into(),
            ));
        }
        if self.options.seq_per_batch && self.options.enable_pipelined_write {
            return Err(EmberError::NotSupported(
                "pipelined writes are not compatible with seq-per-batch".into(),
            ));
        }
        if self.options.unordered_write && self.options.enable_pipelined_write {
            return Err(EmberError::NotSupported(
                "pipelined writes are not compatible with unordered writes".into(),
            ));
        }
        if self.options.seq_per_batch && extras.batch_cnt == 0 {
            return Err(EmberError::InvalidArgument(
                "seq-per-batch mode requires an explicit batch count".into(),
            ));
        }
        // The persistent-state hint only makes sense for WAL-only batches.
        debug_assert!(!batch.is_latest_persistent_state() || extras.disable_memtable);

        if options.low_pri {
            self.throttle_low_pri_writes_if_needed(options, &batch)?;
        }

        if self.options.two_write_queues && extras.disable_memtable {
            // WAL-only prepares in a write-committed policy consume a
            // sequence only under seq-per-batch.
            let assign_order = self.options.seq_per_batch;
            return self
                .write_impl_wal_only(
                    &self.nonmem_write_queue,
                    options,
                    batch,
                    callback,
                    extras,
                    assign_order,
                    false,
                )
                .map(|(seq, _)| seq);
        }

        match self.mode {
            WriteMode::Unordered => {
                let sub_batch_cnt = if extras.batch_cnt != 0 {
                    extras.batch_cnt
                } else {
                    // Every record is a sub-batch consuming one sequence.
                    batch.count() as usize
                };
                let disable_memtable = extras.disable_memtable;
                let pre_release_callback = extras.pre_release_callback;
                let (seq, batch) = self.write_impl_wal_only(
                    &self.write_queue,
                    options,
                    batch,
                    callback,
                    WriteExtras {
                        disable_memtable,
                        batch_cnt: sub_batch_cnt,
                        pre_release_callback,
                    },
                    true,
                    true,
                )?;
                if !disable_memtable {
                    self.unordered_write_memtable(options, batch, seq, sub_batch_cnt)?;
                }
                Ok(seq)
            }
            WriteMode::Pipelined => self.pipelined_write_impl(options, batch, callback, extras),
            WriteMode::Default => self.default_write_impl(options, batch, callback, extras),
        }
    }

    // =========================================================================
    // Default mode
    // =========================================================================

    fn default_write_impl(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<Box<dyn WriteCallback>>,
        extras: WriteExtras,
    ) -> Result<SequenceNumber> {
        let two_write_queues = self.options.two_write_queues;
        let seq_per_batch = self.options.seq_per_batch;
        let disable_memtable = extras.disable_memtable;

        let mut w = Writer::new(
            batch,
            options,
            disable_memtable,
            extras.batch_cnt,
            callback,
            extras.pre_release_callback,
        );
        let w_ptr = &mut w as *mut Writer;
        self.write_queue.join_batch_group(w_ptr);

        if w.state() == STATE_PARALLEL_MEMTABLE_WRITER {
            // A leader claimed us into a parallel group: apply our own
            // batch, and if we drain the group last, close it out.
            if w.should_write_to_memtable() {
                w.status = self.insert_batch_into_memtables(
                    w.batch.as_ref().expect("parallel writers carry batches"),
                    w.sequence,
                    seq_per_batch,
                    w.batch_cnt,
                    options,
                );
            }
            if self.write_queue.complete_parallel_memtable_writer(w_ptr) {
                let last_sequence = unsafe { (*w.write_group).last_sequence };
                self.seq.publish(last_sequence);
                self.memtable_insert_status_check(&w.status);
                self.write_queue.exit_as_batch_group_follower(w_ptr);
            }
            debug_assert_eq!(w.state(), STATE_COMPLETED);
            return w.final_status().map(|_| w.sequence);
        }
        if w.state() == STATE_COMPLETED {
            return w.final_status().map(|_| w.sequence);
        }
        debug_assert_eq!(w.state(), STATE_GROUP_LEADER);

        let mut in_parallel_group = false;
        let mut last_sequence = MAX_SEQUENCE_NUMBER;

        let mut guard = self.state.lock();
        let mut need_log_sync = options.sync;
        let need_log_dir_sync = need_log_sync && !self.wal.lock().log_dir_synced;
        let mut status = Ok(());
        if !two_write_queues || !disable_memtable {
            // With concurrent WAL queues, preprocessing stays in the thread
            // that also writes memtables to avoid racing on shared state.
            status = self.preprocess_write(&mut guard, options, &mut need_log_sync);
            if !two_write_queues {
                // Read after preprocess: writing recoverable state may have
                // advanced the published sequence.
                last_sequence = self.seq.last_published();
            }
        }
        drop(guard);

        let mut group = WriteGroup::default();
        let group_bytes = self
            .write_queue
            .enter_as_batch_group_leader(w_ptr, &mut group);
        self.last_batch_group_size
            .store(group_bytes, Ordering::Relaxed);

        let mut io_status: Result<()> = Ok(());
        if status.is_ok() {
            // Concurrent memtable apply is off the table as soon as any
            // batch carries a merge: merge reads its own prior state.
            let mut parallel =
                self.options.allow_concurrent_memtable_write && group.size > 1;
            let mut total_count: u64 = 0;
            let mut valid_batches: usize = 0;
            let mut total_byte_size: u64 = 0;
            let mut pre_release_callback_cnt: usize = 0;
            unsafe {
                for member in group.iter() {
                    if (*member).check_callback(self) {
                        valid_batches += (*member).batch_cnt.max(1);
                        if (*member).should_write_to_memtable() {
                            total_count += (*member).batch_count() as u64;
                            let has_merge = (*member)
                                .batch
                                .as_ref()
                                .map(|b| b.has_merge())
                                .unwrap_or(false);
                            parallel = parallel && !has_merge;
                        }
                        total_byte_size += (*member).batch_byte_size();
                        if (*member).pre_release_callback.is_some() {
                            pre_release_callback_cnt += 1;
                        }
                    }
                }
            }
            let seq_inc: u64 = if seq_per_batch {
                valid_batches as u64
            } else {
                total_count
            };

            self.stats.add(&self.stats.keys_written, total_count);
            self.stats.add(&self.stats.bytes_written, total_byte_size);
            self.stats.add(&self.stats.writes_done_by_self, 1);
            if group.size > 1 {
                self.stats
                    .add(&self.stats.writes_done_by_other, group.size as u64 - 1);
            }

            if options.disable_wal {
                self.has_unpersisted_data.store(true, Ordering::Relaxed);
            }

            if !two_write_queues {
                if !options.disable_wal {
                    io_status = self.write_to_wal_group(
                        &group,
                        need_log_sync,
                        need_log_dir_sync,
                        last_sequence + 1,
                    );
                }
            } else if !options.disable_wal {
                // Last-allocated advances inside the appender, under the
                // WAL-write mutex, keeping WAL order equal to sequence
                // order across both queues.
                io_status = self.concurrent_write_to_wal(&group, seq_inc, &mut last_sequence);
            } else {
                last_sequence = self.seq.allocate(seq_inc);
            }
            if let Err(err) = &io_status {
                status = Err(err.clone());
            }
            debug_assert_ne!(last_sequence, MAX_SEQUENCE_NUMBER);
            let current_sequence = last_sequence + 1;
            last_sequence += seq_inc;

            // Pre-release callbacks run after WAL durability and before any
            // memtable apply, in group order, with assigned sequences.
            if status.is_ok() {
                let mut next_sequence = current_sequence;
                let mut index = 0;
                unsafe {
                    for member in group.iter() {
                        if (*member).callback_failed() {
                            continue;
                        }
                        (*member).sequence = next_sequence;
                        if let Some(callback) = &(*member).pre_release_callback {
                            if let Err(err) = callback.callback(
                                (*member).sequence,
                                disable_memtable,
                                (*member).log_used,
                                index,
                                pre_release_callback_cnt,
                            ) {
                                status = Err(err);
                                break;
                            }
                            index += 1;
                        }
                        if seq_per_batch {
                            next_sequence += (*member).batch_cnt as u64;
                        } else if (*member).should_write_to_memtable() {
                            next_sequence += (*member).batch_count() as u64;
                        }
                    }
                }
            }

            if status.is_ok() {
                if !parallel {
                    w.status = self.insert_group_into_memtables(&group, options);
                } else {
                    group.last_sequence = last_sequence;
                    self.write_queue.launch_parallel_memtable_writers(&mut group);
                    in_parallel_group = true;

                    if w.should_write_to_memtable() {
                        w.status = self.insert_batch_into_memtables(
                            w.batch.as_ref().expect("leader carries a batch"),
                            w.sequence,
                            seq_per_batch,
                            w.batch_cnt,
                            options,
                        );
                    }
                }
            }
        }

        if !w.callback_failed() {
            if io_status.is_err() {
                self.io_status_check(&io_status);
            } else {
                self.write_status_check(&status);
            }
        }

        if need_log_sync {
            let mut guard = self.state.lock();
            let logfile_number = self.wal.lock().logfile_number;
            if status.is_ok() {
                self.mark_logs_synced(&mut guard, logfile_number, need_log_dir_sync);
            } else {
                self.mark_logs_not_synced(&mut guard, logfile_number);
            }
            drop(guard);
            // Sync with concurrent queues is rare; a simple full pass is
            // enough.
            if two_write_queues {
                let sync_status = if self.options.manual_wal_flush {
                    self.flush_wal(true)
                } else {
                    self.sync_wal()
                };
                if status.is_ok() {
                    status = sync_status;
                }
            }
        }

        let should_exit_batch_group = if in_parallel_group {
            self.write_queue.complete_parallel_memtable_writer(w_ptr)
        } else {
            true
        };
        if should_exit_batch_group {
            if status.is_ok() {
                self.seq.publish(last_sequence);
            }
            self.memtable_insert_status_check(&w.status);
            self.write_queue
                .exit_as_batch_group_leader(&mut group, status.clone());
        }

        status?;
        w.final_status().map(|_| w.sequence)
    }

    // =========================================================================
    // Pipelined mode
    // =========================================================================

    fn pipelined_write_impl(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<Box<dyn WriteCallback>>,
        extras: WriteExtras,
    ) -> Result<SequenceNumber> {
        let mut w = Writer::new(
            batch,
            options,
            extras.disable_memtable,
            extras.batch_cnt,
            callback,
            extras.pre_release_callback,
        );
        let w_ptr = &mut w as *mut Writer;
        self.write_queue.join_batch_group(w_ptr);

        // Lives across both leadership phases: parallel followers keep raw
        // references into the leader's group until the last one exits it.
        let mut memtable_write_group = WriteGroup::default();

        if w.state() == STATE_GROUP_LEADER {
            if w.callback.is_some()
                && !w.callback.as_ref().unwrap().allow_write_batching()
            {
                self.write_queue.wait_for_memtable_writers();
            }
            let mut guard = self.state.lock();
            let mut need_log_sync = !options.disable_wal && options.sync;
            let need_log_dir_sync = need_log_sync && !self.wal.lock().log_dir_synced;
            w.status = self.preprocess_write(&mut guard, options, &mut need_log_sync);
            drop(guard);

            let mut wal_write_group = WriteGroup::default();
            let group_bytes = self
                .write_queue
                .enter_as_batch_group_leader(w_ptr, &mut wal_write_group);
            self.last_batch_group_size
                .store(group_bytes, Ordering::Relaxed);

            // The queue's own tracker, not the published counter: earlier
            // groups may still be in their memtable phase.
            let current_sequence = self
                .write_queue
                .update_last_sequence(self.seq.last_published())
                + 1;
            let mut total_count: u64 = 0;
            let mut total_byte_size: u64 = 0;

            if w.status.is_ok() {
                let mut next_sequence = current_sequence;
                unsafe {
                    for member in wal_write_group.iter() {
                        if (*member).check_callback(self) {
                            if (*member).should_write_to_memtable() {
                                (*member).sequence = next_sequence;
                                let count = (*member).batch_count() as u64;
                                next_sequence += count;
                                total_count += count;
                            }
                            total_byte_size += (*member).batch_byte_size();
                        }
                    }
                }
                if w.disable_wal {
                    self.has_unpersisted_data.store(true, Ordering::Relaxed);
                }
                self.write_queue
                    .update_last_sequence(current_sequence + total_count - 1);
            }

            self.stats.add(&self.stats.keys_written, total_count);
            self.stats.add(&self.stats.bytes_written, total_byte_size);

            let mut io_status: Result<()> = Ok(());
            if w.status.is_ok() && !options.disable_wal {
                self.stats.add(&self.stats.writes_done_by_self, 1);
                if wal_write_group.size > 1 {
                    self.stats.add(
                        &self.stats.writes_done_by_other,
                        wal_write_group.size as u64 - 1,
                    );
                }
                io_status = self.write_to_wal_group(
                    &wal_write_group,
                    need_log_sync,
                    need_log_dir_sync,
                    current_sequence,
                );
                if let Err(err) = &io_status {
                    w.status = Err(err.clone());
                }
            }

            if !w.callback_failed() {
                if io_status.is_err() {
                    self.io_status_check(&io_status);
                } else {
                    self.write_status_check(&w.status);
                }
            }

            if need_log_sync {
                let mut guard = self.state.lock();
                let logfile_number = self.wal.lock().logfile_number;
                if w.status.is_ok() {
                    self.mark_logs_synced(&mut guard, logfile_number, need_log_dir_sync);
                } else {
                    self.mark_logs_not_synced(&mut guard, logfile_number);
                }
            }

            let wal_status = w.status.clone();
            self.write_queue
                .exit_as_batch_group_leader(&mut wal_write_group, wal_status);
        }

        if w.state() == STATE_MEMTABLE_WRITER_LEADER {
            debug_assert!(w.should_write_to_memtable());
            self.write_queue
                .enter_as_memtable_writer(w_ptr, &mut memtable_write_group);
            if memtable_write_group.size > 1 && self.options.allow_concurrent_memtable_write
            {
                self.write_queue
                    .launch_parallel_memtable_writers(&mut memtable_write_group);
            } else {
                let apply_status =
                    self.insert_group_into_memtables(&memtable_write_group, options);
                if apply_status.is_err() {
                    *memtable_write_group.status.lock() = apply_status.clone();
                    self.memtable_insert_status_check(&apply_status);
                }
                self.seq.publish(memtable_write_group.last_sequence);
                self.write_queue
                    .exit_as_memtable_writer(&mut memtable_write_group);
            }
        }

        if w.state() == STATE_PARALLEL_MEMTABLE_WRITER {
            debug_assert!(w.should_write_to_memtable());
            w.status = self.insert_batch_into_memtables(
                w.batch.as_ref().expect("parallel writers carry batches"),
                w.sequence,
                false,
                0,
                options,
            );
            if self.write_queue.complete_parallel_memtable_writer(w_ptr) {
                self.memtable_insert_status_check(&w.status);
                unsafe {
                    let group = &mut *w.write_group;
                    self.seq.publish(group.last_sequence);
                    self.write_queue.exit_as_memtable_writer(group);
                }
            }
        }

        debug_assert_eq!(w.state(), STATE_COMPLETED);
        w.final_status().map(|_| w.sequence)
    }

    // =========================================================================
    // Unordered mode
    // =========================================================================

    fn unordered_write_memtable(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        seq: SequenceNumber,
        sub_batch_cnt: usize,
    ) -> Result<()> {
        let mut w = Writer::new(batch, options, false, sub_batch_cnt, None, None);
        w.sequence = seq;
        if w.should_write_to_memtable() {
            let total_count = w.batch_count() as u64;
            self.stats.add(&self.stats.keys_written, total_count);
            w.status = self.insert_batch_into_memtables(
                w.batch.as_ref().expect("unordered writers carry batches"),
                w.sequence,
                self.options.seq_per_batch,
                sub_batch_cnt,
                options,
            );
            if options.disable_wal {
                self.has_unpersisted_data.store(true, Ordering::Relaxed);
            }
        }

        let pending = self.pending_memtable_writes.fetch_sub(1, Ordering::AcqRel) - 1;
        if pending == 0 {
            // Taking the mutex before notifying guarantees a switcher that
            // just observed a non-zero count is parked before the wakeup.
            let _guard = self.switch_mu.lock();
            self.switch_cv.notify_all();
        }
        self.write_status_check(&w.status);
        w.final_status()
    }

    // =========================================================================
    // WAL-only queue
    // =========================================================================

    /// The second write path: batches that reach the WAL but never the
    /// memtables. The only path that advances last-published in a
    /// two-queue setting.
    #[allow(clippy::too_many_arguments)]
    fn write_impl_wal_only(
        &self,
        queue: &WriteQueue,
        options: &WriteOptions,
        batch: WriteBatch,
        callback: Option<Box<dyn WriteCallback>>,
        extras: WriteExtras,
        assign_order: bool,
        publish_last_seq: bool,
    ) -> Result<(SequenceNumber, WriteBatch)> {
        let mut status: Result<()> = Ok(());
        let mut w = Writer::new(
            batch,
            options,
            extras.disable_memtable,
            extras.batch_cnt,
            callback,
            extras.pre_release_callback,
        );
        let w_ptr = &mut w as *mut Writer;
        queue.join_batch_group(w_ptr);
        debug_assert_ne!(w.state(), STATE_PARALLEL_MEMTABLE_WRITER);
        if w.state() == STATE_COMPLETED {
            let seq = w.sequence;
            let batch = w.batch.take().expect("completed writer retains its batch");
            return w.final_status().map(|_| (seq, batch));
        }
        debug_assert_eq!(w.state(), STATE_GROUP_LEADER);

        if publish_last_seq {
            // Only the unordered path publishes from here; it owns the
            // preprocess duty since no memtable leader will.
            debug_assert!(self.options.unordered_write);
            {
                let guard = self.state.lock();
                if let Some(err) = &guard.bg_error {
                    status = Err(err.clone());
                }
            }
            if status.is_ok() {
                let mut guard = self.state.lock();
                let mut need_log_sync = false;
                status = self.preprocess_write(&mut guard, options, &mut need_log_sync);
                if status.is_err() {
                    self.write_status_check_on_locked(&mut guard, &status);
                }
            }
            if let Err(err) = &status {
                let mut group = WriteGroup::default();
                queue.enter_as_batch_group_leader(w_ptr, &mut group);
                queue.exit_as_batch_group_leader(&mut group, Err(err.clone()));
                return Err(err.clone());
            }
        }

        let mut group = WriteGroup::default();
        queue.enter_as_batch_group_leader(w_ptr, &mut group);

        let mut total_byte_size: u64 = 0;
        let mut pre_release_callback_cnt: usize = 0;
        unsafe {
            for member in group.iter() {
                if (*member).check_callback(self) {
                    total_byte_size += (*member).batch_byte_size();
                    if (*member).pre_release_callback.is_some() {
                        pre_release_callback_cnt += 1;
                    }
                }
            }
        }
        self.stats.add(&self.stats.bytes_written, total_byte_size);
        self.stats.add(&self.stats.writes_done_by_self, 1);
        if group.size > 1 {
            self.stats
                .add(&self.stats.writes_done_by_other, group.size as u64 - 1);
        }

        let seq_inc: u64 = if assign_order {
            let mut total_batch_cnt: u64 = 0;
            unsafe {
                for member in group.iter() {
                    debug_assert!((*member).batch_cnt > 0 || !self.options.seq_per_batch);
                    if !(*member).callback_failed() {
                        total_batch_cnt += (*member).batch_cnt.max(1) as u64;
                    }
                }
            }
            total_batch_cnt
        } else {
            0
        };

        let mut io_status: Result<()> = Ok(());
        let mut last_sequence = MAX_SEQUENCE_NUMBER;
        if !options.disable_wal {
            io_status = self.concurrent_write_to_wal(&group, seq_inc, &mut last_sequence);
            if let Err(err) = &io_status {
                status = Err(err.clone());
            }
        } else {
            // Sequence allocation is all that is left to do.
            last_sequence = self.seq.allocate(seq_inc);
        }

        let mut memtable_write_cnt: usize = 0;
        let mut curr_seq = last_sequence + 1;
        unsafe {
            for member in group.iter() {
                if (*member).callback_failed() {
                    continue;
                }
                (*member).sequence = curr_seq;
                if assign_order {
                    curr_seq += (*member).batch_cnt.max(1) as u64;
                }
                if !(*member).disable_memtable {
                    memtable_write_cnt += 1;
                }
            }
        }

        if status.is_ok() && options.sync {
            debug_assert!(!options.disable_wal);
            status = if self.options.manual_wal_flush {
                self.flush_wal(true)
            } else {
                self.sync_wal()
            };
        }

        if !w.callback_failed() {
            if io_status.is_err() {
                self.io_status_check(&io_status);
            } else {
                self.write_status_check(&status);
            }
        }

        if status.is_ok() {
            let mut index = 0;
            unsafe {
                for member in group.iter() {
                    if !(*member).callback_failed() {
                        if let Some(callback) = &(*member).pre_release_callback {
                            debug_assert_ne!((*member).sequence, MAX_SEQUENCE_NUMBER);
                            if let Err(err) = callback.callback(
                                (*member).sequence,
                                (*member).disable_memtable,
                                (*member).log_used,
                                index,
                                pre_release_callback_cnt,
                            ) {
                                status = Err(err);
                                break;
                            }
                            index += 1;
                        }
                    }
                }
            }
        }
        if publish_last_seq {
            self.seq.publish(last_sequence + seq_inc);
        }
        if self.options.unordered_write && status.is_ok() {
            self.pending_memtable_writes
                .fetch_add(memtable_write_cnt, Ordering::AcqRel);
        }
        queue.exit_as_batch_group_leader(&mut group, status.clone());

        status?;
        let seq = w.sequence;
        let batch = w.batch.take().expect("leader retains its batch");
        w.final_status().map(|_| (seq, batch))
    }

    // =========================================================================
    // Status checks and the background error handler
    // =========================================================================

    fn set_bg_error_locked(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        err: EmberError,
        reason: BackgroundErrorReason,
    ) {
        if guard.bg_error.is_none() || err.is_io_fenced() {
            tracing::warn!(error = %err, ?reason, "background error recorded; writes will fail fast");
            guard.bg_error = Some(err);
            guard.bg_error_reason = Some(reason);
        }
        self.bg_cv.notify_all();
    }

    fn write_status_check_on_locked(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        status: &Result<()>,
    ) {
        let Err(err) = status else { return };
        if self.options.paranoid_checks && !err.is_busy() && !err.is_incomplete() {
            self.set_bg_error_locked(guard, err.clone(), BackgroundErrorReason::WriteCallback);
        }
    }

    /// Paranoid-checks promotion: unexpected write errors become background
    /// errors and stop the database. Busy and Incomplete are transient by
    /// definition and never promoted.
    fn write_status_check(&self, status: &Result<()>) {
        let Err(err) = status else { return };
        if self.options.paranoid_checks && !err.is_busy() && !err.is_incomplete() {
            let mut guard = self.state.lock();
            self.set_bg_error_locked(&mut guard, err.clone(), BackgroundErrorReason::WriteCallback);
        }
    }

    fn io_status_check(&self, status: &Result<()>) {
        let Err(err) = status else { return };
        if (self.options.paranoid_checks && !err.is_busy() && !err.is_incomplete())
            || err.is_io_fenced()
        {
            let mut guard = self.state.lock();
            self.set_bg_error_locked(&mut guard, err.clone(), BackgroundErrorReason::WriteCallback);
        }
    }

    /// A failed memtable apply means the WAL and memory have diverged;
    /// always promoted, regardless of paranoid checks.
    fn memtable_insert_status_check(&self, status: &Result<()>) {
        let Err(err) = status else { return };
        let mut guard = self.state.lock();
        self.set_bg_error_locked(&mut guard, err.clone(), BackgroundErrorReason::MemTable);
    }

    // =========================================================================
    // Preprocess (leader only, global mutex held)
    // =========================================================================

    fn preprocess_write(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        options: &WriteOptions,
        need_log_sync: &mut bool,
    ) -> Result<()> {
        let mut status: Result<()> = Ok(());
        if let Some(err) = &guard.bg_error {
            status = Err(err.clone());
        }

        if status.is_ok() && self.total_wal_size() > self.max_total_wal_size() {
            self.wait_for_pending_writes(guard);
            status = self.switch_wal(guard);
        }

        if status.is_ok() && self.write_buffer_manager.should_flush() {
            // The manager keeps demanding memory until a switch lands; a
            // concurrent writer may switch more than strictly needed,
            // which is suboptimal but correct.
            self.wait_for_pending_writes(guard);
            status = self.handle_write_buffer_full(guard);
        }

        if status.is_ok() && !self.trim_history_scheduler.is_empty() {
            status = self.trim_memtable_history(guard);
        }

        if status.is_ok() && !self.flush_scheduler.is_empty() {
            self.wait_for_pending_writes(guard);
            status = self.schedule_flushes(guard);
        }

        if status.is_ok()
            && (self.write_controller.is_stopped() || self.write_controller.needs_delay())
        {
            // The size of the current group is unknown at this point, so
            // the previous group's size prices the delay.
            status = self.delay_write(
                guard,
                self.last_batch_group_size.load(Ordering::Relaxed),
                options,
            );
        }

        if status.is_ok() && *need_log_sync {
            // A parallel syncer must sync the front log too, so watching
            // the front is enough.
            loop {
                let front_getting_synced = self
                    .wal
                    .lock()
                    .logs
                    .front()
                    .map(|log| log.getting_synced)
                    .unwrap_or(false);
                if !front_getting_synced {
                    break;
                }
                self.log_sync_cv.wait(guard);
            }
            let mut wal = self.wal.lock();
            for log in wal.logs.iter_mut() {
                debug_assert!(!log.getting_synced);
                // Claimed now so a parallel sync pass keeps its hands off;
                // the actual fsync happens after the WAL append.
                log.getting_synced = true;
            }
        } else {
            *need_log_sync = false;
        }

        status
    }

    fn max_total_wal_size(&self) -> u64 {
        if self.options.max_total_wal_size > 0 {
            self.options.max_total_wal_size
        } else {
            4 * self.max_total_in_memory_state.load(Ordering::Relaxed)
        }
    }

    /// Wait for every write admitted before this point to finish its
    /// memtable phase. Pipelined and unordered writes run those phases
    /// detached from the queue head.
    fn wait_for_pending_writes(&self, guard: &mut MutexGuard<'_, DbState>) {
        if self.options.enable_pipelined_write {
            MutexGuard::unlocked(guard, || {
                self.write_queue.wait_for_memtable_writers();
            });
        }
        if !self.options.unordered_write {
            return;
        }
        if self.pending_memtable_writes.load(Ordering::Acquire) != 0 {
            MutexGuard::unlocked(guard, || {
                let mut switch_guard = self.switch_mu.lock();
                while self.pending_memtable_writes.load(Ordering::Acquire) != 0 {
                    self.switch_cv.wait(&mut switch_guard);
                }
            });
        }
    }

    /// Sleep (or fail fast) while the write controller demands it.
    /// Re-acquires the global mutex before returning.
    fn delay_write(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        num_bytes: u64,
        options: &WriteOptions,
    ) -> Result<()> {
        let start = Instant::now();
        let mut delayed = false;

        let delay = self.write_controller.get_delay(num_bytes);
        if !delay.is_zero() {
            if options.no_slowdown {
                return Err(EmberError::Incomplete("Write stall".into()));
            }
            // Raise the barrier so queued no_slowdown writers fail now
            // instead of waiting out our sleep.
            self.write_queue.begin_write_stall();
            let deadline = start + delay;
            MutexGuard::unlocked(guard, || {
                while self.write_controller.needs_delay() && Instant::now() < deadline {
                    delayed = true;
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
            self.write_queue.end_write_stall();
        }

        // A stop is open-ended: park on the background condvar, but never
        // while a background error is pending — that stall might last
        // forever.
        while guard.bg_error.is_none() && self.write_controller.is_stopped() {
            if options.no_slowdown {
                return Err(EmberError::Incomplete("Write stall".into()));
            }
            delayed = true;
            self.write_queue.begin_write_stall();
            // Stop tokens drop outside any lock, so poll alongside the
            // wakeup.
            let _ = self.bg_cv.wait_for(guard, Duration::from_millis(1));
            self.write_queue.end_write_stall();
        }
        debug_assert!(!delayed || !options.no_slowdown);
        if delayed {
            self.stats
                .add(&self.stats.write_stall_micros, start.elapsed().as_micros() as u64);
        }

        // A recorded background error outranks the stall: it carries the
        // real kind — possibly terminal — that callers dispatch on. The
        // wait loop may have bailed on it while the controller was still
        // stopped.
        if let Some(err) = &guard.bg_error {
            return Err(err.clone());
        }
        if self.write_controller.is_stopped() {
            // Stopped again with nothing recorded: a pure controller-level
            // stall re-raised between the wait loop and here.
            return Err(EmberError::Incomplete("Write stall".into()));
        }
        Ok(())
    }

    fn throttle_low_pri_writes_if_needed(
        &self,
        options: &WriteOptions,
        batch: &WriteBatch,
    ) -> Result<()> {
        debug_assert!(options.low_pri);
        // Called outside the global mutex; the pressure reading is a
        // snapshot and that is fine.
        if self.write_controller.need_speedup_compaction() {
            if batch.has_commit() || batch.has_rollback() {
                // Rate limit prepares, never the outcome records.
                return Ok(());
            }
            if options.no_slowdown {
                return Err(EmberError::Incomplete("Low priority write stall".into()));
            }
            self.write_controller
                .low_pri_rate_limiter()
                .request(batch.data_size() as u64);
        }
        Ok(())
    }

    // =========================================================================
    // WAL writes
    // =========================================================================

    /// Flatten the group for logging: a lone intact batch goes as-is, and
    /// anything else is copied into a scratch batch in group order.
    /// Returns (payload source, batches logged, state batch to cache).
    unsafe fn merge_batch(
        &self,
        group: &WriteGroup,
    ) -> (Option<WriteBatch>, usize, Option<WriteBatch>) {
        let leader = group.leader;
        debug_assert!(!(*leader).disable_wal);
        let leader_batch = (*leader).batch.as_ref().expect("leader carries a batch");
        if group.size == 1
            && !(*leader).callback_failed()
            && !leader_batch.has_wal_termination_point()
        {
            let cached = leader_batch
                .is_latest_persistent_state()
                .then(|| leader_batch.clone());
            (None, 1, cached)
        } else {
            let mut merged = WriteBatch::new();
            let mut write_with_wal = 0;
            let mut cached = None;
            for member in group.iter() {
                if (*member).callback_failed() {
                    continue;
                }
                let batch = (*member).batch.as_ref().expect("group members carry batches");
                merged.append_from(batch, true);
                if batch.is_latest_persistent_state() {
                    // Only the newest such batch matters for recovery.
                    cached = Some(batch.clone());
                }
                write_with_wal += 1;
            }
            (Some(merged), write_with_wal, cached)
        }
    }

    /// Exclusive-leader WAL write: append the merged group, then run the
    /// requested durability cycle.
    fn write_to_wal_group(
        &self,
        group: &WriteGroup,
        need_log_sync: bool,
        need_log_dir_sync: bool,
        sequence: SequenceNumber,
    ) -> Result<()> {
        unsafe {
            let (mut scratch, write_with_wal, to_be_cached) = self.merge_batch(group);

            let mut wal = self.wal.lock();
            let logfile_number = wal.logfile_number;
            if scratch.is_none() {
                (*group.leader).log_used = logfile_number;
            } else if write_with_wal > 1 {
                for member in group.iter() {
                    (*member).log_used = logfile_number;
                }
            }

            let log_size;
            {
                let payload: &[u8] = match &mut scratch {
                    Some(batch) => {
                        batch.set_sequence(sequence);
                        batch.data()
                    }
                    None => {
                        let leader_batch =
                            (*group.leader).batch.as_mut().expect("leader carries a batch");
                        leader_batch.set_sequence(sequence);
                        leader_batch.data()
                    }
                };
                log_size = payload.len() as u64;
                let written = wal.current_log_mut().writer.add_record(payload)?;
                wal.note_append(written);
                self.total_log_size.fetch_add(written, Ordering::Relaxed);
            }
            if let Some(cached) = to_be_cached {
                wal.cached_recoverable_state = Some(cached);
            }

            if need_log_sync {
                // Every log was claimed in preprocess, so nothing else pops
                // from the list while the sync runs.
                let use_fsync = self.options.use_fsync;
                for log in wal.logs.iter_mut() {
                    if log.getting_synced {
                        log.writer.sync(use_fsync)?;
                    }
                }
                if need_log_dir_sync {
                    // Once per durability cycle is enough; users who never
                    // sync never pay it.
                    wal::sync_dir(&wal.dir)?;
                }
                self.stats.add(&self.stats.wal_files_synced, 1);
            }
            drop(wal);

            self.stats.add(&self.stats.wal_bytes, log_size);
            self.stats
                .add(&self.stats.writes_with_wal, write_with_wal as u64);
            Ok(())
        }
    }

    /// Two-queue WAL write: the sequence fetch-add and the append happen
    /// under the WAL-write mutex as one unit, so WAL record order equals
    /// sequence order across both queues. `last_sequence` receives the
    /// pre-advance allocation even when the append itself fails.
    fn concurrent_write_to_wal(
        &self,
        group: &WriteGroup,
        seq_inc: u64,
        last_sequence: &mut SequenceNumber,
    ) -> Result<()> {
        unsafe {
            let (mut scratch, write_with_wal, to_be_cached) = self.merge_batch(group);

            let mut wal = self.wal.lock();
            let logfile_number = wal.logfile_number;
            if scratch.is_none() {
                (*group.leader).log_used = logfile_number;
            } else if write_with_wal > 1 {
                for member in group.iter() {
                    (*member).log_used = logfile_number;
                }
            }

            *last_sequence = self.seq.allocate(seq_inc);
            let sequence = *last_sequence + 1;
            let payload: &[u8] = match &mut scratch {
                Some(batch) => {
                    batch.set_sequence(sequence);
                    batch.data()
                }
                None => {
                    let leader_batch =
                        (*group.leader).batch.as_mut().expect("leader carries a batch");
                    leader_batch.set_sequence(sequence);
                    leader_batch.data()
                }
            };
            let log_size = payload.len() as u64;
            let written = wal.current_log_mut().writer.add_record(payload)?;
            wal.note_append(written);
            self.total_log_size.fetch_add(written, Ordering::Relaxed);
            if let Some(cached) = to_be_cached {
                wal.cached_recoverable_state = Some(cached);
            }
            drop(wal);

            self.stats.add(&self.stats.wal_bytes, log_size);
            self.stats
                .add(&self.stats.writes_with_wal, write_with_wal as u64);
            Ok(())
        }
    }

    /// Clear sync claims after a successful durability cycle and retire
    /// fully synced, no-longer-active logs. Caller holds the global mutex.
    fn mark_logs_synced(
        &self,
        _guard: &mut MutexGuard<'_, DbState>,
        up_to: u64,
        synced_dir: bool,
    ) {
        let mut wal = self.wal.lock();
        if synced_dir {
            wal.log_dir_synced = true;
        }
        loop {
            let Some(front) = wal.logs.front() else { break };
            if front.number > up_to {
                break;
            }
            debug_assert!(front.getting_synced);
            if wal.logs.len() > 1 {
                wal.logs.pop_front();
            } else {
                wal.logs.front_mut().unwrap().getting_synced = false;
                break;
            }
        }
        drop(wal);
        self.log_sync_cv.notify_all();
    }

    fn mark_logs_not_synced(&self, _guard: &mut MutexGuard<'_, DbState>, up_to: u64) {
        let mut wal = self.wal.lock();
        for log in wal.logs.iter_mut() {
            if log.number <= up_to {
                log.getting_synced = false;
            }
        }
        drop(wal);
        self.log_sync_cv.notify_all();
    }

    /// Push buffered WAL frames to the kernel; with `sync`, make them
    /// durable too. The entry point for manual WAL flush mode.
    pub fn flush_wal(&self, sync: bool) -> Result<()> {
        {
            let mut wal = self.wal.lock();
            if let Err(err) = wal.current_log_mut().writer.flush_buffer() {
                drop(wal);
                let status = Err(err);
                self.write_status_check(&status);
                return status;
            }
        }
        if sync {
            self.sync_wal()
        } else {
            Ok(())
        }
    }

    /// Sync every WAL not already claimed by a parallel durability cycle.
    pub fn sync_wal(&self) -> Result<()> {
        let (up_to, need_dir_sync) = {
            let guard = self.state.lock();
            let mut wal = self.wal.lock();
            for log in wal.logs.iter_mut() {
                log.getting_synced = true;
            }
            let result = (wal.logfile_number, !wal.log_dir_synced);
            drop(wal);
            drop(guard);
            result
        };

        let sync_status = {
            let mut wal = self.wal.lock();
            let use_fsync = self.options.use_fsync;
            let mut result: Result<()> = Ok(());
            for log in wal.logs.iter_mut() {
                if log.getting_synced {
                    if let Err(err) = log.writer.sync(use_fsync) {
                        result = Err(err);
                        break;
                    }
                }
            }
            if result.is_ok() && need_dir_sync {
                result = wal::sync_dir(&wal.dir);
            }
            result
        };

        let mut guard = self.state.lock();
        match &sync_status {
            Ok(()) => {
                self.stats.add(&self.stats.wal_files_synced, 1);
                self.mark_logs_synced(&mut guard, up_to, need_dir_sync);
            }
            Err(_) => self.mark_logs_not_synced(&mut guard, up_to),
        }
        drop(guard);
        if sync_status.is_err() {
            self.io_status_check(&sync_status);
        }
        sync_status
    }

    /// Drop alive-list entries (and their files) once no column family
    /// needs them, feeding the recycle list when recycling is on.
    fn purge_obsolete_wal_files(&self) {
        let min_log_needed = self
            .cfs
            .all()
            .iter()
            .filter(|cf| {
                !cf.mem().is_empty() || cf.imm().num_not_flushed() > 0 || cf.log_number() > 0
            })
            .map(|cf| cf.log_number())
            .min()
            .unwrap_or(0);
        if min_log_needed == 0 {
            return;
        }
        let mut wal = self.wal.lock();
        while wal.logs.len() > 1 {
            let front = wal.logs.front().unwrap();
            if front.number >= min_log_needed || front.getting_synced {
                break;
            }
            // Buffers were flushed when the log was rotated out; dropping
            // the writer just closes the handle.
            wal.logs.pop_front();
        }
        while let Some(front) = wal.alive_log_files.front() {
            if front.number >= min_log_needed || wal.alive_log_files.len() == 1 {
                break;
            }
            let retired = wal.alive_log_files.pop_front().unwrap();
            self.total_log_size.fetch_sub(retired.size, Ordering::Relaxed);
            if wal.log_recycle_files.len() < self.options.recycle_log_file_num {
                wal.log_recycle_files.push_back(retired.number);
            } else {
                let _ = fs::remove_file(wal::log_file_path(&wal.dir, retired.number));
            }
        }
    }

    // =========================================================================
    // Rotation: switch WAL / write-buffer-full / scheduled flushes
    // =========================================================================

    /// Total WAL size crossed the threshold: seal every family still
    /// holding the oldest log so that log can eventually retire.
    fn switch_wal(&self, guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let oldest_alive_log = {
            let mut wal = self.wal.lock();
            let Some(front) = wal.alive_log_files.front_mut() else {
                return Ok(());
            };
            if front.getting_flushed {
                return Ok(());
            }
            // Only marked once all of this log's data is going to flush.
            front.getting_flushed = true;
            front.number
        };
        tracing::info!(
            oldest_wal = oldest_alive_log,
            total_log_size = self.total_wal_size(),
            max_total_wal_size = self.max_total_wal_size(),
            "rotating WAL: flushing all column families with data in the oldest log"
        );

        let mut families = if self.options.atomic_flush {
            self.select_cfs_for_atomic_flush()
        } else {
            let picked: Vec<_> = self
                .cfs
                .all()
                .into_iter()
                .filter(|cf| cf.log_number() <= oldest_alive_log)
                .collect();
            picked
        };
        if !self.options.atomic_flush {
            self.maybe_flush_stats_cf(&mut families);
        }

        let status = self.switch_memtables_with_wal_queue_excluded(guard, &families, false);

        if status.is_ok() {
            self.finish_flush_scheduling(families, FlushReason::WalFull);
        }
        status
    }

    /// The shared write buffer is over budget: seal the family whose
    /// active memtable is oldest (all of them under atomic flush).
    fn handle_write_buffer_full(&self, guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        tracing::info!(
            memory_usage = self.write_buffer_manager.memory_usage(),
            buffer_size = self.write_buffer_manager.buffer_size(),
            "write buffer full: flushing column family with the oldest memtable entry"
        );
        let mut families = if self.options.atomic_flush {
            self.select_cfs_for_atomic_flush()
        } else {
            let mut picked: Option<Arc<ColumnFamily>> = None;
            let mut picked_seq = MAX_SEQUENCE_NUMBER;
            for cf in self.cfs.all() {
                if cf.mem().is_empty() {
                    // Hope the immutables are already on their way out.
                    continue;
                }
                let seq = cf.mem().creation_seq();
                if picked.is_none() || seq < picked_seq {
                    picked = Some(cf);
                    picked_seq = seq;
                }
            }
            picked.into_iter().collect()
        };
        if !self.options.atomic_flush {
            self.maybe_flush_stats_cf(&mut families);
        }

        let status = self.switch_memtables_with_wal_queue_excluded(guard, &families, true);

        if status.is_ok() {
            self.finish_flush_scheduling(families, FlushReason::WriteBufferManager);
        }
        status
    }

    /// Drain the flush scheduler: every enqueued family gets its memtable
    /// sealed (all non-empty families under atomic flush).
    fn schedule_flushes(&self, guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let families = if self.options.atomic_flush {
            let picked = self.select_cfs_for_atomic_flush();
            self.flush_scheduler.clear();
            picked
        } else {
            let mut picked = Vec::new();
            while let Some(cf_id) = self.flush_scheduler.take_next() {
                if let Some(cf) = self.cfs.get(cf_id) {
                    picked.push(cf);
                }
            }
            self.maybe_flush_stats_cf(&mut picked);
            picked
        };

        let status = self.switch_memtables_with_wal_queue_excluded(guard, &families, true);

        if status.is_ok() {
            self.finish_flush_scheduling(families, FlushReason::WriteBufferFull);
        }
        status
    }

    /// Seal each family's memtable, holding exclusive passage on the
    /// WAL-only queue so its sequence allocations cannot interleave with
    /// the switch. `skip_empty` leaves untouched families alone.
    fn switch_memtables_with_wal_queue_excluded(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        families: &[Arc<ColumnFamily>],
        skip_empty: bool,
    ) -> Result<()> {
        let mut nonmem_w = Writer::empty();
        let nonmem_ptr = &mut nonmem_w as *mut Writer;
        if self.options.two_write_queues {
            MutexGuard::unlocked(guard, || {
                self.nonmem_write_queue.enter_unbatched(nonmem_ptr);
            });
        }
        let mut status: Result<()> = Ok(());
        for cf in families {
            if skip_empty && cf.mem().is_empty() {
                continue;
            }
            status = self.switch_memtable(guard, cf);
            if status.is_err() {
                break;
            }
        }
        if self.options.two_write_queues {
            self.nonmem_write_queue.exit_unbatched(nonmem_ptr);
        }
        status
    }

    fn select_cfs_for_atomic_flush(&self) -> Vec<Arc<ColumnFamily>> {
        self.cfs
            .all()
            .into_iter()
            .filter(|cf| !cf.mem().is_empty() || cf.imm().num_not_flushed() > 0)
            .collect()
    }

    /// With stats persistence on, force-flush the stats family whenever it
    /// pins a log older than everyone else's.
    fn maybe_flush_stats_cf(&self, families: &mut Vec<Arc<ColumnFamily>>) {
        if families.is_empty() || !self.options.persist_stats_to_disk {
            return;
        }
        let Some(stats_cf) = self.cfs.get_by_name(PERSISTENT_STATS_COLUMN_FAMILY_NAME) else {
            return;
        };
        if stats_cf.mem().is_empty() {
            return;
        }
        if families.iter().any(|cf| cf.id() == stats_cf.id()) {
            return;
        }
        let force = self
            .cfs
            .all()
            .iter()
            .filter(|cf| cf.id() != stats_cf.id())
            .all(|cf| cf.log_number() > stats_cf.log_number());
        if force {
            tracing::info!(
                "force flushing the stats column family so it stops pinning old logs"
            );
            families.push(stats_cf);
        }
    }

    fn finish_flush_scheduling(&self, families: Vec<Arc<ColumnFamily>>, reason: FlushReason) {
        if families.is_empty() {
            return;
        }
        if self.options.atomic_flush {
            let seq = self.seq.last_published();
            for cf in &families {
                cf.imm().assign_atomic_flush_seq(seq);
            }
        }
        for cf in &families {
            cf.imm().set_flush_requested();
        }
        let request_families = families
            .iter()
            .map(|cf| {
                let newest = cf
                    .imm()
                    .memtables()
                    .last()
                    .map(|m| m.id())
                    .unwrap_or(0);
                (cf.id(), newest)
            })
            .collect();
        self.flush_requests.lock().push_back(FlushRequest {
            reason,
            families: request_families,
            token: None,
        });
        self.maybe_schedule_flush_or_compaction();
    }

    /// Claim limiter slots for queued flush requests. Requests left
    /// without a token simply wait for the next pass.
    fn maybe_schedule_flush_or_compaction(&self) {
        let Some(limiter) = &self.options.flush_task_limiter else {
            return;
        };
        let mut requests = self.flush_requests.lock();
        for request in requests.iter_mut() {
            if request.token.is_none() {
                match limiter.get_token(false) {
                    Some(token) => request.token = Some(token),
                    None => break,
                }
            }
        }
    }

    /// Drop obsolete immutable history for every family the trim scheduler
    /// accumulated.
    fn trim_memtable_history(&self, _guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let mut families = Vec::new();
        while let Some(cf_id) = self.trim_history_scheduler.take_next() {
            if let Some(cf) = self.cfs.get(cf_id) {
                families.push(cf);
            }
        }
        for cf in families {
            let active_usage = cf.mem().approximate_memory_usage();
            let trimmed = cf.imm().trim_history(active_usage);
            if trimmed {
                cf.install_super_version();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Memtable switch
    // =========================================================================

    /// Atomically roll `cf` to a new WAL and a new active memtable.
    ///
    /// Preconditions: global mutex held; this thread is at the head of the
    /// writer queue (and of the WAL-only queue under two-queue mode).
    fn switch_memtable(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        cf: &Arc<ColumnFamily>,
    ) -> Result<()> {
        // The WAL holding the recoverable state may retire after this
        // switch; persist that state into the memtable first.
        self.write_recoverable_state(guard)?;

        let (creating_new_log, recycle_log_number, new_log_number) = {
            let wal = self.wal.lock();
            let creating = !wal.log_empty;
            let recycle = if creating && self.options.recycle_log_file_num > 0 {
                wal.log_recycle_files.front().copied()
            } else {
                None
            };
            let number = if creating {
                self.next_file_number.fetch_add(1, Ordering::Relaxed)
            } else {
                wal.logfile_number
            };
            (creating, recycle, number)
        };

        let old_mem = cf.mem();
        let memtable_info = MemtableInfo {
            cf_name: cf.name().to_string(),
            first_seqno: old_mem.first_sequence(),
            earliest_seqno: old_mem.earliest_sequence(),
            num_entries: old_mem.num_entries(),
            num_deletes: old_mem.num_deletes(),
        };
        let num_imm_unflushed = cf.imm().num_not_flushed();
        let preallocate_block_size =
            self.wal_preallocate_block_size(cf.options().write_buffer_size);

        // File creation and memtable construction happen off the mutex.
        let mut new_log = None;
        let mut io_status: Result<()> = Ok(());
        let new_mem = MutexGuard::unlocked(guard, || {
            if creating_new_log {
                match LogWriter::create(
                    &self.path,
                    new_log_number,
                    recycle_log_number,
                    preallocate_block_size,
                    self.options.manual_wal_flush,
                ) {
                    Ok(writer) => new_log = Some(writer),
                    Err(err) => io_status = Err(err),
                }
            }
            if io_status.is_ok() {
                Some(cf.construct_new_memtable(self.seq.last_published()))
            } else {
                None
            }
        });
        tracing::info!(
            cf = cf.name(),
            log = new_log_number,
            immutable_memtables = num_imm_unflushed,
            "new memtable created"
        );

        let mut status = io_status.clone();
        if status.is_ok() && creating_new_log {
            let mut wal = self.wal.lock();
            if recycle_log_number.is_some() {
                debug_assert_eq!(wal.log_recycle_files.front().copied(), recycle_log_number);
                wal.log_recycle_files.pop_front();
            }
            // Always flush the outgoing log's buffer before moving on.
            if let Err(err) = wal.current_log_mut().writer.flush_buffer() {
                tracing::warn!(
                    cf = cf.name(),
                    new_log = new_log_number,
                    error = %err,
                    "failed to switch WAL files"
                );
                status = Err(err);
            }
            if status.is_ok() {
                wal.install_log(new_log.take().expect("created above"));
            }
        }

        if let Err(err) = status {
            // Data may be stranded in the outgoing log's buffer; record a
            // background error and fail every subsequent write fast.
            debug_assert!(creating_new_log);
            drop(new_log);
            self.set_bg_error_locked(guard, err, BackgroundErrorReason::MemTable);
            return Err(guard.bg_error.clone().expect("just recorded"));
        }

        let logfile_number = self.wal.lock().logfile_number;
        let published = self.seq.last_published();
        for other in self.cfs.all() {
            // Empty families do not need the old logs alive; advancing
            // their tracked log lets those files retire without touching
            // the manifest.
            if other.mem().first_sequence() == 0 && other.imm().num_not_flushed() == 0 {
                if creating_new_log {
                    other.set_log_number(logfile_number);
                }
                other.mem().set_creation_seq(published);
            }
        }

        let new_mem = new_mem.expect("constructed above");
        old_mem.set_next_log_number(logfile_number);
        let sealed_bytes = old_mem.approximate_memory_usage();
        cf.imm().add(Arc::clone(&old_mem));
        self.write_buffer_manager.schedule_free_mem(sealed_bytes);
        cf.set_memtable(new_mem);
        cf.install_super_version();

        // Listeners run outside the mutex, after the new memtable is
        // installed.
        MutexGuard::unlocked(guard, || {
            let listeners = self.listeners.read().clone();
            for listener in listeners {
                listener.on_memtable_sealed(&memtable_info);
            }
        });
        Ok(())
    }

    fn wal_preallocate_block_size(&self, write_buffer_size: usize) -> usize {
        let mut size = write_buffer_size / 10 + write_buffer_size;
        if self.options.max_total_wal_size > 0 {
            size = size.min(self.options.max_total_wal_size as usize);
        }
        if self.options.db_write_buffer_size > 0 {
            size = size.min(self.options.db_write_buffer_size);
        }
        size
    }

    /// Re-insert the cached recoverable state into memtables so it
    /// survives the retirement of the WAL that carried it.
    fn write_recoverable_state(&self, guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let Some(mut batch) = self.wal.lock().cached_recoverable_state.take() else {
            return Ok(());
        };
        if batch.count() == 0 {
            return Ok(());
        }
        let base = if self.options.two_write_queues {
            self.seq.last_allocated()
        } else {
            self.seq.last_published()
        };
        batch.set_sequence(base + 1);
        let count = batch.count() as u64;
        let apply_options = WriteOptions {
            ignore_missing_column_families: true,
            ..Default::default()
        };
        let status = self.insert_batch_into_memtables(&batch, base + 1, false, 0, &apply_options);
        if status.is_err() {
            // Put it back for the next switch attempt.
            self.wal.lock().cached_recoverable_state = Some(batch);
            return status;
        }
        let last = base + count;
        if self.options.two_write_queues {
            self.seq.allocate(count);
        }
        self.seq.publish(last);

        let callback = self.recoverable_state_pre_release_callback.lock();
        if let Some(callback) = callback.as_ref() {
            for sub_batch_seq in (base + 1)..=last {
                // The callback may take locks of its own; drop the global
                // mutex around each invocation.
                let result = MutexGuard::unlocked(guard, || {
                    callback.callback(sub_batch_seq, false, 0, 0, 1)
                });
                result?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Memtable application
    // =========================================================================

    fn insert_group_into_memtables(
        &self,
        group: &WriteGroup,
        options: &WriteOptions,
    ) -> Result<()> {
        unsafe {
            for member in group.iter() {
                if !(*member).should_write_to_memtable() {
                    continue;
                }
                let batch = (*member).batch.as_ref().expect("group members carry batches");
                self.insert_batch_into_memtables(
                    batch,
                    (*member).sequence,
                    self.options.seq_per_batch,
                    (*member).batch_cnt,
                    options,
                )?;
            }
        }
        Ok(())
    }

    /// Apply one batch at its assigned base sequence. Under seq-per-batch
    /// every record shares the base; otherwise each mutation advances it.
    fn insert_batch_into_memtables(
        &self,
        batch: &WriteBatch,
        base_seq: SequenceNumber,
        seq_per_batch: bool,
        _batch_cnt: usize,
        options: &WriteOptions,
    ) -> Result<()> {
        let mut hint: HashMap<u32, Arc<ColumnFamily>> = HashMap::new();
        let mut seq = base_seq;
        for record in batch.iter() {
            let record = record?;
            if !record.op.is_mutation() {
                continue;
            }
            let cf = if options.memtable_insert_hint_per_batch {
                match hint.get(&record.cf_id) {
                    Some(cf) => Some(Arc::clone(cf)),
                    None => {
                        let cf = self.cfs.get(record.cf_id);
                        if let Some(cf) = &cf {
                            hint.insert(record.cf_id, Arc::clone(cf));
                        }
                        cf
                    }
                }
            } else {
                self.cfs.get(record.cf_id)
            };
            let Some(cf) = cf else {
                if options.ignore_missing_column_families {
                    if !seq_per_batch {
                        seq += 1;
                    }
                    continue;
                }
                return Err(EmberError::InvalidArgument(format!(
                    "invalid column family {} specified in write batch",
                    record.cf_id
                )));
            };

            let mem = cf.mem();
            let bytes = match record.op {
                BatchOp::Put { key, value } => mem.add_put(seq, key, value),
                BatchOp::Delete { key } => mem.add_delete(seq, key),
                BatchOp::SingleDelete { key } => mem.add_single_delete(seq, key),
                BatchOp::DeleteRange { begin, end } => mem.add_range_delete(seq, begin, end),
                BatchOp::Merge { key, operand } => mem.add_merge(seq, key, operand),
                BatchOp::BeginPrepare | BatchOp::Commit { .. } | BatchOp::Rollback { .. } => {
                    unreachable!("markers are not mutations")
                }
            };
            self.write_buffer_manager.reserve_mem(bytes as usize);

            if mem.should_schedule_flush() && mem.mark_flush_requested() {
                self.flush_scheduler.schedule_work(cf.id());
            }
            if cf.options().max_write_buffer_size_to_maintain > 0
                && cf.imm().history_len() > 0
            {
                self.trim_history_scheduler.schedule_work(cf.id());
            }

            if !seq_per_batch {
                seq += 1;
            }
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Best effort: push buffered WAL frames down before the handles
        // close. Durability still requires an explicit sync.
        let mut wal = self.wal.lock();
        if !wal.logs.is_empty() {
            let _ = wal.current_log_mut().writer.flush_buffer();
        }
    }
}
