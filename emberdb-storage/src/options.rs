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

//! Write-path configuration
//!
//! Two layers of knobs: `DbOptions` fixes the shape of the write pipeline at
//! open time (queueing mode, WAL policy, buffer budgets), while
//! `WriteOptions` travels with each individual write. Incompatible
//! combinations are rejected by the coordinator before a writer joins the
//! queue, never silently ignored.

use std::sync::Arc;

use crate::task_limiter::ConcurrentTaskLimiter;
use crate::write_buffer_manager::WriteBufferManager;

/// Default per-memtable budget before a flush is scheduled (64 MB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Default ceiling for one batch group (1 MiB). The queue grows or shrinks
/// the effective budget around this base depending on recent group sizes and
/// queue pressure.
pub const DEFAULT_MAX_WRITE_BATCH_GROUP_SIZE_BYTES: u64 = 1024 * 1024;

/// Options that travel with a single `write` call.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fsync the WAL (and, once per durability cycle, its directory) before
    /// acknowledging the write. Incompatible with `disable_wal`.
    pub sync: bool,
    /// Skip the WAL entirely; the write exists only in the memtable and is
    /// lost on crash.
    pub disable_wal: bool,
    /// Apply records for unknown column families as no-ops instead of
    /// failing the whole batch.
    pub ignore_missing_column_families: bool,
    /// Fail immediately with `Incomplete("Write stall")` instead of waiting
    /// when the write path is stalled or throttled.
    pub no_slowdown: bool,
    /// Mark the write as low priority: it yields to compaction pressure via
    /// the write controller's low-pri rate limiter.
    pub low_pri: bool,
    /// Let the in-memory inserter keep per-batch insert state to speed up
    /// repeated inserts into the same column family.
    pub memtable_insert_hint_per_batch: bool,
    /// User-supplied timestamp appended to every key of the batch. Its length
    /// must equal the column family's configured timestamp size.
    pub timestamp: Option<Vec<u8>>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_disable_wal(mut self, disable_wal: bool) -> Self {
        self.disable_wal = disable_wal;
        self
    }

    pub fn with_no_slowdown(mut self, no_slowdown: bool) -> Self {
        self.no_slowdown = no_slowdown;
        self
    }

    pub fn with_low_pri(mut self, low_pri: bool) -> Self {
        self.low_pri = low_pri;
        self
    }
}

/// Per-column-family configuration.
#[derive(Clone)]
pub struct CfOptions {
    /// Size of the active memtable before it is rotated out.
    pub write_buffer_size: usize,
    /// Operator used to combine merge operands; `merge` calls fail with
    /// `NotSupported` when absent.
    pub merge_operator: Option<Arc<dyn crate::memtable::MergeOperator>>,
    /// Length in bytes of user timestamps suffixed to keys, 0 to disable.
    pub timestamp_size: usize,
    /// Bytes of flushed memtable history to retain for the trim scheduler.
    pub max_write_buffer_size_to_maintain: usize,
}

impl std::fmt::Debug for CfOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfOptions")
            .field("write_buffer_size", &self.write_buffer_size)
            .field("merge_operator", &self.merge_operator.is_some())
            .field("timestamp_size", &self.timestamp_size)
            .field(
                "max_write_buffer_size_to_maintain",
                &self.max_write_buffer_size_to_maintain,
            )
            .finish()
    }
}

impl Default for CfOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            merge_operator: None,
            timestamp_size: 0,
            max_write_buffer_size_to_maintain: 0,
        }
    }
}

impl CfOptions {
    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_merge_operator(
        mut self,
        operator: Arc<dyn crate::memtable::MergeOperator>,
    ) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    pub fn with_timestamp_size(mut self, bytes: usize) -> Self {
        self.timestamp_size = bytes;
        self
    }
}

/// Database-wide options that shape the write path. Fixed at open.
#[derive(Clone)]
pub struct DbOptions {
    /// Let batch-group followers apply their own batches to memtables in
    /// parallel with the leader.
    pub allow_concurrent_memtable_write: bool,
    /// Split leadership into a WAL phase and a memtable phase so a new
    /// group can start logging while the previous one is still applying.
    pub enable_pipelined_write: bool,
    /// Publish sequences right after the WAL write and apply to memtables
    /// asynchronously. Trades read-your-write visibility for WAL throughput.
    pub unordered_write: bool,
    /// Run a second writer queue for WAL-only batches (e.g. two-phase-commit
    /// prepares) that never touch memtables.
    pub two_write_queues: bool,
    /// Buffer WAL appends until `flush_wal` is called explicitly.
    pub manual_wal_flush: bool,
    /// Promote unexpected write errors to background errors that fail all
    /// subsequent writes fast.
    pub paranoid_checks: bool,
    /// Rotate every non-empty column family together when a flush is needed.
    pub atomic_flush: bool,
    /// Assign one sequence per sub-batch instead of one per record.
    pub seq_per_batch: bool,
    /// Total WAL bytes allowed before the oldest log forces a memtable
    /// switch. 0 derives the threshold from the memtable budgets.
    pub max_total_wal_size: u64,
    /// Aggregate memtable budget across all column families; 0 disables the
    /// shared accounting. Ignored when an explicit manager is supplied.
    pub db_write_buffer_size: usize,
    /// Share one memory accountant across several databases. Overrides
    /// `db_write_buffer_size`.
    pub write_buffer_manager: Option<Arc<WriteBufferManager>>,
    /// Number of retired WAL files kept around for recycling instead of
    /// being deleted.
    pub recycle_log_file_num: usize,
    /// Use `fsync` instead of `fdatasync` when syncing log files.
    pub use_fsync: bool,
    /// Force the internal stats column family into flush picks so its log
    /// never pins the WAL.
    pub persist_stats_to_disk: bool,
    /// Base byte budget for a single batch group.
    pub max_write_batch_group_size_bytes: u64,
    /// Limiter shared with background work; flush requests carry a token
    /// when one is configured.
    pub flush_task_limiter: Option<Arc<ConcurrentTaskLimiter>>,
    /// Column families to create at open, in addition to the default one.
    pub column_families: Vec<(String, CfOptions)>,
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field(
                "allow_concurrent_memtable_write",
                &self.allow_concurrent_memtable_write,
            )
            .field("enable_pipelined_write", &self.enable_pipelined_write)
            .field("unordered_write", &self.unordered_write)
            .field("two_write_queues", &self.two_write_queues)
            .field("manual_wal_flush", &self.manual_wal_flush)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("atomic_flush", &self.atomic_flush)
            .field("seq_per_batch", &self.seq_per_batch)
            .field("max_total_wal_size", &self.max_total_wal_size)
            .field("db_write_buffer_size", &self.db_write_buffer_size)
            .field("write_buffer_manager", &self.write_buffer_manager.is_some())
            .field("recycle_log_file_num", &self.recycle_log_file_num)
            .field("use_fsync", &self.use_fsync)
            .field("persist_stats_to_disk", &self.persist_stats_to_disk)
            .field(
                "max_write_batch_group_size_bytes",
                &self.max_write_batch_group_size_bytes,
            )
            .field("column_families", &self.column_families)
            .finish()
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            allow_concurrent_memtable_write: true,
            enable_pipelined_write: false,
            unordered_write: false,
            two_write_queues: false,
            manual_wal_flush: false,
            paranoid_checks: true,
            atomic_flush: false,
            seq_per_batch: false,
            max_total_wal_size: 0,
            db_write_buffer_size: 0,
            write_buffer_manager: None,
            recycle_log_file_num: 0,
            use_fsync: false,
            persist_stats_to_disk: false,
            max_write_batch_group_size_bytes: DEFAULT_MAX_WRITE_BATCH_GROUP_SIZE_BYTES,
            flush_task_limiter: None,
            column_families: Vec::new(),
        }
    }
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipelined_write(mut self, enabled: bool) -> Self {
        self.enable_pipelined_write = enabled;
        self
    }

    pub fn with_unordered_write(mut self, enabled: bool) -> Self {
        self.unordered_write = enabled;
        self
    }

    pub fn with_two_write_queues(mut self, enabled: bool) -> Self {
        self.two_write_queues = enabled;
        self
    }

    pub fn with_max_total_wal_size(mut self, bytes: u64) -> Self {
        self.max_total_wal_size = bytes;
        self
    }

    pub fn with_column_family(mut self, name: impl Into<String>, opts: CfOptions) -> Self {
        self.column_families.push((name.into(), opts));
        self
    }
}
