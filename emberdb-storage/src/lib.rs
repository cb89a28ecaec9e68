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

//! EmberDB Storage Layer
//!
//! The write path of a log-structured merge engine: group-commit
//! coordination, WAL appends, memtable lifecycle, and the backpressure
//! machinery that keeps memory and log usage bounded.
//!
//! ## Write pipeline
//!
//! ```text
//! client ──► Writer ──► writer queue ──► leader election
//!                                           │
//!                         ┌─────────────────┤
//!                         ▼                 ▼
//!                   preprocess        followers park
//!                (rotate / stall)
//!                         │
//!                         ▼
//!                    WAL append ──► pre-release callbacks
//!                         │
//!                         ▼
//!                  memtable apply (serial or parallel fan-out)
//!                         │
//!                         ▼
//!                  publish last sequence, drain group
//! ```
//!
//! Reads, flush execution, and compaction live above this crate; it only
//! schedules their work and hands them named contracts (`FlushRequest`,
//! `MemtableList::mark_flushed`, `ConcurrentTaskLimiter`).

pub mod column_family;
pub mod db; // Write coordinator: default, pipelined, unordered, WAL-only
pub mod flush_scheduler;
pub mod memtable;
pub mod options;
pub mod sequence;
pub mod stats;
pub mod task_limiter; // Shared cap on parallel background work
pub mod wal;
pub mod write_batch;
pub mod write_buffer_manager;
pub mod write_controller; // Stall / delay / low-pri throttling
pub(crate) mod write_queue; // Lock-free writer list and batch groups

pub use column_family::{
    ColumnFamily, ColumnFamilySet, SuperVersion, DEFAULT_COLUMN_FAMILY_ID,
    DEFAULT_COLUMN_FAMILY_NAME,
};
pub use db::{
    BackgroundErrorReason, Db, EventListener, FlushReason, FlushRequest, MemtableInfo,
    PreReleaseCallback, WriteCallback, WriteMode, WriteTracer,
};
pub use emberdb_core::{EmberError, Result, SequenceNumber, MAX_SEQUENCE_NUMBER};
pub use memtable::{LookupResult, Memtable, MemtableList, MergeOperator};
pub use options::{CfOptions, DbOptions, WriteOptions};
pub use stats::{WriteStats, WriteStatsSnapshot};
pub use task_limiter::{ConcurrentTaskLimiter, TaskLimiterToken};
pub use wal::{log_file_path, read_log_records};
pub use write_batch::{BatchOp, BatchRecord, WriteBatch, BATCH_HEADER_SIZE};
pub use write_buffer_manager::WriteBufferManager;
pub use write_controller::{RateLimiter, WriteController};
