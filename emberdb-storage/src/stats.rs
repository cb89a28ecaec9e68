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

//! Write-path counters
//!
//! In-process metrics only; relaxed atomics updated from the hot path and a
//! consistent-enough snapshot for monitoring. Leaders account for their
//! followers, which is where `writes_done_by_other` comes from.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WriteStats {
    pub(crate) keys_written: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) writes_done_by_self: AtomicU64,
    pub(crate) writes_done_by_other: AtomicU64,
    pub(crate) writes_with_wal: AtomicU64,
    pub(crate) wal_bytes: AtomicU64,
    pub(crate) wal_files_synced: AtomicU64,
    pub(crate) write_stall_micros: AtomicU64,
}

impl WriteStats {
    pub(crate) fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            keys_written: self.keys_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            writes_done_by_self: self.writes_done_by_self.load(Ordering::Relaxed),
            writes_done_by_other: self.writes_done_by_other.load(Ordering::Relaxed),
            writes_with_wal: self.writes_with_wal.load(Ordering::Relaxed),
            wal_bytes: self.wal_bytes.load(Ordering::Relaxed),
            wal_files_synced: self.wal_files_synced.load(Ordering::Relaxed),
            write_stall_micros: self.write_stall_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriteStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatsSnapshot {
    pub keys_written: u64,
    pub bytes_written: u64,
    pub writes_done_by_self: u64,
    pub writes_done_by_other: u64,
    pub writes_with_wal: u64,
    pub wal_bytes: u64,
    pub wal_files_synced: u64,
    pub write_stall_micros: u64,
}
