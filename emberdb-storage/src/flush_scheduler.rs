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

//! Flush and trim-history scheduling queues
//!
//! Memtable inserters enqueue a column family here the moment its active
//! memtable crosses its budget; the preprocessor drains the queue on the
//! next leader's watch, under the global mutex. Each family appears at most
//! once per queue — re-requests between drains are no-ops.
//!
//! The `is_empty` fast path is a plain atomic so the per-write check in the
//! preprocessor costs one load when nothing is pending.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<u32>,
    queued: HashSet<u32>,
}

#[derive(Debug, Default)]
pub struct FlushScheduler {
    inner: Mutex<QueueInner>,
    empty: AtomicBool,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            empty: AtomicBool::new(true),
        }
    }

    /// Request a memtable switch for `cf_id`. Duplicate requests before the
    /// next drain collapse into one.
    pub fn schedule_work(&self, cf_id: u32) {
        let mut inner = self.inner.lock();
        if inner.queued.insert(cf_id) {
            inner.queue.push_back(cf_id);
            self.empty.store(false, Ordering::Release);
        }
    }

    /// Pop the next column family in request order.
    pub fn take_next(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let next = inner.queue.pop_front();
        if let Some(cf_id) = next {
            inner.queued.remove(&cf_id);
        }
        if inner.queue.is_empty() {
            self.empty.store(true, Ordering::Release);
        }
        next
    }

    pub fn is_empty(&self) -> bool {
        self.empty.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.queued.clear();
        self.empty.store(true, Ordering::Release);
    }
}

/// Same queue discipline, but for dropping obsolete immutable-memtable
/// history rather than switching actives.
#[derive(Debug, Default)]
pub struct TrimHistoryScheduler {
    inner: FlushScheduler,
}

impl TrimHistoryScheduler {
    pub fn new() -> Self {
        Self {
            inner: FlushScheduler::new(),
        }
    }

    pub fn schedule_work(&self, cf_id: u32) {
        self.inner.schedule_work(cf_id);
    }

    pub fn take_next(&self) -> Option<u32> {
        self.inner.take_next()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
