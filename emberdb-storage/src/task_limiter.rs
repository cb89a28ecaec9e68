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

//! Concurrent task limiter
//!
//! A named counting semaphore over long-running background tasks, shared
//! between unrelated subsystems (flushes here, compactions elsewhere).
//! Throttling is expressed purely as "no token returned"; there is no
//! blocking acquire. Tokens decrement the outstanding count on drop.
//!
//! The cap uses relaxed ordering: it is set once near startup and rarely
//! touched again. The outstanding count is the contended word and stays
//! sequentially consistent on both the CAS increment and the drop-side
//! decrement.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

/// Counting semaphore with an adjustable cap and an optional bypass.
#[derive(Debug)]
pub struct ConcurrentTaskLimiter {
    name: String,
    /// Maximum outstanding tasks; negative means unbounded.
    max_outstanding: AtomicI64,
    outstanding: AtomicI32,
}

impl ConcurrentTaskLimiter {
    /// `limit < 0` creates an unbounded limiter.
    pub fn new(name: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            max_outstanding: AtomicI64::new(limit),
            outstanding: AtomicI32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the cap; negative lifts it entirely.
    pub fn set_max_outstanding_tasks(&self, limit: i64) {
        self.max_outstanding.store(limit, Ordering::Relaxed);
    }

    /// Equivalent to `set_max_outstanding_tasks(-1)`.
    pub fn reset_max_outstanding_tasks(&self) {
        self.max_outstanding.store(-1, Ordering::Relaxed);
    }

    pub fn outstanding_tasks(&self) -> i32 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Try to claim a slot. Returns a token iff `force`, the limiter is
    /// unbounded, or the outstanding count is below the cap. The returned
    /// token releases the slot when dropped.
    pub fn get_token(self: &Arc<Self>, force: bool) -> Option<TaskLimiterToken> {
        let limit = self.max_outstanding.load(Ordering::Relaxed);
        let mut tasks = self.outstanding.load(Ordering::Relaxed);
        while force || limit < 0 || (tasks as i64) < limit {
            match self.outstanding.compare_exchange_weak(
                tasks,
                tasks + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(TaskLimiterToken {
                        limiter: Arc::clone(self),
                    })
                }
                Err(observed) => tasks = observed,
            }
        }
        None
    }
}

impl Drop for ConcurrentTaskLimiter {
    fn drop(&mut self) {
        // Every token holds an Arc back to the limiter, so outstanding must
        // have drained by the time the last reference goes away.
        debug_assert_eq!(self.outstanding.load(Ordering::SeqCst), 0);
    }
}

/// Claim on one slot of a [`ConcurrentTaskLimiter`]. Dropping it releases
/// the slot.
#[derive(Debug)]
pub struct TaskLimiterToken {
    limiter: Arc<ConcurrentTaskLimiter>,
}

impl TaskLimiterToken {
    pub fn limiter(&self) -> &Arc<ConcurrentTaskLimiter> {
        &self.limiter
    }
}

impl Drop for TaskLimiterToken {
    fn drop(&mut self) {
        let prev = self.limiter.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1);
    }
}
