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

//! Write buffer manager
//!
//! Aggregate memory accounting across every column family's memtables. When
//! the pool crosses its budget the preprocessor picks a victim family (the
//! one whose active memtable is oldest by creation sequence) and rotates it.
//! A zero budget disables the shared accounting entirely; per-family
//! `write_buffer_size` limits still apply.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct WriteBufferManager {
    buffer_size: usize,
    memory_used: AtomicUsize,
    /// Memory owned by memtables already sealed and awaiting flush; it
    /// cannot be reclaimed by another switch, so it is exempt from the
    /// should-flush trigger.
    memory_inactive: AtomicUsize,
}

impl WriteBufferManager {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            memory_used: AtomicUsize::new(0),
            memory_inactive: AtomicUsize::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.buffer_size > 0
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_used.load(Ordering::Relaxed)
    }

    pub fn reserve_mem(&self, bytes: usize) {
        self.memory_used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Move `bytes` from the active pool to the sealed pool.
    pub fn schedule_free_mem(&self, bytes: usize) {
        self.memory_inactive.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Release `bytes` entirely, e.g. after a flush completes.
    pub fn free_mem(&self, bytes: usize) {
        let inactive = self.memory_inactive.load(Ordering::Relaxed);
        let sub = bytes.min(inactive);
        if sub > 0 {
            self.memory_inactive.fetch_sub(sub, Ordering::Relaxed);
        }
        self.memory_used.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Whether the preprocessor should rotate a memtable to shed memory.
    /// Mutable (not yet sealed) usage past the budget is what matters;
    /// memory already scheduled for flush will drain on its own.
    pub fn should_flush(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        let used = self.memory_used.load(Ordering::Relaxed);
        let inactive = self.memory_inactive.load(Ordering::Relaxed);
        used.saturating_sub(inactive) >= self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_flushes() {
        let manager = WriteBufferManager::new(0);
        manager.reserve_mem(usize::MAX / 2);
        assert!(!manager.enabled());
        assert!(!manager.should_flush());
    }

    #[test]
    fn test_budget_triggers_flush() {
        let manager = WriteBufferManager::new(1024);
        manager.reserve_mem(512);
        assert!(!manager.should_flush());
        manager.reserve_mem(512);
        assert!(manager.should_flush());
    }

    #[test]
    fn test_sealed_memory_is_exempt() {
        let manager = WriteBufferManager::new(1024);
        manager.reserve_mem(2048);
        assert!(manager.should_flush());
        manager.schedule_free_mem(2048);
        assert!(!manager.should_flush());
        assert_eq!(manager.memory_usage(), 2048);
        manager.free_mem(2048);
        assert_eq!(manager.memory_usage(), 0);
    }
}
