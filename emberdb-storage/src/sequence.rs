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

//! Sequence allocation
//!
//! Two counters drive mutation ordering:
//!
//! - **last allocated**: sequences reserved for writes in flight. Only the
//!   two-queue paths advance it directly (under the WAL-write mutex, so WAL
//!   record order equals sequence order across both queues).
//! - **last published**: the newest sequence visible to readers, advanced
//!   after the in-memory apply completes.
//!
//! `last_published <= last_allocated` holds at every instant; publishing
//! raises both so the single-queue mode, which never reserves ahead, keeps
//! the counters coincident.

use std::sync::atomic::{AtomicU64, Ordering};

use emberdb_core::SequenceNumber;

#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last_allocated: AtomicU64,
    last_published: AtomicU64,
}

impl SequenceAllocator {
    pub fn new(start: SequenceNumber) -> Self {
        Self {
            last_allocated: AtomicU64::new(start),
            last_published: AtomicU64::new(start),
        }
    }

    /// Reserve `n` sequences, returning the value before the reservation.
    /// The reserved range is `prior + 1 ..= prior + n`.
    pub fn allocate(&self, n: u64) -> SequenceNumber {
        self.last_allocated.fetch_add(n, Ordering::SeqCst)
    }

    pub fn last_allocated(&self) -> SequenceNumber {
        self.last_allocated.load(Ordering::Acquire)
    }

    /// Make everything up to `seq` visible to readers. Never moves either
    /// counter backwards.
    pub fn publish(&self, seq: SequenceNumber) {
        self.last_allocated.fetch_max(seq, Ordering::SeqCst);
        self.last_published.fetch_max(seq, Ordering::SeqCst);
    }

    pub fn last_published(&self) -> SequenceNumber {
        self.last_published.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_returns_prior() {
        let seq = SequenceAllocator::new(0);
        assert_eq!(seq.allocate(3), 0);
        assert_eq!(seq.allocate(2), 3);
        assert_eq!(seq.last_allocated(), 5);
        assert_eq!(seq.last_published(), 0);
    }

    #[test]
    fn test_publish_never_moves_backwards() {
        let seq = SequenceAllocator::new(0);
        seq.publish(10);
        seq.publish(4);
        assert_eq!(seq.last_published(), 10);
        assert_eq!(seq.last_allocated(), 10);
    }

    #[test]
    fn test_publish_raises_allocated() {
        let seq = SequenceAllocator::new(0);
        seq.publish(7);
        assert!(seq.last_published() <= seq.last_allocated());
        assert_eq!(seq.last_allocated(), 7);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let seq = Arc::new(SequenceAllocator::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(thread::spawn(move || {
                let mut ranges = Vec::new();
                for _ in 0..500 {
                    let base = seq.allocate(3);
                    ranges.push((base + 1, base + 3));
                }
                ranges
            }));
        }
        let mut all: Vec<(u64, u64)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(pair[0].1 < pair[1].0, "ranges overlap: {pair:?}");
        }
        assert_eq!(seq.last_allocated(), 8 * 500 * 3);
    }
}
