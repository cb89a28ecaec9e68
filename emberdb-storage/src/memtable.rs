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

//! Memtables
//!
//! The mutable in-memory buffer each column family writes into, plus the
//! ordered list of sealed (immutable) memtables awaiting flush. Backed by a
//! lock-free skip list so batch-group followers can insert concurrently.
//!
//! Entries are keyed by `user_key ++ (MAX - seq)` big-endian, so versions of
//! one key sort newest-first and a point lookup is a short forward range
//! scan. Range tombstones live in a side table consulted on reads.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use emberdb_core::SequenceNumber;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// Internal key: user key plus the inverted sequence suffix. Small keys
/// stay inline, off the heap.
type InternalKey = SmallVec<[u8; 24]>;

/// Combines merge operands with an optional existing value. Families opened
/// without an operator reject `merge` writes outright.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// `operands` is ordered oldest to newest.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> Option<Vec<u8>>;
}

/// Fixed per-entry bookkeeping overhead used for approximate accounting.
const ENTRY_OVERHEAD: u64 = 32;

const FLUSH_NOT_REQUESTED: u8 = 0;
const FLUSH_REQUESTED: u8 = 1;
const FLUSH_SCHEDULED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MemValue {
    Put(Vec<u8>),
    Delete,
    SingleDelete,
    Merge(Vec<u8>),
}

#[derive(Debug, Clone)]
struct RangeTombstone {
    begin: Vec<u8>,
    end: Vec<u8>,
    seq: SequenceNumber,
}

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Key present with this value.
    Value(Vec<u8>),
    /// Key deleted at or below the read sequence.
    Deleted,
    /// Key not present in this memtable.
    NotFound,
}

pub struct Memtable {
    id: u64,
    map: SkipMap<InternalKey, MemValue>,
    range_dels: Mutex<Vec<RangeTombstone>>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    write_buffer_size: usize,

    /// Published sequence at the time this memtable became active.
    creation_seq: AtomicU64,
    /// Sequence of the first inserted record, 0 while empty.
    first_seq: AtomicU64,
    /// Lower bound on sequences this memtable may contain.
    earliest_seq: AtomicU64,
    /// Highest sequence inserted so far.
    largest_seq: AtomicU64,
    /// WAL that writes after this memtable sealed go to.
    next_log_number: AtomicU64,
    /// Sequence shared by every family sealed in one atomic-flush cycle.
    atomic_flush_seq: AtomicU64,

    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    data_size: AtomicU64,
    flush_state: AtomicU8,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("id", &self.id)
            .field("creation_seq", &self.creation_seq())
            .field("num_entries", &self.num_entries())
            .field("num_deletes", &self.num_deletes())
            .field("approximate_memory", &self.approximate_memory_usage())
            .finish()
    }
}

fn internal_key(user_key: &[u8], seq: SequenceNumber) -> InternalKey {
    let mut key = InternalKey::with_capacity(user_key.len() + 8);
    key.extend_from_slice(user_key);
    key.extend_from_slice(&(u64::MAX - seq).to_be_bytes());
    key
}

fn split_internal_key(internal: &[u8]) -> (&[u8], SequenceNumber) {
    let split = internal.len() - 8;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&internal[split..]);
    (&internal[..split], u64::MAX - u64::from_be_bytes(buf))
}

impl Memtable {
    pub fn new(
        id: u64,
        write_buffer_size: usize,
        creation_seq: SequenceNumber,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> Self {
        Self {
            id,
            map: SkipMap::new(),
            range_dels: Mutex::new(Vec::new()),
            merge_operator,
            write_buffer_size,
            creation_seq: AtomicU64::new(creation_seq),
            first_seq: AtomicU64::new(0),
            earliest_seq: AtomicU64::new(creation_seq),
            largest_seq: AtomicU64::new(0),
            next_log_number: AtomicU64::new(0),
            atomic_flush_seq: AtomicU64::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            flush_state: AtomicU8::new(FLUSH_NOT_REQUESTED),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // =========================================================================
    // Inserts (concurrent-safe)
    // =========================================================================

    /// Each insert returns the bytes charged against memory accounting.
    pub fn add_put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> u64 {
        self.map
            .insert(internal_key(key, seq), MemValue::Put(value.to_vec()));
        self.note_insert(seq, (key.len() + value.len()) as u64, false)
    }

    pub fn add_delete(&self, seq: SequenceNumber, key: &[u8]) -> u64 {
        self.map.insert(internal_key(key, seq), MemValue::Delete);
        self.note_insert(seq, key.len() as u64, true)
    }

    pub fn add_single_delete(&self, seq: SequenceNumber, key: &[u8]) -> u64 {
        self.map
            .insert(internal_key(key, seq), MemValue::SingleDelete);
        self.note_insert(seq, key.len() as u64, true)
    }

    pub fn add_merge(&self, seq: SequenceNumber, key: &[u8], operand: &[u8]) -> u64 {
        self.map
            .insert(internal_key(key, seq), MemValue::Merge(operand.to_vec()));
        self.note_insert(seq, (key.len() + operand.len()) as u64, false)
    }

    pub fn add_range_delete(&self, seq: SequenceNumber, begin: &[u8], end: &[u8]) -> u64 {
        self.range_dels.lock().push(RangeTombstone {
            begin: begin.to_vec(),
            end: end.to_vec(),
            seq,
        });
        self.note_insert(seq, (begin.len() + end.len()) as u64, true)
    }

    fn note_insert(&self, seq: SequenceNumber, payload: u64, is_delete: bool) -> u64 {
        self.first_seq
            .compare_exchange(0, seq, Ordering::AcqRel, Ordering::Relaxed)
            .ok();
        self.largest_seq.fetch_max(seq, Ordering::AcqRel);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        if is_delete {
            self.num_deletes.fetch_add(1, Ordering::Relaxed);
        }
        let charged = payload + ENTRY_OVERHEAD;
        self.data_size.fetch_add(charged, Ordering::Relaxed);
        charged
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Newest visible version of `key` at `read_seq`.
    pub fn get(&self, key: &[u8], read_seq: SequenceNumber) -> LookupResult {
        let cover_seq = {
            let tombstones = self.range_dels.lock();
            tombstones
                .iter()
                .filter(|t| {
                    t.seq <= read_seq && t.begin.as_slice() <= key && key < t.end.as_slice()
                })
                .map(|t| t.seq)
                .max()
                .unwrap_or(0)
        };

        let mut operands: Vec<Vec<u8>> = Vec::new();
        let start = internal_key(key, read_seq);
        for entry in self.map.range(start..) {
            let (user_key, seq) = split_internal_key(entry.key());
            if user_key != key {
                break;
            }
            debug_assert!(seq <= read_seq);
            if seq <= cover_seq {
                // Shadowed by a range tombstone newer than this version.
                return self.finish_merge(key, None, operands);
            }
            match entry.value() {
                MemValue::Put(value) => {
                    return self.finish_merge(key, Some(value.clone()), operands)
                }
                MemValue::Delete | MemValue::SingleDelete => {
                    return self.finish_merge(key, None, operands)
                }
                MemValue::Merge(operand) => operands.push(operand.clone()),
            }
        }
        if cover_seq > 0 || !operands.is_empty() {
            return self.finish_merge(key, None, operands);
        }
        LookupResult::NotFound
    }

    fn finish_merge(
        &self,
        key: &[u8],
        base: Option<Vec<u8>>,
        mut newest_first: Vec<Vec<u8>>,
    ) -> LookupResult {
        if newest_first.is_empty() {
            return match base {
                Some(value) => LookupResult::Value(value),
                None => LookupResult::Deleted,
            };
        }
        newest_first.reverse();
        let operands: Vec<&[u8]> = newest_first.iter().map(|v| v.as_slice()).collect();
        match &self.merge_operator {
            Some(op) => match op.full_merge(key, base.as_deref(), &operands) {
                Some(value) => LookupResult::Value(value),
                None => LookupResult::Deleted,
            },
            // Operand stream without an operator: surface the newest operand.
            None => LookupResult::Value(newest_first.pop().unwrap_or_default()),
        }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn is_empty(&self) -> bool {
        self.first_seq.load(Ordering::Acquire) == 0
    }

    pub fn creation_seq(&self) -> SequenceNumber {
        self.creation_seq.load(Ordering::Acquire)
    }

    pub fn set_creation_seq(&self, seq: SequenceNumber) {
        self.creation_seq.store(seq, Ordering::Release);
    }

    pub fn first_sequence(&self) -> SequenceNumber {
        self.first_seq.load(Ordering::Acquire)
    }

    pub fn earliest_sequence(&self) -> SequenceNumber {
        self.earliest_seq.load(Ordering::Acquire)
    }

    pub fn largest_sequence(&self) -> SequenceNumber {
        self.largest_seq.load(Ordering::Acquire)
    }

    pub fn next_log_number(&self) -> u64 {
        self.next_log_number.load(Ordering::Acquire)
    }

    pub fn set_next_log_number(&self, log: u64) {
        self.next_log_number.store(log, Ordering::Release);
    }

    pub fn atomic_flush_seq(&self) -> SequenceNumber {
        self.atomic_flush_seq.load(Ordering::Acquire)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.data_size.load(Ordering::Relaxed) as usize
    }

    /// Whether this memtable has outgrown its budget and nobody has
    /// requested a flush for it yet.
    pub fn should_schedule_flush(&self) -> bool {
        self.flush_state.load(Ordering::Acquire) == FLUSH_NOT_REQUESTED
            && self.approximate_memory_usage() >= self.write_buffer_size
    }

    /// Claim the flush request; only the first caller wins, so one oversized
    /// memtable schedules exactly one switch.
    pub fn mark_flush_requested(&self) -> bool {
        self.flush_state
            .compare_exchange(
                FLUSH_NOT_REQUESTED,
                FLUSH_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_flush_scheduled(&self) {
        self.flush_state.store(FLUSH_SCHEDULED, Ordering::Release);
    }
}

// =============================================================================
// Immutable memtable list
// =============================================================================

/// Sealed memtables of one column family, oldest first, plus the flushed
/// tail retained as history until the trim scheduler reclaims it.
#[derive(Debug, Default)]
pub struct MemtableList {
    unflushed: Vec<Arc<Memtable>>,
    history: Vec<Arc<Memtable>>,
    flush_requested: bool,
    max_history_bytes: usize,
}

impl MemtableList {
    pub fn new(max_history_bytes: usize) -> Self {
        Self {
            unflushed: Vec::new(),
            history: Vec::new(),
            flush_requested: false,
            max_history_bytes,
        }
    }

    pub fn add(&mut self, memtable: Arc<Memtable>) {
        self.unflushed.push(memtable);
    }

    pub fn num_not_flushed(&self) -> usize {
        self.unflushed.len()
    }

    pub fn memtables(&self) -> &[Arc<Memtable>] {
        &self.unflushed
    }

    /// Highest sequence present across the unflushed tables, 0 when empty.
    pub fn newest_sequence(&self) -> SequenceNumber {
        self.unflushed
            .iter()
            .map(|m| m.largest_sequence())
            .max()
            .unwrap_or(0)
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_requested
    }

    pub fn set_flush_requested(&mut self) {
        self.flush_requested = true;
    }

    pub fn assign_atomic_flush_seq(&mut self, seq: SequenceNumber) {
        for memtable in &self.unflushed {
            memtable
                .atomic_flush_seq
                .compare_exchange(0, seq, Ordering::AcqRel, Ordering::Relaxed)
                .ok();
        }
    }

    /// Contract for the external flush driver: once a memtable's contents
    /// are durably on disk, move it out of the unflushed set. The table is
    /// retained as history until trimmed.
    pub fn mark_flushed(&mut self, memtable_id: u64) -> Option<Arc<Memtable>> {
        let pos = self.unflushed.iter().position(|m| m.id() == memtable_id)?;
        let memtable = self.unflushed.remove(pos);
        self.history.push(Arc::clone(&memtable));
        if self.unflushed.is_empty() {
            self.flush_requested = false;
        }
        Some(memtable)
    }

    /// Drop flushed history until it fits the retention budget alongside the
    /// active memtable's usage. Returns whether anything was dropped.
    pub fn trim_history(&mut self, active_usage: usize) -> bool {
        if self.max_history_bytes == 0 {
            let trimmed = !self.history.is_empty();
            self.history.clear();
            return trimmed;
        }
        let mut trimmed = false;
        loop {
            let history_usage: usize = self
                .history
                .iter()
                .map(|m| m.approximate_memory_usage())
                .sum();
            if self.history.is_empty() || active_usage + history_usage <= self.max_history_bytes {
                break;
            }
            self.history.remove(0);
            trimmed = true;
        }
        trimmed
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn memtable() -> Memtable {
        Memtable::new(1, 1 << 20, 0, None)
    }

    #[test]
    fn test_put_get() {
        let mem = memtable();
        mem.add_put(1, b"k", b"v1");
        mem.add_put(5, b"k", b"v2");
        assert_eq!(mem.get(b"k", u64::MAX), LookupResult::Value(b"v2".to_vec()));
        assert_eq!(mem.get(b"k", 1), LookupResult::Value(b"v1".to_vec()));
        assert_eq!(mem.get(b"missing", u64::MAX), LookupResult::NotFound);
    }

    #[test]
    fn test_delete_shadows_put() {
        let mem = memtable();
        mem.add_put(1, b"k", b"v");
        mem.add_delete(2, b"k");
        assert_eq!(mem.get(b"k", u64::MAX), LookupResult::Deleted);
        assert_eq!(mem.get(b"k", 1), LookupResult::Value(b"v".to_vec()));
    }

    #[test]
    fn test_range_delete_covers_interval() {
        let mem = memtable();
        mem.add_put(1, b"apple", b"1");
        mem.add_put(2, b"berry", b"2");
        mem.add_put(3, b"cherry", b"3");
        mem.add_range_delete(4, b"b", b"c");
        assert_eq!(
            mem.get(b"apple", u64::MAX),
            LookupResult::Value(b"1".to_vec())
        );
        assert_eq!(mem.get(b"berry", u64::MAX), LookupResult::Deleted);
        assert_eq!(
            mem.get(b"cherry", u64::MAX),
            LookupResult::Value(b"3".to_vec())
        );
        // Reads below the tombstone's sequence still see the value.
        assert_eq!(mem.get(b"berry", 3), LookupResult::Value(b"2".to_vec()));
    }

    #[test]
    fn test_merge_folds_operands() {
        let mem = Memtable::new(1, 1 << 20, 0, Some(Arc::new(AppendOperator)));
        mem.add_put(1, b"k", b"a");
        mem.add_merge(2, b"k", b"b");
        mem.add_merge(3, b"k", b"c");
        assert_eq!(
            mem.get(b"k", u64::MAX),
            LookupResult::Value(b"abc".to_vec())
        );
    }

    #[test]
    fn test_counters() {
        let mem = memtable();
        assert!(mem.is_empty());
        mem.add_put(7, b"k", b"v");
        mem.add_delete(8, b"k");
        assert!(!mem.is_empty());
        assert_eq!(mem.first_sequence(), 7);
        assert_eq!(mem.largest_sequence(), 8);
        assert_eq!(mem.num_entries(), 2);
        assert_eq!(mem.num_deletes(), 1);
        assert!(mem.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_flush_request_claimed_once() {
        let mem = Memtable::new(1, 8, 0, None);
        mem.add_put(1, b"key", b"a value large enough to cross the tiny budget");
        assert!(mem.should_schedule_flush());
        assert!(mem.mark_flush_requested());
        assert!(!mem.mark_flush_requested());
        assert!(!mem.should_schedule_flush());
    }

    #[test]
    fn test_memtable_list_flush_lifecycle() {
        let mut list = MemtableList::new(0);
        let m1 = Arc::new(Memtable::new(1, 1 << 20, 0, None));
        m1.add_put(3, b"a", b"1");
        let m2 = Arc::new(Memtable::new(2, 1 << 20, 3, None));
        m2.add_put(9, b"b", b"2");
        list.add(m1);
        list.add(m2);
        list.set_flush_requested();
        assert_eq!(list.num_not_flushed(), 2);
        assert_eq!(list.newest_sequence(), 9);

        let flushed = list.mark_flushed(1).unwrap();
        assert_eq!(flushed.id(), 1);
        assert_eq!(list.num_not_flushed(), 1);
        assert!(list.flush_requested());
        list.mark_flushed(2).unwrap();
        assert!(list.mark_flushed(2).is_none());
        assert_eq!(list.num_not_flushed(), 0);
        assert!(!list.flush_requested());
        assert_eq!(list.history_len(), 2);

        assert!(list.trim_history(0));
        assert_eq!(list.history_len(), 0);
    }
}
