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

//! Column families and super-versions
//!
//! A column family is an independently rotated namespace: one active
//! memtable, an ordered list of sealed memtables, and the number of the
//! oldest WAL it still depends on.
//!
//! Readers never lock. Each family publishes a `SuperVersion` — an immutable
//! bundle of (active memtable, immutable list snapshot) — through an atomic
//! swap; the write path builds a fresh bundle under the global mutex and
//! installs it in O(1). Old super-versions stay alive as long as any reader
//! holds them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use emberdb_core::SequenceNumber;
use parking_lot::{Mutex, MutexGuard};

use crate::memtable::{Memtable, MemtableList, MergeOperator};
use crate::options::CfOptions;

/// Identifier of the default column family, always present.
pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;

/// Name of the default column family.
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// Name of the internal stats family used when stats persistence is on.
pub const PERSISTENT_STATS_COLUMN_FAMILY_NAME: &str = "__ember_stats__";

/// Immutable snapshot bundle handed to readers: the active memtable plus the
/// sealed list at one instant.
#[derive(Debug)]
pub struct SuperVersion {
    pub version_number: u64,
    pub memtable: Arc<Memtable>,
    pub immutables: Vec<Arc<Memtable>>,
}

pub struct ColumnFamily {
    id: u32,
    name: String,
    options: CfOptions,
    mem: ArcSwap<Memtable>,
    imm: Mutex<MemtableList>,
    /// Oldest WAL whose records this family still needs for recovery.
    log_number: AtomicU64,
    super_version: ArcSwap<SuperVersion>,
    super_version_number: AtomicU64,
    next_memtable_id: AtomicU64,
}

impl std::fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("log_number", &self.log_number())
            .finish()
    }
}

impl ColumnFamily {
    fn new(id: u32, name: String, options: CfOptions, creation_seq: SequenceNumber) -> Arc<Self> {
        let first_memtable = Arc::new(Memtable::new(
            1,
            options.write_buffer_size,
            creation_seq,
            options.merge_operator.clone(),
        ));
        let cf = Self {
            id,
            name,
            imm: Mutex::new(MemtableList::new(options.max_write_buffer_size_to_maintain)),
            options,
            mem: ArcSwap::from(Arc::clone(&first_memtable)),
            log_number: AtomicU64::new(0),
            super_version: ArcSwap::from_pointee(SuperVersion {
                version_number: 1,
                memtable: first_memtable,
                immutables: Vec::new(),
            }),
            super_version_number: AtomicU64::new(1),
            next_memtable_id: AtomicU64::new(2),
        };
        Arc::new(cf)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CfOptions {
        &self.options
    }

    pub fn merge_operator(&self) -> Option<&Arc<dyn MergeOperator>> {
        self.options.merge_operator.as_ref()
    }

    pub fn timestamp_size(&self) -> usize {
        self.options.timestamp_size
    }

    /// Current active memtable.
    pub fn mem(&self) -> Arc<Memtable> {
        self.mem.load_full()
    }

    /// Sealed memtables awaiting flush.
    pub fn imm(&self) -> MutexGuard<'_, MemtableList> {
        self.imm.lock()
    }

    pub fn log_number(&self) -> u64 {
        self.log_number.load(Ordering::Acquire)
    }

    pub fn set_log_number(&self, log: u64) {
        self.log_number.store(log, Ordering::Release);
    }

    /// Build the successor of the current active memtable. Does not install
    /// it; the memtable switch does that under the global mutex.
    pub fn construct_new_memtable(&self, creation_seq: SequenceNumber) -> Arc<Memtable> {
        let id = self.next_memtable_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Memtable::new(
            id,
            self.options.write_buffer_size,
            creation_seq,
            self.options.merge_operator.clone(),
        ))
    }

    /// Swap in a new active memtable. Caller holds the global mutex and has
    /// already moved the outgoing memtable to the immutable list.
    pub fn set_memtable(&self, memtable: Arc<Memtable>) {
        self.mem.store(memtable);
    }

    /// Publish a fresh super-version reflecting the current memtable and
    /// immutable list. Readers pick it up on their next load.
    pub fn install_super_version(&self) {
        let version_number = self.super_version_number.fetch_add(1, Ordering::AcqRel) + 1;
        let immutables = self.imm.lock().memtables().to_vec();
        self.super_version.store(Arc::new(SuperVersion {
            version_number,
            memtable: self.mem.load_full(),
            immutables,
        }));
    }

    pub fn super_version(&self) -> Arc<SuperVersion> {
        self.super_version.load_full()
    }

    pub fn super_version_number(&self) -> u64 {
        self.super_version_number.load(Ordering::Acquire)
    }
}

// =============================================================================
// Column family set
// =============================================================================

#[derive(Debug, Default)]
pub struct ColumnFamilySet {
    families: DashMap<u32, Arc<ColumnFamily>>,
    names: DashMap<String, u32>,
    next_id: AtomicU32,
}

impl ColumnFamilySet {
    pub fn new(default_cf_options: CfOptions) -> Self {
        let set = Self {
            families: DashMap::new(),
            names: DashMap::new(),
            next_id: AtomicU32::new(1),
        };
        set.insert(
            DEFAULT_COLUMN_FAMILY_ID,
            DEFAULT_COLUMN_FAMILY_NAME,
            default_cf_options,
            0,
        );
        set
    }

    fn insert(
        &self,
        id: u32,
        name: &str,
        options: CfOptions,
        creation_seq: SequenceNumber,
    ) -> Arc<ColumnFamily> {
        let cf = ColumnFamily::new(id, name.to_string(), options, creation_seq);
        self.families.insert(id, Arc::clone(&cf));
        self.names.insert(name.to_string(), id);
        cf
    }

    pub fn create(
        &self,
        name: &str,
        options: CfOptions,
        creation_seq: SequenceNumber,
        log_number: u64,
    ) -> Arc<ColumnFamily> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cf = self.insert(id, name, options, creation_seq);
        cf.set_log_number(log_number);
        cf
    }

    pub fn get(&self, id: u32) -> Option<Arc<ColumnFamily>> {
        self.families.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<ColumnFamily>> {
        self.names.get(name).and_then(|id| self.get(*id.value()))
    }

    pub fn default_cf(&self) -> Arc<ColumnFamily> {
        self.get(DEFAULT_COLUMN_FAMILY_ID)
            .expect("default column family always exists")
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// All families in id order. Preprocess walks this snapshot; creation
    /// during a walk is benign since new families start empty.
    pub fn all(&self) -> Vec<Arc<ColumnFamily>> {
        let mut families: Vec<_> = self
            .families
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        families.sort_by_key(|cf| cf.id());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_family_exists() {
        let set = ColumnFamilySet::new(CfOptions::default());
        assert_eq!(set.len(), 1);
        let default = set.default_cf();
        assert_eq!(default.id(), DEFAULT_COLUMN_FAMILY_ID);
        assert_eq!(default.name(), DEFAULT_COLUMN_FAMILY_NAME);
    }

    #[test]
    fn test_create_and_lookup() {
        let set = ColumnFamilySet::new(CfOptions::default());
        let events = set.create("events", CfOptions::default(), 5, 3);
        assert_eq!(events.log_number(), 3);
        assert_eq!(events.mem().creation_seq(), 5);
        assert_eq!(set.get_by_name("events").unwrap().id(), events.id());
        assert_eq!(set.all().len(), 2);
    }

    #[test]
    fn test_super_version_reflects_switch() {
        let set = ColumnFamilySet::new(CfOptions::default());
        let cf = set.default_cf();
        let sv1 = cf.super_version();
        assert_eq!(sv1.version_number, 1);
        assert!(sv1.immutables.is_empty());

        let old = cf.mem();
        old.add_put(1, b"k", b"v");
        let fresh = cf.construct_new_memtable(1);
        cf.imm().add(Arc::clone(&old));
        cf.set_memtable(Arc::clone(&fresh));
        cf.install_super_version();

        let sv2 = cf.super_version();
        assert_eq!(sv2.version_number, 2);
        assert_eq!(sv2.immutables.len(), 1);
        assert_eq!(sv2.memtable.id(), fresh.id());
        // Readers holding the old bundle still see the old state.
        assert_eq!(sv1.immutables.len(), 0);
    }
}
