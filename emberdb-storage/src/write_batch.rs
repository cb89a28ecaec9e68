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

//! Write batches
//!
//! A write batch is the unit handed to the write coordinator: an ordered,
//! immutable-after-submit sequence of mutation records sharing one base
//! sequence number.
//!
//! ## Wire format
//!
//! ```text
//! +----------------+-------------+------------------------------+
//! | base seq (8B)  | count (4B)  | records...                   |
//! +----------------+-------------+------------------------------+
//! record := tag (1B) | cf id (4B) | payload
//! payload (Put/Merge)    := klen (4B) | key | vlen (4B) | value
//! payload (Delete/Single):= klen (4B) | key
//! payload (DeleteRange)  := blen (4B) | begin | elen (4B) | end
//! payload (Commit/Rollback) := xlen (4B) | xid
//! payload (BeginPrepare) := empty
//! ```
//!
//! All integers little-endian. The 12-byte header is stamped with the
//! group's base sequence just before the batch (or the merged scratch batch)
//! reaches the log. `count` covers mutation records only; transaction
//! markers ride along without consuming sequence numbers.

use byteorder::{ByteOrder, LittleEndian};
use emberdb_core::{EmberError, Result, SequenceNumber};

/// Byte size of the batch header: 8-byte base sequence + 4-byte count.
pub const BATCH_HEADER_SIZE: usize = 12;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_SINGLE_DELETE: u8 = 3;
const TAG_DELETE_RANGE: u8 = 4;
const TAG_MERGE: u8 = 5;
const TAG_BEGIN_PREPARE: u8 = 6;
const TAG_COMMIT: u8 = 7;
const TAG_ROLLBACK: u8 = 8;

const FLAG_HAS_MERGE: u8 = 1 << 0;
const FLAG_HAS_COMMIT: u8 = 1 << 1;
const FLAG_HAS_ROLLBACK: u8 = 1 << 2;

/// One decoded record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
    SingleDelete { key: &'a [u8] },
    DeleteRange { begin: &'a [u8], end: &'a [u8] },
    Merge { key: &'a [u8], operand: &'a [u8] },
    BeginPrepare,
    Commit { xid: &'a [u8] },
    Rollback { xid: &'a [u8] },
}

impl BatchOp<'_> {
    /// Whether this record consumes a sequence number when applied.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            BatchOp::BeginPrepare | BatchOp::Commit { .. } | BatchOp::Rollback { .. }
        )
    }
}

/// A decoded record together with its target column family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord<'a> {
    pub cf_id: u32,
    pub op: BatchOp<'a>,
}

/// Offset + count snapshot used to truncate what reaches the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavePoint {
    offset: usize,
    count: u32,
}

/// An ordered group of mutations committed atomically under one base
/// sequence. Immutable once handed to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    data: Vec<u8>,
    content_flags: u8,
    wal_term_point: Option<SavePoint>,
    latest_persistent_state: bool,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-size the buffer; `reserved` excludes the fixed header.
    pub fn with_capacity(reserved: usize) -> Self {
        let mut data = Vec::with_capacity(BATCH_HEADER_SIZE + reserved);
        data.resize(BATCH_HEADER_SIZE, 0);
        Self {
            data,
            content_flags: 0,
            wal_term_point: None,
            latest_persistent_state: false,
        }
    }

    // =========================================================================
    // Record builders
    // =========================================================================

    pub fn put(&mut self, cf_id: u32, key: &[u8], value: &[u8]) {
        self.push_record(TAG_PUT, cf_id, &[key, value]);
        self.bump_count();
    }

    pub fn delete(&mut self, cf_id: u32, key: &[u8]) {
        self.push_record(TAG_DELETE, cf_id, &[key]);
        self.bump_count();
    }

    pub fn single_delete(&mut self, cf_id: u32, key: &[u8]) {
        self.push_record(TAG_SINGLE_DELETE, cf_id, &[key]);
        self.bump_count();
    }

    pub fn delete_range(&mut self, cf_id: u32, begin: &[u8], end: &[u8]) {
        self.push_record(TAG_DELETE_RANGE, cf_id, &[begin, end]);
        self.bump_count();
    }

    pub fn merge(&mut self, cf_id: u32, key: &[u8], operand: &[u8]) {
        self.push_record(TAG_MERGE, cf_id, &[key, operand]);
        self.content_flags |= FLAG_HAS_MERGE;
        self.bump_count();
    }

    /// Transaction markers share the record stream but consume no sequence.
    pub fn begin_prepare(&mut self) {
        self.push_record(TAG_BEGIN_PREPARE, 0, &[]);
    }

    pub fn commit(&mut self, xid: &[u8]) {
        self.push_record(TAG_COMMIT, 0, &[xid]);
        self.content_flags |= FLAG_HAS_COMMIT;
    }

    pub fn rollback(&mut self, xid: &[u8]) {
        self.push_record(TAG_ROLLBACK, 0, &[xid]);
        self.content_flags |= FLAG_HAS_ROLLBACK;
    }

    fn push_record(&mut self, tag: u8, cf_id: u32, fields: &[&[u8]]) {
        self.data.push(tag);
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, cf_id);
        self.data.extend_from_slice(&buf);
        for field in fields {
            LittleEndian::write_u32(&mut buf, field.len() as u32);
            self.data.extend_from_slice(&buf);
            self.data.extend_from_slice(field);
        }
    }

    fn bump_count(&mut self) {
        let count = self.count() + 1;
        LittleEndian::write_u32(&mut self.data[8..12], count);
    }

    // =========================================================================
    // Header
    // =========================================================================

    /// Number of sequence-consuming records.
    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[8..12])
    }

    pub fn sequence(&self) -> SequenceNumber {
        LittleEndian::read_u64(&self.data[0..8])
    }

    /// Stamp the base sequence. Every record is implicitly numbered
    /// `sequence + index_of_mutation`.
    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        LittleEndian::write_u64(&mut self.data[0..8], seq);
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == BATCH_HEADER_SIZE
    }

    /// Serialized contents, header included. This is exactly what reaches
    /// the log.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size without the header, used by the low-pri rate limiter.
    pub fn data_size(&self) -> usize {
        self.data.len() - BATCH_HEADER_SIZE
    }

    pub fn clear(&mut self) {
        self.data.truncate(BATCH_HEADER_SIZE);
        self.data[..BATCH_HEADER_SIZE].fill(0);
        self.content_flags = 0;
        self.wal_term_point = None;
        self.latest_persistent_state = false;
    }

    pub fn has_merge(&self) -> bool {
        self.content_flags & FLAG_HAS_MERGE != 0
    }

    pub fn has_commit(&self) -> bool {
        self.content_flags & FLAG_HAS_COMMIT != 0
    }

    pub fn has_rollback(&self) -> bool {
        self.content_flags & FLAG_HAS_ROLLBACK != 0
    }

    /// Mark this batch as carrying the latest recoverable engine state; the
    /// coordinator caches a copy at log-append time so a memtable switch can
    /// re-persist it.
    pub fn set_latest_persistent_state(&mut self, value: bool) {
        self.latest_persistent_state = value;
    }

    pub fn is_latest_persistent_state(&self) -> bool {
        self.latest_persistent_state
    }

    // =========================================================================
    // WAL termination point
    // =========================================================================

    /// Records appended after this call stay out of the WAL when the batch
    /// is merged for logging.
    pub fn mark_wal_termination_point(&mut self) {
        self.wal_term_point = Some(SavePoint {
            offset: self.data.len(),
            count: self.count(),
        });
    }

    pub fn has_wal_termination_point(&self) -> bool {
        self.wal_term_point.is_some()
    }

    // =========================================================================
    // Append / merge
    // =========================================================================

    /// Append another batch's records. With `wal_only`, the source batch is
    /// truncated at its WAL termination point first. Used by the leader to
    /// build the group's scratch batch.
    pub fn append_from(&mut self, other: &WriteBatch, wal_only: bool) {
        let (limit, count) = match (wal_only, other.wal_term_point) {
            (true, Some(sp)) => (sp.offset, sp.count),
            _ => (other.data.len(), other.count()),
        };
        self.data.extend_from_slice(&other.data[BATCH_HEADER_SIZE..limit]);
        let new_count = self.count() + count;
        LittleEndian::write_u32(&mut self.data[8..12], new_count);
        self.content_flags |= other.content_flags;
    }

    // =========================================================================
    // Timestamps
    // =========================================================================

    /// Append `ts` to every key of every mutation record. The coordinator
    /// validates the timestamp length against the column family before
    /// calling this.
    pub fn assign_timestamp(&mut self, ts: &[u8]) -> Result<()> {
        let mut rebuilt = WriteBatch::with_capacity(self.data.len());
        for record in self.iter() {
            let record = record?;
            match record.op {
                BatchOp::Put { key, value } => {
                    rebuilt.push_record(TAG_PUT, record.cf_id, &[&stamp(key, ts), value]);
                    rebuilt.bump_count();
                }
                BatchOp::Delete { key } => {
                    rebuilt.push_record(TAG_DELETE, record.cf_id, &[&stamp(key, ts)]);
                    rebuilt.bump_count();
                }
                BatchOp::SingleDelete { key } => {
                    rebuilt.push_record(TAG_SINGLE_DELETE, record.cf_id, &[&stamp(key, ts)]);
                    rebuilt.bump_count();
                }
                BatchOp::DeleteRange { begin, end } => {
                    rebuilt.push_record(
                        TAG_DELETE_RANGE,
                        record.cf_id,
                        &[&stamp(begin, ts), &stamp(end, ts)],
                    );
                    rebuilt.bump_count();
                }
                BatchOp::Merge { key, operand } => {
                    rebuilt.push_record(TAG_MERGE, record.cf_id, &[&stamp(key, ts), operand]);
                    rebuilt.bump_count();
                }
                BatchOp::BeginPrepare => rebuilt.push_record(TAG_BEGIN_PREPARE, 0, &[]),
                BatchOp::Commit { xid } => {
                    rebuilt.push_record(TAG_COMMIT, 0, &[xid]);
                    rebuilt.content_flags |= FLAG_HAS_COMMIT;
                }
                BatchOp::Rollback { xid } => {
                    rebuilt.push_record(TAG_ROLLBACK, 0, &[xid]);
                    rebuilt.content_flags |= FLAG_HAS_ROLLBACK;
                }
            }
        }
        rebuilt.content_flags |= self.content_flags;
        rebuilt.set_sequence(self.sequence());
        rebuilt.latest_persistent_state = self.latest_persistent_state;
        // A termination point cannot survive a key rewrite; batches that use
        // both stamp the timestamp first.
        debug_assert!(self.wal_term_point.is_none());
        *self = rebuilt;
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            data: &self.data,
            pos: BATCH_HEADER_SIZE,
        }
    }

    /// Reconstruct a batch from its serialized form, validating structure.
    pub fn from_data(data: &[u8]) -> Result<WriteBatch> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(EmberError::Corruption(format!(
                "batch shorter than header: {} bytes",
                data.len()
            )));
        }
        let batch = WriteBatch {
            data: data.to_vec(),
            content_flags: 0,
            wal_term_point: None,
            latest_persistent_state: false,
        };
        let mut flags = 0;
        let mut mutations = 0u32;
        for record in batch.iter() {
            let record = record?;
            match record.op {
                BatchOp::Merge { .. } => flags |= FLAG_HAS_MERGE,
                BatchOp::Commit { .. } => flags |= FLAG_HAS_COMMIT,
                BatchOp::Rollback { .. } => flags |= FLAG_HAS_ROLLBACK,
                _ => {}
            }
            if record.op.is_mutation() {
                mutations += 1;
            }
        }
        if mutations != batch.count() {
            return Err(EmberError::Corruption(format!(
                "batch count {} does not match {} decoded mutations",
                batch.count(),
                mutations
            )));
        }
        Ok(WriteBatch {
            content_flags: flags,
            ..batch
        })
    }
}

fn stamp(key: &[u8], ts: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + ts.len());
    out.extend_from_slice(key);
    out.extend_from_slice(ts);
    out
}

/// Streaming decoder over a batch's records.
pub struct BatchIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BatchIter<'a> {
    fn read_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(truncated());
        }
        let v = LittleEndian::read_u32(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn read_field(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if self.pos + len > self.data.len() {
            return Err(truncated());
        }
        let field = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(field)
    }
}

fn truncated() -> EmberError {
    EmberError::Corruption("truncated batch record".into())
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let tag = self.data[self.pos];
        self.pos += 1;
        let result = (|| {
            let cf_id = self.read_u32()?;
            let op = match tag {
                TAG_PUT => BatchOp::Put {
                    key: self.read_field()?,
                    value: self.read_field()?,
                },
                TAG_DELETE => BatchOp::Delete {
                    key: self.read_field()?,
                },
                TAG_SINGLE_DELETE => BatchOp::SingleDelete {
                    key: self.read_field()?,
                },
                TAG_DELETE_RANGE => BatchOp::DeleteRange {
                    begin: self.read_field()?,
                    end: self.read_field()?,
                },
                TAG_MERGE => BatchOp::Merge {
                    key: self.read_field()?,
                    operand: self.read_field()?,
                },
                TAG_BEGIN_PREPARE => BatchOp::BeginPrepare,
                TAG_COMMIT => BatchOp::Commit {
                    xid: self.read_field()?,
                },
                TAG_ROLLBACK => BatchOp::Rollback {
                    xid: self.read_field()?,
                },
                other => {
                    return Err(EmberError::Corruption(format!(
                        "unknown batch record tag {other}"
                    )))
                }
            };
            Ok(BatchRecord { cf_id, op })
        })();
        if result.is_err() {
            // Poison the iterator so a corrupt record surfaces exactly once.
            self.pos = self.data.len();
        }
        Some(result)
    }
}
