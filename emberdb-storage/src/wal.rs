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

//! Write-ahead log files
//!
//! Each log is an append-only file of framed records:
//!
//! ```text
//! +------------+------------+------------------+
//! | len (4B)   | crc32 (4B) | payload (len B)  |
//! +------------+------------+------------------+
//! ```
//!
//! A reader stops at the first frame that is truncated, zero-length, or
//! fails its checksum — everything before a torn tail is trusted,
//! everything after is discarded. At most one log is active for appends at
//! a time; older logs stay on the alive list until every memtable they
//! cover has been flushed.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use emberdb_core::Result;

use crate::write_batch::WriteBatch;

/// Frame header: 4-byte length + 4-byte crc32.
const FRAME_HEADER_SIZE: usize = 8;

/// Path of log file `number` inside `dir`.
pub fn log_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.wal"))
}

/// Buffered appender over one log file.
pub struct LogWriter {
    number: u64,
    path: PathBuf,
    file: File,
    writer: BufWriter<File>,
    manual_flush: bool,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("number", &self.number)
            .field("path", &self.path)
            .finish()
    }
}

impl LogWriter {
    /// Create log `number` in `dir`. With `recycle_from`, the retired file
    /// is renamed into place so the allocation is reused. `preallocate`
    /// extends the file up front to keep appends from growing metadata.
    pub fn create(
        dir: &Path,
        number: u64,
        recycle_from: Option<u64>,
        preallocate: usize,
        manual_flush: bool,
    ) -> Result<Self> {
        let path = log_file_path(dir, number);
        if let Some(old_number) = recycle_from {
            let old_path = log_file_path(dir, old_number);
            fs::rename(&old_path, &path)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        if preallocate > 0 {
            file.set_len(preallocate as u64)?;
        }
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            number,
            path,
            file,
            writer,
            manual_flush,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one framed record, returning the on-disk size of the frame.
    /// Without manual flush the frame reaches the kernel before returning;
    /// durability still requires `sync`.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<u64> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(payload));
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        if !self.manual_flush {
            self.writer.flush()?;
        }
        Ok((FRAME_HEADER_SIZE + payload.len()) as u64)
    }

    /// Push buffered frames to the kernel without syncing.
    pub fn flush_buffer(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and make the file durable. `use_fsync` forces a full fsync
    /// instead of a data-only sync.
    pub fn sync(&mut self, use_fsync: bool) -> Result<()> {
        self.writer.flush()?;
        if use_fsync {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Fsync a directory so freshly created log files survive a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

/// Read every intact record of a log file, stopping at a torn or
/// zero-filled tail. Used by recovery and by tests that assert on durable
/// contents.
pub fn read_log_records(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    }

    let mut records = Vec::new();
    let mut pos = 0;
    while pos + FRAME_HEADER_SIZE <= data.len() {
        let len = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        let crc = LittleEndian::read_u32(&data[pos + 4..pos + 8]);
        if len == 0 {
            // Preallocated zero region: end of written frames.
            break;
        }
        let start = pos + FRAME_HEADER_SIZE;
        if start + len > data.len() {
            break;
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        records.push(payload.to_vec());
        pos = start + len;
    }
    Ok(records)
}

// =============================================================================
// Log bookkeeping
// =============================================================================

/// One entry of the open-log list: the writer plus its sync state.
#[derive(Debug)]
pub(crate) struct LogState {
    pub number: u64,
    pub writer: LogWriter,
    /// Claimed by an in-flight sync; preprocess waits for the front log to
    /// clear this before marking a new durability cycle.
    pub getting_synced: bool,
}

/// Size accounting for a WAL that may still be needed for recovery.
#[derive(Debug, Clone)]
pub(crate) struct LogFileNumberSize {
    pub number: u64,
    pub size: u64,
    /// The rotation path has already picked this log's memtables for flush.
    pub getting_flushed: bool,
}

impl LogFileNumberSize {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            size: 0,
            getting_flushed: false,
        }
    }
}

/// Everything guarded by the WAL-write mutex: the open logs, the alive-file
/// accounting, and rotation state.
#[derive(Debug)]
pub(crate) struct WalSet {
    pub dir: PathBuf,
    pub logs: VecDeque<LogState>,
    pub alive_log_files: VecDeque<LogFileNumberSize>,
    pub logfile_number: u64,
    pub log_empty: bool,
    pub log_dir_synced: bool,
    pub log_recycle_files: VecDeque<u64>,
    /// Newest batch flagged as the latest persistent engine state, captured
    /// at append time so a memtable switch can re-persist it before the WAL
    /// holding it retires.
    pub cached_recoverable_state: Option<WriteBatch>,
}

impl WalSet {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            logs: VecDeque::new(),
            alive_log_files: VecDeque::new(),
            logfile_number: 0,
            log_empty: true,
            log_dir_synced: false,
            log_recycle_files: VecDeque::new(),
            cached_recoverable_state: None,
        }
    }

    pub fn install_log(&mut self, writer: LogWriter) {
        let number = writer.number();
        self.logfile_number = number;
        self.log_empty = true;
        self.log_dir_synced = false;
        self.logs.push_back(LogState {
            number,
            writer,
            getting_synced: false,
        });
        self.alive_log_files.push_back(LogFileNumberSize::new(number));
    }

    pub fn current_log_mut(&mut self) -> &mut LogState {
        self.logs.back_mut().expect("an active log always exists")
    }

    /// Record `bytes` appended to the active log.
    pub fn note_append(&mut self, bytes: u64) {
        self.log_empty = false;
        if let Some(alive) = self.alive_log_files.back_mut() {
            alive.size += bytes;
        }
    }

    pub fn current_log_size(&self) -> u64 {
        self.alive_log_files.back().map(|l| l.size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut writer = LogWriter::create(dir.path(), 1, None, 0, false).unwrap();
        writer.add_record(b"first").unwrap();
        writer.add_record(b"second record").unwrap();
        writer.sync(false).unwrap();

        let records = read_log_records(&log_file_path(dir.path(), 1)).unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second record".to_vec()]);
    }

    #[test]
    fn test_reader_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let mut writer = LogWriter::create(dir.path(), 1, None, 0, false).unwrap();
        writer.add_record(b"intact").unwrap();
        writer.sync(false).unwrap();

        // Simulate a torn write: a frame header promising more bytes than
        // were persisted.
        let path = log_file_path(dir.path(), 1);
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"partial");
        fs::write(&path, &data).unwrap();

        let records = read_log_records(&path).unwrap();
        assert_eq!(records, vec![b"intact".to_vec()]);
    }

    #[test]
    fn test_reader_stops_at_bad_checksum() {
        let dir = tempdir().unwrap();
        let mut writer = LogWriter::create(dir.path(), 1, None, 0, false).unwrap();
        writer.add_record(b"good").unwrap();
        writer.add_record(b"flipped").unwrap();
        writer.sync(false).unwrap();

        let path = log_file_path(dir.path(), 1);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let records = read_log_records(&path).unwrap();
        assert_eq!(records, vec![b"good".to_vec()]);
    }

    #[test]
    fn test_preallocated_zeros_read_as_empty() {
        let dir = tempdir().unwrap();
        let mut writer = LogWriter::create(dir.path(), 1, None, 4096, false).unwrap();
        writer.add_record(b"only").unwrap();
        writer.sync(false).unwrap();

        let records = read_log_records(&log_file_path(dir.path(), 1)).unwrap();
        assert_eq!(records, vec![b"only".to_vec()]);
    }

    #[test]
    fn test_recycle_renames_old_file() {
        let dir = tempdir().unwrap();
        let mut old = LogWriter::create(dir.path(), 1, None, 0, false).unwrap();
        old.add_record(b"stale").unwrap();
        old.sync(false).unwrap();
        drop(old);

        let mut recycled = LogWriter::create(dir.path(), 2, Some(1), 0, false).unwrap();
        assert!(!log_file_path(dir.path(), 1).exists());
        recycled.add_record(b"fresh").unwrap();
        recycled.sync(false).unwrap();

        let records = read_log_records(&log_file_path(dir.path(), 2)).unwrap();
        assert_eq!(records, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_manual_flush_buffers_until_flushed() {
        let dir = tempdir().unwrap();
        let mut writer = LogWriter::create(dir.path(), 1, None, 0, true).unwrap();
        writer.add_record(b"buffered").unwrap();
        // Nothing observable until the buffer is pushed down.
        let records = read_log_records(&log_file_path(dir.path(), 1)).unwrap();
        assert!(records.is_empty());

        writer.flush_buffer().unwrap();
        let records = read_log_records(&log_file_path(dir.path(), 1)).unwrap();
        assert_eq!(records, vec![b"buffered".to_vec()]);
    }

    #[test]
    fn test_wal_set_bookkeeping() {
        let dir = tempdir().unwrap();
        let mut set = WalSet::new(dir.path().to_path_buf());
        let writer = LogWriter::create(dir.path(), 1, None, 0, false).unwrap();
        set.install_log(writer);
        assert_eq!(set.logfile_number, 1);
        assert!(set.log_empty);

        set.note_append(64);
        assert!(!set.log_empty);
        assert_eq!(set.current_log_size(), 64);

        let writer = LogWriter::create(dir.path(), 2, None, 0, false).unwrap();
        set.install_log(writer);
        assert_eq!(set.logfile_number, 2);
        assert!(set.log_empty);
        assert_eq!(set.logs.len(), 2);
        assert_eq!(set.alive_log_files.len(), 2);
    }
}
