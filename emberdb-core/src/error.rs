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

//! Error types for EmberDB
//!
//! Errors are values that travel through the write path: a single failed
//! writer inside a batch group carries its own error without aborting its
//! peers, and background errors are stored and replayed to subsequent
//! writers. All variants are therefore cheaply cloneable; I/O errors are
//! captured as their message rather than the non-cloneable `std::io::Error`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// Rejected before any queue interaction, typically an unsupported
    /// combination of write or DB options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation is not available in this configuration,
    /// e.g. `merge` on a column family without a merge operator.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// On-disk or in-flight data failed validation.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The operation could not run to completion, e.g. a write stall hit a
    /// writer that asked not to be slowed down.
    #[error("incomplete: {0}")]
    Incomplete(String),

    /// An underlying write, fsync, or directory sync failed.
    #[error("io error: {0}")]
    Io(String),

    /// The storage was fenced off by another instance. Terminal: no further
    /// writes will succeed.
    #[error("io fenced: {0}")]
    IoFenced(String),

    /// A resource is transiently held elsewhere; the caller may retry.
    #[error("busy: {0}")]
    Busy(String),

    /// The database is shutting down.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// The in-memory state diverged from what the WAL recorded. Always
    /// promoted to a background error.
    #[error("memtable apply diverged from log: {0}")]
    MemTable(String),
}

impl EmberError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, EmberError::Incomplete(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EmberError::Busy(_))
    }

    pub fn is_io_fenced(&self) -> bool {
        matches!(self, EmberError::IoFenced(_))
    }
}

impl From<io::Error> for EmberError {
    fn from(err: io::Error) -> Self {
        EmberError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EmberError>;
