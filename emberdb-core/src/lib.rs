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

//! EmberDB Core
//!
//! Fundamental types shared across the EmberDB crates: the error enum, the
//! crate-wide `Result` alias, and the sequence-number type that stamps every
//! mutation flowing through the write path.

pub mod error;

pub use error::{EmberError, Result};

/// Dense, strictly increasing 64-bit identifier assigned to every mutation.
///
/// Sequence 0 is reserved as "no sequence"; the first write receives 1.
pub type SequenceNumber = u64;

/// Largest representable sequence number, used as a sentinel for "unassigned".
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = u64::MAX;
