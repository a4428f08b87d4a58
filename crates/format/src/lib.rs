// Copyright 2025 itscheems
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

//! Shardsnap Format - shared snapshot types and on-disk codecs
//!
//! This crate holds everything both the snapshot engine and the offline
//! verifier need to agree on:
//! - Request/status types exchanged with the coordinator
//! - Hashinator configuration captured into digests
//! - Deterministic file naming
//! - The data-file codec (header, checksummed chunks, trailer)
//! - The digest (manifest) codec
//!
//! The crate is deliberately passive:
//! - No background threads
//! - No runtime initialization
//! - No environment or configuration loading

pub mod datafile;
pub mod digest;
pub mod error;
pub mod hashinator;
pub mod naming;
pub mod types;

pub use datafile::{DataFileDefect, DataFileHeader, DataFileScan, Trailer, scan_data_file};
pub use digest::{ManifestEntry, SnapshotDigest, read_digest, write_digest};
pub use error::FormatError;
pub use hashinator::{HashinatorConfig, HashinatorScheme, TokenRange};
pub use naming::SnapshotFileName;
pub use types::*;
