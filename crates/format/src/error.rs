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

use thiserror::Error;

/// Error types for encoding and decoding snapshot files
#[derive(Debug, Error)]
pub enum FormatError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Malformed JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("Invalid name: {0}")]
	InvalidName(String),
	#[error("Unsupported format version: {0}")]
	UnsupportedVersion(u32),
	#[error("Digest checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
	DigestChecksumMismatch { stored: u32, computed: u32 },
	#[error("Corrupt data file: {0}")]
	CorruptDataFile(String),
	#[error("Record too large: {0} bytes")]
	RecordTooLarge(usize),
}
