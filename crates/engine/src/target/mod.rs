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

mod fault;

use std::{
	fs::{File, OpenOptions},
	io::{self, Write},
	path::{Path, PathBuf},
	sync::Arc,
};

use shardsnap_format::{
	DataFileHeader, FormatError, Row, Trailer,
	datafile::{encode_chunk, encode_header, encode_trailer},
};
use thiserror::Error;
use tracing::{debug, warn};

pub use fault::{InjectedFaults, NoFaults, WriteFaultPolicy};

/// Error types for data file writes
#[derive(Debug, Error)]
pub enum TargetError {
	#[error("I/O failure writing {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("Encoding failed: {0}")]
	Encode(#[from] FormatError),
	#[error("Header already written")]
	HeaderAlreadyWritten,
	#[error("Header not written yet")]
	HeaderMissing,
	#[error("An earlier write failed; the file stays unfinalized")]
	AlreadyFailed,
}

/// What a cleanly closed data file contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSummary {
	pub file_name: String,
	pub chunk_count: u32,
	pub row_count: u64,
	/// CRC32 of every byte before the trailer
	pub checksum: u32,
}

/// Writer for one snapshot data file
///
/// Records go out strictly in order: header, chunks, trailer. Each record
/// is assembled in memory and written with a single `write_all`, then
/// synced before the next record starts.
///
/// The first failed write poisons the target. Nothing is truncated or
/// rewritten afterwards; the file keeps the header and whole chunks that
/// made it, and `close` refuses to add a trailer.
pub struct SnapshotDataTarget {
	path: PathBuf,
	file_name: String,
	file: File,
	faults: Arc<dyn WriteFaultPolicy>,
	sync_each_chunk: bool,
	header: Option<DataFileHeader>,
	hasher: crc32fast::Hasher,
	chunk_count: u32,
	row_count: u64,
	failed: bool,
}

impl SnapshotDataTarget {
	/// Create `dir/file_name`; an existing file is never reused
	pub fn create(
		dir: &Path,
		file_name: &str,
		faults: Arc<dyn WriteFaultPolicy>,
		sync_each_chunk: bool,
	) -> Result<Self, TargetError> {
		let path = dir.join(file_name);
		let file = OpenOptions::new()
			.create_new(true)
			.write(true)
			.open(&path)
			.map_err(|source| TargetError::Io {
				path: path.clone(),
				source,
			})?;

		Ok(Self {
			path,
			file_name: file_name.to_string(),
			file,
			faults,
			sync_each_chunk,
			header: None,
			hasher: crc32fast::Hasher::new(),
			chunk_count: 0,
			row_count: 0,
			failed: false,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn chunk_count(&self) -> u32 {
		self.chunk_count
	}

	pub fn write_header(&mut self, header: DataFileHeader) -> Result<(), TargetError> {
		if self.failed {
			return Err(TargetError::AlreadyFailed);
		}
		if self.header.is_some() {
			return Err(TargetError::HeaderAlreadyWritten);
		}

		if self.faults.fail_header(&header) {
			return Err(self.fail(simulated_full_disk("header")));
		}

		let bytes = encode_header(&header).inspect_err(|_| self.failed = true)?;
		self.append(&bytes)?;
		self.header = Some(header);
		Ok(())
	}

	pub fn write_chunk(&mut self, rows: &[Row]) -> Result<(), TargetError> {
		if self.failed {
			return Err(TargetError::AlreadyFailed);
		}
		let Some(header) = self.header.as_ref() else {
			return Err(TargetError::HeaderMissing);
		};

		if self.faults.fail_chunk(header, self.chunk_count) {
			return Err(self.fail(simulated_full_disk("chunk")));
		}

		let bytes = encode_chunk(rows).inspect_err(|_| self.failed = true)?;
		self.append(&bytes)?;
		self.chunk_count += 1;
		self.row_count += rows.len() as u64;
		Ok(())
	}

	/// Append the end-of-file checksum
	///
	/// Only a target whose every write succeeded gets finalized.
	pub fn close(mut self) -> Result<TargetSummary, TargetError> {
		if self.failed {
			warn!(
				target: "target",
				file = %self.file_name,
				chunks = self.chunk_count,
				"Leaving data file unfinalized after failed write"
			);
			return Err(TargetError::AlreadyFailed);
		}
		if self.header.is_none() {
			return Err(TargetError::HeaderMissing);
		}

		let checksum = self.hasher.clone().finalize();
		let trailer = Trailer {
			chunk_count: self.chunk_count,
			row_count: self.row_count,
			file_checksum: checksum,
		};
		self.append(&encode_trailer(&trailer))?;
		self.file.sync_all().map_err(|e| self.fail(e))?;

		debug!(
			target: "target",
			file = %self.file_name,
			chunks = self.chunk_count,
			rows = self.row_count,
			checksum = checksum,
			"Data file finalized"
		);

		Ok(TargetSummary {
			file_name: self.file_name,
			chunk_count: self.chunk_count,
			row_count: self.row_count,
			checksum,
		})
	}

	fn append(&mut self, bytes: &[u8]) -> Result<(), TargetError> {
		self.file.write_all(bytes).map_err(|e| self.fail(e))?;
		if self.sync_each_chunk {
			self.file.sync_data().map_err(|e| self.fail(e))?;
		}
		self.hasher.update(bytes);
		Ok(())
	}

	fn fail(&mut self, source: io::Error) -> TargetError {
		self.failed = true;
		TargetError::Io {
			path: self.path.clone(),
			source,
		}
	}
}

fn simulated_full_disk(record: &str) -> io::Error {
	io::Error::new(
		io::ErrorKind::StorageFull,
		format!("no space left on device (injected while writing {})", record),
	)
}
