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

//! Snapshot digest (manifest)
//!
//! Each host writes one digest per nonce once all of its local tasks are
//! terminal. The digest lists only files whose task completed; anything
//! else found on disk for that nonce is suspect.
//!
//! The file is JSON wrapped in an envelope carrying a CRC32 of the
//! serialized digest body. It is written with the write-fsync-rename
//! pattern, so a digest is either complete or absent.

use std::{
	fs::{self, File, OpenOptions},
	io::Write,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	error::FormatError,
	hashinator::HashinatorConfig,
	naming::digest_file_name,
	types::{HostId, PartitionId, SnapshotType, TableId},
};

pub const DIGEST_VERSION: u32 = 1;

/// One completed data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
	pub table: TableId,
	pub partition: PartitionId,
	pub host: HostId,
	pub file_name: String,
	pub row_count: u64,
	pub chunk_count: u32,
	/// End-of-file CRC32 stored in the data file trailer
	pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDigest {
	pub version: u32,
	pub nonce: String,
	pub host_id: HostId,
	#[serde(rename = "type")]
	pub snapshot_type: SnapshotType,
	pub created_at: DateTime<Utc>,
	pub catalog_id: String,
	/// Hashinator configuration captured at cycle start
	pub hashinator: HashinatorConfig,
	/// Tables the snapshot was asked to cover
	pub tables: Vec<TableId>,
	/// Command-log anchor, copied verbatim from the request
	pub truncation_anchor: Option<u64>,
	pub entries: Vec<ManifestEntry>,
}

impl SnapshotDigest {
	pub fn file_name(&self) -> String {
		digest_file_name(&self.nonce, self.host_id)
	}
}

#[derive(Serialize, Deserialize)]
struct DigestEnvelope {
	checksum: u32,
	digest: SnapshotDigest,
}

fn body_checksum(digest: &SnapshotDigest) -> Result<u32, FormatError> {
	Ok(crc32fast::hash(&serde_json::to_vec(digest)?))
}

/// Write a digest into `dir` using write-fsync-rename
///
/// Returns the final path.
pub fn write_digest(dir: impl AsRef<Path>, digest: &SnapshotDigest) -> Result<PathBuf, FormatError> {
	let dir = dir.as_ref();
	let final_path = dir.join(digest.file_name());
	let temp_path = dir.join(format!(".{}.tmp", digest.file_name()));

	let envelope = DigestEnvelope {
		checksum: body_checksum(digest)?,
		digest: digest.clone(),
	};
	let bytes = serde_json::to_vec_pretty(&envelope)?;

	let mut file = OpenOptions::new()
		.create(true)
		.truncate(true)
		.write(true)
		.open(&temp_path)?;
	file.write_all(&bytes)?;
	file.sync_all()?;
	drop(file);

	fs::rename(&temp_path, &final_path)?;
	File::open(dir)?.sync_all()?;

	Ok(final_path)
}

/// Read and checksum-verify a digest
pub fn read_digest(path: impl AsRef<Path>) -> Result<SnapshotDigest, FormatError> {
	let bytes = fs::read(path)?;
	let envelope: DigestEnvelope = serde_json::from_slice(&bytes)?;

	if envelope.digest.version != DIGEST_VERSION {
		return Err(FormatError::UnsupportedVersion(envelope.digest.version));
	}

	let computed = body_checksum(&envelope.digest)?;
	if computed != envelope.checksum {
		return Err(FormatError::DigestChecksumMismatch {
			stored: envelope.checksum,
			computed,
		});
	}

	Ok(envelope.digest)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn digest() -> SnapshotDigest {
		SnapshotDigest {
			version: DIGEST_VERSION,
			nonce: "testnonce".to_string(),
			host_id: 1,
			snapshot_type: SnapshotType::CommandLogTruncation,
			created_at: Utc::now(),
			catalog_id: "catalog-1".to_string(),
			hashinator: HashinatorConfig::elastic(6, 4),
			tables: vec!["P1".to_string()],
			truncation_anchor: Some(1_700_000_000_123),
			entries: vec![ManifestEntry {
				table: "P1".to_string(),
				partition: 0,
				host: 1,
				file_name: "testnonce-P1-p0-host_1.vpt".to_string(),
				row_count: 2,
				chunk_count: 1,
				checksum: 0xdead_beef,
			}],
		}
	}

	#[test]
	fn test_written_digest_reads_back() {
		let dir = tempfile::tempdir().unwrap();
		let original = digest();

		let path = write_digest(dir.path(), &original).unwrap();
		assert_eq!(path.file_name().unwrap(), "testnonce-host_1.digest");
		assert!(!dir.path().join(".testnonce-host_1.digest.tmp").exists());

		let read = read_digest(&path).unwrap();
		assert_eq!(read, original);
		assert_eq!(read.truncation_anchor, Some(1_700_000_000_123));
	}

	#[test]
	fn test_tampered_digest_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_digest(dir.path(), &digest()).unwrap();

		let text = fs::read_to_string(&path).unwrap();
		fs::write(&path, text.replace("\"row_count\": 2", "\"row_count\": 3")).unwrap();

		assert!(matches!(
			read_digest(&path),
			Err(FormatError::DigestChecksumMismatch { .. })
		));
	}

	#[test]
	fn test_garbage_digest_is_unreadable() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("x-host_0.digest");
		fs::write(&path, b"{ not json").unwrap();

		assert!(matches!(read_digest(&path), Err(FormatError::Json(_))));
	}
}
