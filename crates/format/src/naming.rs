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

//! Deterministic snapshot file names
//!
//! - data file: `<nonce>-<table>-p<partition>-host_<host>.vpt`
//! - digest:    `<nonce>-host_<host>.digest`
//!
//! Nonces and table names never contain `-`, so names split unambiguously
//! and the verifier can rebuild a manifest from a directory listing alone.

use crate::{
	error::FormatError,
	types::{HostId, PartitionId, TableId},
};

pub const DATA_FILE_EXTENSION: &str = "vpt";
pub const DIGEST_FILE_EXTENSION: &str = "digest";

const FORBIDDEN_NONCE_CHARS: [char; 4] = ['-', ',', '/', '\\'];

/// A parsed snapshot file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotFileName {
	Data {
		nonce: String,
		table: TableId,
		partition: PartitionId,
		host: HostId,
	},
	Digest {
		nonce: String,
		host: HostId,
	},
}

impl SnapshotFileName {
	pub fn nonce(&self) -> &str {
		match self {
			SnapshotFileName::Data { nonce, .. } | SnapshotFileName::Digest { nonce, .. } => nonce,
		}
	}

	/// Parse a bare file name; returns `None` for anything that is not a
	/// snapshot file.
	pub fn parse(file_name: &str) -> Option<Self> {
		if let Some(stem) = file_name.strip_suffix(&format!(".{}", DIGEST_FILE_EXTENSION)) {
			let (nonce, host) = stem.rsplit_once('-')?;
			let host = host.strip_prefix("host_")?.parse().ok()?;
			if nonce.is_empty() {
				return None;
			}
			return Some(SnapshotFileName::Digest {
				nonce: nonce.to_string(),
				host,
			});
		}

		let stem = file_name.strip_suffix(&format!(".{}", DATA_FILE_EXTENSION))?;
		let mut parts = stem.split('-');
		let nonce = parts.next()?;
		let table = parts.next()?;
		let partition = parts.next()?.strip_prefix('p')?.parse().ok()?;
		let host = parts.next()?.strip_prefix("host_")?.parse().ok()?;
		if parts.next().is_some() || nonce.is_empty() || table.is_empty() {
			return None;
		}

		Some(SnapshotFileName::Data {
			nonce: nonce.to_string(),
			table: table.to_string(),
			partition,
			host,
		})
	}
}

pub fn data_file_name(nonce: &str, table: &str, partition: PartitionId, host: HostId) -> String {
	format!(
		"{}-{}-p{}-host_{}.{}",
		nonce, table, partition, host, DATA_FILE_EXTENSION
	)
}

pub fn digest_file_name(nonce: &str, host: HostId) -> String {
	format!("{}-host_{}.{}", nonce, host, DIGEST_FILE_EXTENSION)
}

/// Reject nonces that would make file names ambiguous or escape the
/// snapshot directory.
pub fn validate_nonce(nonce: &str) -> Result<(), FormatError> {
	if nonce.is_empty() {
		return Err(FormatError::InvalidName("nonce must not be empty".to_string()));
	}
	if let Some(c) = nonce.chars().find(|c| FORBIDDEN_NONCE_CHARS.contains(c)) {
		return Err(FormatError::InvalidName(format!(
			"nonce '{}' contains forbidden character '{}'",
			nonce, c
		)));
	}
	Ok(())
}

pub fn validate_table_name(table: &str) -> Result<(), FormatError> {
	if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
		return Err(FormatError::InvalidName(format!(
			"table name '{}' is not a plain identifier",
			table
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_data_file_name_parses_back() {
		let name = data_file_name("testnonce", "P1", 3, 2);
		assert_eq!(name, "testnonce-P1-p3-host_2.vpt");

		match SnapshotFileName::parse(&name) {
			Some(SnapshotFileName::Data {
				nonce,
				table,
				partition,
				host,
			}) => {
				assert_eq!(nonce, "testnonce");
				assert_eq!(table, "P1");
				assert_eq!(partition, 3);
				assert_eq!(host, 2);
			}
			other => panic!("unexpected parse result: {:?}", other),
		}
	}

	#[test]
	fn test_digest_name_parses_back() {
		let name = digest_file_name("auto_20250101T000000", 7);
		assert_eq!(
			SnapshotFileName::parse(&name),
			Some(SnapshotFileName::Digest {
				nonce: "auto_20250101T000000".to_string(),
				host: 7
			})
		);
	}

	#[test]
	fn test_foreign_files_are_ignored() {
		assert_eq!(SnapshotFileName::parse("notes.txt"), None);
		assert_eq!(SnapshotFileName::parse("x-P1-p1.vpt"), None);
		assert_eq!(SnapshotFileName::parse("x-P1-pA-host_1.vpt"), None);
		assert_eq!(SnapshotFileName::parse("-host_1.digest"), None);
	}

	#[test]
	fn test_nonce_validation() {
		assert!(validate_nonce("testnonce").is_ok());
		assert!(validate_nonce("").is_err());
		assert!(validate_nonce("bad-nonce").is_err());
		assert!(validate_nonce("a,b").is_err());
		assert!(validate_nonce("../etc").is_err());
	}

	#[test]
	fn test_table_validation() {
		assert!(validate_table_name("P1").is_ok());
		assert!(validate_table_name("orders_2024").is_ok());
		assert!(validate_table_name("P-1").is_err());
	}
}
