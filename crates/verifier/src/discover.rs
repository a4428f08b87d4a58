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

use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
};

use shardsnap_format::{HostId, PartitionId, SnapshotFileName, TableId};
use tracing::debug;

use crate::VerifyError;

/// A data file found on disk, identified by its name alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileRef {
	pub path: PathBuf,
	pub file_name: String,
	pub table: TableId,
	pub partition: PartitionId,
	pub host: HostId,
}

/// Every file of one nonce across the scanned directories
#[derive(Debug, Clone, Default)]
pub struct Inventory {
	/// host -> digest path
	pub digests: BTreeMap<HostId, PathBuf>,
	/// file name -> data file
	pub data_files: BTreeMap<String, DataFileRef>,
}

impl Inventory {
	pub fn is_empty(&self) -> bool {
		self.digests.is_empty() && self.data_files.is_empty()
	}
}

/// Group every snapshot file under `dirs` by nonce
///
/// Files whose names are not snapshot names are ignored. The same file
/// name in two directories keeps the first one seen.
pub fn discover(dirs: &[PathBuf]) -> Result<BTreeMap<String, Inventory>, VerifyError> {
	let mut by_nonce: BTreeMap<String, Inventory> = BTreeMap::new();

	for dir in dirs {
		for (name, path) in list_dir(dir)? {
			let Some(parsed) = SnapshotFileName::parse(&name) else {
				continue;
			};
			let inventory = by_nonce.entry(parsed.nonce().to_string()).or_default();
			match parsed {
				SnapshotFileName::Digest { host, .. } => {
					inventory.digests.entry(host).or_insert(path);
				}
				SnapshotFileName::Data {
					table,
					partition,
					host,
					..
				} => {
					inventory
						.data_files
						.entry(name.clone())
						.or_insert(DataFileRef {
							path,
							file_name: name,
							table,
							partition,
							host,
						});
				}
			}
		}
	}

	debug!(target: "verifier", dirs = dirs.len(), nonces = by_nonce.len(), "Snapshot files discovered");
	Ok(by_nonce)
}

fn list_dir(dir: &Path) -> Result<Vec<(String, PathBuf)>, VerifyError> {
	let io_error = |source| VerifyError::Io {
		path: dir.to_path_buf(),
		source,
	};

	let mut files = Vec::new();
	for entry in fs::read_dir(dir).map_err(io_error)? {
		let entry = entry.map_err(io_error)?;
		if entry.file_type().map_err(io_error)?.is_file() {
			files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
		}
	}
	files.sort();
	Ok(files)
}

#[cfg(test)]
mod tests {
	use shardsnap_format::naming::{data_file_name, digest_file_name};

	use super::*;

	#[test]
	fn test_files_grouped_by_nonce_across_dirs() {
		let a = tempfile::tempdir().unwrap();
		let b = tempfile::tempdir().unwrap();
		fs::write(a.path().join(digest_file_name("n1", 0)), b"").unwrap();
		fs::write(a.path().join(data_file_name("n1", "P1", 0, 0)), b"").unwrap();
		fs::write(b.path().join(digest_file_name("n1", 1)), b"").unwrap();
		fs::write(b.path().join(data_file_name("n2", "P1", 3, 1)), b"").unwrap();
		fs::write(b.path().join("README"), b"").unwrap();

		let found = discover(&[a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();

		assert_eq!(found.len(), 2);
		let n1 = &found["n1"];
		assert_eq!(n1.digests.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
		assert_eq!(n1.data_files.len(), 1);
		let n2 = &found["n2"];
		assert!(n2.digests.is_empty());
		assert_eq!(n2.data_files.values().next().unwrap().partition, 3);
	}

	#[test]
	fn test_missing_dir_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("nope");
		assert!(matches!(discover(&[missing]), Err(VerifyError::Io { .. })));
	}
}
