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

//! Per-nonce checks
//!
//! Order of work:
//! 1. Load and merge the host digests
//! 2. Check the captured hashinator and the truncation anchor
//! 3. Validate every manifest entry against its file
//! 4. Reconcile files on disk with the manifest
//! 5. Check table × partition coverage

use std::collections::{BTreeSet, HashSet};

use shardsnap_format::{
	DataFileScan, HashinatorScheme, HostId, ManifestEntry, PartitionId, SnapshotDigest, TableId,
	read_digest, scan_data_file,
};
use tracing::debug;

use crate::{
	discover::{DataFileRef, Inventory},
	report::{CorruptionReason, NonceReport, Verdict},
};

pub fn check_nonce(
	nonce: &str,
	inventory: &Inventory,
	expected_scheme: Option<HashinatorScheme>,
) -> NonceReport {
	let mut check = NonceCheck::default();

	let digests = check.load_digests(inventory);
	match digests.first() {
		Some(reference) => check.check_with_manifest(reference, &digests, inventory, expected_scheme),
		None => check.reconstruct(inventory),
	}

	debug!(
		target: "verifier",
		nonce = nonce,
		digests = digests.len(),
		files = inventory.data_files.len(),
		reasons = check.reasons.len(),
		"Nonce checked"
	);

	NonceReport {
		nonce: nonce.to_string(),
		verdict: if check.reasons.is_empty() {
			Verdict::Valid
		} else {
			Verdict::Corrupted(check.reasons)
		},
		notes: check.notes,
	}
}

#[derive(Default)]
struct NonceCheck {
	reasons: Vec<CorruptionReason>,
	notes: Vec<String>,
}

impl NonceCheck {
	fn load_digests(&mut self, inventory: &Inventory) -> Vec<SnapshotDigest> {
		let mut digests = Vec::new();
		for path in inventory.digests.values() {
			match read_digest(path) {
				Ok(digest) => digests.push(digest),
				Err(e) => self.reasons.push(CorruptionReason::DigestUnreadable {
					file: file_name(path),
					error: e.to_string(),
				}),
			}
		}
		digests
	}

	fn check_with_manifest(
		&mut self,
		reference: &SnapshotDigest,
		digests: &[SnapshotDigest],
		inventory: &Inventory,
		expected_scheme: Option<HashinatorScheme>,
	) {
		for other in &digests[1..] {
			self.compare_digests(reference, other);
		}

		let digest_hosts: BTreeSet<HostId> = inventory.digests.keys().copied().collect();
		let data_hosts: BTreeSet<HostId> = inventory.data_files.values().map(|f| f.host).collect();
		for &host in data_hosts.difference(&digest_hosts) {
			self.reasons.push(CorruptionReason::HostDigestMissing { host });
		}

		let hashinator = &reference.hashinator;
		for problem in hashinator.consistency_problems() {
			self.reasons.push(CorruptionReason::HashinatorInconsistent(problem));
		}
		if let Some(expected) = expected_scheme
			&& expected != hashinator.scheme
		{
			self.notes.push(format!(
				"expected {} hashinator, snapshot recorded {}",
				expected, hashinator.scheme
			));
		}

		if reference.snapshot_type.is_truncation()
			&& digests.iter().any(|d| d.truncation_anchor.is_none())
		{
			self.reasons.push(CorruptionReason::MissingTruncationAnchor);
		}

		let mut seen = HashSet::new();
		let mut listed = HashSet::new();
		let mut covered = HashSet::new();
		for digest in digests {
			for entry in &digest.entries {
				if !seen.insert((entry.table.clone(), entry.partition, entry.host)) {
					self.reasons.push(CorruptionReason::DuplicateEntry {
						table: entry.table.clone(),
						partition: entry.partition,
						host: entry.host,
					});
					continue;
				}
				listed.insert(entry.file_name.clone());

				if entry.partition >= hashinator.partition_count {
					self.reasons.push(CorruptionReason::UnknownPartition {
						table: entry.table.clone(),
						partition: entry.partition,
						partition_count: hashinator.partition_count,
					});
				}
				if self.check_entry(digest, entry, inventory) {
					covered.insert((entry.table.clone(), entry.partition));
				}
			}
		}

		for (name, file) in &inventory.data_files {
			if !listed.contains(name) {
				self.reasons.push(CorruptionReason::UnlistedFile {
					file: name.clone(),
					state: describe_unlisted(file),
				});
			}
		}

		let tables: BTreeSet<&TableId> = digests.iter().flat_map(|d| d.tables.iter()).collect();
		for table in tables {
			for partition in 0..hashinator.partition_count {
				if !covered.contains(&(table.clone(), partition)) {
					self.reasons.push(CorruptionReason::MissingCoverage {
						table: table.clone(),
						partition,
					});
				}
			}
		}
	}

	fn compare_digests(&mut self, reference: &SnapshotDigest, other: &SnapshotDigest) {
		let hosts = format!("host {} vs host {}", reference.host_id, other.host_id);
		let mut conflict = |field: &'static str, differs: bool, detail: String| {
			if differs {
				self.reasons.push(CorruptionReason::DigestConflict {
					field,
					detail: format!("{} ({})", detail, hosts),
				});
			}
		};

		conflict(
			"catalog",
			reference.catalog_id != other.catalog_id,
			format!("{} != {}", reference.catalog_id, other.catalog_id),
		);
		conflict(
			"hashinator",
			reference.hashinator != other.hashinator,
			format!(
				"{} over {} partitions != {} over {} partitions",
				reference.hashinator.scheme,
				reference.hashinator.partition_count,
				other.hashinator.scheme,
				other.hashinator.partition_count
			),
		);
		conflict(
			"type",
			reference.snapshot_type != other.snapshot_type,
			format!("{} != {}", reference.snapshot_type, other.snapshot_type),
		);
		conflict(
			"tables",
			reference.tables != other.tables,
			format!("{:?} != {:?}", reference.tables, other.tables),
		);
		conflict(
			"truncation anchor",
			reference.truncation_anchor != other.truncation_anchor,
			format!("{:?} != {:?}", reference.truncation_anchor, other.truncation_anchor),
		);
	}

	/// Validate one manifest entry; true when the file fully matches it
	fn check_entry(
		&mut self,
		digest: &SnapshotDigest,
		entry: &ManifestEntry,
		inventory: &Inventory,
	) -> bool {
		let file = entry.file_name.clone();
		let Some(found) = inventory.data_files.get(&entry.file_name) else {
			self.reasons.push(CorruptionReason::DataFileMissing { file });
			return false;
		};

		let scan = match scan_data_file(&found.path) {
			Ok(scan) => scan,
			Err(e) => {
				self.reasons.push(CorruptionReason::DataFileUnreadable {
					file,
					error: e.to_string(),
				});
				return false;
			}
		};
		if !scan.is_clean() {
			self.push_defects(&file, &scan);
			return false;
		}

		let before = self.reasons.len();
		if let Some(header) = &scan.header {
			let mut mismatches = Vec::new();
			if header.nonce != digest.nonce {
				mismatches.push(format!("nonce {}", header.nonce));
			}
			if header.table != entry.table || header.partition != entry.partition {
				mismatches.push(format!("table {} partition {}", header.table, header.partition));
			}
			if header.host != entry.host {
				mismatches.push(format!("host {}", header.host));
			}
			if header.catalog_id != digest.catalog_id {
				mismatches.push(format!("catalog {}", header.catalog_id));
			}
			if !mismatches.is_empty() {
				self.reasons.push(CorruptionReason::HeaderMismatch {
					file: file.clone(),
					detail: mismatches.join(", "),
				});
			}
		}

		if let Some(trailer) = scan.trailer {
			if trailer.file_checksum != entry.checksum {
				self.reasons.push(CorruptionReason::ChecksumMismatch {
					file: file.clone(),
					expected: entry.checksum,
					actual: trailer.file_checksum,
				});
			}
			if trailer.row_count != entry.row_count || trailer.chunk_count != entry.chunk_count {
				self.reasons.push(CorruptionReason::CountMismatch {
					file,
					expected_rows: entry.row_count,
					actual_rows: trailer.row_count,
					expected_chunks: entry.chunk_count,
					actual_chunks: trailer.chunk_count,
				});
			}
		}
		self.reasons.len() == before
	}

	/// No usable digest: rebuild what we can from the files themselves
	fn reconstruct(&mut self, inventory: &Inventory) {
		self.reasons.push(CorruptionReason::DigestMissing);

		let mut rebuilt: BTreeSet<(TableId, PartitionId, HostId)> = BTreeSet::new();
		for (name, file) in &inventory.data_files {
			match scan_data_file(&file.path) {
				Ok(scan) if scan.is_clean() => {
					if let Some(header) = scan.header {
						rebuilt.insert((header.table, header.partition, header.host));
					}
				}
				Ok(scan) => self.push_defects(name, &scan),
				Err(e) => self.reasons.push(CorruptionReason::DataFileUnreadable {
					file: name.clone(),
					error: e.to_string(),
				}),
			}
		}

		let tables: BTreeSet<&TableId> = rebuilt.iter().map(|(t, _, _)| t).collect();
		let partitions: BTreeSet<PartitionId> = rebuilt.iter().map(|(_, p, _)| *p).collect();
		self.notes.push(format!(
			"reconstructed manifest: {} complete files covering {} tables over {} partitions",
			rebuilt.len(),
			tables.len(),
			partitions.len()
		));
	}

	fn push_defects(&mut self, file: &str, scan: &DataFileScan) {
		for defect in &scan.defects {
			self.reasons.push(CorruptionReason::DataFileDefect {
				file: file.to_string(),
				defect: defect.clone(),
			});
		}
	}
}

fn describe_unlisted(file: &DataFileRef) -> String {
	match scan_data_file(&file.path) {
		Ok(scan) if scan.is_clean() => "complete file".to_string(),
		Ok(scan) if scan.is_incomplete_prefix() => format!(
			"incomplete: {} whole chunks, no end-of-file checksum",
			scan.valid_chunks
		),
		Ok(scan) => scan
			.defects
			.first()
			.map(ToString::to_string)
			.unwrap_or_else(|| "unknown state".to_string()),
		Err(e) => format!("unreadable: {}", e),
	}
}

fn file_name(path: &std::path::Path) -> String {
	path.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| path.display().to_string())
}
