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

use std::{fmt, io};

use shardsnap_format::{DataFileDefect, HostId, PartitionId, TableId};

/// One reason a snapshot cannot be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
	/// No digest at all; the manifest was rebuilt from file names and headers
	DigestMissing,
	/// Data files from `host` exist but its digest does not
	HostDigestMissing { host: HostId },
	DigestUnreadable { file: String, error: String },
	DigestConflict { field: &'static str, detail: String },
	HashinatorInconsistent(String),
	MissingTruncationAnchor,
	DuplicateEntry {
		table: TableId,
		partition: PartitionId,
		host: HostId,
	},
	DataFileMissing { file: String },
	DataFileUnreadable { file: String, error: String },
	DataFileDefect { file: String, defect: DataFileDefect },
	HeaderMismatch { file: String, detail: String },
	ChecksumMismatch {
		file: String,
		expected: u32,
		actual: u32,
	},
	CountMismatch {
		file: String,
		expected_rows: u64,
		actual_rows: u64,
		expected_chunks: u32,
		actual_chunks: u32,
	},
	UnlistedFile { file: String, state: String },
	MissingCoverage { table: TableId, partition: PartitionId },
	UnknownPartition {
		table: TableId,
		partition: PartitionId,
		partition_count: u32,
	},
}

impl fmt::Display for CorruptionReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CorruptionReason::DigestMissing => {
				write!(f, "no digest found; manifest reconstructed from data files")
			}
			CorruptionReason::HostDigestMissing { host } => {
				write!(f, "host {} wrote data files but no digest", host)
			}
			CorruptionReason::DigestUnreadable { file, error } => {
				write!(f, "digest {} unreadable: {}", file, error)
			}
			CorruptionReason::DigestConflict { field, detail } => {
				write!(f, "host digests disagree on {}: {}", field, detail)
			}
			CorruptionReason::HashinatorInconsistent(problem) => {
				write!(f, "hashinator inconsistent: {}", problem)
			}
			CorruptionReason::MissingTruncationAnchor => {
				write!(f, "COMMANDLOG snapshot has no truncation anchor")
			}
			CorruptionReason::DuplicateEntry {
				table,
				partition,
				host,
			} => write!(
				f,
				"manifest lists {} partition {} from host {} more than once",
				table, partition, host
			),
			CorruptionReason::DataFileMissing { file } => write!(f, "{}: file missing", file),
			CorruptionReason::DataFileUnreadable { file, error } => {
				write!(f, "{}: unreadable: {}", file, error)
			}
			CorruptionReason::DataFileDefect { file, defect } => write!(f, "{}: {}", file, defect),
			CorruptionReason::HeaderMismatch { file, detail } => {
				write!(f, "{}: header disagrees with manifest: {}", file, detail)
			}
			CorruptionReason::ChecksumMismatch {
				file,
				expected,
				actual,
			} => write!(
				f,
				"{}: checksum {:#010x} does not match manifest {:#010x}",
				file, actual, expected
			),
			CorruptionReason::CountMismatch {
				file,
				expected_rows,
				actual_rows,
				expected_chunks,
				actual_chunks,
			} => write!(
				f,
				"{}: holds {} rows in {} chunks, manifest says {} rows in {} chunks",
				file, actual_rows, actual_chunks, expected_rows, expected_chunks
			),
			CorruptionReason::UnlistedFile { file, state } => {
				write!(f, "{}: not in any digest ({})", file, state)
			}
			CorruptionReason::MissingCoverage { table, partition } => {
				write!(f, "no valid copy of table {} partition {}", table, partition)
			}
			CorruptionReason::UnknownPartition {
				table,
				partition,
				partition_count,
			} => write!(
				f,
				"table {} partition {} is outside the {} recorded partitions",
				table, partition, partition_count
			),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Valid,
	Corrupted(Vec<CorruptionReason>),
	NotFound,
}

/// Verification outcome for one nonce
#[derive(Debug, Clone)]
pub struct NonceReport {
	pub nonce: String,
	pub verdict: Verdict,
	/// Observations that do not make the snapshot corrupt
	pub notes: Vec<String>,
}

impl NonceReport {
	pub fn is_valid(&self) -> bool {
		self.verdict == Verdict::Valid
	}

	pub fn reasons(&self) -> &[CorruptionReason] {
		match &self.verdict {
			Verdict::Corrupted(reasons) => reasons,
			_ => &[],
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct VerificationSummary {
	pub reports: Vec<NonceReport>,
}

impl VerificationSummary {
	/// Something was checked and every nonce is clean
	pub fn passed(&self) -> bool {
		!self.reports.is_empty() && self.reports.iter().all(NonceReport::is_valid)
	}

	pub fn report(&self, nonce: &str) -> Option<&NonceReport> {
		self.reports.iter().find(|r| r.nonce == nonce)
	}

	pub fn corrupted(&self) -> impl Iterator<Item = &NonceReport> {
		self.reports
			.iter()
			.filter(|r| matches!(r.verdict, Verdict::Corrupted(_)))
	}

	pub fn write_report<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
		if self.reports.is_empty() {
			writeln!(out, "No snapshots found")?;
		}
		for report in &self.reports {
			match &report.verdict {
				Verdict::Valid => writeln!(out, "Snapshot valid: {}", report.nonce)?,
				Verdict::NotFound => writeln!(out, "Snapshot not found: {}", report.nonce)?,
				Verdict::Corrupted(reasons) => {
					writeln!(out, "Snapshot corrupted: {}", report.nonce)?;
					for reason in reasons {
						writeln!(out, "  - {}", reason)?;
					}
				}
			}
			for note in &report.notes {
				writeln!(out, "  note: {}", note)?;
			}
		}
		Ok(())
	}

	pub fn render(&self) -> String {
		let mut buf = Vec::new();
		// writing to a Vec cannot fail
		let _ = self.write_report(&mut buf);
		String::from_utf8_lossy(&buf).into_owned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_report_lines() {
		let summary = VerificationSummary {
			reports: vec![
				NonceReport {
					nonce: "bad".to_string(),
					verdict: Verdict::Corrupted(vec![
						CorruptionReason::DataFileDefect {
							file: "bad-P1-p0-host_0.vpt".to_string(),
							defect: DataFileDefect::EmptyFile,
						},
						CorruptionReason::MissingCoverage {
							table: "P1".to_string(),
							partition: 0,
						},
					]),
					notes: Vec::new(),
				},
				NonceReport {
					nonce: "good".to_string(),
					verdict: Verdict::Valid,
					notes: vec!["expected legacy".to_string()],
				},
			],
		};

		assert_eq!(
			summary.render(),
			"Snapshot corrupted: bad\n  - bad-P1-p0-host_0.vpt: file is empty (header never written)\n  - no valid copy of table P1 partition 0\nSnapshot valid: good\n  note: expected legacy\n"
		);
		assert!(!summary.passed());
		assert_eq!(summary.corrupted().count(), 1);
	}

	#[test]
	fn test_nothing_checked_does_not_pass() {
		let summary = VerificationSummary::default();
		assert!(!summary.passed());
		assert_eq!(summary.render(), "No snapshots found\n");
	}
}
