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

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster-wide host identifier
pub type HostId = u32;

/// Partition identifier as assigned by the hashinator
pub type PartitionId = u32;

/// Table name (SQL identifier, never contains `-`)
pub type TableId = String;

/// A single serialized row as produced by the execution engine
pub type Row = Vec<u8>;

/// Why a snapshot was taken
///
/// The type only changes behavior in two places: the tag on status rows
/// and truncation anchoring for command-log snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SnapshotType {
	#[serde(rename = "MANUAL")]
	Manual,
	#[serde(rename = "AUTO")]
	Auto,
	#[serde(rename = "COMMANDLOG")]
	CommandLogTruncation,
}

impl SnapshotType {
	pub fn as_str(&self) -> &'static str {
		match self {
			SnapshotType::Manual => "MANUAL",
			SnapshotType::Auto => "AUTO",
			SnapshotType::CommandLogTruncation => "COMMANDLOG",
		}
	}

	/// Whether digests of this type must carry a command-log anchor
	pub fn is_truncation(&self) -> bool {
		matches!(self, SnapshotType::CommandLogTruncation)
	}
}

impl fmt::Display for SnapshotType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SnapshotType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"MANUAL" => Ok(SnapshotType::Manual),
			"AUTO" => Ok(SnapshotType::Auto),
			"COMMANDLOG" | "COMMANDLOG_TRUNCATION" => Ok(SnapshotType::CommandLogTruncation),
			other => Err(format!("unknown snapshot type: {}", other)),
		}
	}
}

/// Outcome column used by both dispatch rows and status rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotResult {
	Success,
	Failure,
}

impl SnapshotResult {
	pub fn is_success(&self) -> bool {
		matches!(self, SnapshotResult::Success)
	}
}

impl fmt::Display for SnapshotResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SnapshotResult::Success => f.write_str("SUCCESS"),
			SnapshotResult::Failure => f.write_str("FAILURE"),
		}
	}
}

/// Request to take a snapshot
///
/// Created by the initiating call and never modified after dispatch;
/// hosts receive it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
	/// Caller-unique label for this snapshot
	pub nonce: String,
	/// Directory every host writes its files into
	pub path: String,
	#[serde(rename = "type")]
	pub snapshot_type: SnapshotType,
	/// Whether the initiating call waits for host status rows
	pub blocking: bool,
	/// Tables to include (`None` = every table in the catalog)
	pub tables: Option<BTreeSet<TableId>>,
	/// Command-log anchor, embedded verbatim into the digest
	pub truncation_anchor: Option<u64>,
}

impl SnapshotRequest {
	pub fn new(
		path: impl Into<String>,
		nonce: impl Into<String>,
		snapshot_type: SnapshotType,
		blocking: bool,
	) -> Self {
		Self {
			nonce: nonce.into(),
			path: path.into(),
			snapshot_type,
			blocking,
			tables: None,
			truncation_anchor: None,
		}
	}

	pub fn with_tables<I, T>(mut self, tables: I) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<TableId>,
	{
		self.tables = Some(tables.into_iter().map(Into::into).collect());
		self
	}

	pub fn with_truncation_anchor(mut self, anchor: u64) -> Self {
		self.truncation_anchor = Some(anchor);
		self
	}

	/// Whether `table` is covered by this request
	pub fn includes_table(&self, table: &str) -> bool {
		self.tables.as_ref().is_none_or(|t| t.contains(table))
	}
}

/// Per-host row returned by the initiate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRow {
	pub host_id: HostId,
	pub result: SnapshotResult,
	pub err_msg: Option<String>,
}

impl DispatchRow {
	pub fn success(host_id: HostId) -> Self {
		Self {
			host_id,
			result: SnapshotResult::Success,
			err_msg: None,
		}
	}

	pub fn failure(host_id: HostId, err_msg: impl Into<String>) -> Self {
		Self {
			host_id,
			result: SnapshotResult::Failure,
			err_msg: Some(err_msg.into()),
		}
	}
}

/// Host-local outcome of one snapshot
///
/// `Success` is a host-local claim only. Whether every host in the cluster
/// succeeded is a question for the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshotStatus {
	pub nonce: String,
	#[serde(rename = "type")]
	pub snapshot_type: SnapshotType,
	pub host_id: HostId,
	pub result: SnapshotResult,
	pub error_message: Option<String>,
	pub start_time: DateTime<Utc>,
	pub completion_time: DateTime<Utc>,
}

/// Filter for status queries; every `None` field matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusScope {
	pub nonce: Option<String>,
	pub snapshot_type: Option<SnapshotType>,
	/// Inclusive lower bound on `start_time`
	pub since: Option<DateTime<Utc>>,
	/// Inclusive upper bound on `start_time`
	pub until: Option<DateTime<Utc>>,
}

impl StatusScope {
	pub fn all() -> Self {
		Self::default()
	}

	pub fn nonce(nonce: impl Into<String>) -> Self {
		Self {
			nonce: Some(nonce.into()),
			..Self::default()
		}
	}

	pub fn of_type(snapshot_type: SnapshotType) -> Self {
		Self {
			snapshot_type: Some(snapshot_type),
			..Self::default()
		}
	}

	pub fn matches(&self, status: &HostSnapshotStatus) -> bool {
		self.nonce.as_ref().is_none_or(|n| *n == status.nonce)
			&& self
				.snapshot_type
				.is_none_or(|t| t == status.snapshot_type)
			&& self.since.is_none_or(|since| status.start_time >= since)
			&& self.until.is_none_or(|until| status.start_time <= until)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn status(nonce: &str, snapshot_type: SnapshotType) -> HostSnapshotStatus {
		let now = Utc::now();
		HostSnapshotStatus {
			nonce: nonce.to_string(),
			snapshot_type,
			host_id: 0,
			result: SnapshotResult::Success,
			error_message: None,
			start_time: now,
			completion_time: now,
		}
	}

	#[test]
	fn test_snapshot_type_names() {
		assert_eq!(SnapshotType::CommandLogTruncation.to_string(), "COMMANDLOG");
		assert_eq!("manual".parse::<SnapshotType>().unwrap(), SnapshotType::Manual);
		assert!("weekly".parse::<SnapshotType>().is_err());

		let json = serde_json::to_string(&SnapshotType::Auto).unwrap();
		assert_eq!(json, "\"AUTO\"");
	}

	#[test]
	fn test_scope_filters() {
		let row = status("n1", SnapshotType::Manual);

		assert!(StatusScope::all().matches(&row));
		assert!(StatusScope::nonce("n1").matches(&row));
		assert!(!StatusScope::nonce("n2").matches(&row));
		assert!(!StatusScope::of_type(SnapshotType::Auto).matches(&row));

		let future = StatusScope {
			since: Some(row.start_time + chrono::Duration::seconds(1)),
			..StatusScope::default()
		};
		assert!(!future.matches(&row));
	}

	#[test]
	fn test_request_table_filter() {
		let all = SnapshotRequest::new("/tmp", "n", SnapshotType::Manual, false);
		assert!(all.includes_table("P1"));

		let some = all.with_tables(["P1"]);
		assert!(some.includes_table("P1"));
		assert!(!some.includes_table("R1"));
	}
}
