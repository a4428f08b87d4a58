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

use std::fmt;

use chrono::{DateTime, Utc};
use shardsnap_format::{HostId, PartitionId, TableId, naming::data_file_name};
use thiserror::Error;

use crate::target::TargetSummary;

/// Lifecycle of one partition × table task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
	Pending,
	WritingHeader,
	WritingData,
	Done,
	Failed,
}

impl TaskState {
	fn rank(self) -> u8 {
		match self {
			TaskState::Pending => 0,
			TaskState::WritingHeader => 1,
			TaskState::WritingData => 2,
			TaskState::Done | TaskState::Failed => 3,
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, TaskState::Done | TaskState::Failed)
	}

	/// Forward moves only; `Done` is reachable from `WritingData` alone
	pub fn can_advance_to(self, next: TaskState) -> bool {
		if self.is_terminal() || next.rank() <= self.rank() {
			return false;
		}
		next != TaskState::Done || self == TaskState::WritingData
	}
}

impl fmt::Display for TaskState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			TaskState::Pending => "PENDING",
			TaskState::WritingHeader => "WRITING_HEADER",
			TaskState::WritingData => "WRITING_DATA",
			TaskState::Done => "DONE",
			TaskState::Failed => "FAILED",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Error)]
#[error("Illegal task transition {from} -> {to}")]
pub struct IllegalTransition {
	pub from: TaskState,
	pub to: TaskState,
}

/// Archived terminal task, as the registry keeps it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
	pub nonce: String,
	pub host: HostId,
	pub partition: PartitionId,
	pub table: TableId,
	pub state: TaskState,
	pub file_name: String,
	pub row_count: u64,
	pub chunk_count: u32,
	/// File checksum, present only for `Done`
	pub checksum: Option<u32>,
	pub error: Option<String>,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
}

/// Live task owned by exactly one site processor
#[derive(Debug, Clone)]
pub struct PartitionSnapshotTask {
	nonce: String,
	host: HostId,
	partition: PartitionId,
	table: TableId,
	file_name: String,
	state: TaskState,
	started_at: DateTime<Utc>,
	error: Option<String>,
	summary: Option<TargetSummary>,
}

impl PartitionSnapshotTask {
	pub fn new(nonce: &str, host: HostId, partition: PartitionId, table: &str) -> Self {
		Self {
			nonce: nonce.to_string(),
			host,
			partition,
			table: table.to_string(),
			file_name: data_file_name(nonce, table, partition, host),
			state: TaskState::Pending,
			started_at: Utc::now(),
			error: None,
			summary: None,
		}
	}

	pub fn state(&self) -> TaskState {
		self.state
	}

	pub fn partition(&self) -> PartitionId {
		self.partition
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	pub fn nonce(&self) -> &str {
		&self.nonce
	}

	pub fn file_name(&self) -> &str {
		&self.file_name
	}

	pub fn advance(&mut self, next: TaskState) -> Result<(), IllegalTransition> {
		if !self.state.can_advance_to(next) {
			return Err(IllegalTransition {
				from: self.state,
				to: next,
			});
		}
		self.state = next;
		Ok(())
	}

	pub fn complete(&mut self, summary: TargetSummary) -> Result<(), IllegalTransition> {
		self.advance(TaskState::Done)?;
		self.summary = Some(summary);
		Ok(())
	}

	pub fn fail(&mut self, error: impl fmt::Display) -> Result<(), IllegalTransition> {
		self.advance(TaskState::Failed)?;
		self.error = Some(error.to_string());
		Ok(())
	}

	pub fn into_record(self) -> TaskRecord {
		let (row_count, chunk_count, checksum) = match &self.summary {
			Some(summary) => (summary.row_count, summary.chunk_count, Some(summary.checksum)),
			None => (0, 0, None),
		};
		TaskRecord {
			nonce: self.nonce,
			host: self.host,
			partition: self.partition,
			table: self.table,
			state: self.state,
			file_name: self.file_name,
			row_count,
			chunk_count,
			checksum,
			error: self.error,
			started_at: self.started_at,
			finished_at: Utc::now(),
		}
	}
}
