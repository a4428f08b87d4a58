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

//! Site processors
//!
//! One processor per local partition × table, each on its own thread:
//!
//! 1. QUIESCE: claim the partition and fix a read boundary (done by the
//!    host at dispatch, once per partition)
//! 2. SERIALIZE: take the row image as of that boundary
//! 3. WRITE: header, then bounded chunks, then the trailer
//! 4. REPORT: archive the terminal task, release the partition, and run
//!    the cycle callbacks if this was the last local task
//!
//! A failure only ever fails its own task.

mod task;

use std::{
	path::Path,
	sync::Arc,
	thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use shardsnap_format::{DataFileHeader, HostId, PartitionId, Row, SnapshotRequest};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
	registry::{RegistryError, SnapshotRegistry},
	source::{ReadBoundary, SourceError, TableSource},
	target::{SnapshotDataTarget, TargetError, TargetSummary, WriteFaultPolicy},
};

pub use task::{IllegalTransition, PartitionSnapshotTask, TaskRecord, TaskState};

/// Error types for site processing
#[derive(Debug, Error)]
pub enum SiteError {
	#[error("Partition {partition} is already part of in-flight snapshot {holder}")]
	ConcurrentSnapshotOnPartition {
		partition: PartitionId,
		holder: String,
	},
	#[error(transparent)]
	Source(#[from] SourceError),
	#[error(transparent)]
	Target(#[from] TargetError),
	#[error(transparent)]
	Transition(#[from] IllegalTransition),
	#[error(transparent)]
	Registry(RegistryError),
}

impl From<RegistryError> for SiteError {
	fn from(e: RegistryError) -> Self {
		match e {
			RegistryError::PartitionHeld { partition, holder } => {
				SiteError::ConcurrentSnapshotOnPartition { partition, holder }
			}
			other => SiteError::Registry(other),
		}
	}
}

/// Host-level context every processor on the host shares
pub struct SiteContext {
	pub host_id: HostId,
	pub registry: Arc<SnapshotRegistry>,
	pub source: Arc<dyn TableSource>,
	pub faults: Arc<dyn WriteFaultPolicy>,
	pub chunk_size_bytes: usize,
	pub sync_each_chunk: bool,
}

/// Facts fixed once per cycle, at dispatch
#[derive(Debug)]
pub struct CycleContext {
	pub request: Arc<SnapshotRequest>,
	pub catalog_id: String,
	pub created_at: DateTime<Utc>,
}

/// Snapshot of one table on one partition replica
pub struct SnapshotSiteProcessor {
	task: PartitionSnapshotTask,
	boundary: ReadBoundary,
	site: Arc<SiteContext>,
	cycle: Arc<CycleContext>,
}

impl SnapshotSiteProcessor {
	/// QUIESCE one partition for `table_count` table tasks
	///
	/// The claim is check-and-insert; a partition held by another nonce is
	/// rejected without touching that snapshot's claim.
	pub fn quiesce(
		site: &SiteContext,
		nonce: &str,
		partition: PartitionId,
		table_count: usize,
	) -> Result<ReadBoundary, SiteError> {
		site.registry.claim(partition, nonce, table_count)?;

		match site.source.fix_read_boundary(partition) {
			Ok(boundary) => {
				debug!(
					target: "site",
					host_id = site.host_id,
					partition = partition,
					version = boundary.version,
					"Read boundary fixed"
				);
				Ok(boundary)
			}
			Err(e) => {
				site.registry.abandon(partition, nonce);
				Err(e.into())
			}
		}
	}

	pub fn new(
		site: Arc<SiteContext>,
		cycle: Arc<CycleContext>,
		boundary: ReadBoundary,
		table: &str,
	) -> Self {
		let task = PartitionSnapshotTask::new(
			&cycle.request.nonce,
			site.host_id,
			boundary.partition,
			table,
		);
		Self {
			task,
			boundary,
			site,
			cycle,
		}
	}

	pub fn task(&self) -> &PartitionSnapshotTask {
		&self.task
	}

	/// Run on a dedicated thread
	///
	/// If the thread cannot be started the task is reported as failed
	/// here, so the cycle still completes.
	pub fn spawn(self) -> Option<JoinHandle<TaskRecord>> {
		let name = format!(
			"snap-h{}-p{}-{}",
			self.site.host_id,
			self.task.partition(),
			self.task.table()
		);
		let mut fallback = self.task.clone();
		let site = self.site.clone();

		match thread::Builder::new().name(name).spawn(move || self.run()) {
			Ok(handle) => Some(handle),
			Err(e) => {
				error!(
					target: "site",
					host_id = site.host_id,
					partition = fallback.partition(),
					table = %fallback.table(),
					error = %e,
					"Failed to spawn site processor thread"
				);
				if let Err(refused) = fallback.fail(format!("could not start processor: {}", e)) {
					warn!(target: "site", error = %refused, "Task state machine refused failure");
				}
				report(&site, fallback.into_record());
				None
			}
		}
	}

	/// Drive the task to a terminal state and report it
	pub fn run(mut self) -> TaskRecord {
		match self.serialize_and_write() {
			Ok(summary) => {
				info!(
					target: "site",
					host_id = self.site.host_id,
					partition = self.task.partition(),
					table = %self.task.table(),
					rows = summary.row_count,
					chunks = summary.chunk_count,
					"Partition snapshot written"
				);
				if let Err(e) = self.task.complete(summary) {
					error!(target: "site", error = %e, "Task state machine refused completion");
				}
			}
			Err(e) => {
				warn!(
					target: "site",
					host_id = self.site.host_id,
					partition = self.task.partition(),
					table = %self.task.table(),
					state = %self.task.state(),
					error = %e,
					"Partition snapshot failed"
				);
				if let Err(refused) = self.task.fail(&e) {
					error!(target: "site", error = %refused, "Task state machine refused failure");
				}
			}
		}

		report(&self.site, self.task.into_record())
	}

	fn serialize_and_write(&mut self) -> Result<TargetSummary, SiteError> {
		let rows = self
			.site
			.source
			.row_image(self.task.table(), self.boundary)?;

		self.task.advance(TaskState::WritingHeader)?;
		let mut target = SnapshotDataTarget::create(
			Path::new(&self.cycle.request.path),
			self.task.file_name(),
			self.site.faults.clone(),
			self.site.sync_each_chunk,
		)?;
		target.write_header(DataFileHeader {
			nonce: self.cycle.request.nonce.clone(),
			table: self.task.table().to_string(),
			partition: self.task.partition(),
			host: self.site.host_id,
			catalog_id: self.cycle.catalog_id.clone(),
			snapshot_type: self.cycle.request.snapshot_type,
			created_at: self.cycle.created_at,
		})?;

		self.task.advance(TaskState::WritingData)?;
		for chunk in split_into_chunks(&rows, self.site.chunk_size_bytes) {
			target.write_chunk(chunk)?;
		}

		Ok(target.close()?)
	}
}

/// REPORT: archive the record, free the partition, maybe end the cycle
fn report(site: &SiteContext, record: TaskRecord) -> TaskRecord {
	site.registry.release(record.partition, &record.nonce);
	if let Some(done) = site.registry.finish_task(record.clone()) {
		let report = done.run();
		debug!(
			target: "site",
			host_id = site.host_id,
			nonce = %report.request.nonce,
			tasks = report.tasks.len(),
			"Cycle callbacks drained"
		);
	}
	record
}

/// Split rows into chunks whose encoded payload stays within `limit`
///
/// A single row larger than `limit` gets a chunk of its own.
pub fn split_into_chunks(rows: &[Row], limit: usize) -> Vec<&[Row]> {
	let mut chunks = Vec::new();
	let mut start = 0;
	let mut size = 0;

	for (i, row) in rows.iter().enumerate() {
		let encoded = 4 + row.len();
		if i > start && size + encoded > limit {
			chunks.push(&rows[start..i]);
			start = i;
			size = 0;
		}
		size += encoded;
	}
	if start < rows.len() {
		chunks.push(&rows[start..]);
	}
	chunks
}

#[cfg(test)]
mod tests {
	use shardsnap_format::{HashinatorConfig, SnapshotType, datafile::read_rows};

	use super::*;
	use crate::{
		cluster::StaticHashinator,
		registry::CycleReport,
		source::MemoryTableStore,
		target::{InjectedFaults, NoFaults},
	};

	fn context(
		dir: &Path,
		faults: Arc<dyn WriteFaultPolicy>,
	) -> (Arc<SiteContext>, Arc<MemoryTableStore>, Arc<CycleContext>) {
		let hashinator = Arc::new(StaticHashinator::new(HashinatorConfig::legacy(1)));
		let store = Arc::new(MemoryTableStore::new("catalog-1", ["P1", "R1"], hashinator));
		for key in 0..50 {
			store.insert("P1", key, vec![key as u8; 32]).unwrap();
		}

		let site = Arc::new(SiteContext {
			host_id: 0,
			registry: Arc::new(SnapshotRegistry::new(0, 8)),
			source: store.clone(),
			faults,
			chunk_size_bytes: 256,
			sync_each_chunk: false,
		});
		let request = SnapshotRequest::new(
			dir.to_string_lossy(),
			"testnonce",
			SnapshotType::Manual,
			false,
		);
		let cycle = Arc::new(CycleContext {
			request: Arc::new(request),
			catalog_id: "catalog-1".to_string(),
			created_at: Utc::now(),
		});
		(site, store, cycle)
	}

	fn begin(site: &SiteContext, cycle: &CycleContext, tasks: usize) {
		site.registry
			.begin_cycle(
				CycleReport::new(site.host_id, cycle.request.clone()),
				tasks,
				Vec::new(),
			)
			.unwrap();
	}

	#[test]
	fn test_split_respects_limit() {
		let rows: Vec<Row> = (0..10).map(|_| vec![0u8; 60]).collect();
		let chunks = split_into_chunks(&rows, 200);
		assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![3, 3, 3, 1]);

		let huge = vec![vec![0u8; 1000]];
		assert_eq!(split_into_chunks(&huge, 200).len(), 1);
		assert!(split_into_chunks(&[], 200).is_empty());
	}

	#[test]
	fn test_processor_writes_rows_as_of_boundary() {
		let dir = tempfile::tempdir().unwrap();
		let (site, store, cycle) = context(dir.path(), Arc::new(NoFaults));
		begin(&site, &cycle, 1);

		let boundary = SnapshotSiteProcessor::quiesce(&site, "testnonce", 0, 1).unwrap();
		store.insert("P1", 999, b"late".to_vec()).unwrap();

		let record = SnapshotSiteProcessor::new(site.clone(), cycle, boundary, "P1")
			.spawn()
			.unwrap()
			.join()
			.unwrap();

		assert_eq!(record.state, TaskState::Done);
		assert_eq!(record.row_count, 50);
		assert!(record.chunk_count > 1);
		assert!(site.registry.active_partitions().is_empty());

		let rows = read_rows(dir.path().join(&record.file_name)).unwrap();
		assert_eq!(rows.len(), 50);
		assert!(!rows.contains(&b"late".to_vec()));
	}

	#[test]
	fn test_quiesce_conflict_leaves_existing_claim() {
		let dir = tempfile::tempdir().unwrap();
		let (site, _, _) = context(dir.path(), Arc::new(NoFaults));

		SnapshotSiteProcessor::quiesce(&site, "first", 0, 1).unwrap();
		let err = SnapshotSiteProcessor::quiesce(&site, "second", 0, 1).unwrap_err();

		assert!(matches!(
			err,
			SiteError::ConcurrentSnapshotOnPartition { partition: 0, ref holder } if holder == "first"
		));
		assert_eq!(site.registry.holder(0), Some("first".to_string()));
	}

	#[test]
	fn test_write_failure_fails_only_its_task() {
		let dir = tempfile::tempdir().unwrap();
		let faults = Arc::new(InjectedFaults::new().on_table("P1"));
		faults.fail_chunks(true);
		faults.fail_chunks_from(1);
		let (site, _, cycle) = context(dir.path(), faults);
		begin(&site, &cycle, 2);

		let boundary = SnapshotSiteProcessor::quiesce(&site, "testnonce", 0, 2).unwrap();
		let failed = SnapshotSiteProcessor::new(site.clone(), cycle.clone(), boundary, "P1").run();
		let done = SnapshotSiteProcessor::new(site.clone(), cycle, boundary, "R1").run();

		assert_eq!(failed.state, TaskState::Failed);
		assert!(failed.error.as_deref().unwrap().contains("no space left"));
		assert_eq!(done.state, TaskState::Done);
		assert!(site.registry.active_partitions().is_empty());
		assert_eq!(site.registry.in_flight(), None);
	}

	#[test]
	fn test_serialization_failure_never_creates_file() {
		let dir = tempfile::tempdir().unwrap();
		let (site, store, cycle) = context(dir.path(), Arc::new(NoFaults));
		store.fail_serialization_of("P1");
		begin(&site, &cycle, 1);

		let boundary = SnapshotSiteProcessor::quiesce(&site, "testnonce", 0, 1).unwrap();
		let record = SnapshotSiteProcessor::new(site, cycle, boundary, "P1").run();

		assert_eq!(record.state, TaskState::Failed);
		assert!(!dir.path().join(&record.file_name).exists());
	}
}
