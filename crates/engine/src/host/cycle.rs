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

//! End-of-cycle callbacks
//!
//! Queued in this order when a cycle starts:
//! 1. [`CycleFinalizer`]: drift check, then the host digest
//! 2. [`status_callback`]: collapse the report into the host status row

use std::sync::{
	Arc, Weak,
	atomic::{AtomicBool, Ordering},
};

use shardsnap_format::{
	HashinatorConfig, ManifestEntry, SnapshotDigest, TableId, digest::DIGEST_VERSION, write_digest,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
	cluster::Hashinator,
	registry::{CompletionCallback, CycleReport, SnapshotRegistry},
	site::{CycleContext, TaskState},
	source::TableSource,
};

/// Conditions the host treats as unrecoverable for a cycle
#[derive(Debug, Error)]
pub enum ProcessFatal {
	#[error("Hashinator configuration changed while snapshot {nonce} was running")]
	HashinatorChanged { nonce: String },
	#[error("Catalog changed while snapshot {nonce} was running: {before} -> {after}")]
	CatalogChanged {
		nonce: String,
		before: String,
		after: String,
	},
}

/// Writes the host digest once every local task is terminal
pub(crate) struct CycleFinalizer {
	pub cycle: Arc<CycleContext>,
	pub tables: Vec<TableId>,
	pub captured_hashinator: HashinatorConfig,
	pub hashinator: Arc<dyn Hashinator>,
	pub source: Arc<dyn TableSource>,
	pub abort_on_fatal: bool,
	pub fatal_signalled: Arc<AtomicBool>,
}

impl CycleFinalizer {
	pub fn into_callback(self) -> CompletionCallback {
		Box::new(move |report: &mut CycleReport| self.finish(report))
	}

	fn finish(self, report: &mut CycleReport) {
		if let Some(fatal) = self.detect_drift() {
			self.escalate(fatal, report);
			return;
		}

		let digest = self.build_digest(report);
		match write_digest(&self.cycle.request.path, &digest) {
			Ok(path) => info!(
				target: "host",
				host_id = report.host_id,
				nonce = %digest.nonce,
				entries = digest.entries.len(),
				path = %path.display(),
				"Digest written"
			),
			Err(e) => {
				error!(
					target: "host",
					host_id = report.host_id,
					nonce = %digest.nonce,
					error = %e,
					"Failed to write digest"
				);
				report.errors.push(format!("digest write failed: {}", e));
			}
		}
	}

	fn detect_drift(&self) -> Option<ProcessFatal> {
		let nonce = self.cycle.request.nonce.clone();
		if self.hashinator.current() != self.captured_hashinator {
			return Some(ProcessFatal::HashinatorChanged { nonce });
		}
		let catalog_now = self.source.catalog_id();
		if catalog_now != self.cycle.catalog_id {
			return Some(ProcessFatal::CatalogChanged {
				nonce,
				before: self.cycle.catalog_id.clone(),
				after: catalog_now,
			});
		}
		None
	}

	fn escalate(&self, fatal: ProcessFatal, report: &mut CycleReport) {
		error!(
			target: "host",
			host_id = report.host_id,
			error = %fatal,
			abort = self.abort_on_fatal,
			"Unrecoverable condition during snapshot"
		);
		self.fatal_signalled.store(true, Ordering::SeqCst);
		report.errors.push(fatal.to_string());

		if self.abort_on_fatal {
			error!(target: "host", "Aborting process");
			std::process::abort();
		}
	}

	fn build_digest(&self, report: &CycleReport) -> SnapshotDigest {
		let mut entries: Vec<ManifestEntry> = report
			.tasks
			.iter()
			.filter(|task| task.state == TaskState::Done)
			.filter_map(|task| {
				Some(ManifestEntry {
					table: task.table.clone(),
					partition: task.partition,
					host: task.host,
					file_name: task.file_name.clone(),
					row_count: task.row_count,
					chunk_count: task.chunk_count,
					checksum: task.checksum?,
				})
			})
			.collect();
		entries.sort_by(|a, b| (&a.table, a.partition).cmp(&(&b.table, b.partition)));

		SnapshotDigest {
			version: DIGEST_VERSION,
			nonce: self.cycle.request.nonce.clone(),
			host_id: report.host_id,
			snapshot_type: self.cycle.request.snapshot_type,
			created_at: self.cycle.created_at,
			catalog_id: self.cycle.catalog_id.clone(),
			hashinator: self.captured_hashinator.clone(),
			tables: self.tables.clone(),
			truncation_anchor: self.cycle.request.truncation_anchor,
			entries,
		}
	}
}

/// Record the host status row for the finished cycle
pub(crate) fn status_callback(registry: Weak<SnapshotRegistry>) -> CompletionCallback {
	Box::new(move |report: &mut CycleReport| {
		let status = report.to_status();
		if status.result.is_success() {
			info!(
				target: "host",
				host_id = status.host_id,
				nonce = %status.nonce,
				snapshot_type = %status.snapshot_type,
				tasks = report.tasks.len(),
				"Snapshot completed"
			);
		} else {
			warn!(
				target: "host",
				host_id = status.host_id,
				nonce = %status.nonce,
				snapshot_type = %status.snapshot_type,
				error = status.error_message.as_deref().unwrap_or(""),
				"Snapshot finished with failures"
			);
		}

		match registry.upgrade() {
			Some(registry) => registry.record_status(status),
			None => warn!(target: "host", nonce = %status.nonce, "Registry gone; status row dropped"),
		}
	})
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use shardsnap_format::{
		SnapshotRequest, SnapshotResult, SnapshotType, naming::digest_file_name,
	};

	use super::*;
	use crate::{cluster::StaticHashinator, site::TaskRecord, source::MemoryTableStore};

	struct Fixture {
		dir: tempfile::TempDir,
		store: Arc<MemoryTableStore>,
		hashinator: Arc<StaticHashinator>,
		fatal: Arc<AtomicBool>,
		finalizer: CycleFinalizer,
	}

	fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let hashinator = Arc::new(StaticHashinator::new(HashinatorConfig::elastic(2, 4)));
		let store = Arc::new(MemoryTableStore::new("catalog-1", ["P1"], hashinator.clone()));
		let fatal = Arc::new(AtomicBool::new(false));
		let request = SnapshotRequest::new(
			dir.path().to_string_lossy(),
			"n1",
			SnapshotType::CommandLogTruncation,
			false,
		)
		.with_truncation_anchor(42);
		let finalizer = CycleFinalizer {
			cycle: Arc::new(CycleContext {
				request: Arc::new(request),
				catalog_id: "catalog-1".to_string(),
				created_at: Utc::now(),
			}),
			tables: vec!["P1".to_string()],
			captured_hashinator: hashinator.current(),
			hashinator: hashinator.clone(),
			source: store.clone(),
			abort_on_fatal: false,
			fatal_signalled: fatal.clone(),
		};
		Fixture {
			dir,
			store,
			hashinator,
			fatal,
			finalizer,
		}
	}

	fn report(finalizer: &CycleFinalizer, state: TaskState) -> CycleReport {
		let mut report = CycleReport::new(0, finalizer.cycle.request.clone());
		report.tasks.push(TaskRecord {
			nonce: "n1".to_string(),
			host: 0,
			partition: 1,
			table: "P1".to_string(),
			state,
			file_name: "n1-P1-p1-host_0.vpt".to_string(),
			row_count: 3,
			chunk_count: 1,
			checksum: (state == TaskState::Done).then_some(7),
			error: None,
			started_at: Utc::now(),
			finished_at: Utc::now(),
		});
		report
	}

	#[test]
	fn test_digest_lists_only_done_tasks() {
		let f = fixture();
		let mut report = report(&f.finalizer, TaskState::Done);
		report.tasks.push(TaskRecord {
			partition: 0,
			state: TaskState::Failed,
			checksum: None,
			..report.tasks[0].clone()
		});

		f.finalizer.finish(&mut report);

		let digest =
			shardsnap_format::read_digest(f.dir.path().join(digest_file_name("n1", 0))).unwrap();
		assert_eq!(digest.entries.len(), 1);
		assert_eq!(digest.entries[0].partition, 1);
		assert_eq!(digest.truncation_anchor, Some(42));
		assert!(report.errors.is_empty());
	}

	#[test]
	fn test_hashinator_drift_is_fatal_and_skips_digest() {
		let f = fixture();
		f.hashinator.update(HashinatorConfig::elastic(3, 4));
		let mut report = report(&f.finalizer, TaskState::Done);

		f.finalizer.finish(&mut report);

		assert!(f.fatal.load(Ordering::SeqCst));
		assert!(!f.dir.path().join(digest_file_name("n1", 0)).exists());
		assert_eq!(report.to_status().result, SnapshotResult::Failure);
	}

	#[test]
	fn test_catalog_drift_is_fatal() {
		let f = fixture();
		f.store.set_catalog_id("catalog-2");
		let mut report = report(&f.finalizer, TaskState::Done);

		f.finalizer.finish(&mut report);

		assert!(f.fatal.load(Ordering::SeqCst));
		assert!(report.errors[0].contains("catalog-1 -> catalog-2"));
	}

	#[test]
	fn test_status_callback_records_row() {
		let registry = Arc::new(SnapshotRegistry::new(0, 4));
		let f = fixture();
		let mut report = report(&f.finalizer, TaskState::Failed);

		status_callback(Arc::downgrade(&registry))(&mut report);

		let rows = registry.statuses(&shardsnap_format::StatusScope::nonce("n1"));
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].result, SnapshotResult::Failure);
	}
}
