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

mod cycle;

use std::{
	collections::BTreeSet,
	io,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle},
};

use chrono::Utc;
use crossbeam::channel::{self, Receiver, Sender};
use shardsnap_format::{
	HostId, HostSnapshotStatus, PartitionId, SnapshotRequest, StatusScope, TableId,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
	cluster::Hashinator,
	config::EngineConfig,
	registry::{CycleReport, RegistryError, SnapshotRegistry},
	site::{CycleContext, SiteContext, SiteError, SnapshotSiteProcessor, TaskRecord},
	source::{ReadBoundary, TableSource},
	target::WriteFaultPolicy,
};

pub use cycle::ProcessFatal;
use cycle::{CycleFinalizer, status_callback};

/// Error types for host-side request handling
///
/// Every variant is a request-time rejection; nothing was written.
#[derive(Debug, Error)]
pub enum HostError {
	#[error("Concurrent snapshot on partition(s) {partitions:?}: held by {holder}")]
	ConcurrentSnapshotOnPartition {
		partitions: Vec<PartitionId>,
		holder: String,
	},
	#[error("Snapshot {0} is still running on this host")]
	Busy(String),
	#[error("Unknown table(s) requested: {0:?}")]
	UnknownTables(Vec<TableId>),
	#[error("Snapshot registry refused the request: {0}")]
	Registry(RegistryError),
	#[error("Could not fix read boundary: {0}")]
	Quiesce(SiteError),
	#[error("Failed to start host worker: {0}")]
	Spawn(#[source] io::Error),
	#[error("Host worker is shut down")]
	Shutdown,
}

/// Host-side knobs, taken from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct HostSettings {
	pub chunk_size_bytes: usize,
	pub sync_each_chunk: bool,
	pub status_history_capacity: usize,
	pub abort_on_fatal: bool,
}

impl HostSettings {
	pub fn from_config(config: &EngineConfig) -> Self {
		Self {
			chunk_size_bytes: config.snapshot.chunk_size_bytes,
			sync_each_chunk: config.snapshot.sync_each_chunk,
			status_history_capacity: config.snapshot.status_history_capacity,
			abort_on_fatal: config.escalation.abort_on_fatal,
		}
	}
}

impl Default for HostSettings {
	fn default() -> Self {
		Self::from_config(&EngineConfig::default())
	}
}

/// Collaborators a host is built from
pub struct HostSpec {
	pub host_id: HostId,
	/// Partition replicas this host carries
	pub partitions: Vec<PartitionId>,
	pub source: Arc<dyn TableSource>,
	pub hashinator: Arc<dyn Hashinator>,
	pub faults: Arc<dyn WriteFaultPolicy>,
	/// Shared status generation counter, if the cluster keeps one
	pub status_notifier: Option<Arc<watch::Sender<u64>>>,
}

/// Messages for the host worker
#[derive(Debug)]
enum HostCommand {
	/// Start a local cycle; the reply says whether it was accepted
	Dispatch {
		request: Arc<SnapshotRequest>,
		respond_to: Sender<Result<(), HostError>>,
	},
	Shutdown,
}

/// One cluster host as far as snapshots are concerned
///
/// A worker thread owns request handling, so two dispatches on the same
/// host never interleave. The snapshot itself runs on site processor
/// threads; the worker only starts them.
pub struct SnapshotHost {
	host_id: HostId,
	partitions: Vec<PartitionId>,
	registry: Arc<SnapshotRegistry>,
	inbox: Sender<HostCommand>,
	thread_handle: Option<JoinHandle<()>>,
	fatal_signalled: Arc<AtomicBool>,
}

impl SnapshotHost {
	pub fn start(spec: HostSpec, settings: HostSettings) -> Result<Self, HostError> {
		let registry = Arc::new(match spec.status_notifier {
			Some(notifier) => SnapshotRegistry::with_notifier(
				spec.host_id,
				settings.status_history_capacity,
				notifier,
			),
			None => SnapshotRegistry::new(spec.host_id, settings.status_history_capacity),
		});
		registry.clear();

		let fatal_signalled = Arc::new(AtomicBool::new(false));
		let mut partitions = spec.partitions;
		partitions.sort_unstable();
		partitions.dedup();

		let worker = HostWorker {
			site: Arc::new(SiteContext {
				host_id: spec.host_id,
				registry: registry.clone(),
				source: spec.source,
				faults: spec.faults,
				chunk_size_bytes: settings.chunk_size_bytes,
				sync_each_chunk: settings.sync_each_chunk,
			}),
			partitions: partitions.clone(),
			hashinator: spec.hashinator,
			abort_on_fatal: settings.abort_on_fatal,
			fatal_signalled: fatal_signalled.clone(),
			processors: Vec::new(),
		};

		let (inbox, commands) = channel::unbounded();
		let host_id = spec.host_id;
		let thread_handle = thread::Builder::new()
			.name(format!("snapshot-host-{}", host_id))
			.spawn(move || {
				info!(target: "host", host_id = host_id, "Host worker started");
				worker.run(commands);
				info!(target: "host", host_id = host_id, "Host worker stopped");
			})
			.map_err(HostError::Spawn)?;

		Ok(Self {
			host_id,
			partitions,
			registry,
			inbox,
			thread_handle: Some(thread_handle),
			fatal_signalled,
		})
	}

	pub fn host_id(&self) -> HostId {
		self.host_id
	}

	pub fn partitions(&self) -> &[PartitionId] {
		&self.partitions
	}

	pub fn registry(&self) -> &Arc<SnapshotRegistry> {
		&self.registry
	}

	/// Hand a request to the worker and wait for accept/reject
	pub fn dispatch(&self, request: Arc<SnapshotRequest>) -> Result<(), HostError> {
		let (respond_to, reply) = channel::bounded(1);
		self.inbox
			.send(HostCommand::Dispatch {
				request,
				respond_to,
			})
			.map_err(|_| HostError::Shutdown)?;
		reply.recv().map_err(|_| HostError::Shutdown)?
	}

	pub fn status(&self, scope: &StatusScope) -> Vec<HostSnapshotStatus> {
		self.registry.statuses(scope)
	}

	/// Whether an unrecoverable condition was detected during any cycle
	pub fn fatal_signalled(&self) -> bool {
		self.fatal_signalled.load(Ordering::SeqCst)
	}

	/// Rejoin after a partition from the cluster; local state is stale
	pub fn rejoin(&self) {
		info!(target: "host", host_id = self.host_id, "Host rejoining; clearing snapshot state");
		self.registry.clear();
	}

	/// Stop the worker after in-flight processors finish
	pub fn shutdown(mut self) {
		self.stop();
	}

	fn stop(&mut self) {
		let _ = self.inbox.send(HostCommand::Shutdown);
		if let Some(handle) = self.thread_handle.take()
			&& let Err(e) = handle.join()
		{
			warn!(target: "host", host_id = self.host_id, error = ?e, "Host worker panicked");
		}
	}
}

impl Drop for SnapshotHost {
	fn drop(&mut self) {
		self.stop();
	}
}

struct HostWorker {
	site: Arc<SiteContext>,
	partitions: Vec<PartitionId>,
	hashinator: Arc<dyn Hashinator>,
	abort_on_fatal: bool,
	fatal_signalled: Arc<AtomicBool>,
	processors: Vec<JoinHandle<TaskRecord>>,
}

impl HostWorker {
	fn run(mut self, commands: Receiver<HostCommand>) {
		while let Ok(command) = commands.recv() {
			match command {
				HostCommand::Dispatch {
					request,
					respond_to,
				} => {
					self.processors.retain(|handle| !handle.is_finished());
					let result = self.start_cycle(request);
					let _ = respond_to.send(result);
				}
				HostCommand::Shutdown => break,
			}
		}

		for handle in self.processors.drain(..) {
			if let Err(e) = handle.join() {
				warn!(target: "host", host_id = self.site.host_id, error = ?e, "Site processor panicked");
			}
		}
	}

	fn start_cycle(&mut self, request: Arc<SnapshotRequest>) -> Result<(), HostError> {
		let host_id = self.site.host_id;
		let registry = &self.site.registry;
		let tables = self.requested_tables(&request)?;

		let idle = match registry.reset_cycle_state() {
			Ok(()) => true,
			Err(RegistryError::CycleInFlight(current)) => {
				debug!(
					target: "host",
					host_id = host_id,
					nonce = %request.nonce,
					current = %current,
					"Cycle in flight; claims kept"
				);
				false
			}
			Err(e) => {
				warn!(
					target: "host",
					host_id = host_id,
					nonce = %request.nonce,
					error = %e,
					"Failed to reset cycle state"
				);
				return Err(HostError::Registry(e));
			}
		};

		let boundaries = self.quiesce_all(&request.nonce, tables.len())?;

		if !idle && let Some(current) = registry.in_flight() {
			self.abandon(&request.nonce, &boundaries);
			return Err(HostError::Busy(current));
		}

		let cycle = Arc::new(CycleContext {
			request: request.clone(),
			catalog_id: self.site.source.catalog_id(),
			created_at: Utc::now(),
		});

		if let Err(e) = std::fs::create_dir_all(&request.path) {
			warn!(
				target: "host",
				host_id = host_id,
				path = %request.path,
				error = %e,
				"Snapshot directory unavailable"
			);
		}

		let finalizer = CycleFinalizer {
			cycle: cycle.clone(),
			tables: tables.clone(),
			captured_hashinator: self.hashinator.current(),
			hashinator: self.hashinator.clone(),
			source: self.site.source.clone(),
			abort_on_fatal: self.abort_on_fatal,
			fatal_signalled: self.fatal_signalled.clone(),
		};
		let callbacks = vec![
			finalizer.into_callback(),
			status_callback(Arc::downgrade(registry)),
		];

		let expected = boundaries.len() * tables.len();
		let report = CycleReport::new(host_id, request.clone());
		match registry.begin_cycle(report, expected, callbacks) {
			Ok(Some(done)) => {
				done.run();
			}
			Ok(None) => {
				for boundary in &boundaries {
					for table in &tables {
						let processor = SnapshotSiteProcessor::new(
							self.site.clone(),
							cycle.clone(),
							*boundary,
							table,
						);
						if let Some(handle) = processor.spawn() {
							self.processors.push(handle);
						}
					}
				}
			}
			Err(e) => {
				self.abandon(&request.nonce, &boundaries);
				return Err(HostError::Busy(e.to_string()));
			}
		}

		info!(
			target: "host",
			host_id = host_id,
			nonce = %request.nonce,
			snapshot_type = %request.snapshot_type,
			partitions = boundaries.len(),
			tables = tables.len(),
			"Snapshot cycle started"
		);
		Ok(())
	}

	/// Catalog tables covered by the request, in name order
	fn requested_tables(&self, request: &SnapshotRequest) -> Result<Vec<TableId>, HostError> {
		let catalog: BTreeSet<TableId> = self.site.source.tables().into_iter().collect();

		if let Some(requested) = &request.tables {
			let unknown: Vec<TableId> = requested.difference(&catalog).cloned().collect();
			if !unknown.is_empty() {
				return Err(HostError::UnknownTables(unknown));
			}
		}

		Ok(catalog
			.into_iter()
			.filter(|table| request.includes_table(table))
			.collect())
	}

	/// QUIESCE every local partition, all or nothing
	fn quiesce_all(&self, nonce: &str, table_count: usize) -> Result<Vec<ReadBoundary>, HostError> {
		if table_count == 0 {
			return Ok(Vec::new());
		}

		let mut boundaries = Vec::with_capacity(self.partitions.len());
		let mut conflicts = Vec::new();
		let mut holder = String::new();
		let mut failure = None;

		for &partition in &self.partitions {
			match SnapshotSiteProcessor::quiesce(&self.site, nonce, partition, table_count) {
				Ok(boundary) => boundaries.push(boundary),
				Err(SiteError::ConcurrentSnapshotOnPartition {
					partition,
					holder: current,
				}) => {
					conflicts.push(partition);
					holder = current;
				}
				Err(e) => {
					failure.get_or_insert(e);
				}
			}
		}

		if !conflicts.is_empty() {
			self.abandon(nonce, &boundaries);
			debug!(
				target: "host",
				host_id = self.site.host_id,
				nonce = nonce,
				holder = %holder,
				partitions = ?conflicts,
				"Snapshot rejected: partitions already under snapshot"
			);
			return Err(HostError::ConcurrentSnapshotOnPartition {
				partitions: conflicts,
				holder,
			});
		}
		if let Some(e) = failure {
			self.abandon(nonce, &boundaries);
			return Err(HostError::Quiesce(e));
		}
		Ok(boundaries)
	}

	fn abandon(&self, nonce: &str, boundaries: &[ReadBoundary]) {
		for boundary in boundaries {
			self.site.registry.abandon(boundary.partition, nonce);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		path::Path,
		time::{Duration, Instant},
	};

	use shardsnap_format::{
		HashinatorConfig, SnapshotResult, SnapshotType, digest::read_digest, naming::digest_file_name,
	};

	use super::*;
	use crate::{cluster::StaticHashinator, source::MemoryTableStore, target::NoFaults};

	fn host(partitions: Vec<PartitionId>) -> (SnapshotHost, Arc<MemoryTableStore>, Arc<StaticHashinator>) {
		let hashinator = Arc::new(StaticHashinator::new(HashinatorConfig::legacy(2)));
		let store = Arc::new(MemoryTableStore::new("catalog-1", ["P1", "R1"], hashinator.clone()));
		for key in 0..20 {
			store.insert("P1", key, vec![1; 16]).unwrap();
		}
		let host = SnapshotHost::start(
			HostSpec {
				host_id: 0,
				partitions,
				source: store.clone(),
				hashinator: hashinator.clone(),
				faults: Arc::new(NoFaults),
				status_notifier: None,
			},
			HostSettings {
				sync_each_chunk: false,
				..HostSettings::default()
			},
		)
		.unwrap();
		(host, store, hashinator)
	}

	fn wait_for_status(host: &SnapshotHost, nonce: &str) -> HostSnapshotStatus {
		let deadline = Instant::now() + Duration::from_secs(10);
		loop {
			if let Some(status) = host.status(&StatusScope::nonce(nonce)).pop() {
				return status;
			}
			assert!(Instant::now() < deadline, "no status for {}", nonce);
			std::thread::sleep(Duration::from_millis(10));
		}
	}

	fn request(dir: &Path, nonce: &str) -> Arc<SnapshotRequest> {
		Arc::new(SnapshotRequest::new(
			dir.to_string_lossy(),
			nonce,
			SnapshotType::Manual,
			false,
		))
	}

	#[test]
	fn test_dispatch_writes_files_and_digest() {
		let dir = tempfile::tempdir().unwrap();
		let (host, _, _) = host(vec![1, 0]);

		host.dispatch(request(dir.path(), "n1")).unwrap();
		let status = wait_for_status(&host, "n1");

		assert_eq!(status.result, SnapshotResult::Success);
		assert!(host.registry().active_partitions().is_empty());
		let digest = read_digest(dir.path().join(digest_file_name("n1", 0))).unwrap();
		assert_eq!(digest.entries.len(), 4);
		assert_eq!(digest.tables, vec!["P1".to_string(), "R1".to_string()]);
		assert!(!host.fatal_signalled());
	}

	#[test]
	fn test_held_partition_rejects_whole_request() {
		let dir = tempfile::tempdir().unwrap();
		let (host, _, _) = host(vec![0, 1]);
		host.registry().claim(1, "other", 1).unwrap();

		let err = host.dispatch(request(dir.path(), "n2")).unwrap_err();
		assert!(matches!(
			err,
			HostError::ConcurrentSnapshotOnPartition { ref partitions, ref holder }
				if partitions == &vec![1] && holder == "other"
		));
		// nothing of the refused request stays claimed
		assert_eq!(host.registry().holder(0), None);
		assert!(!dir.path().join(digest_file_name("n2", 0)).exists());
	}

	#[test]
	fn test_unknown_table_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (host, _, _) = host(vec![0]);

		let bad = SnapshotRequest::new(dir.path().to_string_lossy(), "n3", SnapshotType::Manual, false)
			.with_tables(["NOPE"]);
		assert!(matches!(
			host.dispatch(Arc::new(bad)),
			Err(HostError::UnknownTables(t)) if t == vec!["NOPE".to_string()]
		));
	}

	#[test]
	fn test_rejoin_forgets_history() {
		let dir = tempfile::tempdir().unwrap();
		let (host, _, _) = host(vec![0]);
		host.dispatch(request(dir.path(), "n6")).unwrap();
		wait_for_status(&host, "n6");

		host.rejoin();
		assert!(host.status(&StatusScope::all()).is_empty());
		host.shutdown();
	}
}
