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

//! Host-local snapshot bookkeeping
//!
//! One [`SnapshotRegistry`] per host, shared by the host worker and every
//! site processor it spawns. It owns three collections:
//! - the active partition set (which snapshot holds which partition)
//! - the completion callback queue of the cycle in flight
//! - a bounded history of host status rows
//!
//! Nothing here is persisted. A restarted host answers status queries
//! about earlier snapshots with nothing at all.

use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use shardsnap_format::{
	HostId, HostSnapshotStatus, PartitionId, SnapshotRequest, SnapshotResult, StatusScope,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::site::{TaskRecord, TaskState};

/// Callback run once every local task of a cycle is terminal
pub type CompletionCallback = Box<dyn FnOnce(&mut CycleReport) + Send>;

/// Error types for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("Partition {partition} is held by snapshot {holder}")]
	PartitionHeld {
		partition: PartitionId,
		holder: String,
	},
	#[error("Snapshot {0} is still running on this host")]
	CycleInFlight(String),
	#[error("No snapshot cycle in flight")]
	NoCycle,
}

/// Everything a host learned while running one snapshot
#[derive(Debug, Clone)]
pub struct CycleReport {
	pub host_id: HostId,
	pub request: Arc<SnapshotRequest>,
	pub started_at: DateTime<Utc>,
	/// Terminal task records, in completion order
	pub tasks: Vec<TaskRecord>,
	/// Failures outside any single task (digest write, fatal checks)
	pub errors: Vec<String>,
}

impl CycleReport {
	pub fn new(host_id: HostId, request: Arc<SnapshotRequest>) -> Self {
		Self {
			host_id,
			request,
			started_at: Utc::now(),
			tasks: Vec::new(),
			errors: Vec::new(),
		}
	}

	pub fn all_done(&self) -> bool {
		self.errors.is_empty() && self.tasks.iter().all(|t| t.state == TaskState::Done)
	}

	/// Collapse the cycle into the host's status row
	pub fn to_status(&self) -> HostSnapshotStatus {
		let mut messages: Vec<String> = self
			.tasks
			.iter()
			.filter_map(|t| {
				t.error
					.as_ref()
					.map(|e| format!("{} p{}: {}", t.table, t.partition, e))
			})
			.collect();
		messages.extend(self.errors.iter().cloned());

		HostSnapshotStatus {
			nonce: self.request.nonce.clone(),
			snapshot_type: self.request.snapshot_type,
			host_id: self.host_id,
			result: if self.all_done() {
				SnapshotResult::Success
			} else {
				SnapshotResult::Failure
			},
			error_message: (!messages.is_empty()).then(|| messages.join("; ")),
			start_time: self.started_at,
			completion_time: Utc::now(),
		}
	}
}

/// A cycle whose last task just finished, with its drained callback queue
pub struct CompletedCycle {
	report: CycleReport,
	callbacks: VecDeque<CompletionCallback>,
}

impl CompletedCycle {
	/// Run the callbacks in FIFO order
	pub fn run(mut self) -> CycleReport {
		while let Some(callback) = self.callbacks.pop_front() {
			callback(&mut self.report);
		}
		self.report
	}
}

#[derive(Debug, Clone)]
struct PartitionClaim {
	nonce: String,
	/// Table tasks of this snapshot still working on the partition
	holders: usize,
}

struct InFlightCycle {
	report: CycleReport,
	outstanding: usize,
	callbacks: VecDeque<CompletionCallback>,
}

/// Snapshot registry - explicit per-host context passed to every processor
pub struct SnapshotRegistry {
	host_id: HostId,
	active: DashMap<PartitionId, PartitionClaim>,
	cycle: Mutex<Option<InFlightCycle>>,
	history: Mutex<VecDeque<HostSnapshotStatus>>,
	history_capacity: usize,
	status_tx: Arc<watch::Sender<u64>>,
}

impl SnapshotRegistry {
	pub fn new(host_id: HostId, history_capacity: usize) -> Self {
		let (status_tx, _) = watch::channel(0);
		Self::with_notifier(host_id, history_capacity, Arc::new(status_tx))
	}

	/// Share a status generation counter with other registries
	pub fn with_notifier(
		host_id: HostId,
		history_capacity: usize,
		status_tx: Arc<watch::Sender<u64>>,
	) -> Self {
		Self {
			host_id,
			active: DashMap::new(),
			cycle: Mutex::new(None),
			history: Mutex::new(VecDeque::with_capacity(history_capacity)),
			history_capacity: history_capacity.max(1),
			status_tx,
		}
	}

	pub fn host_id(&self) -> HostId {
		self.host_id
	}

	/// Claim `partition` for `nonce` on behalf of `holders` table tasks
	///
	/// Succeeds when the partition is free or already held by the same
	/// nonce. A conflicting claim is left untouched.
	pub fn claim(&self, partition: PartitionId, nonce: &str, holders: usize) -> Result<(), RegistryError> {
		match self.active.entry(partition) {
			Entry::Occupied(mut entry) => {
				if entry.get().nonce != nonce {
					return Err(RegistryError::PartitionHeld {
						partition,
						holder: entry.get().nonce.clone(),
					});
				}
				entry.get_mut().holders += holders;
			}
			Entry::Vacant(entry) => {
				entry.insert(PartitionClaim {
					nonce: nonce.to_string(),
					holders,
				});
			}
		}
		Ok(())
	}

	/// One table task of `nonce` is done with `partition`
	///
	/// The partition is freed when its last holder releases it. Returns
	/// `false` if `nonce` did not hold the partition.
	pub fn release(&self, partition: PartitionId, nonce: &str) -> bool {
		match self.active.entry(partition) {
			Entry::Occupied(mut entry) if entry.get().nonce == nonce => {
				let claim = entry.get_mut();
				claim.holders = claim.holders.saturating_sub(1);
				if claim.holders == 0 {
					entry.remove();
					debug!(target: "registry", partition = partition, nonce = nonce, "Partition released");
				}
				true
			}
			_ => false,
		}
	}

	/// Drop the whole claim of `nonce` on `partition`
	pub fn abandon(&self, partition: PartitionId, nonce: &str) {
		self.active.remove_if(&partition, |_, claim| claim.nonce == nonce);
	}

	/// Nonce currently holding `partition`
	pub fn holder(&self, partition: PartitionId) -> Option<String> {
		self.active.get(&partition).map(|claim| claim.nonce.clone())
	}

	pub fn active_partitions(&self) -> Vec<PartitionId> {
		let mut partitions: Vec<PartitionId> = self.active.iter().map(|e| *e.key()).collect();
		partitions.sort_unstable();
		partitions
	}

	/// Nonce of the cycle in flight, if any
	pub fn in_flight(&self) -> Option<String> {
		self.cycle
			.lock()
			.as_ref()
			.map(|cycle| cycle.report.request.nonce.clone())
	}

	/// Reset cycle-scoped state before a fresh cycle
	///
	/// Clears the active partition set and any callback queue. Refused
	/// while a cycle is in flight.
	pub fn reset_cycle_state(&self) -> Result<(), RegistryError> {
		let mut cycle = self.cycle.lock();
		if let Some(in_flight) = cycle.as_ref() {
			return Err(RegistryError::CycleInFlight(
				in_flight.report.request.nonce.clone(),
			));
		}
		*cycle = None;
		self.active.clear();
		Ok(())
	}

	/// Start tracking a cycle of `expected_tasks` local tasks
	///
	/// With no tasks at all the cycle is complete immediately and is
	/// handed back for the caller to run.
	pub fn begin_cycle(
		&self,
		report: CycleReport,
		expected_tasks: usize,
		callbacks: Vec<CompletionCallback>,
	) -> Result<Option<CompletedCycle>, RegistryError> {
		let mut cycle = self.cycle.lock();
		if let Some(in_flight) = cycle.as_ref() {
			return Err(RegistryError::CycleInFlight(
				in_flight.report.request.nonce.clone(),
			));
		}

		let callbacks: VecDeque<CompletionCallback> = callbacks.into();
		if expected_tasks == 0 {
			return Ok(Some(CompletedCycle { report, callbacks }));
		}

		debug!(
			target: "registry",
			host_id = self.host_id,
			nonce = %report.request.nonce,
			tasks = expected_tasks,
			"Cycle started"
		);
		*cycle = Some(InFlightCycle {
			report,
			outstanding: expected_tasks,
			callbacks,
		});
		Ok(None)
	}

	/// Append a callback to the cycle in flight
	pub fn enqueue_callback(&self, callback: CompletionCallback) -> Result<(), RegistryError> {
		let mut cycle = self.cycle.lock();
		let in_flight = cycle.as_mut().ok_or(RegistryError::NoCycle)?;
		in_flight.callbacks.push_back(callback);
		Ok(())
	}

	/// Record a terminal task
	///
	/// The call that finishes the last outstanding task takes the callback
	/// queue with it; every other call gets `None`.
	pub fn finish_task(&self, record: TaskRecord) -> Option<CompletedCycle> {
		let mut cycle = self.cycle.lock();

		let Some(in_flight) = cycle.as_mut() else {
			warn!(
				target: "registry",
				nonce = %record.nonce,
				partition = record.partition,
				table = %record.table,
				"Task finished with no cycle in flight"
			);
			return None;
		};
		if in_flight.report.request.nonce != record.nonce {
			warn!(
				target: "registry",
				nonce = %record.nonce,
				current = %in_flight.report.request.nonce,
				"Task finished for a cycle that is no longer current"
			);
			return None;
		}

		in_flight.report.tasks.push(record);
		in_flight.outstanding = in_flight.outstanding.saturating_sub(1);
		if in_flight.outstanding > 0 {
			return None;
		}

		cycle.take().map(|done| CompletedCycle {
			report: done.report,
			callbacks: done.callbacks,
		})
	}

	/// Add a host status row and wake status watchers
	pub fn record_status(&self, status: HostSnapshotStatus) {
		{
			let mut history = self.history.lock();
			while history.len() >= self.history_capacity {
				history.pop_front();
			}
			history.push_back(status);
		}
		self.status_tx.send_modify(|generation| *generation += 1);
	}

	/// Status rows matching `scope`, oldest first
	pub fn statuses(&self, scope: &StatusScope) -> Vec<HostSnapshotStatus> {
		self.history
			.lock()
			.iter()
			.filter(|status| scope.matches(status))
			.cloned()
			.collect()
	}

	/// Forget everything: claims, the cycle in flight and its callbacks,
	/// and the status history
	pub fn clear(&self) {
		*self.cycle.lock() = None;
		self.active.clear();
		self.history.lock().clear();
		info!(target: "registry", host_id = self.host_id, "Registry cleared");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use shardsnap_format::SnapshotType;

	use super::*;

	fn request(nonce: &str) -> Arc<SnapshotRequest> {
		Arc::new(SnapshotRequest::new("/tmp", nonce, SnapshotType::Manual, false))
	}

	fn record(nonce: &str, partition: PartitionId, state: TaskState) -> TaskRecord {
		TaskRecord {
			nonce: nonce.to_string(),
			host: 0,
			partition,
			table: "P1".to_string(),
			state,
			file_name: format!("{}-P1-p{}-host_0.vpt", nonce, partition),
			row_count: 0,
			chunk_count: 0,
			checksum: None,
			error: (state == TaskState::Failed).then(|| "disk full".to_string()),
			started_at: Utc::now(),
			finished_at: Utc::now(),
		}
	}

	#[test]
	fn test_claim_is_exclusive_per_nonce() {
		let registry = SnapshotRegistry::new(0, 8);

		registry.claim(1, "first", 1).unwrap();
		registry.claim(1, "first", 1).unwrap();
		let err = registry.claim(1, "second", 1).unwrap_err();
		assert!(matches!(err, RegistryError::PartitionHeld { holder, .. } if holder == "first"));

		// second holder keeps it claimed
		assert!(registry.release(1, "first"));
		assert_eq!(registry.holder(1), Some("first".to_string()));
		assert!(registry.release(1, "first"));
		assert_eq!(registry.holder(1), None);

		assert!(!registry.release(1, "first"));
	}

	#[test]
	fn test_concurrent_claims_admit_one_nonce() {
		let registry = Arc::new(SnapshotRegistry::new(0, 8));
		let winners = Arc::new(AtomicUsize::new(0));

		let handles: Vec<_> = (0..8)
			.map(|i| {
				let registry = registry.clone();
				let winners = winners.clone();
				std::thread::spawn(move || {
					if registry.claim(3, &format!("nonce{}", i), 1).is_ok() {
						winners.fetch_add(1, Ordering::SeqCst);
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(winners.load(Ordering::SeqCst), 1);
		assert_eq!(registry.active_partitions(), vec![3]);
	}

	#[test]
	fn test_last_task_drains_callbacks_once_in_order() {
		let registry = SnapshotRegistry::new(0, 8);
		let order = Arc::new(Mutex::new(Vec::new()));

		let first = order.clone();
		let second = order.clone();
		let callbacks: Vec<CompletionCallback> = vec![
			Box::new(move |report: &mut CycleReport| {
				first.lock().push(("digest", report.tasks.len()));
			}),
			Box::new(move |_: &mut CycleReport| {
				second.lock().push(("status", 0));
			}),
		];
		assert!(
			registry
				.begin_cycle(CycleReport::new(0, request("n1")), 2, callbacks)
				.unwrap()
				.is_none()
		);
		assert_eq!(registry.in_flight(), Some("n1".to_string()));

		assert!(registry.finish_task(record("n1", 0, TaskState::Done)).is_none());
		let done = registry
			.finish_task(record("n1", 1, TaskState::Failed))
			.expect("last task completes the cycle");
		let report = done.run();

		assert_eq!(*order.lock(), vec![("digest", 2), ("status", 0)]);
		assert!(!report.all_done());
		assert_eq!(registry.in_flight(), None);

		// late arrivals never re-run anything
		assert!(registry.finish_task(record("n1", 2, TaskState::Done)).is_none());
		assert_eq!(order.lock().len(), 2);
	}

	#[test]
	fn test_second_cycle_is_refused_while_first_runs() {
		let registry = SnapshotRegistry::new(0, 8);
		registry
			.begin_cycle(CycleReport::new(0, request("n1")), 1, Vec::new())
			.unwrap();

		assert!(matches!(
			registry.begin_cycle(CycleReport::new(0, request("n2")), 1, Vec::new()),
			Err(RegistryError::CycleInFlight(n)) if n == "n1"
		));
		assert!(registry.reset_cycle_state().is_err());
	}

	#[test]
	fn test_refused_reset_keeps_claims_of_running_cycle() {
		let registry = SnapshotRegistry::new(0, 8);
		registry.claim(2, "n1", 1).unwrap();
		registry
			.begin_cycle(CycleReport::new(0, request("n1")), 1, Vec::new())
			.unwrap();

		assert!(matches!(
			registry.reset_cycle_state(),
			Err(RegistryError::CycleInFlight(n)) if n == "n1"
		));
		assert_eq!(registry.holder(2), Some("n1".to_string()));
		assert_eq!(registry.in_flight(), Some("n1".to_string()));

		assert!(registry.finish_task(record("n1", 2, TaskState::Done)).is_some());
		assert!(registry.release(2, "n1"));
		registry.reset_cycle_state().unwrap();
		assert_eq!(registry.holder(2), None);
	}

	#[test]
	fn test_empty_cycle_completes_immediately() {
		let registry = SnapshotRegistry::new(0, 8);
		let done = registry
			.begin_cycle(CycleReport::new(0, request("n1")), 0, Vec::new())
			.unwrap();
		assert!(done.is_some());
		assert_eq!(registry.in_flight(), None);
	}

	#[test]
	fn test_history_is_bounded_and_notifies() {
		let (tx, mut rx) = watch::channel(0u64);
		let registry = SnapshotRegistry::with_notifier(0, 2, Arc::new(tx));

		for nonce in ["a", "b", "c"] {
			registry.record_status(CycleReport::new(0, request(nonce)).to_status());
		}

		let nonces: Vec<String> = registry
			.statuses(&StatusScope::all())
			.into_iter()
			.map(|s| s.nonce)
			.collect();
		assert_eq!(nonces, vec!["b".to_string(), "c".to_string()]);
		assert!(rx.has_changed().unwrap());
		assert_eq!(*rx.borrow_and_update(), 3);
	}

	#[test]
	fn test_clear_resets_everything() {
		let registry = SnapshotRegistry::new(0, 8);
		registry.claim(0, "n1", 1).unwrap();
		registry
			.begin_cycle(CycleReport::new(0, request("n1")), 1, Vec::new())
			.unwrap();
		registry.record_status(CycleReport::new(0, request("old")).to_status());

		registry.clear();

		assert!(registry.active_partitions().is_empty());
		assert_eq!(registry.in_flight(), None);
		assert!(registry.statuses(&StatusScope::all()).is_empty());
		assert!(matches!(
			registry.enqueue_callback(Box::new(|_: &mut CycleReport| {})),
			Err(RegistryError::NoCycle)
		));
	}

	#[test]
	fn test_panic_while_holding_history_leaves_registry_usable() {
		let registry = Arc::new(SnapshotRegistry::new(0, 8));
		let held = registry.clone();
		let died = std::thread::spawn(move || {
			let _history = held.history.lock();
			panic!("status writer died");
		})
		.join();
		assert!(died.is_err());

		registry.record_status(CycleReport::new(0, request("after")).to_status());
		let rows = registry.statuses(&StatusScope::nonce("after"));
		assert_eq!(rows.len(), 1);
	}
}
