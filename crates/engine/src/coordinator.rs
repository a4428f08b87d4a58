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

//! Snapshot coordinator
//!
//! Entry point for starting snapshots and asking how they went. A request
//! is broadcast to every live host; each host answers accept/reject on its
//! own and then runs its share without talking to the others. There is no
//! cross-host commit, so a SUCCESS row only speaks for that host.
//!
//! The coordinator does NOT:
//! - Cancel or retry snapshots
//! - Judge cross-host completeness (the verifier does)
//! - Persist anything

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	fs, io,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use shardsnap_format::{
	DispatchRow, HashinatorConfig, HostId, HostSnapshotStatus, SnapshotFileName, SnapshotRequest,
	SnapshotType, StatusScope,
	naming::{validate_nonce, validate_table_name},
};
use thiserror::Error;
use tokio::{sync::watch, task};
use tracing::{debug, info, warn};

use crate::{
	cluster::{ClusterTransport, CommandLog, DispatchError, Hashinator, Membership},
	config::PollSettings,
};

/// Error types for snapshot initiation
#[derive(Debug, Error)]
pub enum CoordinatorError {
	#[error("Invalid snapshot request: {0}")]
	InvalidRequest(String),
	#[error("Snapshot {0} is already in progress")]
	DuplicateNonce(String),
	#[error("No live hosts to snapshot")]
	NoLiveHosts,
	#[error("COMMANDLOG snapshot requested but the command log has no truncation anchor")]
	MissingTruncationAnchor,
}

/// Backoff schedule for blocking requests
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	pub max_attempts: u32,
}

impl From<&PollSettings> for PollPolicy {
	fn from(settings: &PollSettings) -> Self {
		Self {
			initial_backoff: settings.initial_backoff(),
			max_backoff: settings.max_backoff(),
			max_attempts: settings.max_attempts,
		}
	}
}

impl Default for PollPolicy {
	fn default() -> Self {
		Self::from(&PollSettings::default())
	}
}

/// What `initiate` hands back
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
	pub nonce: String,
	pub snapshot_type: SnapshotType,
	/// Taken just before the broadcast; older status rows belong to
	/// somebody else
	pub dispatched_at: DateTime<Utc>,
	/// One row per live host: did it accept the request
	pub dispatch: Vec<DispatchRow>,
	/// Host status rows; filled only for blocking requests
	pub statuses: Vec<HostSnapshotStatus>,
	/// Every accepting host reported before the poll gave up
	pub converged: bool,
}

impl SnapshotHandle {
	pub fn accepted_hosts(&self) -> Vec<HostId> {
		self.dispatch
			.iter()
			.filter(|row| row.result.is_success())
			.map(|row| row.host_id)
			.collect()
	}

	/// Every host accepted and every host reported SUCCESS
	pub fn succeeded(&self) -> bool {
		self.converged
			&& self.dispatch.iter().all(|row| row.result.is_success())
			&& self.statuses.iter().all(|row| row.result.is_success())
	}
}

/// A nonce between reservation and reaping
#[derive(Debug, Clone)]
struct InFlight {
	/// Hosts that accepted it; empty while the broadcast is still out
	hosts: Vec<HostId>,
	dispatched_at: DateTime<Utc>,
}

pub struct SnapshotCoordinator {
	transport: Arc<dyn ClusterTransport>,
	membership: Arc<dyn Membership>,
	hashinator: Arc<dyn Hashinator>,
	command_log: Arc<dyn CommandLog>,
	poll: PollPolicy,
	in_flight: DashMap<String, InFlight>,
}

impl SnapshotCoordinator {
	pub fn new(
		transport: Arc<dyn ClusterTransport>,
		membership: Arc<dyn Membership>,
		hashinator: Arc<dyn Hashinator>,
		command_log: Arc<dyn CommandLog>,
		poll: PollPolicy,
	) -> Self {
		Self {
			transport,
			membership,
			hashinator,
			command_log,
			poll,
			in_flight: DashMap::new(),
		}
	}

	/// Broadcast a snapshot request to every live host
	///
	/// Returns as soon as every host has accepted or rejected, unless the
	/// request is blocking; then the host status rows are awaited too.
	/// Incomplete convergence is reported through `converged`, never as an
	/// error.
	///
	/// A nonce names one snapshot only. It is refused while it is in
	/// flight, while any host still remembers it, and while its files sit
	/// in the target directory.
	pub async fn initiate(&self, request: SnapshotRequest) -> Result<SnapshotHandle, CoordinatorError> {
		let request = Arc::new(self.prepare(request)?);
		let nonce = request.nonce.clone();

		self.reap_finished().await;

		let hosts = self.membership.live_hosts();
		if hosts.is_empty() {
			return Err(CoordinatorError::NoLiveHosts);
		}

		match self.in_flight.entry(nonce.clone()) {
			Entry::Occupied(_) => return Err(CoordinatorError::DuplicateNonce(nonce)),
			Entry::Vacant(entry) => {
				entry.insert(InFlight {
					hosts: Vec::new(),
					dispatched_at: Utc::now(),
				});
			}
		}
		if self.nonce_used(&request, &hosts).await {
			self.in_flight.remove(&nonce);
			warn!(target: "coordinator", nonce = %nonce, "Nonce already names a snapshot");
			return Err(CoordinatorError::DuplicateNonce(nonce));
		}

		// subscribe before dispatch so no completion slips past the poll
		let updates = self.transport.status_updates();
		let dispatched_at = Utc::now();
		let dispatch = self.broadcast(&hosts, &request).await;

		let accepted: Vec<HostId> = dispatch
			.iter()
			.filter(|row| row.result.is_success())
			.map(|row| row.host_id)
			.collect();
		if accepted.is_empty() {
			self.in_flight.remove(&nonce);
		} else if let Some(mut entry) = self.in_flight.get_mut(&nonce) {
			entry.hosts = accepted.clone();
			entry.dispatched_at = dispatched_at;
		}

		info!(
			target: "coordinator",
			nonce = %nonce,
			snapshot_type = %request.snapshot_type,
			hosts = hosts.len(),
			accepted = accepted.len(),
			blocking = request.blocking,
			"Snapshot dispatched"
		);

		let mut handle = SnapshotHandle {
			nonce,
			snapshot_type: request.snapshot_type,
			dispatched_at,
			dispatch,
			statuses: Vec::new(),
			converged: false,
		};
		if request.blocking && !accepted.is_empty() {
			let (statuses, converged) = self
				.await_statuses(&handle.nonce, &accepted, dispatched_at, updates)
				.await;
			handle.statuses = statuses;
			handle.converged = converged;
		} else if request.blocking {
			// nobody accepted, so there is nothing to wait for
			handle.converged = true;
		}
		if handle.converged {
			self.in_flight.remove(&handle.nonce);
		}
		Ok(handle)
	}

	/// Wait for the hosts that accepted `handle` to report
	///
	/// Same poll as a blocking `initiate`, for requests sent without
	/// blocking.
	pub async fn await_completion(&self, handle: &SnapshotHandle) -> (Vec<HostSnapshotStatus>, bool) {
		let updates = self.transport.status_updates();
		let (rows, converged) = self
			.await_statuses(
				&handle.nonce,
				&handle.accepted_hosts(),
				handle.dispatched_at,
				updates,
			)
			.await;
		if converged {
			self.in_flight.remove(&handle.nonce);
		}
		(rows, converged)
	}

	/// Status rows from every live host, in a stable order
	pub async fn query_status(&self, scope: &StatusScope) -> Vec<HostSnapshotStatus> {
		let hosts = self.membership.live_hosts();
		let mut rows = Vec::new();
		for (host, result) in gather(self.transport.clone(), hosts, scope.clone()).await {
			match result {
				Ok(mut host_rows) => rows.append(&mut host_rows),
				Err(e) => warn!(target: "coordinator", host_id = host, error = %e, "Status unavailable"),
			}
		}
		sort_statuses(&mut rows);
		rows
	}

	/// Partitioning consistency query: the live token -> partition map
	pub fn partition_keys(&self) -> HashinatorConfig {
		self.hashinator.current()
	}

	/// Nonces still waiting on at least one host
	pub fn in_flight(&self) -> Vec<String> {
		let mut nonces: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
		nonces.sort();
		nonces
	}

	/// Poll `hosts` for rows of `nonce` started at or after `since`
	///
	/// Returns the rows seen and whether all of `hosts` reported.
	async fn await_statuses(
		&self,
		nonce: &str,
		hosts: &[HostId],
		since: DateTime<Utc>,
		mut updates: Option<watch::Receiver<u64>>,
	) -> (Vec<HostSnapshotStatus>, bool) {
		let expected: BTreeSet<HostId> = hosts.iter().copied().collect();
		let scope = StatusScope::nonce(nonce);
		let mut backoff = self.poll.initial_backoff;
		let mut rows = Vec::new();

		for attempt in 1..=self.poll.max_attempts.max(1) {
			rows = gather(self.transport.clone(), hosts.to_vec(), scope.clone())
				.await
				.into_iter()
				.filter_map(|(_, result)| result.ok())
				.flatten()
				.filter(|row| row.start_time >= since)
				.collect();
			sort_statuses(&mut rows);

			let reported: BTreeSet<HostId> = rows.iter().map(|row| row.host_id).collect();
			if expected.is_subset(&reported) {
				debug!(target: "coordinator", nonce = nonce, attempt = attempt, "Snapshot statuses converged");
				return (rows, true);
			}

			match updates.as_mut() {
				Some(rx) => {
					if let Ok(Err(_)) = tokio::time::timeout(backoff, rx.changed()).await {
						// notifier gone; plain sleeps from here on
						updates = None;
					}
				}
				None => tokio::time::sleep(backoff).await,
			}
			backoff = (backoff * 2).min(self.poll.max_backoff);
		}

		warn!(
			target: "coordinator",
			nonce = nonce,
			expected = expected.len(),
			reported = rows.len(),
			"Snapshot statuses did not converge"
		);
		(rows, false)
	}

	fn prepare(&self, mut request: SnapshotRequest) -> Result<SnapshotRequest, CoordinatorError> {
		validate_nonce(&request.nonce).map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
		if request.path.trim().is_empty() {
			return Err(CoordinatorError::InvalidRequest(
				"snapshot path must not be empty".to_string(),
			));
		}
		if let Some(tables) = &request.tables {
			if tables.is_empty() {
				return Err(CoordinatorError::InvalidRequest(
					"table filter must name at least one table".to_string(),
				));
			}
			for table in tables {
				validate_table_name(table)
					.map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
			}
		}

		if request.snapshot_type.is_truncation() && request.truncation_anchor.is_none() {
			let anchor = self
				.command_log
				.truncation_anchor()
				.ok_or(CoordinatorError::MissingTruncationAnchor)?;
			request.truncation_anchor = Some(anchor);
		}
		Ok(request)
	}

	/// Whether the nonce already names a snapshot, on a host or on disk
	async fn nonce_used(&self, request: &SnapshotRequest, hosts: &[HostId]) -> bool {
		let remembered = gather(
			self.transport.clone(),
			hosts.to_vec(),
			StatusScope::nonce(request.nonce.as_str()),
		)
		.await
		.into_iter()
		.any(|(_, result)| result.is_ok_and(|rows| !rows.is_empty()));
		if remembered {
			return true;
		}

		let dir = PathBuf::from(&request.path);
		let nonce = request.nonce.clone();
		task::spawn_blocking(move || snapshot_files_exist(&dir, &nonce))
			.await
			.unwrap_or_else(|e| {
				warn!(target: "coordinator", error = %e, "Snapshot directory check failed");
				false
			})
	}

	async fn broadcast(&self, hosts: &[HostId], request: &Arc<SnapshotRequest>) -> Vec<DispatchRow> {
		let pending: Vec<_> = hosts
			.iter()
			.map(|&host| {
				let transport = self.transport.clone();
				let request = request.clone();
				(host, task::spawn_blocking(move || transport.dispatch(host, request)))
			})
			.collect();

		let mut rows = Vec::with_capacity(pending.len());
		for (host, join) in pending {
			let row = match join.await {
				Ok(Ok(())) => DispatchRow::success(host),
				Ok(Err(e)) => {
					warn!(
						target: "coordinator",
						host_id = host,
						nonce = %request.nonce,
						error = %e,
						"Host rejected snapshot"
					);
					DispatchRow::failure(host, e.to_string())
				}
				Err(e) => DispatchRow::failure(host, format!("dispatch task failed: {}", e)),
			};
			rows.push(row);
		}
		rows
	}

	/// Forget nonces no accepting host is still running
	///
	/// Hosts are asked what they run now rather than what they remember,
	/// so a nonce whose status rows already left the history still goes.
	async fn reap_finished(&self) {
		if self.in_flight.is_empty() {
			return;
		}
		let hosts: BTreeSet<HostId> = self
			.in_flight
			.iter()
			.flat_map(|e| e.value().hosts.clone())
			.collect();

		let mut running: HashMap<HostId, Option<String>> = HashMap::new();
		let mut gone = HashSet::new();
		let hosts: Vec<HostId> = hosts.into_iter().collect();
		for (host, result) in fan_out(self.transport.clone(), hosts, |transport, host| {
			transport.active_snapshot(host)
		})
		.await
		{
			match result {
				Ok(current) => {
					running.insert(host, current);
				}
				Err(DispatchError::HostUnreachable(_)) => {
					gone.insert(host);
				}
				Err(_) => {}
			}
		}

		self.in_flight.retain(|nonce, entry| {
			let done = !entry.hosts.is_empty()
				&& entry.hosts.iter().all(|host| {
					gone.contains(host)
						|| running
							.get(host)
							.is_some_and(|current| current.as_deref() != Some(nonce.as_str()))
				});
			if done {
				debug!(
					target: "coordinator",
					nonce = %nonce,
					dispatched_at = %entry.dispatched_at,
					"Snapshot reaped"
				);
			}
			!done
		});
	}
}

/// Run `query` against every host off the async runtime
async fn fan_out<T, F>(
	transport: Arc<dyn ClusterTransport>,
	hosts: Vec<HostId>,
	query: F,
) -> Vec<(HostId, Result<T, DispatchError>)>
where
	T: Send + 'static,
	F: Fn(&dyn ClusterTransport, HostId) -> Result<T, DispatchError> + Send + 'static,
{
	let joined = task::spawn_blocking(move || {
		hosts
			.into_iter()
			.map(|host| (host, query(transport.as_ref(), host)))
			.collect::<Vec<_>>()
	})
	.await;

	joined.unwrap_or_else(|e| {
		warn!(target: "coordinator", error = %e, "Host fan-out failed");
		Vec::new()
	})
}

/// Ask `hosts` for their status rows
async fn gather(
	transport: Arc<dyn ClusterTransport>,
	hosts: Vec<HostId>,
	scope: StatusScope,
) -> Vec<(HostId, Result<Vec<HostSnapshotStatus>, DispatchError>)> {
	fan_out(transport, hosts, move |transport, host| {
		transport.host_status(host, &scope)
	})
	.await
}

/// Any data file or digest of `nonce` in `dir`
fn snapshot_files_exist(dir: &Path, nonce: &str) -> bool {
	let entries = match fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
		Err(e) => {
			warn!(
				target: "coordinator",
				path = %dir.display(),
				error = %e,
				"Snapshot directory unreadable"
			);
			return false;
		}
	};
	entries.filter_map(Result::ok).any(|entry| {
		SnapshotFileName::parse(&entry.file_name().to_string_lossy())
			.is_some_and(|file| file.nonce() == nonce)
	})
}

fn sort_statuses(rows: &mut [HostSnapshotStatus]) {
	rows.sort_by(|a, b| {
		(a.start_time, &a.nonce, a.host_id).cmp(&(b.start_time, &b.nonce, b.host_id))
	});
}
