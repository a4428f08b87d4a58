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

//! Cluster collaborators
//!
//! The snapshot subsystem does not own membership, partitioning or the
//! command log. It consumes them through the traits below:
//! - [`Membership`]: live host set
//! - [`Hashinator`]: current partitioning configuration
//! - [`CommandLog`]: truncation anchor for COMMANDLOG snapshots
//! - [`ClusterTransport`]: request dispatch and status fan-out to hosts

mod local;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use shardsnap_format::{
	HashinatorConfig, HostId, HostSnapshotStatus, PartitionId, SnapshotRequest, StatusScope,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::host::HostError;

pub use local::{ClusterError, ClusterShape, LocalCluster, LocalClusterBuilder};

/// Error types for reaching a host
#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("Host {0} is unreachable")]
	HostUnreachable(HostId),
	#[error(transparent)]
	Rejected(#[from] HostError),
}

/// Live host set
pub trait Membership: Send + Sync {
	fn live_hosts(&self) -> Vec<HostId>;
}

/// Partition mapping oracle
pub trait Hashinator: Send + Sync {
	/// Configuration currently in effect
	fn current(&self) -> HashinatorConfig;

	fn partition_for_key(&self, key: i64) -> PartitionId {
		self.current().partition_for_key(key)
	}
}

/// Write-ahead command log, as far as snapshots care
pub trait CommandLog: Send + Sync {
	/// Log position up to which segments may be dropped once a truncation
	/// snapshot completes
	fn truncation_anchor(&self) -> Option<u64>;
}

/// Request fan-out to hosts
///
/// `dispatch` blocks until the host has accepted or rejected the request,
/// never until the snapshot finishes.
pub trait ClusterTransport: Send + Sync {
	fn dispatch(&self, host: HostId, request: Arc<SnapshotRequest>) -> Result<(), DispatchError>;

	fn host_status(
		&self,
		host: HostId,
		scope: &StatusScope,
	) -> Result<Vec<HostSnapshotStatus>, DispatchError>;

	/// Nonce of the snapshot cycle `host` is running right now, if any
	fn active_snapshot(&self, host: HostId) -> Result<Option<String>, DispatchError>;

	/// Generation counter bumped whenever any host records a status row
	fn status_updates(&self) -> Option<watch::Receiver<u64>> {
		None
	}
}

/// Hashinator holding a fixed configuration until told otherwise
pub struct StaticHashinator {
	config: RwLock<HashinatorConfig>,
}

impl StaticHashinator {
	pub fn new(config: HashinatorConfig) -> Self {
		Self {
			config: RwLock::new(config),
		}
	}

	/// Install a new configuration, as an elastic rebalance would
	pub fn update(&self, config: HashinatorConfig) {
		*self.config.write() = config;
	}
}

impl Hashinator for StaticHashinator {
	fn current(&self) -> HashinatorConfig {
		self.config.read().clone()
	}
}

/// Command log stand-in whose anchor is set by the caller
#[derive(Default)]
pub struct InMemoryCommandLog {
	anchor: Mutex<Option<u64>>,
}

impl InMemoryCommandLog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_anchor(&self, anchor: u64) {
		*self.anchor.lock() = Some(anchor);
	}
}

impl CommandLog for InMemoryCommandLog {
	fn truncation_anchor(&self) -> Option<u64> {
		*self.anchor.lock()
	}
}
