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

//! In-process cluster
//!
//! Every host runs in this process and shares one table store. Transport
//! is a direct call into the host worker, so "unreachable" only ever
//! means a host was marked down.

use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
};

use dashmap::DashSet;
use shardsnap_format::{
	HashinatorConfig, HashinatorScheme, HostId, HostSnapshotStatus, PartitionId, SnapshotRequest,
	StatusScope, TableId,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use super::{ClusterTransport, DispatchError, Membership, StaticHashinator};
use crate::{
	config::EngineConfig,
	host::{HostError, HostSettings, HostSpec, SnapshotHost},
	source::MemoryTableStore,
	target::{NoFaults, WriteFaultPolicy},
};

#[derive(Debug, Error)]
pub enum ClusterError {
	#[error("Invalid cluster shape: {0}")]
	InvalidShape(String),
	#[error(transparent)]
	Host(#[from] HostError),
}

/// Host count, sites per host and replication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterShape {
	pub hosts: u32,
	pub sites_per_host: u32,
	pub k_factor: u32,
}

impl ClusterShape {
	pub fn new(hosts: u32, sites_per_host: u32, k_factor: u32) -> Result<Self, ClusterError> {
		if hosts == 0 || sites_per_host == 0 {
			return Err(ClusterError::InvalidShape(
				"hosts and sites per host must be positive".to_string(),
			));
		}
		if k_factor + 1 > hosts {
			return Err(ClusterError::InvalidShape(format!(
				"k-factor {} needs at least {} hosts, have {}",
				k_factor,
				k_factor + 1,
				hosts
			)));
		}
		if (hosts * sites_per_host) % (k_factor + 1) != 0 {
			return Err(ClusterError::InvalidShape(format!(
				"{} sites cannot be split into replica sets of {}",
				hosts * sites_per_host,
				k_factor + 1
			)));
		}
		Ok(Self {
			hosts,
			sites_per_host,
			k_factor,
		})
	}

	pub fn partition_count(&self) -> u32 {
		self.hosts * self.sites_per_host / (self.k_factor + 1)
	}

	/// Hosts carrying a replica of `partition`
	///
	/// Replica `r` of partition `p` lives on site `p * (k + 1) + r`, and
	/// sites are dealt round-robin over hosts.
	pub fn replica_hosts(&self, partition: PartitionId) -> Vec<HostId> {
		let replicas = self.k_factor + 1;
		(0..replicas)
			.map(|r| (partition * replicas + r) % self.hosts)
			.collect()
	}

	pub fn partitions_on(&self, host: HostId) -> Vec<PartitionId> {
		(0..self.partition_count())
			.filter(|&p| self.replica_hosts(p).contains(&host))
			.collect()
	}
}

pub struct LocalClusterBuilder {
	hosts: u32,
	sites_per_host: u32,
	k_factor: u32,
	tables: Vec<TableId>,
	scheme: HashinatorScheme,
	tokens_per_partition: u32,
	catalog_id: String,
	faults: Arc<dyn WriteFaultPolicy>,
	host_faults: HashMap<HostId, Arc<dyn WriteFaultPolicy>>,
	settings: HostSettings,
}

impl Default for LocalClusterBuilder {
	fn default() -> Self {
		let config = EngineConfig::default();
		Self {
			hosts: config.cluster.hosts,
			sites_per_host: config.cluster.sites_per_host,
			k_factor: config.cluster.k_factor,
			tables: config.cluster.tables,
			scheme: config.cluster.hashinator,
			tokens_per_partition: config.cluster.tokens_per_partition,
			catalog_id: "catalog-1".to_string(),
			faults: Arc::new(NoFaults),
			host_faults: HashMap::new(),
			settings: HostSettings::default(),
		}
	}
}

impl LocalClusterBuilder {
	pub fn hosts(mut self, hosts: u32) -> Self {
		self.hosts = hosts;
		self
	}

	pub fn sites_per_host(mut self, sites_per_host: u32) -> Self {
		self.sites_per_host = sites_per_host;
		self
	}

	pub fn k_factor(mut self, k_factor: u32) -> Self {
		self.k_factor = k_factor;
		self
	}

	pub fn tables<I, T>(mut self, tables: I) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<TableId>,
	{
		self.tables = tables.into_iter().map(Into::into).collect();
		self
	}

	pub fn hashinator(mut self, scheme: HashinatorScheme, tokens_per_partition: u32) -> Self {
		self.scheme = scheme;
		self.tokens_per_partition = tokens_per_partition;
		self
	}

	pub fn catalog_id(mut self, catalog_id: impl Into<String>) -> Self {
		self.catalog_id = catalog_id.into();
		self
	}

	/// Fault policy for every host without an override
	pub fn faults(mut self, faults: Arc<dyn WriteFaultPolicy>) -> Self {
		self.faults = faults;
		self
	}

	pub fn host_faults(mut self, host: HostId, faults: Arc<dyn WriteFaultPolicy>) -> Self {
		self.host_faults.insert(host, faults);
		self
	}

	pub fn settings(mut self, settings: HostSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn build(self) -> Result<LocalCluster, ClusterError> {
		let shape = ClusterShape::new(self.hosts, self.sites_per_host, self.k_factor)?;
		let config = match self.scheme {
			HashinatorScheme::Elastic => {
				HashinatorConfig::elastic(shape.partition_count(), self.tokens_per_partition)
			}
			HashinatorScheme::Legacy => HashinatorConfig::legacy(shape.partition_count()),
		};
		let hashinator = Arc::new(StaticHashinator::new(config));
		let store = Arc::new(MemoryTableStore::new(
			self.catalog_id,
			self.tables,
			hashinator.clone(),
		));
		let (status_tx, _) = watch::channel(0);
		let status_tx = Arc::new(status_tx);

		let mut hosts = BTreeMap::new();
		for host_id in 0..shape.hosts {
			let faults = self
				.host_faults
				.get(&host_id)
				.cloned()
				.unwrap_or_else(|| self.faults.clone());
			let host = SnapshotHost::start(
				HostSpec {
					host_id,
					partitions: shape.partitions_on(host_id),
					source: store.clone(),
					hashinator: hashinator.clone(),
					faults,
					status_notifier: Some(status_tx.clone()),
				},
				self.settings.clone(),
			)?;
			hosts.insert(host_id, host);
		}

		info!(
			target: "cluster",
			hosts = shape.hosts,
			sites_per_host = shape.sites_per_host,
			k_factor = shape.k_factor,
			partitions = shape.partition_count(),
			"Local cluster started"
		);

		Ok(LocalCluster {
			shape,
			hosts,
			down: DashSet::new(),
			hashinator,
			store,
			status_tx,
		})
	}
}

/// Every host of a cluster, in one process
pub struct LocalCluster {
	shape: ClusterShape,
	hosts: BTreeMap<HostId, SnapshotHost>,
	down: DashSet<HostId>,
	hashinator: Arc<StaticHashinator>,
	store: Arc<MemoryTableStore>,
	status_tx: Arc<watch::Sender<u64>>,
}

impl LocalCluster {
	pub fn builder() -> LocalClusterBuilder {
		LocalClusterBuilder::default()
	}

	pub fn from_config(config: &EngineConfig) -> Result<Self, ClusterError> {
		Self::builder()
			.hosts(config.cluster.hosts)
			.sites_per_host(config.cluster.sites_per_host)
			.k_factor(config.cluster.k_factor)
			.tables(config.cluster.tables.iter().cloned())
			.hashinator(config.cluster.hashinator, config.cluster.tokens_per_partition)
			.settings(HostSettings::from_config(config))
			.build()
	}

	pub fn shape(&self) -> ClusterShape {
		self.shape
	}

	pub fn host(&self, host_id: HostId) -> Option<&SnapshotHost> {
		self.hosts.get(&host_id)
	}

	pub fn hosts(&self) -> impl Iterator<Item = &SnapshotHost> {
		self.hosts.values()
	}

	pub fn store(&self) -> &Arc<MemoryTableStore> {
		&self.store
	}

	pub fn hashinator(&self) -> &Arc<StaticHashinator> {
		&self.hashinator
	}

	/// Take a host out of the live set; it keeps its local state
	pub fn mark_down(&self, host_id: HostId) {
		info!(target: "cluster", host_id = host_id, "Host marked down");
		self.down.insert(host_id);
	}

	pub fn mark_up(&self, host_id: HostId) {
		self.down.remove(&host_id);
	}

	/// Bring a host back after a partition; its snapshot state is dropped
	pub fn rejoin(&self, host_id: HostId) {
		if let Some(host) = self.hosts.get(&host_id) {
			host.rejoin();
		}
		self.mark_up(host_id);
	}

	/// Whether any host hit an unrecoverable condition
	pub fn fatal_signalled(&self) -> bool {
		self.hosts.values().any(SnapshotHost::fatal_signalled)
	}

	pub fn shutdown(self) {
		for host in self.hosts.into_values() {
			host.shutdown();
		}
		info!(target: "cluster", "Local cluster stopped");
	}

	fn reachable(&self, host_id: HostId) -> Result<&SnapshotHost, DispatchError> {
		if self.down.contains(&host_id) {
			return Err(DispatchError::HostUnreachable(host_id));
		}
		self.hosts
			.get(&host_id)
			.ok_or(DispatchError::HostUnreachable(host_id))
	}
}

impl Membership for LocalCluster {
	fn live_hosts(&self) -> Vec<HostId> {
		self.hosts
			.keys()
			.copied()
			.filter(|id| !self.down.contains(id))
			.collect()
	}
}

impl ClusterTransport for LocalCluster {
	fn dispatch(&self, host: HostId, request: Arc<SnapshotRequest>) -> Result<(), DispatchError> {
		Ok(self.reachable(host)?.dispatch(request)?)
	}

	fn host_status(
		&self,
		host: HostId,
		scope: &StatusScope,
	) -> Result<Vec<HostSnapshotStatus>, DispatchError> {
		Ok(self.reachable(host)?.status(scope))
	}

	fn active_snapshot(&self, host: HostId) -> Result<Option<String>, DispatchError> {
		Ok(self.reachable(host)?.registry().in_flight())
	}

	fn status_updates(&self) -> Option<watch::Receiver<u64>> {
		Some(self.status_tx.subscribe())
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;

	#[test]
	fn test_replicas_land_on_distinct_hosts() {
		let shape = ClusterShape::new(3, 4, 1).unwrap();
		assert_eq!(shape.partition_count(), 6);

		for partition in 0..6 {
			let hosts: BTreeSet<HostId> = shape.replica_hosts(partition).into_iter().collect();
			assert_eq!(hosts.len(), 2);
		}
		for host in 0..3 {
			assert_eq!(shape.partitions_on(host).len(), 4);
		}
	}

	#[test]
	fn test_invalid_shapes_are_refused() {
		assert!(ClusterShape::new(2, 4, 2).is_err());
		assert!(ClusterShape::new(3, 1, 1).is_err());
		assert!(ClusterShape::new(0, 4, 0).is_err());
	}

	#[test]
	fn test_down_host_is_unreachable() {
		let cluster = LocalCluster::builder()
			.hosts(2)
			.sites_per_host(2)
			.k_factor(0)
			.build()
			.unwrap();
		assert_eq!(cluster.live_hosts(), vec![0, 1]);

		cluster.mark_down(1);
		assert_eq!(cluster.live_hosts(), vec![0]);
		assert!(matches!(
			cluster.host_status(1, &StatusScope::all()),
			Err(DispatchError::HostUnreachable(1))
		));

		cluster.rejoin(1);
		assert_eq!(cluster.live_hosts(), vec![0, 1]);
		assert!(cluster.status_updates().is_some());
		cluster.shutdown();
	}
}
