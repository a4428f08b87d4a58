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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardsnap_format::HashinatorScheme;

/// Environment prefix, e.g. `SHARDSNAP_SNAPSHOT__CHUNK_SIZE_BYTES=65536`
pub const ENV_PREFIX: &str = "SHARDSNAP";

// Logging configuration constants
/// Default log level (can be overridden by RUST_LOG environment variable)
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log directory component name
pub const LOG_COMPONENT_NAME: &str = "node";

/// Default console output enabled (can be overridden by LOG_TO_CONSOLE environment variable)
pub const DEFAULT_LOG_TO_CONSOLE: bool = false;

// Write path constants
/// Default upper bound on the encoded size of one chunk
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 128 * 1024;

/// Default for syncing each chunk to disk before the next one starts
pub const DEFAULT_SYNC_EACH_CHUNK: bool = true;

/// Default number of status rows each host keeps
pub const DEFAULT_STATUS_HISTORY_CAPACITY: usize = 64;

// Blocking poll constants
pub const DEFAULT_POLL_INITIAL_BACKOFF_MS: u64 = 100;
pub const DEFAULT_POLL_MAX_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 60;

// In-process cluster shape
pub const DEFAULT_CLUSTER_HOSTS: u32 = 3;
pub const DEFAULT_SITES_PER_HOST: u32 = 4;
pub const DEFAULT_K_FACTOR: u32 = 1;
pub const DEFAULT_TOKENS_PER_PARTITION: u32 = 8;

// AUTO snapshot constants
pub const DEFAULT_AUTO_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_AUTO_RETAIN: usize = 2;
pub const DEFAULT_AUTO_PATH: &str = "./snapshots";
pub const DEFAULT_AUTO_NONCE_PREFIX: &str = "auto";

/// Snapshot node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	pub snapshot: SnapshotSettings,
	pub poll: PollSettings,
	pub escalation: EscalationSettings,
	pub cluster: ClusterSettings,
	pub auto_snapshot: AutoSnapshotSettings,
}

/// Host-side write path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
	pub chunk_size_bytes: usize,
	pub sync_each_chunk: bool,
	pub status_history_capacity: usize,
}

impl Default for SnapshotSettings {
	fn default() -> Self {
		Self {
			chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
			sync_each_chunk: DEFAULT_SYNC_EACH_CHUNK,
			status_history_capacity: DEFAULT_STATUS_HISTORY_CAPACITY,
		}
	}
}

/// Backoff used by blocking initiate calls while waiting for host rows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
	pub initial_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub max_attempts: u32,
}

impl Default for PollSettings {
	fn default() -> Self {
		Self {
			initial_backoff_ms: DEFAULT_POLL_INITIAL_BACKOFF_MS,
			max_backoff_ms: DEFAULT_POLL_MAX_BACKOFF_MS,
			max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
		}
	}
}

impl PollSettings {
	pub fn initial_backoff(&self) -> Duration {
		Duration::from_millis(self.initial_backoff_ms)
	}

	pub fn max_backoff(&self) -> Duration {
		Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
	}
}

/// What to do when a host detects an unrecoverable condition mid-cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
	/// Abort the whole process instead of failing the host row
	pub abort_on_fatal: bool,
}

/// Shape of the in-process cluster started by the node binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
	pub hosts: u32,
	pub sites_per_host: u32,
	pub k_factor: u32,
	pub hashinator: HashinatorScheme,
	pub tokens_per_partition: u32,
	pub tables: Vec<String>,
}

impl Default for ClusterSettings {
	fn default() -> Self {
		Self {
			hosts: DEFAULT_CLUSTER_HOSTS,
			sites_per_host: DEFAULT_SITES_PER_HOST,
			k_factor: DEFAULT_K_FACTOR,
			hashinator: HashinatorScheme::Elastic,
			tokens_per_partition: DEFAULT_TOKENS_PER_PARTITION,
			tables: vec!["P1".to_string()],
		}
	}
}

/// Periodic AUTO snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSnapshotSettings {
	pub enabled: bool,
	pub interval_secs: u64,
	/// Number of most recent AUTO snapshots kept on disk
	pub retain: usize,
	pub path: String,
	pub nonce_prefix: String,
}

impl Default for AutoSnapshotSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			interval_secs: DEFAULT_AUTO_INTERVAL_SECS,
			retain: DEFAULT_AUTO_RETAIN,
			path: DEFAULT_AUTO_PATH.to_string(),
			nonce_prefix: DEFAULT_AUTO_NONCE_PREFIX.to_string(),
		}
	}
}

impl EngineConfig {
	/// Load configuration from environment variables
	pub fn from_env() -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(Self::env_source())
			.build()?;

		cfg.try_deserialize()
	}

	/// Load configuration from file, with environment overrides
	pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(config::File::with_name(path))
			.add_source(Self::env_source())
			.build()?;

		cfg.try_deserialize()
	}

	fn env_source() -> config::Environment {
		config::Environment::with_prefix(ENV_PREFIX)
			.prefix_separator("_")
			.separator("__")
			.try_parsing(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = EngineConfig::default();
		assert_eq!(config.snapshot.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
		assert_eq!(config.poll.max_attempts, 60);
		assert_eq!(config.poll.initial_backoff(), Duration::from_millis(100));
		assert!(!config.escalation.abort_on_fatal);
		assert!(!config.auto_snapshot.enabled);
	}

	#[test]
	fn test_partial_file_keeps_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("node.toml");
		std::fs::write(
			&path,
			"[snapshot]\nchunk_size_bytes = 4096\n\n[cluster]\nhosts = 5\nhashinator = \"legacy\"\n",
		)
		.unwrap();

		let config = EngineConfig::from_file(path.to_str().unwrap()).unwrap();
		assert_eq!(config.snapshot.chunk_size_bytes, 4096);
		assert_eq!(
			config.snapshot.status_history_capacity,
			DEFAULT_STATUS_HISTORY_CAPACITY
		);
		assert_eq!(config.cluster.hosts, 5);
		assert_eq!(config.cluster.hashinator, HashinatorScheme::Legacy);
		assert_eq!(config.cluster.sites_per_host, DEFAULT_SITES_PER_HOST);
	}
}
