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

//! Snapshot node entry point
//!
//! Runs an in-process cluster and wires up:
//! - Local cluster (hosts, shared table store, hashinator)
//! - Snapshot coordinator
//! - Auto snapshot scheduler (when enabled)
//!
//! With `--nonce` it takes one MANUAL snapshot, prints the host rows and
//! exits; otherwise it runs until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shardsnap_engine::{
	AutoSnapshotScheduler, EngineConfig, InMemoryCommandLog, LocalCluster, PollPolicy,
	SnapshotCoordinator,
};
use shardsnap_format::{SnapshotRequest, SnapshotType};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shardsnap-node")]
struct Args {
	/// Configuration file; SHARDSNAP_* environment variables override it
	#[arg(long)]
	config: Option<String>,
	/// Take one snapshot with this nonce and exit
	#[arg(long)]
	nonce: Option<String>,
	/// Directory for the one-off snapshot
	#[arg(long, default_value = "./snapshots")]
	snapshot_path: String,
	/// MANUAL, AUTO or COMMANDLOG
	#[arg(long, default_value = "MANUAL")]
	snapshot_type: SnapshotType,
	/// Rows to insert into every table before starting
	#[arg(long, default_value_t = 0)]
	seed_rows: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	shardsnap_engine::logging::init_logging()?;

	let config = match &args.config {
		Some(path) => EngineConfig::from_file(path)
			.with_context(|| format!("Failed to load configuration from {}", path))?,
		None => EngineConfig::from_env().unwrap_or_else(|_| {
			info!(target: "server", "Using default configuration");
			EngineConfig::default()
		}),
	};

	info!(target: "server", "Starting shardsnap node");
	info!(target: "server", "Hosts: {}", config.cluster.hosts);
	info!(target: "server", "Sites per host: {}", config.cluster.sites_per_host);
	info!(target: "server", "K-factor: {}", config.cluster.k_factor);

	let cluster = Arc::new(LocalCluster::from_config(&config).context("Failed to start cluster")?);
	for table in &config.cluster.tables {
		for key in 0..args.seed_rows {
			cluster
				.store()
				.insert(table, key, format!("{}:{}", table, key).into_bytes())
				.with_context(|| format!("Failed to seed table {}", table))?;
		}
	}

	let command_log = Arc::new(InMemoryCommandLog::new());
	command_log.set_anchor(0);
	let coordinator = Arc::new(SnapshotCoordinator::new(
		cluster.clone(),
		cluster.clone(),
		cluster.hashinator().clone(),
		command_log,
		PollPolicy::from(&config.poll),
	));

	if let Some(nonce) = args.nonce {
		let request = SnapshotRequest::new(args.snapshot_path, nonce, args.snapshot_type, true);
		let handle = coordinator
			.initiate(request)
			.await
			.context("Snapshot request refused")?;

		for row in &handle.dispatch {
			println!(
				"HOST_ID={} RESULT={} ERR_MSG={}",
				row.host_id,
				row.result,
				row.err_msg.as_deref().unwrap_or("")
			);
		}
		for status in &handle.statuses {
			println!(
				"NONCE={} TYPE={} HOST_ID={} RESULT={} START_TIME={} COMPLETION_TIME={}",
				status.nonce,
				status.snapshot_type,
				status.host_id,
				status.result,
				status.start_time.to_rfc3339(),
				status.completion_time.to_rfc3339()
			);
		}
		if !handle.succeeded() {
			anyhow::bail!("Snapshot {} did not succeed on every host", handle.nonce);
		}
		return Ok(());
	}

	let scheduler = config
		.auto_snapshot
		.enabled
		.then(|| AutoSnapshotScheduler::start(coordinator.clone(), config.auto_snapshot.clone()));

	signal::ctrl_c()
		.await
		.context("Failed to listen for shutdown signal")?;
	info!(target: "server", "Shutting down...");

	if let Some(scheduler) = scheduler {
		scheduler.shutdown().await;
	}
	info!(target: "server", "Shutdown complete");
	Ok(())
}
