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

use std::{
	collections::BTreeSet,
	fs, io,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use shardsnap_format::{SnapshotFileName, SnapshotRequest, SnapshotType};
use tokio::{
	sync::oneshot,
	task::JoinHandle,
	time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
	config::AutoSnapshotSettings,
	coordinator::{CoordinatorError, SnapshotCoordinator, SnapshotHandle},
};

/// AutoSnapshotScheduler - periodic AUTO snapshots with retention
///
/// Each tick issues one blocking AUTO request through the coordinator.
/// When every host reports SUCCESS, files of AUTO nonces older than the
/// newest `retain` are deleted from the snapshot directory.
///
/// The scheduler does NOT:
/// - Overlap runs (a tick waits for the previous run)
/// - Prune after a failed run
/// - Touch nonces without its prefix
pub struct AutoSnapshotScheduler {
	handle: Option<JoinHandle<()>>,
	shutdown: Option<oneshot::Sender<()>>,
}

impl AutoSnapshotScheduler {
	/// Start the scheduler on the current tokio runtime
	pub fn start(coordinator: Arc<SnapshotCoordinator>, settings: AutoSnapshotSettings) -> Self {
		let (shutdown, mut stop) = oneshot::channel();
		let period = Duration::from_secs(settings.interval_secs.max(1));

		let handle = tokio::spawn(async move {
			info!(
				target: "auto_snapshot",
				interval_secs = period.as_secs(),
				retain = settings.retain,
				path = %settings.path,
				"Auto snapshot scheduler started"
			);

			let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = &mut stop => break,
					_ = ticker.tick() => {
						if let Err(e) = run_once(&coordinator, &settings).await {
							error!(target: "auto_snapshot", error = %e, "Auto snapshot not started");
						}
					}
				}
			}

			info!(target: "auto_snapshot", "Auto snapshot scheduler stopped");
		});

		Self {
			handle: Some(handle),
			shutdown: Some(shutdown),
		}
	}

	/// Stop after the run in progress, if any
	pub async fn shutdown(mut self) {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}
		if let Some(handle) = self.handle.take()
			&& let Err(e) = handle.await
		{
			warn!(target: "auto_snapshot", error = %e, "Auto snapshot task failed");
		}
	}
}

impl Drop for AutoSnapshotScheduler {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}
}

/// Nonce for an AUTO snapshot started at `at`
///
/// The timestamp sorts chronologically as text.
pub fn auto_nonce(prefix: &str, at: DateTime<Utc>) -> String {
	format!("{}_{}", prefix, at.format("%Y%m%dT%H%M%S%3f"))
}

/// One AUTO snapshot, then retention if it fully succeeded
pub async fn run_once(
	coordinator: &SnapshotCoordinator,
	settings: &AutoSnapshotSettings,
) -> Result<SnapshotHandle, CoordinatorError> {
	let nonce = auto_nonce(&settings.nonce_prefix, Utc::now());
	let request = SnapshotRequest::new(&settings.path, &nonce, SnapshotType::Auto, true);
	let handle = coordinator.initiate(request).await?;

	if !handle.succeeded() {
		warn!(
			target: "auto_snapshot",
			nonce = %nonce,
			converged = handle.converged,
			"Auto snapshot incomplete; retention skipped"
		);
		return Ok(handle);
	}
	info!(target: "auto_snapshot", nonce = %nonce, "Auto snapshot completed");

	let dir = PathBuf::from(&settings.path);
	let prefix = settings.nonce_prefix.clone();
	let retain = settings.retain.max(1);
	match tokio::task::spawn_blocking(move || prune_auto_snapshots(&dir, &prefix, retain)).await {
		Ok(Ok(removed)) if !removed.is_empty() => {
			info!(target: "auto_snapshot", removed = ?removed, retained = retain, "Old auto snapshots removed");
		}
		Ok(Ok(_)) => {}
		Ok(Err(e)) => error!(target: "auto_snapshot", error = %e, "Failed to prune auto snapshots"),
		Err(e) => error!(target: "auto_snapshot", error = %e, "Prune task failed"),
	}
	Ok(handle)
}

/// Delete every file of AUTO nonces older than the newest `retain`
///
/// Returns the removed nonces, oldest first.
pub fn prune_auto_snapshots(dir: &Path, prefix: &str, retain: usize) -> io::Result<Vec<String>> {
	let marker = format!("{}_", prefix);
	let mut files = Vec::new();
	let mut nonces = BTreeSet::new();

	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let name = entry.file_name().to_string_lossy().into_owned();
		if let Some(parsed) = SnapshotFileName::parse(&name)
			&& parsed.nonce().starts_with(&marker)
		{
			nonces.insert(parsed.nonce().to_string());
			files.push((parsed.nonce().to_string(), entry.path()));
		}
	}

	let expired: Vec<String> = nonces
		.iter()
		.take(nonces.len().saturating_sub(retain))
		.cloned()
		.collect();
	for (nonce, path) in &files {
		if expired.contains(nonce) {
			fs::remove_file(path)?;
			debug!(target: "auto_snapshot", path = %path.display(), "Removed snapshot file");
		}
	}
	Ok(expired)
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;
	use shardsnap_format::naming::{data_file_name, digest_file_name};

	use super::*;
	use crate::{
		cluster::{InMemoryCommandLog, LocalCluster},
		coordinator::PollPolicy,
	};

	#[test]
	fn test_auto_nonce_is_valid_and_ordered() {
		let early = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
		let late = early + chrono::Duration::milliseconds(1);

		let a = auto_nonce("auto", early);
		assert_eq!(a, "auto_20250102T030405000");
		assert!(shardsnap_format::naming::validate_nonce(&a).is_ok());
		assert!(a < auto_nonce("auto", late));
	}

	#[test]
	fn test_prune_keeps_newest_and_ignores_others() {
		let dir = tempfile::tempdir().unwrap();
		for nonce in ["auto_1", "auto_2", "auto_3", "manual1"] {
			fs::write(dir.path().join(data_file_name(nonce, "P1", 0, 0)), b"x").unwrap();
			fs::write(dir.path().join(digest_file_name(nonce, 0)), b"{}").unwrap();
		}
		fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

		let removed = prune_auto_snapshots(dir.path(), "auto", 2).unwrap();

		assert_eq!(removed, vec!["auto_1".to_string()]);
		assert!(!dir.path().join(digest_file_name("auto_1", 0)).exists());
		assert!(dir.path().join(digest_file_name("auto_2", 0)).exists());
		assert!(dir.path().join(digest_file_name("manual1", 0)).exists());
		assert!(dir.path().join("notes.txt").exists());
	}

	#[tokio::test]
	async fn test_run_once_takes_auto_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		let cluster = Arc::new(
			LocalCluster::builder()
				.hosts(1)
				.sites_per_host(2)
				.k_factor(0)
				.build()
				.unwrap(),
		);
		let coordinator = SnapshotCoordinator::new(
			cluster.clone(),
			cluster.clone(),
			cluster.hashinator().clone(),
			Arc::new(InMemoryCommandLog::new()),
			PollPolicy {
				initial_backoff: Duration::from_millis(10),
				max_backoff: Duration::from_millis(50),
				max_attempts: 400,
			},
		);
		let settings = AutoSnapshotSettings {
			enabled: true,
			path: dir.path().to_string_lossy().into_owned(),
			retain: 1,
			..AutoSnapshotSettings::default()
		};

		let first = run_once(&coordinator, &settings).await.unwrap();
		assert!(first.succeeded());
		assert_eq!(first.snapshot_type, SnapshotType::Auto);

		tokio::time::sleep(Duration::from_millis(5)).await;
		let second = run_once(&coordinator, &settings).await.unwrap();
		assert!(second.succeeded());
		assert!(!dir.path().join(digest_file_name(&first.nonce, 0)).exists());
		assert!(dir.path().join(digest_file_name(&second.nonce, 0)).exists());
	}
}
