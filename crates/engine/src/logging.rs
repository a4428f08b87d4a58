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

//! Logging initialization for the snapshot node
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log level filter (default: `info`)
//!   - Can be set per target: `RUST_LOG=info,site=debug,registry=debug`
//!
//! - `LOG_DIR`: Root directory for log files (default: `{workspace_root}/logs`)
//!   - Log files are created in `{LOG_DIR}/node/`
//!
//! - `LOG_TO_CONSOLE`: Enable console output (default: `false`)
//!   - Set to `true`, `1`, or `yes` to also log to stderr with ANSI colors
//!
//! # Log File Format
//!
//! - Rotation: one file per day (UTC), e.g. `node.2026-01-03.log`
//! - Format: UTC timestamp, thread ID, log level, target, message

use std::{
	env,
	path::{Path, PathBuf},
	sync::OnceLock,
};

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::{
	non_blocking,
	rolling::{self, Rotation},
};
use tracing_subscriber::{
	EnvFilter, fmt, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt,
};

use crate::config::{DEFAULT_LOG_LEVEL, DEFAULT_LOG_TO_CONSOLE, LOG_COMPONENT_NAME};

// Keeps the non-blocking writer flushing until process exit
static LOG_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

/// Walk up from the current directory to the workspace root
fn find_workspace_root() -> PathBuf {
	let start = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

	let mut current = start.clone();
	loop {
		let cargo_toml = current.join("Cargo.toml");
		if let Ok(content) = std::fs::read_to_string(&cargo_toml)
			&& content.contains("[workspace]")
		{
			return current;
		}
		match current.parent() {
			Some(parent) => current = parent.to_path_buf(),
			None => return start,
		}
	}
}

fn get_log_root() -> PathBuf {
	env::var("LOG_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(|_| find_workspace_root().join("logs"))
}

/// Daily appender writing `{LOG_COMPONENT_NAME}.{date}.log`
///
/// The appender puts the separator in front of the suffix itself.
fn file_appender(log_dir: &Path) -> Result<rolling::RollingFileAppender> {
	rolling::RollingFileAppender::builder()
		.rotation(Rotation::DAILY)
		.filename_prefix(LOG_COMPONENT_NAME.to_string())
		.filename_suffix("log")
		.build(log_dir)
		.with_context(|| {
			format!(
				"Failed to create rolling file appender in {}",
				log_dir.display()
			)
		})
}

fn setup_file_logging(log_dir: &Path) -> Result<non_blocking::NonBlocking> {
	let (file_writer, guard) = non_blocking(file_appender(log_dir)?);
	LOG_GUARD.set(guard).ok();

	Ok(file_writer)
}

/// Initialize logging with file output and optional console output
pub fn init_logging() -> Result<()> {
	dotenv::dotenv().ok();

	let log_level = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

	let log_dir = get_log_root().join(LOG_COMPONENT_NAME);
	std::fs::create_dir_all(&log_dir)
		.with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

	let file_writer = setup_file_logging(&log_dir)?;

	let log_to_console = env::var("LOG_TO_CONSOLE")
		.map(|v| v == "true" || v == "1" || v == "yes")
		.unwrap_or(DEFAULT_LOG_TO_CONSOLE);

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

	let subscriber = Registry::default().with(filter).with(
		fmt::layer()
			.with_writer(file_writer)
			.with_timer(fmt::time::UtcTime::rfc_3339())
			.with_thread_ids(true)
			.with_target(true)
			.with_thread_names(false)
			.with_ansi(false),
	);

	if log_to_console {
		subscriber
			.with(
				fmt::layer()
					.with_writer(std::io::stderr)
					.with_timer(fmt::time::UtcTime::rfc_3339())
					.with_thread_ids(true)
					.with_target(true)
					.with_thread_names(false)
					.with_ansi(true),
			)
			.try_init()
			.context("Failed to install tracing subscriber")?;
	} else {
		subscriber
			.try_init()
			.context("Failed to install tracing subscriber")?;
	}

	info!(target: "server", "Log level: {}", log_level);
	info!(target: "server", "Log directory: {}", log_dir.display());
	if log_to_console {
		info!(target: "server", "Console output: enabled");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn test_log_file_name_has_single_separator() {
		let dir = tempfile::tempdir().unwrap();
		let mut appender = file_appender(dir.path()).unwrap();
		appender.write_all(b"line\n").unwrap();
		appender.flush().unwrap();

		let names: Vec<String> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(names.len(), 1);
		let name = &names[0];
		assert!(name.starts_with(&format!("{}.", LOG_COMPONENT_NAME)));
		assert!(name.ends_with(".log"));
		assert!(!name.contains(".."), "unexpected log file name {}", name);
	}
}
