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

//! Shardsnap Verifier - offline snapshot checking
//!
//! Reads snapshot directories, never writes them. For each nonce it merges
//! the host digests, validates every listed data file chunk by chunk, and
//! reconciles the files on disk with the manifest.
//!
//! The verifier does NOT:
//! - Repair or delete anything
//! - Talk to a running cluster
//! - Restore data

pub mod check;
pub mod discover;
pub mod logging;
pub mod report;

use std::{collections::BTreeSet, io, path::PathBuf};

use shardsnap_format::HashinatorScheme;
use thiserror::Error;
use tracing::info;

pub use report::{CorruptionReason, NonceReport, VerificationSummary, Verdict};

/// Error types for the verifier itself, not for what it finds
#[derive(Debug, Error)]
pub enum VerifyError {
	#[error("Cannot read snapshot directory {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("No snapshot directories given")]
	NoDirectories,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
	pub dirs: Vec<PathBuf>,
	/// Nonces to check; empty means every nonce found
	pub nonces: BTreeSet<String>,
	pub expected_scheme: Option<HashinatorScheme>,
}

/// Check every selected nonce under `options.dirs`
pub fn verify_snapshots(options: &VerifyOptions) -> Result<VerificationSummary, VerifyError> {
	if options.dirs.is_empty() {
		return Err(VerifyError::NoDirectories);
	}

	let mut found = discover::discover(&options.dirs)?;
	let selected: BTreeSet<String> = if options.nonces.is_empty() {
		found.keys().cloned().collect()
	} else {
		options.nonces.clone()
	};

	let mut summary = VerificationSummary::default();
	for nonce in selected {
		let report = match found.remove(&nonce) {
			Some(inventory) if !inventory.is_empty() => {
				check::check_nonce(&nonce, &inventory, options.expected_scheme)
			}
			_ => NonceReport {
				nonce,
				verdict: Verdict::NotFound,
				notes: Vec::new(),
			},
		};
		summary.reports.push(report);
	}

	info!(
		target: "verifier",
		checked = summary.reports.len(),
		corrupted = summary.corrupted().count(),
		"Verification finished"
	);
	Ok(summary)
}
