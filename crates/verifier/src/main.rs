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

//! Offline snapshot verifier
//!
//! Exit codes: 0 every checked nonce is valid, 1 corruption or a
//! requested nonce was not found, 2 the verifier could not run.

use std::{io, path::PathBuf, process::ExitCode};

use clap::Parser;
use shardsnap_format::HashinatorScheme;
use shardsnap_verifier::{VerifyOptions, logging, verify_snapshots};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "shardsnap-verify")]
struct Args {
	/// Snapshot directories to scan
	#[arg(required = true)]
	dirs: Vec<PathBuf>,
	/// Only check these nonces (repeatable)
	#[arg(long = "nonce")]
	nonces: Vec<String>,
	/// Hashinator scheme the cluster is expected to run
	#[arg(long, value_parser = parse_scheme)]
	expect_scheme: Option<HashinatorScheme>,
}

fn parse_scheme(s: &str) -> Result<HashinatorScheme, String> {
	match s.to_ascii_lowercase().as_str() {
		"elastic" => Ok(HashinatorScheme::Elastic),
		"legacy" => Ok(HashinatorScheme::Legacy),
		other => Err(format!("unknown hashinator scheme: {}", other)),
	}
}

fn main() -> ExitCode {
	let args = Args::parse();
	if let Err(e) = logging::init_logging() {
		eprintln!("{:#}", e);
	}

	let options = VerifyOptions {
		dirs: args.dirs,
		nonces: args.nonces.into_iter().collect(),
		expected_scheme: args.expect_scheme,
	};

	let summary = match verify_snapshots(&options) {
		Ok(summary) => summary,
		Err(e) => {
			error!(target: "verifier", error = %e, "Verification could not run");
			eprintln!("{}", e);
			return ExitCode::from(2);
		}
	};

	if let Err(e) = summary.write_report(&mut io::stdout().lock()) {
		eprintln!("Failed to write report: {}", e);
		return ExitCode::from(2);
	}

	if summary.passed() {
		ExitCode::SUCCESS
	} else {
		ExitCode::from(1)
	}
}
