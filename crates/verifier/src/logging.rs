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

//! Logging for the verifier binary
//!
//! stdout carries the report, so logs go to stderr only. `RUST_LOG`
//! filters as usual (default: `warn`).

use anyhow::{Context, Result};
use tracing_subscriber::{
	EnvFilter, fmt, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt,
};

pub const DEFAULT_LOG_LEVEL: &str = "warn";

pub fn init_logging() -> Result<()> {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

	Registry::default()
		.with(filter)
		.with(
			fmt::layer()
				.with_writer(std::io::stderr)
				.with_timer(fmt::time::UtcTime::rfc_3339())
				.with_target(true)
				.with_ansi(false),
		)
		.try_init()
		.context("Failed to install tracing subscriber")
}
