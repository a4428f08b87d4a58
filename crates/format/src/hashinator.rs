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

//! Hashinator configuration
//!
//! The hashinator maps a partitioning key to a partition id. Two schemes
//! exist:
//! - Elastic: a sorted token ring, each token owning the range up to the
//!   next token. Supports rebalancing by moving tokens.
//! - Legacy: static `hash(key) mod partition_count`, no tokens.
//!
//! Snapshots capture the configuration in effect when they were taken so
//! the verifier can check that every partition is accounted for.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::types::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashinatorScheme {
	Elastic,
	Legacy,
}

impl fmt::Display for HashinatorScheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HashinatorScheme::Elastic => f.write_str("elastic"),
			HashinatorScheme::Legacy => f.write_str("legacy"),
		}
	}
}

/// Start of a token range and the partition that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
	pub token: i32,
	pub partition: PartitionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashinatorConfig {
	pub scheme: HashinatorScheme,
	pub partition_count: u32,
	/// Sorted by token; empty for the legacy scheme
	pub tokens: Vec<TokenRange>,
}

impl HashinatorConfig {
	/// Build an elastic ring with `tokens_per_partition` evenly spaced
	/// tokens per partition, assigned round-robin.
	pub fn elastic(partition_count: u32, tokens_per_partition: u32) -> Self {
		let total = u64::from(partition_count.max(1)) * u64::from(tokens_per_partition.max(1));
		let step = (1u64 << 32) / total;

		let tokens = (0..total)
			.map(|i| TokenRange {
				token: (i64::from(i32::MIN) + (i * step) as i64) as i32,
				partition: (i % u64::from(partition_count.max(1))) as PartitionId,
			})
			.collect();

		Self {
			scheme: HashinatorScheme::Elastic,
			partition_count,
			tokens,
		}
	}

	pub fn legacy(partition_count: u32) -> Self {
		Self {
			scheme: HashinatorScheme::Legacy,
			partition_count,
			tokens: Vec::new(),
		}
	}

	/// Distinct partition ids this configuration can route to
	pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
		match self.scheme {
			HashinatorScheme::Elastic => self.tokens.iter().map(|t| t.partition).collect(),
			HashinatorScheme::Legacy => (0..self.partition_count).collect(),
		}
	}

	/// Route a partitioning key
	pub fn partition_for_key(&self, key: i64) -> PartitionId {
		let hash = mix64(key as u64);
		match self.scheme {
			HashinatorScheme::Legacy => (hash % u64::from(self.partition_count.max(1))) as PartitionId,
			HashinatorScheme::Elastic => self.partition_for_token(hash as u32 as i32),
		}
	}

	fn partition_for_token(&self, token: i32) -> PartitionId {
		// Ranges start at their token; the owner is the last token <= value.
		match self.tokens.binary_search_by(|r| r.token.cmp(&token)) {
			Ok(idx) => self.tokens[idx].partition,
			Err(0) => self.tokens.last().map(|r| r.partition).unwrap_or(0),
			Err(idx) => self.tokens[idx - 1].partition,
		}
	}

	/// Check internal consistency of the captured configuration
	///
	/// Returns a description of every problem found.
	pub fn consistency_problems(&self) -> Vec<String> {
		let mut problems = Vec::new();

		if self.partition_count == 0 {
			problems.push("hashinator reports zero partitions".to_string());
		}

		match self.scheme {
			HashinatorScheme::Elastic => {
				if self.tokens.windows(2).any(|w| w[0].token >= w[1].token) {
					problems.push("elastic token ring is not strictly sorted".to_string());
				}
				let live = self.partition_ids().len() as u32;
				if live != self.partition_count {
					problems.push(format!(
						"token ring maps to {} partitions but partition count is {}",
						live, self.partition_count
					));
				}
			}
			HashinatorScheme::Legacy => {
				if !self.tokens.is_empty() {
					problems.push("legacy hashinator carries a token ring".to_string());
				}
			}
		}

		problems
	}
}

/// 64-bit finalizer (MurmurHash3 fmix64)
fn mix64(mut k: u64) -> u64 {
	k ^= k >> 33;
	k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
	k ^= k >> 33;
	k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
	k ^= k >> 33;
	k
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_elastic_ring_covers_every_partition() {
		let config = HashinatorConfig::elastic(6, 8);

		assert_eq!(config.tokens.len(), 48);
		assert_eq!(config.tokens[0].token, i32::MIN);
		assert_eq!(config.partition_ids(), (0..6).collect());
		assert!(config.consistency_problems().is_empty());
	}

	#[test]
	fn test_keys_route_to_known_partitions() {
		for config in [HashinatorConfig::elastic(6, 4), HashinatorConfig::legacy(6)] {
			let ids = config.partition_ids();
			let mut seen = BTreeSet::new();
			for key in 0..1_000i64 {
				let p = config.partition_for_key(key);
				assert!(ids.contains(&p));
				seen.insert(p);
			}
			assert_eq!(seen.len(), 6, "keys should spread over all partitions");
		}
	}

	#[test]
	fn test_routing_is_deterministic() {
		let config = HashinatorConfig::elastic(3, 16);
		assert_eq!(config.partition_for_key(42), config.partition_for_key(42));
	}

	#[test]
	fn test_detects_inconsistent_ring() {
		let mut config = HashinatorConfig::elastic(4, 2);
		config.partition_count = 5;
		assert_eq!(config.consistency_problems().len(), 1);

		let mut legacy = HashinatorConfig::legacy(2);
		legacy.tokens.push(TokenRange {
			token: 0,
			partition: 0,
		});
		assert_eq!(legacy.consistency_problems().len(), 1);
	}
}
