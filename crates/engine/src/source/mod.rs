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

mod memory;

use shardsnap_format::{PartitionId, Row, TableId};
use thiserror::Error;

pub use memory::MemoryTableStore;

/// Per-partition mutation counter
pub type Version = u64;

/// Point in time a partition's row image is taken at
///
/// Every mutation applied at or before `version` is visible in the image;
/// nothing applied after it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBoundary {
	pub partition: PartitionId,
	pub version: Version,
}

/// Error types for row image production
#[derive(Debug, Error)]
pub enum SourceError {
	#[error("Unknown table: {0}")]
	UnknownTable(String),
	#[error("Serialization failed for {table} on partition {partition}: {reason}")]
	SerializationFailed {
		table: String,
		partition: PartitionId,
		reason: String,
	},
}

/// Table data source - the transactional engine as seen by snapshots
///
/// Snapshots only need two things from the engine:
/// - A way to fix a read boundary on one partition without stopping others
/// - A consistent row image of one table as of that boundary
///
/// The boundary is fixed while the partition's mutation path is held, so
/// the pause lasts only as long as reading one counter. Producing the image
/// afterwards runs concurrently with new mutations.
pub trait TableSource: Send + Sync {
	/// Schema identity of the catalog currently in effect
	fn catalog_id(&self) -> String;

	/// Every table in the catalog, in name order
	fn tables(&self) -> Vec<TableId>;

	/// Briefly pause mutations on `partition` and fix a read boundary
	fn fix_read_boundary(&self, partition: PartitionId) -> Result<ReadBoundary, SourceError>;

	/// Rows of `table` visible at `boundary`, in insertion order
	fn row_image(&self, table: &str, boundary: ReadBoundary) -> Result<Vec<Row>, SourceError>;
}
