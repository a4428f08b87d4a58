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
	collections::{BTreeSet, HashMap},
	sync::Arc,
};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use shardsnap_format::{PartitionId, Row, TableId};

use super::{ReadBoundary, SourceError, TableSource, Version};
use crate::cluster::Hashinator;

#[derive(Default)]
struct PartitionRows {
	version: Version,
	rows: HashMap<TableId, Vec<(Version, Row)>>,
}

/// In-memory versioned table store
///
/// Every replica of a partition reads the same rows, so one store serves
/// the whole in-process cluster. Each partition has its own lock; a
/// mutation and a read boundary on partition 3 never wait on partition 4.
///
/// Rows are never overwritten: each insert gets the next partition
/// version, and a row image filters by version.
pub struct MemoryTableStore {
	catalog_id: RwLock<String>,
	tables: BTreeSet<TableId>,
	hashinator: Arc<dyn Hashinator>,
	partitions: DashMap<PartitionId, Arc<Mutex<PartitionRows>>>,
	failing_tables: DashSet<TableId>,
}

impl MemoryTableStore {
	pub fn new<I, T>(catalog_id: impl Into<String>, tables: I, hashinator: Arc<dyn Hashinator>) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<TableId>,
	{
		Self {
			catalog_id: RwLock::new(catalog_id.into()),
			tables: tables.into_iter().map(Into::into).collect(),
			hashinator,
			partitions: DashMap::new(),
			failing_tables: DashSet::new(),
		}
	}

	fn partition(&self, partition: PartitionId) -> Arc<Mutex<PartitionRows>> {
		self.partitions.entry(partition).or_default().clone()
	}

	/// Insert a row routed by `key`; returns the owning partition
	pub fn insert(&self, table: &str, key: i64, row: Row) -> Result<PartitionId, SourceError> {
		if !self.tables.contains(table) {
			return Err(SourceError::UnknownTable(table.to_string()));
		}

		let partition = self.hashinator.partition_for_key(key);
		let rows = self.partition(partition);
		let mut rows = rows.lock();
		rows.version += 1;
		let version = rows.version;
		rows.rows.entry(table.to_string()).or_default().push((version, row));
		Ok(partition)
	}

	/// Number of rows currently stored for `table` on `partition`
	pub fn row_count(&self, table: &str, partition: PartitionId) -> usize {
		self.partitions.get(&partition).map_or(0, |rows| {
			rows.lock()
				.rows
				.get(table)
				.map_or(0, Vec::len)
		})
	}

	/// Switch to a new catalog, as a schema change would
	pub fn set_catalog_id(&self, catalog_id: impl Into<String>) {
		*self.catalog_id.write() = catalog_id.into();
	}

	/// Make row images of `table` fail until cleared
	pub fn fail_serialization_of(&self, table: &str) {
		self.failing_tables.insert(table.to_string());
	}

	pub fn clear_serialization_failures(&self) {
		self.failing_tables.clear();
	}
}

impl TableSource for MemoryTableStore {
	fn catalog_id(&self) -> String {
		self.catalog_id.read().clone()
	}

	fn tables(&self) -> Vec<TableId> {
		self.tables.iter().cloned().collect()
	}

	fn fix_read_boundary(&self, partition: PartitionId) -> Result<ReadBoundary, SourceError> {
		let rows = self.partition(partition);
		let version = rows.lock().version;
		Ok(ReadBoundary { partition, version })
	}

	fn row_image(&self, table: &str, boundary: ReadBoundary) -> Result<Vec<Row>, SourceError> {
		if !self.tables.contains(table) {
			return Err(SourceError::UnknownTable(table.to_string()));
		}
		if self.failing_tables.contains(table) {
			return Err(SourceError::SerializationFailed {
				table: table.to_string(),
				partition: boundary.partition,
				reason: "row image unavailable".to_string(),
			});
		}

		let rows = self.partition(boundary.partition);
		let rows = rows.lock();
		Ok(rows
			.rows
			.get(table)
			.map(|rows| {
				rows.iter()
					.filter(|(version, _)| *version <= boundary.version)
					.map(|(_, row)| row.clone())
					.collect()
			})
			.unwrap_or_default())
	}
}
