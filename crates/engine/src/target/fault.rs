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

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use shardsnap_format::{DataFileHeader, PartitionId, TableId};

/// Write fault strategy consulted before every header and chunk write
///
/// Returning `true` makes the target fail that write as a full disk would,
/// before any of its bytes reach the file.
pub trait WriteFaultPolicy: Send + Sync {
	fn fail_header(&self, file: &DataFileHeader) -> bool;

	/// `chunk_index` counts from zero within one file
	fn fail_chunk(&self, file: &DataFileHeader, chunk_index: u32) -> bool;
}

/// Production policy: never fails anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl WriteFaultPolicy for NoFaults {
	fn fail_header(&self, _file: &DataFileHeader) -> bool {
		false
	}

	fn fail_chunk(&self, _file: &DataFileHeader, _chunk_index: u32) -> bool {
		false
	}
}

/// Deterministic fault switches for test harnesses
///
/// Both switches start off. A chunk fault fires for every chunk whose
/// index is at least `fail_chunks_from`, so `fail_chunks_from(1)` lets the
/// first chunk land and fails the second. Faults can be narrowed to one
/// table and/or one partition.
#[derive(Debug, Default)]
pub struct InjectedFaults {
	header: AtomicBool,
	chunk: AtomicBool,
	chunks_from: AtomicU32,
	table: Option<TableId>,
	partition: Option<PartitionId>,
	injected: AtomicU32,
}

impl InjectedFaults {
	pub fn new() -> Self {
		Self::default()
	}

	/// Only fault files of `table`
	pub fn on_table(mut self, table: impl Into<TableId>) -> Self {
		self.table = Some(table.into());
		self
	}

	/// Only fault files of `partition`
	pub fn on_partition(mut self, partition: PartitionId) -> Self {
		self.partition = Some(partition);
		self
	}

	pub fn fail_headers(&self, enabled: bool) {
		self.header.store(enabled, Ordering::SeqCst);
	}

	pub fn fail_chunks(&self, enabled: bool) {
		self.chunk.store(enabled, Ordering::SeqCst);
	}

	/// Let the first `n` chunks of each file succeed
	pub fn fail_chunks_from(&self, n: u32) {
		self.chunks_from.store(n, Ordering::SeqCst);
	}

	/// Number of writes failed so far
	pub fn injected_count(&self) -> u32 {
		self.injected.load(Ordering::SeqCst)
	}

	fn targets(&self, file: &DataFileHeader) -> bool {
		self.table.as_ref().is_none_or(|t| *t == file.table)
			&& self.partition.is_none_or(|p| p == file.partition)
	}

	fn fire(&self, should_fail: bool) -> bool {
		if should_fail {
			self.injected.fetch_add(1, Ordering::SeqCst);
		}
		should_fail
	}
}

impl WriteFaultPolicy for InjectedFaults {
	fn fail_header(&self, file: &DataFileHeader) -> bool {
		self.fire(self.header.load(Ordering::SeqCst) && self.targets(file))
	}

	fn fail_chunk(&self, file: &DataFileHeader, chunk_index: u32) -> bool {
		self.fire(
			self.chunk.load(Ordering::SeqCst)
				&& chunk_index >= self.chunks_from.load(Ordering::SeqCst)
				&& self.targets(file),
		)
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use shardsnap_format::SnapshotType;

	use super::*;

	fn header(table: &str, partition: PartitionId) -> DataFileHeader {
		DataFileHeader {
			nonce: "n".to_string(),
			table: table.to_string(),
			partition,
			host: 0,
			catalog_id: "c".to_string(),
			snapshot_type: SnapshotType::Manual,
			created_at: Utc::now(),
		}
	}

	#[test]
	fn test_switches_start_off() {
		let faults = InjectedFaults::new();
		assert!(!faults.fail_header(&header("P1", 0)));
		assert!(!faults.fail_chunk(&header("P1", 0), 0));
		assert_eq!(faults.injected_count(), 0);
	}

	#[test]
	fn test_chunk_fault_respects_offset_and_filters() {
		let faults = InjectedFaults::new().on_table("P1").on_partition(2);
		faults.fail_chunks(true);
		faults.fail_chunks_from(1);

		assert!(!faults.fail_chunk(&header("P1", 2), 0));
		assert!(faults.fail_chunk(&header("P1", 2), 1));
		assert!(!faults.fail_chunk(&header("P1", 3), 1));
		assert!(!faults.fail_chunk(&header("R1", 2), 1));
		assert_eq!(faults.injected_count(), 1);
	}
}
