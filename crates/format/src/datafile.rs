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

//! Snapshot data file codec
//!
//! A data file holds one table's rows for one partition replica:
//!
//! ```text
//! header  : "SSNP" | version u16 | reserved u16 | meta_len u32 | meta (JSON) | crc u32
//! chunk*  : 0x01 | row_count u32 | payload_len u32 | payload | crc u32
//! trailer : 0xFF | chunk_count u32 | row_count u64 | file_crc u32
//! ```
//!
//! All integers are little-endian. A chunk payload is a sequence of rows,
//! each prefixed with its `u32` length. The chunk CRC covers row count,
//! payload length and payload. The trailer CRC covers every byte before the
//! trailer and doubles as the file checksum recorded in digests.
//!
//! Writers never emit a partial record, so a file that lost its writer
//! mid-stream is a header plus a prefix of whole chunks with no trailer.
//! [`scan_data_file`] reports that case as [`DataFileDefect::MissingTrailer`],
//! distinct from byte-level corruption.

use std::{fmt, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	error::FormatError,
	types::{HostId, PartitionId, Row, SnapshotType, TableId},
};

pub const DATA_FILE_MAGIC: [u8; 4] = *b"SSNP";
pub const DATA_FILE_VERSION: u16 = 1;
pub const CHUNK_TAG: u8 = 0x01;
pub const TRAILER_TAG: u8 = 0xFF;

const HEADER_PREFIX_LEN: usize = 12;
const CHUNK_PREFIX_LEN: usize = 9;
const TRAILER_LEN: usize = 17;
const CRC_LEN: usize = 4;

/// Self-describing metadata stored in every data file header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileHeader {
	pub nonce: String,
	pub table: TableId,
	pub partition: PartitionId,
	pub host: HostId,
	/// Schema identity of the catalog the rows were serialized under
	pub catalog_id: String,
	#[serde(rename = "type")]
	pub snapshot_type: SnapshotType,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
	pub chunk_count: u32,
	pub row_count: u64,
	pub file_checksum: u32,
}

/// Encode the header record, including its trailing CRC
pub fn encode_header(header: &DataFileHeader) -> Result<Vec<u8>, FormatError> {
	let meta = serde_json::to_vec(header)?;
	let meta_len = u32::try_from(meta.len()).map_err(|_| FormatError::RecordTooLarge(meta.len()))?;

	let mut buf = Vec::with_capacity(HEADER_PREFIX_LEN + meta.len() + CRC_LEN);
	buf.extend_from_slice(&DATA_FILE_MAGIC);
	buf.extend_from_slice(&DATA_FILE_VERSION.to_le_bytes());
	buf.extend_from_slice(&0u16.to_le_bytes());
	buf.extend_from_slice(&meta_len.to_le_bytes());
	buf.extend_from_slice(&meta);

	let crc = crc32fast::hash(&buf);
	buf.extend_from_slice(&crc.to_le_bytes());
	Ok(buf)
}

/// Encode one chunk record from a slice of rows
pub fn encode_chunk(rows: &[Row]) -> Result<Vec<u8>, FormatError> {
	let payload_len: usize = rows.iter().map(|r| 4 + r.len()).sum();
	let payload_len_u32 =
		u32::try_from(payload_len).map_err(|_| FormatError::RecordTooLarge(payload_len))?;
	let row_count = u32::try_from(rows.len()).map_err(|_| FormatError::RecordTooLarge(rows.len()))?;

	let mut buf = Vec::with_capacity(CHUNK_PREFIX_LEN + payload_len + CRC_LEN);
	buf.push(CHUNK_TAG);
	buf.extend_from_slice(&row_count.to_le_bytes());
	buf.extend_from_slice(&payload_len_u32.to_le_bytes());
	for row in rows {
		let len = u32::try_from(row.len()).map_err(|_| FormatError::RecordTooLarge(row.len()))?;
		buf.extend_from_slice(&len.to_le_bytes());
		buf.extend_from_slice(row);
	}

	// CRC covers everything after the tag
	let crc = crc32fast::hash(&buf[1..]);
	buf.extend_from_slice(&crc.to_le_bytes());
	Ok(buf)
}

pub fn encode_trailer(trailer: &Trailer) -> Vec<u8> {
	let mut buf = Vec::with_capacity(TRAILER_LEN);
	buf.push(TRAILER_TAG);
	buf.extend_from_slice(&trailer.chunk_count.to_le_bytes());
	buf.extend_from_slice(&trailer.row_count.to_le_bytes());
	buf.extend_from_slice(&trailer.file_checksum.to_le_bytes());
	buf
}

/// Split a chunk payload back into rows
///
/// Returns `None` if the payload does not hold exactly `row_count`
/// length-prefixed rows.
pub fn decode_rows(payload: &[u8], row_count: u32) -> Option<Vec<Row>> {
	let mut cursor = Cursor::new(payload);
	let mut rows = Vec::with_capacity(row_count as usize);
	for _ in 0..row_count {
		let len = cursor.u32()? as usize;
		rows.push(cursor.take(len)?.to_vec());
	}
	if cursor.remaining() != 0 {
		return None;
	}
	Some(rows)
}

/// Something wrong with a data file, in the order it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFileDefect {
	EmptyFile,
	HeaderTruncated,
	BadMagic,
	UnsupportedVersion(u16),
	HeaderChecksumMismatch,
	HeaderMetadataInvalid(String),
	ChunkTruncated { index: u32 },
	ChunkChecksumMismatch { index: u32 },
	ChunkPayloadMalformed { index: u32 },
	UnknownRecord { offset: usize, tag: u8 },
	MissingTrailer,
	TrailerChecksumMismatch { stored: u32, computed: u32 },
	TrailerCountMismatch { chunks: u32, rows: u64 },
	TrailingBytes { offset: usize },
}

impl fmt::Display for DataFileDefect {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DataFileDefect::EmptyFile => write!(f, "file is empty (header never written)"),
			DataFileDefect::HeaderTruncated => write!(f, "header is truncated"),
			DataFileDefect::BadMagic => write!(f, "bad magic number"),
			DataFileDefect::UnsupportedVersion(v) => write!(f, "unsupported format version {}", v),
			DataFileDefect::HeaderChecksumMismatch => write!(f, "header checksum mismatch"),
			DataFileDefect::HeaderMetadataInvalid(e) => write!(f, "header metadata unreadable: {}", e),
			DataFileDefect::ChunkTruncated { index } => write!(f, "chunk {} is truncated", index),
			DataFileDefect::ChunkChecksumMismatch { index } => {
				write!(f, "chunk {} checksum mismatch", index)
			}
			DataFileDefect::ChunkPayloadMalformed { index } => {
				write!(f, "chunk {} payload does not match its row count", index)
			}
			DataFileDefect::UnknownRecord { offset, tag } => {
				write!(f, "unknown record tag {:#04x} at offset {}", tag, offset)
			}
			DataFileDefect::MissingTrailer => write!(f, "file is incomplete (no end-of-file checksum)"),
			DataFileDefect::TrailerChecksumMismatch { stored, computed } => write!(
				f,
				"end-of-file checksum mismatch: stored {:#010x}, computed {:#010x}",
				stored, computed
			),
			DataFileDefect::TrailerCountMismatch { chunks, rows } => write!(
				f,
				"trailer claims {} chunks / {} rows, file disagrees",
				chunks, rows
			),
			DataFileDefect::TrailingBytes { offset } => {
				write!(f, "unexpected bytes after trailer at offset {}", offset)
			}
		}
	}
}

/// Result of scanning one data file end to end
#[derive(Debug, Clone, Default)]
pub struct DataFileScan {
	pub header: Option<DataFileHeader>,
	/// Whole chunks whose checksum validated
	pub valid_chunks: u32,
	/// Rows inside the valid chunks
	pub valid_rows: u64,
	pub trailer: Option<Trailer>,
	/// CRC over every byte preceding the trailer (or the whole file)
	pub computed_checksum: u32,
	pub defects: Vec<DataFileDefect>,
}

impl DataFileScan {
	/// Header valid, every chunk valid, trailer present and consistent
	pub fn is_clean(&self) -> bool {
		self.header.is_some() && self.trailer.is_some() && self.defects.is_empty()
	}

	/// Only the end-of-file checksum is missing: a whole-chunk prefix
	pub fn is_incomplete_prefix(&self) -> bool {
		self.header.is_some() && self.defects == [DataFileDefect::MissingTrailer]
	}
}

pub fn scan_data_file(path: impl AsRef<Path>) -> Result<DataFileScan, FormatError> {
	let bytes = std::fs::read(path)?;
	Ok(scan_bytes(&bytes))
}

/// Scan an in-memory image of a data file
pub fn scan_bytes(bytes: &[u8]) -> DataFileScan {
	let mut scan = DataFileScan {
		computed_checksum: crc32fast::hash(bytes),
		..DataFileScan::default()
	};

	if bytes.is_empty() {
		scan.defects.push(DataFileDefect::EmptyFile);
		return scan;
	}

	let body_start = match scan_header(bytes) {
		Ok((header, end)) => {
			scan.header = Some(header);
			end
		}
		Err(defect) => {
			scan.defects.push(defect);
			return scan;
		}
	};

	let mut offset = body_start;
	loop {
		let Some(&tag) = bytes.get(offset) else {
			scan.defects.push(DataFileDefect::MissingTrailer);
			break;
		};

		match tag {
			CHUNK_TAG => {
				let index = scan.valid_chunks + chunk_defect_count(&scan.defects);
				let mut cursor = Cursor::new(&bytes[offset + 1..]);
				let (Some(row_count), Some(payload_len)) = (cursor.u32(), cursor.u32()) else {
					scan.defects.push(DataFileDefect::ChunkTruncated { index });
					break;
				};
				let (Some(payload), Some(stored_crc)) = (cursor.take(payload_len as usize), cursor.u32())
				else {
					scan.defects.push(DataFileDefect::ChunkTruncated { index });
					break;
				};

				let covered_end = offset + CHUNK_PREFIX_LEN + payload_len as usize;
				if crc32fast::hash(&bytes[offset + 1..covered_end]) != stored_crc {
					scan.defects.push(DataFileDefect::ChunkChecksumMismatch { index });
				} else if decode_rows(payload, row_count).is_none() {
					scan.defects.push(DataFileDefect::ChunkPayloadMalformed { index });
				} else {
					scan.valid_chunks += 1;
					scan.valid_rows += u64::from(row_count);
				}
				offset = covered_end + CRC_LEN;
			}
			TRAILER_TAG => {
				let mut cursor = Cursor::new(&bytes[offset + 1..]);
				let (Some(chunk_count), Some(row_count), Some(stored)) =
					(cursor.u32(), cursor.u64(), cursor.u32())
				else {
					scan.defects.push(DataFileDefect::MissingTrailer);
					break;
				};

				let computed = crc32fast::hash(&bytes[..offset]);
				scan.computed_checksum = computed;
				if stored != computed {
					scan.defects.push(DataFileDefect::TrailerChecksumMismatch { stored, computed });
				}
				if chunk_count != scan.valid_chunks || row_count != scan.valid_rows {
					scan.defects.push(DataFileDefect::TrailerCountMismatch {
						chunks: chunk_count,
						rows: row_count,
					});
				}
				scan.trailer = Some(Trailer {
					chunk_count,
					row_count,
					file_checksum: stored,
				});

				let end = offset + TRAILER_LEN;
				if end != bytes.len() {
					scan.defects.push(DataFileDefect::TrailingBytes { offset: end });
				}
				break;
			}
			other => {
				scan.defects.push(DataFileDefect::UnknownRecord { offset, tag: other });
				break;
			}
		}
	}

	scan
}

fn chunk_defect_count(defects: &[DataFileDefect]) -> u32 {
	defects
		.iter()
		.filter(|d| {
			matches!(
				d,
				DataFileDefect::ChunkChecksumMismatch { .. } | DataFileDefect::ChunkPayloadMalformed { .. }
			)
		})
		.count() as u32
}

fn scan_header(bytes: &[u8]) -> Result<(DataFileHeader, usize), DataFileDefect> {
	let mut cursor = Cursor::new(bytes);
	let magic = cursor.take(4).ok_or(DataFileDefect::HeaderTruncated)?;
	if magic != DATA_FILE_MAGIC {
		return Err(DataFileDefect::BadMagic);
	}
	let version = cursor.u16().ok_or(DataFileDefect::HeaderTruncated)?;
	if version != DATA_FILE_VERSION {
		return Err(DataFileDefect::UnsupportedVersion(version));
	}
	let _reserved = cursor.u16().ok_or(DataFileDefect::HeaderTruncated)?;
	let meta_len = cursor.u32().ok_or(DataFileDefect::HeaderTruncated)? as usize;
	let meta = cursor.take(meta_len).ok_or(DataFileDefect::HeaderTruncated)?;
	let stored = cursor.u32().ok_or(DataFileDefect::HeaderTruncated)?;

	let covered = HEADER_PREFIX_LEN + meta_len;
	if crc32fast::hash(&bytes[..covered]) != stored {
		return Err(DataFileDefect::HeaderChecksumMismatch);
	}

	let header = serde_json::from_slice(meta)
		.map_err(|e| DataFileDefect::HeaderMetadataInvalid(e.to_string()))?;
	Ok((header, covered + CRC_LEN))
}

/// Read every row of a clean data file, in file order
pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<Row>, FormatError> {
	let bytes = std::fs::read(path)?;
	let (_, mut offset) = scan_header(&bytes).map_err(|d| FormatError::CorruptDataFile(d.to_string()))?;

	let mut rows = Vec::new();
	while let Some(&CHUNK_TAG) = bytes.get(offset) {
		let mut cursor = Cursor::new(&bytes[offset + 1..]);
		let row_count = cursor.u32();
		let payload_len = cursor.u32();
		let (Some(row_count), Some(payload_len)) = (row_count, payload_len) else {
			break;
		};
		let Some(chunk_rows) = cursor
			.take(payload_len as usize)
			.and_then(|payload| decode_rows(payload, row_count))
		else {
			break;
		};
		rows.extend(chunk_rows);
		offset += CHUNK_PREFIX_LEN + payload_len as usize + CRC_LEN;
	}
	Ok(rows)
}

/// Little-endian reader over a byte slice that never panics
struct Cursor<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(bytes: &'a [u8]) -> Self {
		Self { bytes, pos: 0 }
	}

	fn remaining(&self) -> usize {
		self.bytes.len() - self.pos
	}

	fn take(&mut self, n: usize) -> Option<&'a [u8]> {
		let end = self.pos.checked_add(n)?;
		let slice = self.bytes.get(self.pos..end)?;
		self.pos = end;
		Some(slice)
	}

	fn u16(&mut self) -> Option<u16> {
		self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
	}

	fn u32(&mut self) -> Option<u32> {
		self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}

	fn u64(&mut self) -> Option<u64> {
		self.take(8).map(|b| {
			let mut arr = [0u8; 8];
			arr.copy_from_slice(b);
			u64::from_le_bytes(arr)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header() -> DataFileHeader {
		DataFileHeader {
			nonce: "testnonce".to_string(),
			table: "P1".to_string(),
			partition: 2,
			host: 1,
			catalog_id: "catalog-1".to_string(),
			snapshot_type: SnapshotType::Manual,
			created_at: Utc::now(),
		}
	}

	fn rows(n: usize) -> Vec<Row> {
		(0..n).map(|i| format!("row-{}", i).into_bytes()).collect()
	}

	/// Build a file image the way the writer does
	fn build(chunks: &[Vec<Row>], finalize: bool) -> Vec<u8> {
		let mut bytes = encode_header(&header()).unwrap();
		let mut total_rows = 0;
		for chunk in chunks {
			bytes.extend(encode_chunk(chunk).unwrap());
			total_rows += chunk.len() as u64;
		}
		if finalize {
			let trailer = Trailer {
				chunk_count: chunks.len() as u32,
				row_count: total_rows,
				file_checksum: crc32fast::hash(&bytes),
			};
			bytes.extend(encode_trailer(&trailer));
		}
		bytes
	}

	#[test]
	fn test_clean_file_scans_clean() {
		let bytes = build(&[rows(3), rows(2)], true);
		let scan = scan_bytes(&bytes);

		assert!(scan.is_clean(), "defects: {:?}", scan.defects);
		assert_eq!(scan.valid_chunks, 2);
		assert_eq!(scan.valid_rows, 5);
		assert_eq!(scan.header.unwrap().partition, 2);
		assert_eq!(scan.trailer.unwrap().file_checksum, scan.computed_checksum);
	}

	#[test]
	fn test_unfinalized_file_is_incomplete_prefix() {
		let bytes = build(&[rows(3)], false);
		let scan = scan_bytes(&bytes);

		assert!(!scan.is_clean());
		assert!(scan.is_incomplete_prefix());
		assert_eq!(scan.valid_chunks, 1);
	}

	#[test]
	fn test_flipped_payload_byte_is_checksum_mismatch() {
		let mut bytes = build(&[rows(3), rows(3)], true);
		let header_len = encode_header(&header()).unwrap().len();
		bytes[header_len + CHUNK_PREFIX_LEN + 2] ^= 0xFF;

		let scan = scan_bytes(&bytes);
		assert!(
			scan
				.defects
				.contains(&DataFileDefect::ChunkChecksumMismatch { index: 0 })
		);
		// the second chunk still validates
		assert_eq!(scan.valid_chunks, 1);
	}

	#[test]
	fn test_truncated_chunk_is_reported() {
		let mut bytes = build(&[rows(4)], false);
		bytes.truncate(bytes.len() - 3);

		let scan = scan_bytes(&bytes);
		assert_eq!(scan.defects, vec![DataFileDefect::ChunkTruncated { index: 0 }]);
	}

	#[test]
	fn test_header_corruption() {
		assert_eq!(scan_bytes(&[]).defects, vec![DataFileDefect::EmptyFile]);

		let mut bytes = build(&[], true);
		bytes[14] ^= 0x01;
		assert_eq!(
			scan_bytes(&bytes).defects,
			vec![DataFileDefect::HeaderChecksumMismatch]
		);

		bytes[0] = b'X';
		assert_eq!(scan_bytes(&bytes).defects, vec![DataFileDefect::BadMagic]);
	}

	#[test]
	fn test_read_rows_returns_rows_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f.vpt");
		std::fs::write(&path, build(&[rows(2), rows(1)], true)).unwrap();

		let read = read_rows(&path).unwrap();
		assert_eq!(read.len(), 3);
		assert_eq!(read[0], b"row-0".to_vec());
		assert_eq!(read[2], b"row-0".to_vec());
	}
}
