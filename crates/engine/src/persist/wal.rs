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

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use verdict_sdk::RejectReason;

use crate::types::{Order, Trade, now_millis};

/// How many rotated log files are retained besides the active one
const ROTATED_FILES_KEPT: usize = 3;

#[derive(Debug, Error)]
pub enum WalError {
	#[error("write-ahead log I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to encode event: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Kind-specific payload of one log record
///
/// Together with the most recent snapshot these records are sufficient to
/// reconstruct all core state. The TRADE payload carries the buy side's
/// limit so settlement replays with the exact refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WalEventBody {
	#[serde(rename = "ORDER_RECEIVED")]
	OrderReceived { order: Order },
	#[serde(rename = "ORDER_SEQUENCED")]
	OrderSequenced { order: Order },
	#[serde(rename = "ORDER_REJECTED", rename_all = "camelCase")]
	OrderRejected {
		order_id: String,
		user_id: String,
		reason: RejectReason,
		message: String,
	},
	#[serde(rename = "ORDER_CANCELLED")]
	OrderCancelled { order: Order, reason: String },
	#[serde(rename = "TRADE", rename_all = "camelCase")]
	Trade { trade: Trade, buyer_limit: Decimal },
	#[serde(rename = "ORDER_FILLED")]
	OrderFilled { order: Order },
	#[serde(rename = "ORDER_PARTIAL_FILL")]
	OrderPartialFill { order: Order },
}

/// One line of the write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalRecord {
	pub event_number: u64,
	pub timestamp: i64,
	#[serde(flatten)]
	pub body: WalEventBody,
}

/// Append-only event log with buffered batch writes
///
/// Events go into an in-memory buffer first; the buffer is written as one
/// append when it reaches `buffer_size` or when the persistence manager's
/// flush timer fires. Event numbers are assigned at append time under the
/// caller's single-writer discipline and match on-disk order.
pub struct Wal {
	dir: PathBuf,
	file: File,
	current_path: PathBuf,
	buffer: Vec<String>,
	buffer_size: usize,
	next_event_number: u64,
}

impl Wal {
	/// Open the log directory and start a fresh session file
	///
	/// Event numbering continues after the highest number found in any
	/// existing file, so numbers stay strictly increasing across sessions
	/// and rotations.
	pub fn open(dir: &Path, buffer_size: usize) -> Result<Self, WalError> {
		fs::create_dir_all(dir)?;
		let next_event_number = last_event_number_on_disk(dir) + 1;
		let (file, current_path) = create_session_file(dir)?;
		Ok(Self {
			dir: dir.to_path_buf(),
			file,
			current_path,
			buffer: Vec::with_capacity(buffer_size),
			buffer_size,
			next_event_number,
		})
	}

	/// Append one event, returning its assigned event number
	///
	/// Flushes inline when the buffer reaches the configured size; a flush
	/// failure keeps the buffered lines for a later retry and surfaces the
	/// error to the caller.
	pub fn append(&mut self, body: WalEventBody) -> Result<u64, WalError> {
		let record = WalRecord {
			event_number: self.next_event_number,
			timestamp: now_millis(),
			body,
		};
		let line = serde_json::to_string(&record)?;
		let event_number = self.next_event_number;
		self.next_event_number += 1;
		self.buffer.push(line);
		if self.buffer.len() >= self.buffer_size {
			self.flush()?;
		}
		Ok(event_number)
	}

	/// Write the whole buffered block in one append
	pub fn flush(&mut self) -> Result<(), WalError> {
		if self.buffer.is_empty() {
			return Ok(());
		}
		let mut block = self.buffer.join("\n");
		block.push('\n');
		self.file.write_all(block.as_bytes())?;
		self.buffer.clear();
		Ok(())
	}

	/// Last event number assigned so far (0 before any append)
	pub fn last_event_number(&self) -> u64 {
		self.next_event_number - 1
	}

	pub fn buffered_len(&self) -> usize {
		self.buffer.len()
	}

	/// Close the current file and continue in a fresh one
	///
	/// Rotated files beyond the retained window are deleted.
	pub fn rotate(&mut self) -> Result<(), WalError> {
		self.flush()?;
		let (file, path) = create_session_file(&self.dir)?;
		self.file = file;
		self.current_path = path;
		info!(target: "wal", path = %self.current_path.display(), "rotated log file");

		let mut files = wal_files(&self.dir);
		// Newest files last; keep the active file plus the retained window
		if files.len() > ROTATED_FILES_KEPT + 1 {
			let excess = files.len() - (ROTATED_FILES_KEPT + 1);
			for (_, path) in files.drain(..excess) {
				if let Err(e) = fs::remove_file(&path) {
					warn!(target: "wal", path = %path.display(), error = %e, "failed to delete rotated log");
				}
			}
		}
		Ok(())
	}
}

/// Read every parseable record with an event number greater than `after`,
/// across all log files in chronological order
///
/// A corrupt line is skipped, not fatal: recovery applies every event that
/// still parses, in order.
pub fn read_records_after(dir: &Path, after: u64) -> Result<Vec<WalRecord>, WalError> {
	let mut records = Vec::new();
	if !dir.exists() {
		return Ok(records);
	}
	for (_, path) in wal_files(dir) {
		let reader = BufReader::new(File::open(&path)?);
		for (line_no, line) in reader.lines().enumerate() {
			let line = line?;
			if line.trim().is_empty() {
				continue;
			}
			match serde_json::from_str::<WalRecord>(&line) {
				Ok(record) => {
					if record.event_number > after {
						records.push(record);
					}
				}
				Err(e) => {
					warn!(
						target: "wal",
						path = %path.display(),
						line = line_no + 1,
						error = %e,
						"skipping corrupt log line"
					);
				}
			}
		}
	}
	records.sort_by_key(|r| r.event_number);
	Ok(records)
}

fn last_event_number_on_disk(dir: &Path) -> u64 {
	read_records_after(dir, 0)
		.map(|records| records.last().map(|r| r.event_number).unwrap_or(0))
		.unwrap_or(0)
}

fn create_session_file(dir: &Path) -> Result<(File, PathBuf), WalError> {
	let mut stamp = now_millis();
	let path = loop {
		let candidate = dir.join(format!("wal-{}.log", stamp));
		if !candidate.exists() {
			break candidate;
		}
		stamp += 1;
	};
	let file = OpenOptions::new().create(true).append(true).open(&path)?;
	Ok((file, path))
}

/// All log files in the directory, oldest first
fn wal_files(dir: &Path) -> Vec<(u128, PathBuf)> {
	let Ok(entries) = fs::read_dir(dir) else {
		return Vec::new();
	};
	let mut files: Vec<(u128, PathBuf)> = entries
		.flatten()
		.filter_map(|entry| {
			let path = entry.path();
			let name = path.file_name()?.to_str()?;
			let stamp = name
				.strip_prefix("wal-")?
				.strip_suffix(".log")?
				.parse::<u128>()
				.ok()?;
			Some((stamp, path))
		})
		.collect();
	files.sort();
	files
}
