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

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::book::BookState;
use crate::risk::{Balance, LockValue, Position, PositionKey};
use crate::types::now_millis;

/// How many snapshot files are retained
const SNAPSHOTS_KEPT: usize = 5;

#[derive(Debug, Error)]
pub enum SnapshotError {
	#[error("snapshot I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to encode snapshot: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Position table entry in serialized form
///
/// The in-memory table is keyed by a composite struct; JSON objects need
/// string keys, so snapshots store the table as a flat list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
	#[serde(flatten)]
	pub key: PositionKey,
	pub available: u64,
	pub locked: u64,
}

/// Complete serialized engine state at one event number
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
	/// Number of the last event folded into this state
	pub last_event_number: u64,
	pub taken_at: i64,
	/// Last order sequence number handed out
	pub last_sequence: u64,
	pub trade_counter: u64,
	pub order_counter: u64,
	pub books: Vec<BookState>,
	pub balances: HashMap<String, Balance>,
	pub positions: Vec<PositionEntry>,
	pub locks: HashMap<String, LockValue>,
}

impl EngineSnapshot {
	pub fn positions_map(&self) -> HashMap<PositionKey, Position> {
		self.positions
			.iter()
			.map(|entry| {
				(
					entry.key.clone(),
					Position {
						available: entry.available,
						locked: entry.locked,
					},
				)
			})
			.collect()
	}

	pub fn positions_from_map(map: &HashMap<PositionKey, Position>) -> Vec<PositionEntry> {
		map.iter()
			.map(|(key, position)| PositionEntry {
				key: key.clone(),
				available: position.available,
				locked: position.locked,
			})
			.collect()
	}
}

/// Filesystem store for engine snapshots
///
/// Files are named `snapshot-<lastEventNumber>-<wallMs>.json`; the newest
/// snapshot is the one with the highest event number. After a successful
/// save, files beyond the retained window are deleted.
pub struct SnapshotStore {
	dir: PathBuf,
}

impl SnapshotStore {
	pub fn open(dir: &Path) -> Result<Self, SnapshotError> {
		fs::create_dir_all(dir)?;
		Ok(Self {
			dir: dir.to_path_buf(),
		})
	}

	/// Persist a snapshot; returns its event number
	pub fn save(&self, snapshot: &EngineSnapshot) -> Result<u64, SnapshotError> {
		let path = self.dir.join(format!(
			"snapshot-{}-{}.json",
			snapshot.last_event_number,
			now_millis()
		));
		let payload = serde_json::to_vec(snapshot)?;
		fs::write(&path, payload)?;
		info!(
			target: "snapshotter",
			event_number = snapshot.last_event_number,
			path = %path.display(),
			"snapshot saved"
		);
		self.prune();
		Ok(snapshot.last_event_number)
	}

	/// Load the newest readable snapshot
	///
	/// A snapshot that fails to parse is skipped in favour of the next
	/// older one; an empty or missing directory means a clean start.
	pub fn load_latest(&self) -> Result<Option<EngineSnapshot>, SnapshotError> {
		let mut files = self.snapshot_files();
		files.reverse();
		for (event_number, path) in files {
			match fs::read(&path).map_err(SnapshotError::from).and_then(|bytes| {
				serde_json::from_slice::<EngineSnapshot>(&bytes).map_err(SnapshotError::from)
			}) {
				Ok(snapshot) => return Ok(Some(snapshot)),
				Err(e) => {
					warn!(
						target: "snapshotter",
						event_number,
						path = %path.display(),
						error = %e,
						"unreadable snapshot skipped"
					);
				}
			}
		}
		Ok(None)
	}

	fn prune(&self) {
		let mut files = self.snapshot_files();
		if files.len() <= SNAPSHOTS_KEPT {
			return;
		}
		let excess = files.len() - SNAPSHOTS_KEPT;
		for (_, path) in files.drain(..excess) {
			if let Err(e) = fs::remove_file(&path) {
				warn!(target: "snapshotter", path = %path.display(), error = %e, "failed to delete old snapshot");
			}
		}
	}

	/// Snapshot files sorted oldest first by (event number, timestamp)
	fn snapshot_files(&self) -> Vec<(u64, PathBuf)> {
		let Ok(entries) = fs::read_dir(&self.dir) else {
			return Vec::new();
		};
		let mut files: Vec<(u64, u128, PathBuf)> = entries
			.flatten()
			.filter_map(|entry| {
				let path = entry.path();
				let name = path.file_name()?.to_str()?;
				let middle = name.strip_prefix("snapshot-")?.strip_suffix(".json")?;
				let (event_part, stamp_part) = middle.split_once('-')?;
				Some((
					event_part.parse::<u64>().ok()?,
					stamp_part.parse::<u128>().ok()?,
					path,
				))
			})
			.collect();
		files.sort_by_key(|(event_number, stamp, _)| (*event_number, *stamp));
		files
			.into_iter()
			.map(|(event_number, _, path)| (event_number, path))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snapshot(event_number: u64) -> EngineSnapshot {
		EngineSnapshot {
			last_event_number: event_number,
			taken_at: 1_000,
			last_sequence: 7,
			trade_counter: 3,
			order_counter: 9,
			books: Vec::new(),
			balances: HashMap::new(),
			positions: Vec::new(),
			locks: HashMap::new(),
		}
	}

	#[test]
	fn test_save_and_load_latest() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();

		store.save(&snapshot(10)).unwrap();
		store.save(&snapshot(25)).unwrap();

		let latest = store.load_latest().unwrap().unwrap();
		assert_eq!(latest.last_event_number, 25);
		assert_eq!(latest.last_sequence, 7);
	}

	#[test]
	fn test_empty_directory_means_clean_start() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();
		assert!(store.load_latest().unwrap().is_none());
	}

	#[test]
	fn test_prune_keeps_five_newest() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();

		for n in 1..=8 {
			store.save(&snapshot(n * 10)).unwrap();
		}

		let files = store.snapshot_files();
		assert_eq!(files.len(), 5);
		assert_eq!(files[0].0, 40);
		assert_eq!(files[4].0, 80);
	}

	#[test]
	fn test_corrupt_snapshot_falls_back_to_older() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();

		store.save(&snapshot(10)).unwrap();
		fs::write(dir.path().join("snapshot-20-9999.json"), b"{broken").unwrap();

		let latest = store.load_latest().unwrap().unwrap();
		assert_eq!(latest.last_event_number, 10);
	}
}
