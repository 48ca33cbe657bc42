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

pub mod snapshot;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

pub use snapshot::{EngineSnapshot, PositionEntry, SnapshotError, SnapshotStore};
pub use wal::{Wal, WalError, WalEventBody, WalRecord};

#[derive(Debug, Error)]
pub enum PersistError {
	#[error(transparent)]
	Wal(#[from] WalError),
	#[error(transparent)]
	Snapshot(#[from] SnapshotError),
}

/// State recovered at startup: the newest snapshot plus every log record
/// written after it
#[derive(Debug)]
pub struct RecoveredState {
	pub snapshot: Option<EngineSnapshot>,
	pub tail: Vec<WalRecord>,
}

impl RecoveredState {
	pub fn is_empty(&self) -> bool {
		self.snapshot.is_none() && self.tail.is_empty()
	}
}

/// Durable storage for the engine: write-ahead log plus snapshots
///
/// Appends go through an in-memory buffer that is flushed when full and by
/// a background timer thread, so the engine thread never waits on the
/// flush interval. Logging is on the critical path: an append error
/// surfaces to the caller and the current operation halts.
pub struct PersistenceManager {
	wal: Arc<Mutex<Wal>>,
	snapshots: SnapshotStore,
	wal_dir: PathBuf,
	flusher: Mutex<Option<JoinHandle<()>>>,
	shutdown: Arc<AtomicBool>,
}

impl PersistenceManager {
	pub fn open(
		wal_dir: &Path,
		snapshot_dir: &Path,
		buffer_size: usize,
		flush_interval_ms: u64,
	) -> Result<Self, PersistError> {
		let wal = Arc::new(Mutex::new(Wal::open(wal_dir, buffer_size)?));
		let snapshots = SnapshotStore::open(snapshot_dir)?;

		let shutdown = Arc::new(AtomicBool::new(false));
		let flusher = Self::start_flusher(wal.clone(), shutdown.clone(), flush_interval_ms);

		Ok(Self {
			wal,
			snapshots,
			wal_dir: wal_dir.to_path_buf(),
			flusher: Mutex::new(Some(flusher)),
			shutdown,
		})
	}

	fn start_flusher(
		wal: Arc<Mutex<Wal>>,
		shutdown: Arc<AtomicBool>,
		flush_interval_ms: u64,
	) -> JoinHandle<()> {
		thread::Builder::new()
			.name("wal-flusher".to_string())
			.spawn(move || {
				let interval = Duration::from_millis(flush_interval_ms.max(1));
				loop {
					thread::sleep(interval);
					if shutdown.load(Ordering::Relaxed) {
						break;
					}
					if let Err(e) = wal.lock().unwrap().flush() {
						// Buffered lines are kept; the next tick retries
						error!(target: "wal", error = %e, "timed flush failed");
					}
				}
			})
			.expect("failed to spawn wal flusher thread")
	}

	/// Append one event; returns its event number
	pub fn log_event(&self, body: WalEventBody) -> Result<u64, WalError> {
		self.wal.lock().unwrap().append(body)
	}

	pub fn flush(&self) -> Result<(), WalError> {
		self.wal.lock().unwrap().flush()
	}

	pub fn last_event_number(&self) -> u64 {
		self.wal.lock().unwrap().last_event_number()
	}

	pub fn save_snapshot(&self, snapshot: &EngineSnapshot) -> Result<u64, SnapshotError> {
		self.snapshots.save(snapshot)
	}

	/// Newest snapshot plus the parseable log records after it
	pub fn load_latest_state(&self) -> Result<RecoveredState, PersistError> {
		let snapshot = self.snapshots.load_latest()?;
		let after = snapshot
			.as_ref()
			.map(|s| s.last_event_number)
			.unwrap_or(0);
		let tail = wal::read_records_after(&self.wal_dir, after)?;
		Ok(RecoveredState { snapshot, tail })
	}

	/// Start a fresh log file, retaining the last three rotated ones
	pub fn rotate_wal(&self) -> Result<(), WalError> {
		self.wal.lock().unwrap().rotate()
	}

	/// Walk every parseable record on disk, in order (diagnostics)
	pub fn replay_all(&self, mut handler: impl FnMut(&WalRecord)) -> Result<(), WalError> {
		self.flush()?;
		for record in wal::read_records_after(&self.wal_dir, 0)? {
			handler(&record);
		}
		Ok(())
	}

	/// Stop the flush timer and write out anything still buffered
	pub fn close(&self) -> Result<(), WalError> {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.flusher.lock().unwrap().take() {
			if handle.join().is_err() {
				error!(target: "wal", "flusher thread panicked");
			}
		}
		info!(target: "wal", "persistence closed");
		self.flush()
	}
}

impl Drop for PersistenceManager {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.flusher.lock().unwrap().take() {
			let _ = handle.join();
		}
		let _ = self.wal.lock().unwrap().flush();
	}
}
