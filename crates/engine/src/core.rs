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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender, bounded};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use verdict_sdk::{
	BalanceView, BookSnapshot, CancelRejectReason, CancelRejected, MarketStats, Outcome,
	OrderStatus, PositionView, RejectReason, SubmitAccepted, SubmitOrderRequest, SubmitRejected,
};

use crate::config::EngineSettings;
use crate::events::{DomainEvent, EventBus};
use crate::matching::MatchingCore;
use crate::persist::{PersistenceManager, WalEventBody, WalRecord};
use crate::risk::{RiskEngine, RiskLimits};
use crate::sequencer::{RateLimiter, Sequencer, USER_CANCELLED, validate};
use crate::types::{Order, now_millis};

/// Errors surfaced by the facade's read and control surface
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("engine is not running")]
	Stopped,
	#[error("snapshot failed: {0}")]
	Snapshot(String),
}

/// Requests handled on the engine thread between order batches
///
/// Every message carries a oneshot responder, so callers block only for
/// the round trip and never share state with the engine loop.
enum ControlMessage {
	Cancel {
		order_id: String,
		user_id: String,
		respond_to: oneshot::Sender<Result<Order, CancelRejected>>,
	},
	BookSnapshot {
		market_id: String,
		outcome: Outcome,
		depth: usize,
		respond_to: oneshot::Sender<BookSnapshot>,
	},
	Balance {
		user_id: String,
		respond_to: oneshot::Sender<BalanceView>,
	},
	Positions {
		user_id: String,
		respond_to: oneshot::Sender<HashMap<String, PositionView>>,
	},
	MarketStats {
		market_id: String,
		respond_to: oneshot::Sender<MarketStats>,
	},
	SaveSnapshot {
		respond_to: oneshot::Sender<Result<u64, String>>,
	},
	SetBalance {
		user_id: String,
		amount: Decimal,
		respond_to: oneshot::Sender<()>,
	},
	AddBalance {
		user_id: String,
		amount: Decimal,
		respond_to: oneshot::Sender<()>,
	},
	SetPosition {
		user_id: String,
		market_id: String,
		outcome: Outcome,
		quantity: u64,
		respond_to: oneshot::Sender<()>,
	},
	Shutdown,
}

/// The assembled engine
///
/// Composes persistence, risk, matching and the sequencer; owns the
/// single engine thread that runs the critical path. `submit` and
/// `cancel` are safe to call from any thread.
pub struct Engine {
	settings: EngineSettings,
	persistence: Arc<PersistenceManager>,
	events: EventBus,
	rate_limiter: RateLimiter,
	pending: Arc<DashMap<String, Order>>,
	intake_tx: CrossbeamSender<String>,
	control_tx: mpsc::Sender<ControlMessage>,
	order_counter: Arc<AtomicU64>,
	shutdown: Arc<AtomicBool>,
	thread: Option<JoinHandle<()>>,
}

impl Engine {
	/// Build the engine, recover persisted state and start processing
	pub fn start(settings: EngineSettings) -> anyhow::Result<Self> {
		let persistence = Arc::new(PersistenceManager::open(
			&settings.wal_path,
			&settings.snapshot_path,
			settings.buffer_size,
			settings.flush_interval_ms,
		)?);
		let events = EventBus::new(settings.event_bus_capacity);
		let risk = RiskEngine::new(
			RiskLimits {
				max_order_value: settings.max_order_value,
				max_position_size: settings.max_position_size,
				min_balance: settings.min_balance,
			},
			events.clone(),
		);
		let mut sequencer = Sequencer::new(
			MatchingCore::new(),
			risk,
			persistence.clone(),
			events.clone(),
		);

		// Recovery: newest snapshot, then every event journaled after it
		let recovered = persistence.load_latest_state()?;
		let mut order_counter = 0;
		if let Some(snapshot) = &recovered.snapshot {
			info!(
				target: "engine",
				event_number = snapshot.last_event_number,
				sequence = snapshot.last_sequence,
				books = snapshot.books.len(),
				"restoring from snapshot"
			);
			sequencer.restore_state(snapshot);
			order_counter = snapshot.order_counter;
		}
		if !recovered.tail.is_empty() {
			info!(
				target: "engine",
				events = recovered.tail.len(),
				"replaying journal tail"
			);
			for record in &recovered.tail {
				order_counter = order_counter.max(order_counter_in(record));
				sequencer.apply_record(record);
			}
		}
		if !recovered.is_empty() {
			info!(
				target: "engine",
				sequence = sequencer.last_sequence(),
				"recovery complete"
			);
		}

		let order_counter = Arc::new(AtomicU64::new(order_counter));
		let pending: Arc<DashMap<String, Order>> = Arc::new(DashMap::new());
		let (intake_tx, intake_rx) = bounded(settings.queue_capacity);
		let (control_tx, control_rx) = mpsc::channel(64);
		let shutdown = Arc::new(AtomicBool::new(false));

		let thread = {
			let pending = pending.clone();
			let persistence = persistence.clone();
			let order_counter = order_counter.clone();
			let shutdown = shutdown.clone();
			let settings = settings.clone();
			thread::Builder::new()
				.name("engine-loop".to_string())
				.spawn(move || {
					info!(target: "engine", "engine loop started");
					run_engine_loop(
						sequencer,
						intake_rx,
						control_rx,
						pending,
						persistence,
						order_counter,
						settings,
						shutdown,
					);
					info!(target: "engine", "engine loop stopped");
				})
				.expect("failed to spawn engine thread")
		};

		Ok(Self {
			rate_limiter: RateLimiter::new(settings.max_orders_per_second),
			settings,
			persistence,
			events,
			pending,
			intake_tx,
			control_tx,
			order_counter,
			shutdown,
			thread: Some(thread),
		})
	}

	/// Validate, rate-limit, journal and enqueue a submission
	pub fn submit(&self, request: SubmitOrderRequest) -> Result<SubmitAccepted, SubmitRejected> {
		if let Err(message) = validate(&request) {
			return Err(SubmitRejected {
				order_id: None,
				reason: RejectReason::ValidationError,
				message,
			});
		}
		if !self.rate_limiter.allow(&request.user_id) {
			return Err(SubmitRejected {
				order_id: None,
				reason: RejectReason::RateLimitExceeded,
				message: format!(
					"user {} exceeded {} orders per second",
					request.user_id, self.settings.max_orders_per_second
				),
			});
		}

		let order = Order {
			id: order_id(self.order_counter.fetch_add(1, Ordering::SeqCst) + 1),
			user_id: request.user_id,
			market_id: request.market_id,
			outcome: request.outcome,
			side: request.side,
			price: request.price,
			quantity: request.quantity,
			remaining: request.quantity,
			filled: 0,
			status: OrderStatus::Queued,
			received_at: now_millis(),
			sequence: None,
			sequenced_at: None,
		};

		if let Err(e) = self.persistence.log_event(WalEventBody::OrderReceived {
			order: order.clone(),
		}) {
			error!(target: "engine", order_id = %order.id, error = %e, "failed to journal submission");
			return Err(SubmitRejected {
				order_id: Some(order.id),
				reason: RejectReason::ProcessingError,
				message: format!("failed to journal submission: {}", e),
			});
		}

		let order_id = order.id.clone();
		self.pending.insert(order_id.clone(), order);
		if self.intake_tx.try_send(order_id.clone()).is_err() {
			self.pending.remove(&order_id);
			return Err(SubmitRejected {
				order_id: Some(order_id),
				reason: RejectReason::ProcessingError,
				message: "intake queue is full".to_string(),
			});
		}

		let queue_position = self.intake_tx.len();
		let batches_ahead = (queue_position as u64) / self.settings.batch_size.max(1) as u64 + 1;
		Ok(SubmitAccepted {
			order_id,
			queue_position,
			estimated_processing_ms: batches_ahead * self.settings.batch_timeout_ms.max(1),
		})
	}

	/// Cancel an order wherever it currently lives
	///
	/// An order still waiting in the intake queue is withdrawn directly;
	/// anything else is handled on the engine thread against the book.
	pub fn cancel(&self, order_id: &str, user_id: &str) -> Result<Order, CancelRejected> {
		if let Some(entry) = self.pending.get(order_id) {
			if entry.user_id != user_id {
				return Err(CancelRejected {
					reason: CancelRejectReason::Unauthorized,
					message: format!("order {} belongs to a different user", order_id),
				});
			}
		}
		if let Some((_, mut order)) = self
			.pending
			.remove_if(order_id, |_, order| order.user_id == user_id)
		{
			order.status = OrderStatus::Cancelled;
			if let Err(e) = self.persistence.log_event(WalEventBody::OrderCancelled {
				order: order.clone(),
				reason: USER_CANCELLED.to_string(),
			}) {
				error!(target: "engine", order_id, error = %e, "failed to journal queue-stage cancellation");
			}
			self.events.publish(DomainEvent::OrderCancelled {
				order: order.clone(),
			});
			return Ok(order);
		}

		let (tx, rx) = oneshot::channel();
		let message = ControlMessage::Cancel {
			order_id: order_id.to_string(),
			user_id: user_id.to_string(),
			respond_to: tx,
		};
		if self.control_tx.blocking_send(message).is_err() {
			return Err(CancelRejected {
				reason: CancelRejectReason::NotFound,
				message: "engine is not running".to_string(),
			});
		}
		rx.blocking_recv().unwrap_or_else(|_| {
			Err(CancelRejected {
				reason: CancelRejectReason::NotFound,
				message: "engine is not running".to_string(),
			})
		})
	}

	/// Depth-limited book view for one (market, outcome) pair
	pub fn book_snapshot(
		&self,
		market_id: &str,
		outcome: Outcome,
		depth: usize,
	) -> Result<BookSnapshot, EngineError> {
		self.control(|respond_to| ControlMessage::BookSnapshot {
			market_id: market_id.to_string(),
			outcome,
			depth,
			respond_to,
		})
	}

	pub fn balance(&self, user_id: &str) -> Result<BalanceView, EngineError> {
		self.control(|respond_to| ControlMessage::Balance {
			user_id: user_id.to_string(),
			respond_to,
		})
	}

	/// Positions keyed `"{marketId}:{outcome}"`
	pub fn positions(&self, user_id: &str) -> Result<HashMap<String, PositionView>, EngineError> {
		self.control(|respond_to| ControlMessage::Positions {
			user_id: user_id.to_string(),
			respond_to,
		})
	}

	pub fn market_stats(&self, market_id: &str) -> Result<MarketStats, EngineError> {
		self.control(|respond_to| ControlMessage::MarketStats {
			market_id: market_id.to_string(),
			respond_to,
		})
	}

	/// Force a snapshot now; returns the snapshot's event number
	pub fn save_snapshot(&self) -> Result<u64, EngineError> {
		self.control(|respond_to| ControlMessage::SaveSnapshot { respond_to })?
			.map_err(EngineError::Snapshot)
	}

	// Operator funding surface

	pub fn set_balance(&self, user_id: &str, amount: Decimal) -> Result<(), EngineError> {
		self.control(|respond_to| ControlMessage::SetBalance {
			user_id: user_id.to_string(),
			amount,
			respond_to,
		})
	}

	pub fn add_balance(&self, user_id: &str, amount: Decimal) -> Result<(), EngineError> {
		self.control(|respond_to| ControlMessage::AddBalance {
			user_id: user_id.to_string(),
			amount,
			respond_to,
		})
	}

	pub fn set_position(
		&self,
		user_id: &str,
		market_id: &str,
		outcome: Outcome,
		quantity: u64,
	) -> Result<(), EngineError> {
		self.control(|respond_to| ControlMessage::SetPosition {
			user_id: user_id.to_string(),
			market_id: market_id.to_string(),
			outcome,
			quantity,
			respond_to,
		})
	}

	/// Register a domain-event subscriber
	pub fn subscribe(&self) -> crossbeam::channel::Receiver<DomainEvent> {
		self.events.subscribe()
	}

	/// Diagnostics: walk every journaled record in order
	pub fn replay_journal(
		&self,
		handler: impl FnMut(&WalRecord),
	) -> Result<(), crate::persist::WalError> {
		self.persistence.replay_all(handler)
	}

	/// Graceful shutdown: drain, final snapshot, close persistence
	pub fn stop(mut self) -> anyhow::Result<()> {
		info!(target: "engine", "stopping engine");
		if self.control_tx.blocking_send(ControlMessage::Shutdown).is_err() {
			warn!(target: "engine", "engine loop already gone");
		}
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.thread.take() {
			if handle.join().is_err() {
				warn!(target: "engine", "engine thread panicked");
			}
		}
		self.persistence.close()?;
		Ok(())
	}

	fn control<T>(
		&self,
		build: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
	) -> Result<T, EngineError> {
		let (tx, rx) = oneshot::channel();
		self.control_tx
			.blocking_send(build(tx))
			.map_err(|_| EngineError::Stopped)?;
		rx.blocking_recv().map_err(|_| EngineError::Stopped)
	}
}

impl Drop for Engine {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.thread.take() {
			let _ = self.control_tx.try_send(ControlMessage::Shutdown);
			let _ = handle.join();
		}
	}
}

fn order_id(counter: u64) -> String {
	format!("ORD-{:012}", counter)
}

fn parse_order_counter(id: &str) -> Option<u64> {
	id.strip_prefix("ORD-")?.parse().ok()
}

/// Highest order-counter value referenced by a journal record
fn order_counter_in(record: &WalRecord) -> u64 {
	let id = match &record.body {
		WalEventBody::OrderReceived { order }
		| WalEventBody::OrderSequenced { order }
		| WalEventBody::OrderCancelled { order, .. }
		| WalEventBody::OrderFilled { order }
		| WalEventBody::OrderPartialFill { order } => &order.id,
		WalEventBody::OrderRejected { order_id, .. } => order_id,
		WalEventBody::Trade { .. } => return 0,
	};
	parse_order_counter(id).unwrap_or(0)
}

/// The single-threaded critical path
///
/// One loop iteration: handle queued control messages, drain up to a
/// batch of orders, then snapshot if enough events have accumulated.
/// Sleeps for the batch timeout only when the queue ran dry.
#[allow(clippy::too_many_arguments)]
fn run_engine_loop(
	mut sequencer: Sequencer,
	intake_rx: CrossbeamReceiver<String>,
	mut control_rx: mpsc::Receiver<ControlMessage>,
	pending: Arc<DashMap<String, Order>>,
	persistence: Arc<PersistenceManager>,
	order_counter: Arc<AtomicU64>,
	settings: EngineSettings,
	shutdown: Arc<AtomicBool>,
) {
	let idle_wait = Duration::from_millis(settings.batch_timeout_ms.max(1));
	let mut last_snapshot_event = persistence.last_event_number();

	loop {
		if shutdown.load(Ordering::Relaxed) {
			drain_and_stop(&mut sequencer, &intake_rx, &pending, &persistence, &order_counter);
			return;
		}

		// Control messages first; they are rare and cheap
		loop {
			match control_rx.try_recv() {
				Ok(ControlMessage::Shutdown) => {
					drain_and_stop(&mut sequencer, &intake_rx, &pending, &persistence, &order_counter);
					return;
				}
				Ok(message) => handle_control(&mut sequencer, &persistence, &order_counter, message),
				Err(mpsc::error::TryRecvError::Empty) => break,
				Err(mpsc::error::TryRecvError::Disconnected) => {
					drain_and_stop(&mut sequencer, &intake_rx, &pending, &persistence, &order_counter);
					return;
				}
			}
		}

		// Drain one batch of orders
		let mut drained = 0;
		while drained < settings.batch_size {
			match intake_rx.try_recv() {
				Ok(order_id) => {
					// A missing entry means the order was cancelled in the queue
					if let Some((_, order)) = pending.remove(&order_id) {
						sequencer.process(order);
						drained += 1;
					}
				}
				Err(crossbeam::channel::TryRecvError::Empty) => break,
				Err(crossbeam::channel::TryRecvError::Disconnected) => {
					drain_and_stop(&mut sequencer, &intake_rx, &pending, &persistence, &order_counter);
					return;
				}
			}
		}

		// Periodic snapshot, then start a fresh log file
		let last_event = persistence.last_event_number();
		if last_event.saturating_sub(last_snapshot_event) >= settings.snapshot_interval {
			match save_snapshot_now(&sequencer, &persistence, &order_counter) {
				Ok(event_number) => {
					last_snapshot_event = event_number;
					if let Err(e) = persistence.rotate_wal() {
						error!(target: "engine", error = %e, "log rotation failed");
					}
				}
				Err(message) => error!(target: "engine", error = %message, "periodic snapshot failed"),
			}
		}

		if drained == 0 {
			thread::sleep(idle_wait);
		}
	}
}

fn handle_control(
	sequencer: &mut Sequencer,
	persistence: &Arc<PersistenceManager>,
	order_counter: &Arc<AtomicU64>,
	message: ControlMessage,
) {
	match message {
		ControlMessage::Cancel {
			order_id,
			user_id,
			respond_to,
		} => {
			let _ = respond_to.send(sequencer.cancel_resting(&order_id, &user_id));
		}
		ControlMessage::BookSnapshot {
			market_id,
			outcome,
			depth,
			respond_to,
		} => {
			let _ = respond_to.send(sequencer.matching().book_snapshot(&market_id, outcome, depth));
		}
		ControlMessage::Balance {
			user_id,
			respond_to,
		} => {
			let _ = respond_to.send(sequencer.risk().balance_view(&user_id));
		}
		ControlMessage::Positions {
			user_id,
			respond_to,
		} => {
			let positions = sequencer
				.risk()
				.position_views(&user_id)
				.into_iter()
				.map(|view| (view.key(), view))
				.collect();
			let _ = respond_to.send(positions);
		}
		ControlMessage::MarketStats {
			market_id,
			respond_to,
		} => {
			let _ = respond_to.send(sequencer.matching().market_stats(&market_id));
		}
		ControlMessage::SaveSnapshot { respond_to } => {
			let _ = respond_to.send(save_snapshot_now(sequencer, persistence, order_counter));
		}
		ControlMessage::SetBalance {
			user_id,
			amount,
			respond_to,
		} => {
			sequencer.risk_mut().set_balance(&user_id, amount);
			let _ = respond_to.send(());
		}
		ControlMessage::AddBalance {
			user_id,
			amount,
			respond_to,
		} => {
			sequencer.risk_mut().add_balance(&user_id, amount);
			let _ = respond_to.send(());
		}
		ControlMessage::SetPosition {
			user_id,
			market_id,
			outcome,
			quantity,
			respond_to,
		} => {
			sequencer
				.risk_mut()
				.set_position(&user_id, &market_id, outcome, quantity);
			let _ = respond_to.send(());
		}
		ControlMessage::Shutdown => {
			// Handled by the loop before dispatching here
		}
	}
}

fn save_snapshot_now(
	sequencer: &Sequencer,
	persistence: &Arc<PersistenceManager>,
	order_counter: &Arc<AtomicU64>,
) -> Result<u64, String> {
	// Everything journaled so far must be on disk before the snapshot
	// claims to cover it
	persistence.flush().map_err(|e| e.to_string())?;
	let snapshot = sequencer.snapshot_state(order_counter.load(Ordering::SeqCst));
	persistence
		.save_snapshot(&snapshot)
		.map_err(|e| e.to_string())
}

/// Process whatever is still queued, then take the final snapshot
fn drain_and_stop(
	sequencer: &mut Sequencer,
	intake_rx: &CrossbeamReceiver<String>,
	pending: &Arc<DashMap<String, Order>>,
	persistence: &Arc<PersistenceManager>,
	order_counter: &Arc<AtomicU64>,
) {
	while let Ok(order_id) = intake_rx.try_recv() {
		if let Some((_, order)) = pending.remove(&order_id) {
			sequencer.process(order);
		}
	}
	match save_snapshot_now(sequencer, persistence, order_counter) {
		Ok(event_number) => {
			info!(target: "engine", event_number, "final snapshot saved");
		}
		Err(message) => {
			error!(target: "engine", error = %message, "final snapshot failed");
		}
	}
}
