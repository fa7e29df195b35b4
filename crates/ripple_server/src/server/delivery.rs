#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use ripple_protocol::{ServerFrame, close};
use tokio::sync::Notify;

/// Why a session's outbound path is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	SlowConsumer,
	DuplicateSession,
	HeartbeatTimeout,
	ServerShutdown,
	/// Drain window elapsed during shutdown; queued frames are abandoned.
	ShutdownTimeout,
	ClientClose,
	ServerError,
}

impl CloseReason {
	/// WebSocket close code sent to the client.
	pub const fn close_code(self) -> u16 {
		match self {
			CloseReason::SlowConsumer => close::SLOW_CONSUMER,
			CloseReason::DuplicateSession => close::DUPLICATE_SESSION,
			CloseReason::ServerError => close::SERVER_ERROR,
			// normal transport closes
			CloseReason::HeartbeatTimeout | CloseReason::ClientClose => 1000,
			CloseReason::ServerShutdown | CloseReason::ShutdownTimeout => 1001,
		}
	}

	/// Whether queued frames are flushed before the close frame (Draining).
	pub const fn drains(self) -> bool {
		matches!(self, CloseReason::ServerShutdown | CloseReason::ClientClose)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			CloseReason::SlowConsumer => "slow_consumer",
			CloseReason::DuplicateSession => "duplicate_session",
			CloseReason::HeartbeatTimeout => "heartbeat_timeout",
			CloseReason::ServerShutdown => "server_shutdown",
			CloseReason::ShutdownTimeout => "shutdown_timeout",
			CloseReason::ClientClose => "client_close",
			CloseReason::ServerError => "server_error",
		}
	}
}

/// Result of pushing one frame into a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
	Queued,
	/// A queued typing update for the same `(room, user)` was replaced.
	Coalesced,
	/// A droppable frame was shed to make room (or the incoming droppable
	/// frame itself was shed).
	Dropped,
	/// Only essential frames remained; the queue closed as a slow consumer.
	Overflow,
	/// The queue was already closed.
	Closed,
}

#[derive(Debug)]
struct QueueState {
	frames: VecDeque<ServerFrame>,
	close: Option<CloseReason>,
}

#[derive(Debug)]
struct QueueShared {
	state: Mutex<QueueState>,
	notify: Notify,
	capacity: usize,
}

/// Item handed to the per-session writer task.
#[derive(Debug)]
pub enum QueueItem {
	Frame(ServerFrame),
	Close(CloseReason),
}

/// Bounded single-consumer outbound queue for one session.
///
/// Producers (the event bus and the session's own command acks) push
/// synchronously; the writer task drains via [`OutboundQueue::next`].
///
/// Overflow policy:
/// 1. coalesce typing updates per `(room, user)` into the latest one,
/// 2. shed the oldest droppable frame (typing/presence),
/// 3. with only essential frames left, close as `slow_consumer`.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
	inner: Arc<QueueShared>,
}

impl OutboundQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Arc::new(QueueShared {
				state: Mutex::new(QueueState {
					frames: VecDeque::new(),
					close: None,
				}),
				notify: Notify::new(),
				capacity: capacity.max(1),
			}),
		}
	}

	/// Push one frame, applying the overflow policy at capacity.
	pub fn push(&self, frame: ServerFrame) -> PushOutcome {
		let outcome = {
			let mut st = self.inner.state.lock();
			if st.close.is_some() {
				return PushOutcome::Closed;
			}

			if st.frames.len() < self.inner.capacity {
				st.frames.push_back(frame);
				PushOutcome::Queued
			} else {
				let coalesce_slot = frame.body.typing_key().map(|(room, user)| (room.clone(), user)).and_then(|key| {
					st.frames
						.iter()
						.position(|f| f.body.typing_key().map(|(room, user)| (room.clone(), user)) == Some(key.clone()))
				});

				if let Some(idx) = coalesce_slot {
					st.frames[idx] = frame;
					PushOutcome::Coalesced
				} else if let Some(idx) = st.frames.iter().position(|f| f.body.is_droppable()) {
					let _ = st.frames.remove(idx);
					st.frames.push_back(frame);
					PushOutcome::Dropped
				} else if frame.body.is_droppable() {
					// full of essential frames; shed the incoming droppable
					// one rather than disconnecting
					PushOutcome::Dropped
				} else {
					st.close = Some(CloseReason::SlowConsumer);
					PushOutcome::Overflow
				}
			}
		};

		self.inner.notify.notify_one();
		outcome
	}

	/// Request close. The first reason wins; a non-draining reason discards
	/// queued frames.
	pub fn close(&self, reason: CloseReason) {
		{
			let mut st = self.inner.state.lock();
			if st.close.is_none() {
				st.close = Some(reason);
			}
		}
		self.inner.notify.notify_one();
	}

	/// Escalate to a non-draining close. Overrides an earlier draining
	/// reason and discards whatever is still queued, so a writer stuck
	/// mid-drain terminates at its next step.
	pub fn force_close(&self, reason: CloseReason) {
		{
			let mut st = self.inner.state.lock();
			match st.close {
				Some(existing) if !existing.drains() => {}
				_ => st.close = Some(reason),
			}
			st.frames.clear();
		}
		self.inner.notify.notify_one();
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().close.is_some()
	}

	#[allow(dead_code)]
	pub fn len(&self) -> usize {
		self.inner.state.lock().frames.len()
	}

	/// Next item for the writer. Draining close reasons flush queued frames
	/// first; others discard and close immediately.
	pub async fn next(&self) -> QueueItem {
		loop {
			let notified = self.inner.notify.notified();
			{
				let mut st = self.inner.state.lock();
				if let Some(reason) = st.close {
					if !reason.drains() {
						st.frames.clear();
						return QueueItem::Close(reason);
					}
					if let Some(frame) = st.frames.pop_front() {
						return QueueItem::Frame(frame);
					}
					return QueueItem::Close(reason);
				}
				if let Some(frame) = st.frames.pop_front() {
					return QueueItem::Frame(frame);
				}
			}
			notified.await;
		}
	}
}
