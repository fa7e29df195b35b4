#![forbid(unsafe_code)]

use std::collections::HashMap;

use ripple_domain::{SessionId, Subject};
use ripple_protocol::{ServerBody, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::server::delivery::{OutboundQueue, PushOutcome};
use crate::util::time::unix_ms_now;

/// In-process publish/subscribe fan-out.
///
/// Each subject (`room:<id>`, `user:<id>`) carries a monotonically increasing
/// `seq` so clients can detect gaps after reconnect. Delivery into a
/// subscriber's outbound queue is at-most-once: a full queue applies the
/// queue's own shed policy, never a retry.
pub struct EventBus {
	inner: Mutex<Inner>,

	/// Optional best-effort copy of every event for external sinks
	/// (analytics, push-notification hooks). A full sink drops.
	external: Option<mpsc::Sender<ServerFrame>>,
}

#[derive(Default)]
struct Inner {
	subjects: HashMap<Subject, SubjectEntry>,
}

#[derive(Default)]
struct SubjectEntry {
	seq: u64,
	subscribers: Vec<Subscriber>,
}

struct Subscriber {
	session: SessionId,
	queue: OutboundQueue,
}

impl EventBus {
	pub fn new(external: Option<mpsc::Sender<ServerFrame>>) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			external,
		}
	}

	/// Register a session's outbound queue on a subject.
	pub async fn subscribe(&self, subject: Subject, session: SessionId, queue: OutboundQueue) {
		let mut inner = self.inner.lock().await;
		let entry = inner.subjects.entry(subject).or_default();
		entry.subscribers.retain(|s| s.session != session && !s.queue.is_closed());
		entry.subscribers.push(Subscriber { session, queue });
	}

	pub async fn unsubscribe(&self, subject: &Subject, session: SessionId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.subjects.get_mut(subject) {
			entry.subscribers.retain(|s| s.session != session);
		}
	}

	/// Drop every subscription held by a session (session closed).
	pub async fn unsubscribe_all(&self, session: SessionId) {
		let mut inner = self.inner.lock().await;
		for entry in inner.subjects.values_mut() {
			entry.subscribers.retain(|s| s.session != session);
		}
	}

	/// Publish one event on a subject. Assigns the subject `seq`, stamps the
	/// frame, and try-pushes it into every live subscriber queue exactly once.
	/// Returns the assigned `seq`.
	pub async fn publish(&self, subject: &Subject, body: ServerBody) -> u64 {
		let kind = body.kind();
		let mut inner = self.inner.lock().await;
		let entry = inner.subjects.entry(subject.clone()).or_default();
		entry.seq += 1;
		let seq = entry.seq;

		let frame = ServerFrame::event(subject.to_string(), seq, unix_ms_now(), body);

		entry.subscribers.retain(|s| !s.queue.is_closed());

		let mut dropped: u64 = 0;
		let mut overflowed: u64 = 0;
		for sub in &entry.subscribers {
			match sub.queue.push(frame.clone()) {
				PushOutcome::Queued | PushOutcome::Coalesced => {}
				PushOutcome::Dropped => dropped += 1,
				PushOutcome::Overflow => {
					overflowed += 1;
					debug!(session = %sub.session, subject = %subject, "subscriber overflowed; closing as slow consumer");
				}
				PushOutcome::Closed => {}
			}
		}

		entry.subscribers.retain(|s| !s.queue.is_closed());

		metrics::counter!("ripple_server_events_published_total", "kind" => kind).increment(1);
		if dropped > 0 {
			metrics::counter!("ripple_server_events_dropped_total").increment(dropped);
		}
		if overflowed > 0 {
			metrics::counter!("ripple_server_slow_consumer_disconnects_total").increment(overflowed);
		}

		if let Some(external) = &self.external {
			let _ = external.try_send(frame);
		}

		seq
	}

	/// Current `seq` for a subject (0 when nothing was ever published).
	pub async fn current_seq(&self, subject: &Subject) -> u64 {
		let inner = self.inner.lock().await;
		inner.subjects.get(subject).map(|e| e.seq).unwrap_or(0)
	}

	/// Live subscriber count for a subject.
	#[allow(dead_code)]
	pub async fn subscriber_count(&self, subject: &Subject) -> usize {
		let inner = self.inner.lock().await;
		inner
			.subjects
			.get(subject)
			.map(|e| e.subscribers.iter().filter(|s| !s.queue.is_closed()).count())
			.unwrap_or(0)
	}
}
