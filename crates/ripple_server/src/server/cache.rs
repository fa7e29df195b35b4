#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use ripple_domain::{MessageId, RoomId};
use ripple_protocol::WireMessage;

/// Retention for direct-message threads beyond the per-room count cap.
const DIRECT_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Warm cache of the most recent messages per active room.
///
/// Writes happen inside the room's exclusion domain, after the store append
/// commits and before the event is published, so the cached tail is always a
/// monotonic suffix of the store's append order.
pub struct MessageCache {
	per_room: usize,
	rooms: Mutex<HashMap<RoomId, VecDeque<WireMessage>>>,
}

impl MessageCache {
	pub fn new(per_room: usize) -> Self {
		Self {
			per_room,
			rooms: Mutex::new(HashMap::new()),
		}
	}

	/// Append one message to a room's tail. Out-of-order ids are discarded.
	pub fn push(&self, message: WireMessage, now_ms: i64) {
		let mut rooms = self.rooms.lock();
		let buf = rooms.entry(message.room_id.clone()).or_default();

		if let Some(last) = buf.back()
			&& last.message_id >= message.message_id
		{
			return;
		}

		let is_direct = message.room_id.is_direct();
		buf.push_back(message);

		while buf.len() > self.per_room {
			let Some(front) = buf.front() else { break };
			if is_direct && now_ms.saturating_sub(front.created_at) < DIRECT_RETENTION_MS {
				break;
			}
			buf.pop_front();
		}
	}

	/// Apply an edit or soft-delete to a cached entry, if present.
	pub fn apply(&self, room: &RoomId, message_id: MessageId, f: impl FnOnce(&mut WireMessage)) {
		let mut rooms = self.rooms.lock();
		if let Some(buf) = rooms.get_mut(room)
			&& let Some(entry) = buf.iter_mut().find(|m| m.message_id == message_id)
		{
			f(entry);
		}
	}

	/// Most recent `limit` messages in ascending id order, or `None` when the
	/// cached tail cannot satisfy the request and the store must be consulted.
	pub fn recent(&self, room: &RoomId, limit: usize) -> Option<Vec<WireMessage>> {
		let rooms = self.rooms.lock();
		let buf = rooms.get(room)?;
		if buf.len() < limit {
			return None;
		}
		Some(buf.iter().skip(buf.len() - limit).cloned().collect())
	}

	/// Drop a room's cached tail (room deleted).
	pub fn invalidate(&self, room: &RoomId) {
		self.rooms.lock().remove(room);
	}

	/// Cached entry count for a room, for sweeps and tests.
	#[allow(dead_code)]
	pub fn len(&self, room: &RoomId) -> usize {
		self.rooms.lock().get(room).map(|b| b.len()).unwrap_or(0)
	}
}
