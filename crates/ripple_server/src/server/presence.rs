#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ripple_domain::{PresenceStatus, SessionId, UserId};
use ripple_protocol::PresenceUpdate;

use crate::util::time::unix_ms_now;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Default)]
struct UserPresence {
	sessions: HashMap<SessionId, Instant>,
	last_seen_ms: i64,
	pending_offline_at: Option<Instant>,
	published: Option<PresenceStatus>,
}

/// Volatile per-user presence derived from live sessions.
///
/// `online` iff at least one live session; `away` iff every live session has
/// been silent past the idle threshold; `offline` only after the
/// disconnect grace expires without a reconnect, so transient flaps publish
/// nothing.
pub struct PresenceIndex {
	shards: Vec<Mutex<HashMap<UserId, UserPresence>>>,
}

impl PresenceIndex {
	pub fn new() -> Self {
		Self {
			shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
		}
	}

	fn shard(&self, user: UserId) -> &Mutex<HashMap<UserId, UserPresence>> {
		let mut hasher = DefaultHasher::new();
		user.hash(&mut hasher);
		&self.shards[(hasher.finish() as usize) % SHARD_COUNT]
	}

	/// Register a live session. Returns the `online` transition to publish,
	/// if this connect changed the user's published state.
	pub fn on_session_connect(&self, user: UserId, session: SessionId) -> Option<PresenceUpdate> {
		let now = Instant::now();
		let mut shard = self.shard(user).lock();
		let entry = shard.entry(user).or_default();

		entry.sessions.insert(session, now);
		entry.last_seen_ms = unix_ms_now();
		entry.pending_offline_at = None;

		if entry.published != Some(PresenceStatus::Online) {
			entry.published = Some(PresenceStatus::Online);
			return Some(PresenceUpdate {
				user_id: user,
				status: PresenceStatus::Online,
				last_seen_at: entry.last_seen_ms,
			});
		}
		None
	}

	/// Record a client-originated frame. Flips `away → online` when the user
	/// was published away.
	pub fn on_session_frame(&self, user: UserId, session: SessionId) -> Option<PresenceUpdate> {
		let now = Instant::now();
		let mut shard = self.shard(user).lock();
		let entry = shard.entry(user).or_default();

		entry.sessions.insert(session, now);
		entry.last_seen_ms = unix_ms_now();

		if entry.published == Some(PresenceStatus::Away) {
			entry.published = Some(PresenceStatus::Online);
			return Some(PresenceUpdate {
				user_id: user,
				status: PresenceStatus::Online,
				last_seen_at: entry.last_seen_ms,
			});
		}
		None
	}

	/// Drop a session. The offline transition is deferred by `grace` and
	/// published by the sweep only if no session reconnects in the window.
	pub fn on_session_disconnect(&self, user: UserId, session: SessionId, grace: Duration) {
		let mut shard = self.shard(user).lock();
		let Some(entry) = shard.get_mut(&user) else { return };

		entry.sessions.remove(&session);
		entry.last_seen_ms = unix_ms_now();
		if entry.sessions.is_empty() {
			entry.pending_offline_at = Some(Instant::now() + grace);
		}
	}

	/// One sweep pass: expire grace windows into `offline` and idle sessions
	/// into `away`. Returns the transitions to publish.
	pub fn sweep(&self, idle_threshold: Duration) -> Vec<PresenceUpdate> {
		let now = Instant::now();
		let mut updates = Vec::new();

		for shard in &self.shards {
			let mut shard = shard.lock();
			shard.retain(|user, entry| {
				if entry.sessions.is_empty() {
					let Some(deadline) = entry.pending_offline_at else {
						return entry.published.is_some();
					};
					if now >= deadline {
						if entry.published != Some(PresenceStatus::Offline) {
							updates.push(PresenceUpdate {
								user_id: *user,
								status: PresenceStatus::Offline,
								last_seen_at: entry.last_seen_ms,
							});
						}
						// published offline; forget the user entirely
						return false;
					}
					return true;
				}

				let all_idle = entry.sessions.values().all(|last| now.duration_since(*last) >= idle_threshold);
				if all_idle && entry.published == Some(PresenceStatus::Online) {
					entry.published = Some(PresenceStatus::Away);
					updates.push(PresenceUpdate {
						user_id: *user,
						status: PresenceStatus::Away,
						last_seen_at: entry.last_seen_ms,
					});
				}
				true
			});
		}

		updates
	}

	/// Current view for the requested users. Unknown users are `offline`.
	pub fn snapshot(&self, users: &[UserId]) -> HashMap<UserId, PresenceUpdate> {
		let mut out = HashMap::with_capacity(users.len());
		for user in users {
			let shard = self.shard(*user).lock();
			let update = match shard.get(user) {
				Some(entry) => PresenceUpdate {
					user_id: *user,
					status: entry.published.unwrap_or(PresenceStatus::Offline),
					last_seen_at: entry.last_seen_ms,
				},
				None => PresenceUpdate {
					user_id: *user,
					status: PresenceStatus::Offline,
					last_seen_at: 0,
				},
			};
			out.insert(*user, update);
		}
		out
	}
}

impl Default for PresenceIndex {
	fn default() -> Self {
		Self::new()
	}
}
