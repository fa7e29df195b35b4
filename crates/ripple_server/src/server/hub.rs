#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use parking_lot::Mutex as SyncMutex;
use ripple_domain::{RoomId, SessionId, Subject, UserId};
use ripple_protocol::{ServerBody, TypingIndicator};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::server::auth::TokenVerifier;
use crate::server::cache::MessageCache;
use crate::server::delivery::{CloseReason, OutboundQueue};
use crate::server::event_bus::EventBus;
use crate::server::moderation::ModerationGate;
use crate::server::presence::PresenceIndex;
use crate::server::rate_limit::RateLimiter;
use crate::server::rooms::RoomRegistry;
use crate::server::store::MessageStore;

/// Hub-side handle for one live session.
#[derive(Clone)]
pub struct SessionHandle {
	pub session_id: SessionId,
	pub user_id: UserId,

	/// The token's `sid` claim; at most one live session per value.
	pub claim_sid: String,

	pub queue: OutboundQueue,
}

/// Top-level orchestrator. Owns the registries, the live session table and
/// every background sweep; passed by `Arc` into session tasks instead of
/// living in a global.
pub struct Hub {
	pub cfg: ServerConfig,
	pub store: Arc<dyn MessageStore>,
	pub cache: MessageCache,
	pub registry: RoomRegistry,
	pub presence: PresenceIndex,
	pub limiter: RateLimiter,
	pub gate: ModerationGate,
	pub bus: EventBus,
	pub verifier: Arc<dyn TokenVerifier>,

	sessions: SyncMutex<HashMap<SessionId, SessionHandle>>,
	by_user: SyncMutex<HashMap<UserId, HashSet<SessionId>>>,
	by_claim: SyncMutex<HashMap<String, SessionId>>,

	/// Ephemeral typing set: `(room, user) -> expires_at`. Never persisted.
	typing: SyncMutex<HashMap<(RoomId, UserId), Instant>>,

	shutdown_tx: watch::Sender<bool>,
	sweeps: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Hub {
	/// Build a hub over an already connected store.
	pub async fn new(
		cfg: ServerConfig,
		store: Arc<dyn MessageStore>,
		verifier: Arc<dyn TokenVerifier>,
	) -> anyhow::Result<Arc<Self>> {
		let gate = ModerationGate::new(cfg.hub.message_max_length, &cfg.banned_tokens)
			.context("compile banned-token patterns")?;

		let registry = RoomRegistry::new(cfg.hub.room_max_members, cfg.hub.max_rooms_per_user);
		registry.load(store.as_ref()).await.context("load rooms from store")?;

		let (shutdown_tx, _) = watch::channel(false);

		let hub = Arc::new(Self {
			cache: MessageCache::new(cfg.hub.cache_per_room),
			limiter: RateLimiter::new(cfg.rate_limits),
			presence: PresenceIndex::new(),
			bus: EventBus::new(None),
			gate,
			registry,
			cfg,
			store,
			verifier,
			sessions: SyncMutex::new(HashMap::new()),
			by_user: SyncMutex::new(HashMap::new()),
			by_claim: SyncMutex::new(HashMap::new()),
			typing: SyncMutex::new(HashMap::new()),
			shutdown_tx,
			sweeps: SyncMutex::new(Vec::new()),
		});

		hub.spawn_sweeps();
		Ok(hub)
	}

	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown_tx.subscribe()
	}

	pub fn is_shutting_down(&self) -> bool {
		*self.shutdown_tx.borrow()
	}

	/// Register a freshly authenticated session. A second live session for
	/// the same token `sid` evicts the old one with close code 4007.
	pub fn register_session(&self, handle: SessionHandle) -> Result<(), &'static str> {
		if self.is_shutting_down() {
			return Err("shutting_down");
		}

		// lock order: by_claim only ever nests inside sessions
		let evicted = {
			let mut sessions = self.sessions.lock();
			if sessions.len() >= self.cfg.hub.max_sessions {
				return Err("capacity");
			}
			sessions.insert(handle.session_id, handle.clone());
			let old_id = self.by_claim.lock().insert(handle.claim_sid.clone(), handle.session_id);
			old_id.and_then(|old_id| sessions.remove(&old_id))
		};

		self.by_user.lock().entry(handle.user_id).or_default().insert(handle.session_id);

		if let Some(old) = evicted {
			warn!(session = %old.session_id, user = %old.user_id, "evicting duplicate session");
			if let Some(set) = self.by_user.lock().get_mut(&old.user_id) {
				set.remove(&old.session_id);
			}
			old.queue.close(CloseReason::DuplicateSession);
		}

		metrics::gauge!("ripple_server_active_sessions").set(self.sessions.lock().len() as f64);
		Ok(())
	}

	pub fn unregister_session(&self, session_id: SessionId) {
		let removed = self.sessions.lock().remove(&session_id);
		if let Some(handle) = removed {
			if let Some(set) = self.by_user.lock().get_mut(&handle.user_id) {
				set.remove(&session_id);
			}
			let mut by_claim = self.by_claim.lock();
			if by_claim.get(&handle.claim_sid) == Some(&session_id) {
				by_claim.remove(&handle.claim_sid);
			}
		}
		metrics::gauge!("ripple_server_active_sessions").set(self.sessions.lock().len() as f64);
	}

	pub fn session_count(&self) -> usize {
		self.sessions.lock().len()
	}

	/// Subscribe every live session of `user` to a subject.
	pub async fn subscribe_user_sessions(&self, user: UserId, subject: Subject) {
		let ids: Vec<SessionId> = {
			let by_user = self.by_user.lock();
			by_user.get(&user).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
		};
		let handles: Vec<SessionHandle> = {
			let sessions = self.sessions.lock();
			ids.iter().filter_map(|id| sessions.get(id).cloned()).collect()
		};

		for handle in handles {
			self.bus.subscribe(subject.clone(), handle.session_id, handle.queue.clone()).await;
		}
	}

	/// Drop every live session of `user` from a subject (leave, kick).
	pub async fn unsubscribe_user_sessions(&self, user: UserId, subject: &Subject) {
		let ids: Vec<SessionId> = {
			let by_user = self.by_user.lock();
			by_user.get(&user).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
		};

		for id in ids {
			self.bus.unsubscribe(subject, id).await;
		}
	}

	/// Flip a typing indicator. Returns whether the visible state changed
	/// (a refresh of an active indicator only extends its expiry).
	pub fn set_typing(&self, room: RoomId, user: UserId, on: bool) -> bool {
		let mut typing = self.typing.lock();
		if on {
			typing.insert((room, user), Instant::now() + self.cfg.hub.typing_ttl).is_none()
		} else {
			typing.remove(&(room, user)).is_some()
		}
	}

	/// Expire stale typing indicators, publishing the stop for each.
	pub async fn typing_sweep_once(&self) {
		let now = Instant::now();
		let expired: Vec<(RoomId, UserId)> = {
			let mut typing = self.typing.lock();
			let expired = typing
				.iter()
				.filter(|(_, expires)| **expires <= now)
				.map(|(key, _)| key.clone())
				.collect::<Vec<_>>();
			for key in &expired {
				typing.remove(key);
			}
			expired
		};

		for (room, user) in expired {
			self.bus
				.publish(
					&Subject::room(room.clone()),
					ServerBody::TypingIndicator(TypingIndicator {
						room_id: room,
						user_id: user,
						typing: false,
					}),
				)
				.await;
		}
	}

	/// Run one presence sweep: idle sessions to `away`, expired grace
	/// windows to `offline`.
	pub async fn presence_sweep_once(&self) {
		let updates = self.presence.sweep(self.cfg.hub.idle_threshold);
		for update in updates {
			let user = update.user_id;
			self.bus.publish(&Subject::user(user), ServerBody::PresenceUpdate(update)).await;
		}
	}

	fn spawn_sweeps(self: &Arc<Self>) {
		let mut sweeps = self.sweeps.lock();

		let hub = Arc::clone(self);
		sweeps.push(tokio::spawn(async move {
			let mut shutdown = hub.shutdown_signal();
			let mut tick = tokio::time::interval(Duration::from_secs(1));
			loop {
				tokio::select! {
					_ = tick.tick() => {
						hub.presence_sweep_once().await;
						hub.typing_sweep_once().await;
					}
					_ = shutdown.changed() => {
						debug!("presence/typing sweep exiting");
						break;
					}
				}
			}
		}));

		let hub = Arc::clone(self);
		sweeps.push(tokio::spawn(async move {
			let mut shutdown = hub.shutdown_signal();
			let mut tick = tokio::time::interval(Duration::from_secs(60));
			loop {
				tokio::select! {
					_ = tick.tick() => {
						hub.limiter.prune_stale(Duration::from_secs(600));
					}
					_ = shutdown.changed() => {
						debug!("rate-limit prune sweep exiting");
						break;
					}
				}
			}
		}));
	}

	/// Graceful shutdown: every session drains for up to `shutdown_grace`,
	/// then sweeps are stopped. Durable state is untouched.
	pub async fn shutdown(&self) {
		info!(sessions = self.session_count(), "hub shutting down");
		let _ = self.shutdown_tx.send(true);

		let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
		for handle in &handles {
			handle.queue.close(CloseReason::ServerShutdown);
		}

		let deadline = Instant::now() + self.cfg.hub.shutdown_grace;
		while self.session_count() > 0 && Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}

		// anything still draining at the deadline is force-closed: the
		// escalated reason drops queued frames so the writers terminate
		let stragglers: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
		if !stragglers.is_empty() {
			warn!(stragglers = stragglers.len(), "shutdown grace elapsed; force-closing remaining sessions");
			for handle in &stragglers {
				handle.queue.force_close(CloseReason::ShutdownTimeout);
			}
			while self.session_count() > 0 && Instant::now() < deadline + Duration::from_secs(1) {
				tokio::time::sleep(Duration::from_millis(50)).await;
			}
		}

		for sweep in self.sweeps.lock().drain(..) {
			sweep.abort();
		}
		info!("hub shutdown complete");
	}
}
