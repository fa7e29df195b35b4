#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use ripple_domain::{MemberRole, RoomId, RoomKind, RoomNameError, UserId, validate_room_name};
use ripple_protocol::{RoomSpec, RoomSummary};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::server::store::{MemberRecord, MessageStore, RoomConfigBlob, RoomRecord, StoreError};
use crate::util::time::unix_ms_now;

#[derive(Debug, Error)]
pub enum RoomError {
	#[error("invalid room name: {0}")]
	InvalidName(#[from] RoomNameError),

	#[error("room name already taken")]
	NameTaken,

	#[error("room quota exceeded")]
	QuotaExceeded,

	#[error("room not found")]
	NotFound,

	#[error("room is full")]
	Full,

	#[error("bad password")]
	BadPassword,

	#[error("denied: {0}")]
	Denied(&'static str),

	#[error(transparent)]
	Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
	pub role: MemberRole,

	#[allow(dead_code)]
	pub joined_at: i64,
}

/// Mutable room state. Guarded by the room's exclusion domain: membership
/// changes and append-sequence decisions for the room serialize through it.
#[derive(Debug)]
pub struct RoomState {
	pub name: String,
	pub kind: RoomKind,

	#[allow(dead_code)]
	pub creator: Option<UserId>,
	pub members: HashMap<UserId, MemberInfo>,
	pub invited: HashSet<UserId>,
	pub blocked: HashSet<UserId>,
	pub banned_tokens: Vec<String>,
	pub password_digest: Option<String>,
	pub max_members: usize,
	pub created_at: i64,
	pub deleted: bool,
}

impl RoomState {
	pub fn summary(&self, id: &RoomId) -> RoomSummary {
		RoomSummary {
			room_id: id.clone(),
			name: self.name.clone(),
			kind: self.kind,
			member_count: self.members.len(),
			max_members: self.max_members,
		}
	}

	pub fn config_blob(&self) -> RoomConfigBlob {
		RoomConfigBlob {
			password_digest: self.password_digest.clone(),
			max_members: Some(self.max_members),
			banned_tokens: self.banned_tokens.clone(),
			blocked: self.blocked.iter().copied().collect(),
		}
	}

	pub fn role_of(&self, user: UserId) -> Option<MemberRole> {
		self.members.get(&user).map(|m| m.role)
	}
}

/// One registered room and its exclusion domain.
#[derive(Debug)]
pub struct Room {
	pub id: RoomId,
	state: Mutex<RoomState>,
}

impl Room {
	pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
		self.state.lock().await
	}
}

/// Partial room-configuration update applied by a moderator.
#[derive(Debug, Default)]
pub struct RoomPatch {
	pub password: Option<Option<String>>,
	pub max_members: Option<usize>,
	pub banned_tokens: Option<Vec<String>>,
	pub block: Vec<UserId>,
	pub unblock: Vec<UserId>,
}

#[derive(Debug)]
pub struct JoinOutcome {
	pub summary: RoomSummary,
	pub role: MemberRole,
	pub newly_joined: bool,
}

#[derive(Debug)]
pub struct LeaveOutcome {
	pub was_member: bool,
	pub room_deleted: bool,
}

/// In-memory registry of live rooms, write-through to the store.
///
/// Cross-room operations must acquire room domains in ascending `RoomId`
/// order; single-room operations here take exactly one domain at a time.
pub struct RoomRegistry {
	rooms: RwLock<HashMap<RoomId, Arc<Room>>>,

	/// Serializes creations and enforces non-direct name uniqueness.
	names: Mutex<HashMap<String, RoomId>>,

	/// Non-direct memberships per user, for the room quota.
	counts: SyncMutex<HashMap<UserId, usize>>,

	default_max_members: usize,
	max_rooms_per_user: usize,
}

impl RoomRegistry {
	pub fn new(default_max_members: usize, max_rooms_per_user: usize) -> Self {
		Self {
			rooms: RwLock::new(HashMap::new()),
			names: Mutex::new(HashMap::new()),
			counts: SyncMutex::new(HashMap::new()),
			default_max_members,
			max_rooms_per_user,
		}
	}

	/// Rehydrate from the store at startup.
	pub async fn load(&self, store: &dyn MessageStore) -> Result<usize, RoomError> {
		let (records, members) = store.load_rooms().await?;

		let mut by_room: HashMap<RoomId, HashMap<UserId, MemberInfo>> = HashMap::new();
		for m in members {
			by_room.entry(m.room_id.clone()).or_default().insert(
				m.user_id,
				MemberInfo {
					role: m.role,
					joined_at: m.joined_at,
				},
			);
		}

		let mut rooms = self.rooms.write().await;
		let mut names = self.names.lock().await;
		let mut counts = self.counts.lock();

		let loaded = records.len();
		for record in records {
			let members = by_room.remove(&record.id).unwrap_or_default();
			if record.kind != RoomKind::Direct {
				names.insert(record.name.clone(), record.id.clone());
				for user in members.keys() {
					*counts.entry(*user).or_insert(0) += 1;
				}
			}

			let state = RoomState {
				name: record.name,
				kind: record.kind,
				creator: record.creator,
				members,
				invited: HashSet::new(),
				blocked: record.config.blocked.iter().copied().collect(),
				banned_tokens: record.config.banned_tokens,
				password_digest: record.config.password_digest,
				max_members: record.config.max_members.unwrap_or(self.default_max_members),
				created_at: record.created_at,
				deleted: false,
			};

			rooms.insert(
				record.id.clone(),
				Arc::new(Room {
					id: record.id,
					state: Mutex::new(state),
				}),
			);
		}

		info!(rooms = loaded, "room registry loaded");
		Ok(loaded)
	}

	pub async fn resolve(&self, id: &RoomId) -> Option<Arc<Room>> {
		self.rooms.read().await.get(id).cloned()
	}

	/// Create a named room. Exactly one of two concurrent creations with the
	/// same name succeeds; the loser observes `NameTaken`.
	pub async fn create(
		&self,
		actor: UserId,
		spec: &RoomSpec,
		store: &dyn MessageStore,
	) -> Result<(Arc<Room>, RoomSummary), RoomError> {
		if spec.kind == RoomKind::Direct {
			return Err(RoomError::Denied("direct rooms are synthesized, not created"));
		}

		let name = validate_room_name(&spec.name)?;

		if self.counts.lock().get(&actor).copied().unwrap_or(0) >= self.max_rooms_per_user {
			return Err(RoomError::QuotaExceeded);
		}

		let id = RoomId::generate();
		let now = unix_ms_now();

		{
			let mut names = self.names.lock().await;
			if names.contains_key(&name) {
				return Err(RoomError::NameTaken);
			}
			names.insert(name.clone(), id.clone());
		}

		let state = RoomState {
			name: name.clone(),
			kind: spec.kind,
			creator: Some(actor),
			members: HashMap::from([(
				actor,
				MemberInfo {
					role: MemberRole::Owner,
					joined_at: now,
				},
			)]),
			invited: HashSet::new(),
			blocked: HashSet::new(),
			banned_tokens: Vec::new(),
			password_digest: spec.password.as_deref().map(|p| password_digest(&id, p)),
			max_members: spec.max_members.unwrap_or(self.default_max_members),
			created_at: now,
			deleted: false,
		};

		let record = RoomRecord {
			id: id.clone(),
			name: name.clone(),
			kind: spec.kind,
			creator: Some(actor),
			config: state.config_blob(),
			created_at: now,
		};

		if let Err(e) = store.insert_room(&record).await {
			self.names.lock().await.remove(&name);
			return Err(match e {
				StoreError::Conflict => RoomError::NameTaken,
				other => RoomError::Store(other),
			});
		}
		store
			.upsert_member(&MemberRecord {
				room_id: id.clone(),
				user_id: actor,
				role: MemberRole::Owner,
				joined_at: now,
				last_read: ripple_domain::MessageId(0),
			})
			.await?;

		let summary = state.summary(&id);
		let room = Arc::new(Room {
			id: id.clone(),
			state: Mutex::new(state),
		});
		self.rooms.write().await.insert(id.clone(), Arc::clone(&room));
		*self.counts.lock().entry(actor).or_insert(0) += 1;

		debug!(room = %id, name = %name, creator = %actor, "room created");
		Ok((room, summary))
	}

	/// Resolve the deterministic direct room for an unordered pair, creating
	/// it (with both users as members) on first use.
	pub async fn resolve_or_create_direct(
		&self,
		a: UserId,
		b: UserId,
		store: &dyn MessageStore,
	) -> Result<Arc<Room>, RoomError> {
		let id = RoomId::direct(a, b);

		if let Some(room) = self.resolve(&id).await {
			return Ok(room);
		}

		// serialize concurrent first-use through the creation lock, then
		// re-check
		let _guard = self.names.lock().await;
		if let Some(room) = self.resolve(&id).await {
			return Ok(room);
		}

		let now = unix_ms_now();
		let mut members = HashMap::new();
		for user in [a, b] {
			members.insert(
				user,
				MemberInfo {
					role: MemberRole::Member,
					joined_at: now,
				},
			);
		}

		let state = RoomState {
			name: id.as_str().to_string(),
			kind: RoomKind::Direct,
			creator: None,
			members,
			invited: HashSet::new(),
			blocked: HashSet::new(),
			banned_tokens: Vec::new(),
			password_digest: None,
			max_members: 2,
			created_at: now,
			deleted: false,
		};

		let record = RoomRecord {
			id: id.clone(),
			name: state.name.clone(),
			kind: RoomKind::Direct,
			creator: None,
			config: state.config_blob(),
			created_at: now,
		};
		store.insert_room(&record).await?;
		for user in [a, b] {
			store
				.upsert_member(&MemberRecord {
					room_id: id.clone(),
					user_id: user,
					role: MemberRole::Member,
					joined_at: now,
					last_read: ripple_domain::MessageId(0),
				})
				.await?;
		}

		let room = Arc::new(Room {
			id: id.clone(),
			state: Mutex::new(state),
		});
		self.rooms.write().await.insert(id.clone(), Arc::clone(&room));

		debug!(room = %id, user_a = %a, user_b = %b, "direct room created");
		Ok(room)
	}

	pub async fn join(
		&self,
		user: UserId,
		room: &Arc<Room>,
		password: Option<&str>,
		store: &dyn MessageStore,
	) -> Result<JoinOutcome, RoomError> {
		let mut state = room.lock().await;
		if state.deleted {
			return Err(RoomError::NotFound);
		}

		if let Some(info) = state.members.get(&user) {
			return Ok(JoinOutcome {
				summary: state.summary(&room.id),
				role: info.role,
				newly_joined: false,
			});
		}

		if state.kind == RoomKind::Direct {
			return Err(RoomError::Denied("direct rooms cannot be joined"));
		}
		if state.blocked.contains(&user) {
			return Err(RoomError::Denied("banned from room"));
		}
		if self.counts.lock().get(&user).copied().unwrap_or(0) >= self.max_rooms_per_user {
			return Err(RoomError::QuotaExceeded);
		}

		if state.kind == RoomKind::Private {
			let invited = state.invited.remove(&user);
			if !invited {
				match (&state.password_digest, password) {
					(Some(digest), Some(provided)) => {
						if !constant_time_str_eq(digest, &password_digest(&room.id, provided)) {
							return Err(RoomError::BadPassword);
						}
					}
					(Some(_), None) => return Err(RoomError::BadPassword),
					(None, _) => return Err(RoomError::Denied("invite required")),
				}
			}
		}

		if state.members.len() >= state.max_members {
			return Err(RoomError::Full);
		}

		let now = unix_ms_now();
		store
			.upsert_member(&MemberRecord {
				room_id: room.id.clone(),
				user_id: user,
				role: MemberRole::Member,
				joined_at: now,
				last_read: ripple_domain::MessageId(0),
			})
			.await?;

		state.members.insert(
			user,
			MemberInfo {
				role: MemberRole::Member,
				joined_at: now,
			},
		);
		*self.counts.lock().entry(user).or_insert(0) += 1;

		Ok(JoinOutcome {
			summary: state.summary(&room.id),
			role: MemberRole::Member,
			newly_joined: true,
		})
	}

	/// Leave a room. Empty non-public rooms are marked for lazy deletion and
	/// dropped from the registry.
	pub async fn leave(&self, user: UserId, room: &Arc<Room>, store: &dyn MessageStore) -> Result<LeaveOutcome, RoomError> {
		let mut state = room.lock().await;
		if state.members.remove(&user).is_none() {
			return Ok(LeaveOutcome {
				was_member: false,
				room_deleted: false,
			});
		}

		if state.kind != RoomKind::Direct {
			let mut counts = self.counts.lock();
			if let Some(count) = counts.get_mut(&user) {
				*count = count.saturating_sub(1);
			}
		}

		store.remove_member(&room.id, user).await?;

		let mut room_deleted = false;
		if state.members.is_empty() && state.kind != RoomKind::Public {
			state.deleted = true;
			room_deleted = true;
			store.mark_room_deleted(&room.id).await?;

			let name = state.name.clone();
			drop(state);
			self.rooms.write().await.remove(&room.id);
			self.names.lock().await.remove(&name);
			debug!(room = %room.id, "empty room marked deleted");
		}

		Ok(LeaveOutcome {
			was_member: true,
			room_deleted,
		})
	}

	/// Pre-authorize a user to join a private room.
	pub async fn invite(&self, actor: UserId, room: &Arc<Room>, user: UserId) -> Result<(), RoomError> {
		let mut state = room.lock().await;
		if state.kind != RoomKind::Private {
			return Err(RoomError::Denied("invites apply to private rooms"));
		}
		if !state.role_of(actor).is_some_and(|r| r.can_moderate()) {
			return Err(RoomError::Denied("moderator required"));
		}
		if state.members.contains_key(&user) {
			return Err(RoomError::Denied("already a member"));
		}
		state.invited.insert(user);
		Ok(())
	}

	/// Remove a member by moderator action. Owners cannot be kicked.
	pub async fn kick(
		&self,
		actor: UserId,
		room: &Arc<Room>,
		user: UserId,
		store: &dyn MessageStore,
	) -> Result<(), RoomError> {
		let mut state = room.lock().await;
		if !state.role_of(actor).is_some_and(|r| r.can_moderate()) {
			return Err(RoomError::Denied("moderator required"));
		}
		match state.role_of(user) {
			None => return Err(RoomError::NotFound),
			Some(MemberRole::Owner) => return Err(RoomError::Denied("cannot kick the owner")),
			Some(_) => {}
		}

		state.members.remove(&user);
		if state.kind != RoomKind::Direct {
			let mut counts = self.counts.lock();
			if let Some(count) = counts.get_mut(&user) {
				*count = count.saturating_sub(1);
			}
		}
		store.remove_member(&room.id, user).await?;
		Ok(())
	}

	/// Apply a moderator configuration patch.
	pub async fn update_config(
		&self,
		actor: UserId,
		room: &Arc<Room>,
		patch: RoomPatch,
		store: &dyn MessageStore,
	) -> Result<RoomSummary, RoomError> {
		let mut state = room.lock().await;
		if state.kind == RoomKind::Direct {
			return Err(RoomError::Denied("direct rooms have no configuration"));
		}
		if !state.role_of(actor).is_some_and(|r| r.can_moderate()) {
			return Err(RoomError::Denied("moderator required"));
		}

		if let Some(password) = patch.password {
			state.password_digest = password.as_deref().map(|p| password_digest(&room.id, p));
		}
		if let Some(max_members) = patch.max_members {
			state.max_members = max_members.max(state.members.len()).max(1);
		}
		if let Some(tokens) = patch.banned_tokens {
			state.banned_tokens = tokens;
		}
		for user in patch.block {
			if state.role_of(user) != Some(MemberRole::Owner) {
				state.blocked.insert(user);
			}
		}
		for user in patch.unblock {
			state.blocked.remove(&user);
		}

		store.update_room_config(&room.id, &state.config_blob()).await?;
		Ok(state.summary(&room.id))
	}

	/// Public rooms only; direct rooms are never advertised.
	pub async fn list_public(&self, limit: usize) -> Vec<RoomSummary> {
		let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
		let mut out = Vec::new();
		for room in rooms {
			let state = room.lock().await;
			if state.kind == RoomKind::Public && !state.deleted {
				out.push(state.summary(&room.id));
			}
			if out.len() >= limit {
				break;
			}
		}
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	/// Every room the user belongs to, with their role.
	pub async fn rooms_of(&self, user: UserId) -> Vec<(Arc<Room>, RoomSummary, MemberRole)> {
		let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
		let mut out = Vec::new();
		for room in rooms {
			let state = room.lock().await;
			if let Some(info) = state.members.get(&user) {
				out.push((Arc::clone(&room), state.summary(&room.id), info.role));
			}
		}
		out
	}

	pub async fn room_count(&self) -> usize {
		self.rooms.read().await.len()
	}
}

fn password_digest(room: &RoomId, password: &str) -> String {
	let digest = Sha256::digest(format!("{}:{}", room.as_str(), password).as_bytes());
	let mut out = String::with_capacity(64);
	for byte in digest {
		out.push_str(&format!("{byte:02x}"));
	}
	out
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
	let (a, b) = (a.as_bytes(), b.as_bytes());
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}
