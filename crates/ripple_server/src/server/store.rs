#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ripple_domain::{MemberRole, MessageId, MessageKind, RoomId, RoomKind, UserId};
use ripple_protocol::{Attachment, WireMessage};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;

use crate::util::time::{unix_ms_now, unix_secs_now};

/// Hard cap on one `list` page.
pub const HISTORY_PAGE_LIMIT: usize = 100;

/// Store failures. `Backend` failures are retryable from the client's point
/// of view; the rest are command-level rejections.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("not found")]
	NotFound,

	#[error("denied")]
	Denied,

	#[error("conflict")]
	Conflict,

	#[error("storage error: {0}")]
	Backend(#[from] sqlx::Error),

	#[error("encode error: {0}")]
	Encode(#[from] serde_json::Error),

	#[error("store deadline exceeded")]
	Timeout,
}

impl StoreError {
	pub const fn retryable(&self) -> bool {
		matches!(self, StoreError::Backend(_) | StoreError::Timeout)
	}
}

/// Draft accepted by [`MessageStore::append`]. `client_id` drives idempotent
/// retry deduplication.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room_id: RoomId,
	pub sender_id: Option<UserId>,
	pub kind: MessageKind,
	pub content: String,
	pub reply_to: Option<MessageId>,
	pub attachments: Vec<Attachment>,
	pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
	pub message: WireMessage,
	pub duplicate: bool,
}

/// Mutable room configuration persisted as one JSON blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfigBlob {
	#[serde(default)]
	pub password_digest: Option<String>,

	#[serde(default)]
	pub max_members: Option<usize>,

	#[serde(default)]
	pub banned_tokens: Vec<String>,

	#[serde(default)]
	pub blocked: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct RoomRecord {
	pub id: RoomId,
	pub name: String,
	pub kind: RoomKind,
	pub creator: Option<UserId>,
	pub config: RoomConfigBlob,
	pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct MemberRecord {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub role: MemberRole,
	pub joined_at: i64,
	pub last_read: MessageId,
}

/// Read-only user reference data, owned by the account service.
#[derive(Debug, Clone)]
pub struct UserRecord {
	pub user_id: UserId,
	pub username: String,
	pub roles: Vec<String>,
	pub is_banned: bool,
}

/// Durable persistence contract for the hub. The store is the authority for
/// `message_id` assignment; `append` returns only after commit.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Append one message. Per-room id assignment is serialized by the
	/// caller through the room's exclusion domain; a duplicate
	/// `(sender_id, client_id)` inside `idempotency_window` returns the
	/// previously persisted message instead of a new row.
	async fn append(&self, draft: NewMessage, idempotency_window: Duration) -> Result<AppendOutcome, StoreError>;

	/// Page through a room's history in ascending `message_id` order.
	async fn list(
		&self,
		room: &RoomId,
		before: Option<MessageId>,
		after: Option<MessageId>,
		limit: usize,
	) -> Result<Vec<WireMessage>, StoreError>;

	/// Edit message content. Only the sender, inside `edit_window`.
	async fn edit(
		&self,
		actor: UserId,
		message_id: MessageId,
		new_content: &str,
		edit_window: Duration,
	) -> Result<WireMessage, StoreError>;

	/// Fetch one message by id (soft-deleted entries come back redacted).
	async fn get(&self, message_id: MessageId) -> Result<Option<WireMessage>, StoreError>;

	/// Soft-delete a message. The sender, or a moderator of the room.
	async fn soft_delete(
		&self,
		actor: UserId,
		message_id: MessageId,
		actor_is_moderator: bool,
	) -> Result<WireMessage, StoreError>;

	/// Advance (never rewind) a member's read cursor.
	async fn set_read_cursor(&self, user: UserId, room: &RoomId, message_id: MessageId) -> Result<(), StoreError>;

	/// Unread message counts per room for one user.
	async fn unread_counts(&self, user: UserId) -> Result<HashMap<RoomId, i64>, StoreError>;

	/// Persist a message report for the asynchronous moderation pipeline.
	async fn insert_report(&self, message_id: MessageId, reporter: UserId, reason: &str) -> Result<i64, StoreError>;

	/// Read-only user lookup.
	async fn load_user(&self, user: UserId) -> Result<Option<UserRecord>, StoreError>;

	async fn insert_room(&self, room: &RoomRecord) -> Result<(), StoreError>;
	async fn load_rooms(&self) -> Result<(Vec<RoomRecord>, Vec<MemberRecord>), StoreError>;
	async fn update_room_config(&self, room: &RoomId, config: &RoomConfigBlob) -> Result<(), StoreError>;
	async fn mark_room_deleted(&self, room: &RoomId) -> Result<(), StoreError>;
	async fn upsert_member(&self, member: &MemberRecord) -> Result<(), StoreError>;
	async fn remove_member(&self, room: &RoomId, user: UserId) -> Result<(), StoreError>;
}

/// sqlx-backed store selected by `database_url` scheme.
#[derive(Clone)]
pub enum SqlStore {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		use anyhow::Context as _;

		if database_url.starts_with("sqlite:") {
			// a pooled :memory: database is one database per connection;
			// collapse the pool so every query sees the same schema
			let pool = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow::anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

type MessageRow = (
	i64,         // message_id
	String,      // room_id
	Option<i64>, // sender_id
	String,      // kind
	String,      // content
	Option<i64>, // reply_to
	String,      // attachments json
	i64,         // created_at
	Option<i64>, // edited_at
	Option<i64>, // deleted_at
);

fn row_to_message(row: MessageRow) -> Result<WireMessage, StoreError> {
	let (message_id, room_id, sender_id, kind, content, reply_to, attachments, created_at, edited_at, deleted_at) = row;

	let deleted = deleted_at.is_some();
	Ok(WireMessage {
		message_id: MessageId(message_id),
		room_id: RoomId::new(room_id).map_err(|_| StoreError::NotFound)?,
		sender_id: sender_id.map(UserId),
		kind: kind.parse().map_err(|_| StoreError::NotFound)?,
		// soft-deleted content is never put back on the wire
		content: if deleted { String::new() } else { content },
		created_at,
		edited_at,
		deleted,
		reply_to: reply_to.map(MessageId),
		attachments: if deleted {
			Vec::new()
		} else {
			serde_json::from_str(&attachments)?
		},
	})
}

const SELECT_MESSAGE_COLS: &str =
	"message_id, room_id, sender_id, kind, content, reply_to, attachments, created_at, edited_at, deleted_at";

#[async_trait]
impl MessageStore for SqlStore {
	async fn append(&self, draft: NewMessage, idempotency_window: Duration) -> Result<AppendOutcome, StoreError> {
		let now_ms = unix_ms_now();
		let window_floor = now_ms - idempotency_window.as_millis() as i64;
		let attachments = serde_json::to_string(&draft.attachments)?;

		match self {
			SqlStore::Sqlite(pool) => {
				let mut tx = pool.begin().await?;

				if let (Some(sender), Some(client_id)) = (draft.sender_id, draft.client_id.as_deref()) {
					let hit: Option<(i64,)> = sqlx::query_as(
						"SELECT message_id FROM client_sends WHERE sender_id = ? AND client_id = ? AND created_at >= ?",
					)
					.bind(sender.as_i64())
					.bind(client_id)
					.bind(window_floor)
					.fetch_optional(&mut *tx)
					.await?;

					if let Some((existing,)) = hit {
						let row: MessageRow =
							sqlx::query_as(&format!("SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE message_id = ?"))
								.bind(existing)
								.fetch_one(&mut *tx)
								.await?;
						tx.commit().await?;
						return Ok(AppendOutcome {
							message: row_to_message(row)?,
							duplicate: true,
						});
					}
				}

				// keep created_at strictly increasing inside the room
				let prev: Option<(Option<i64>,)> =
					sqlx::query_as("SELECT MAX(created_at) FROM messages WHERE room_id = ?")
						.bind(draft.room_id.as_str())
						.fetch_optional(&mut *tx)
						.await?;
				let created_at = now_ms.max(prev.and_then(|(v,)| v).map(|v| v + 1).unwrap_or(now_ms));

				let (message_id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (room_id, sender_id, kind, content, reply_to, attachments, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING message_id",
				)
				.bind(draft.room_id.as_str())
				.bind(draft.sender_id.map(|u| u.as_i64()))
				.bind(draft.kind.as_str())
				.bind(&draft.content)
				.bind(draft.reply_to.map(|m| m.as_i64()))
				.bind(&attachments)
				.bind(created_at)
				.fetch_one(&mut *tx)
				.await?;

				if let (Some(sender), Some(client_id)) = (draft.sender_id, draft.client_id.as_deref()) {
					sqlx::query(
						"INSERT INTO client_sends (sender_id, client_id, message_id, created_at) VALUES (?, ?, ?, ?) \
						ON CONFLICT(sender_id, client_id) DO UPDATE SET message_id = excluded.message_id, created_at = excluded.created_at",
					)
					.bind(sender.as_i64())
					.bind(client_id)
					.bind(message_id)
					.bind(now_ms)
					.execute(&mut *tx)
					.await?;

					sqlx::query("DELETE FROM client_sends WHERE created_at < ?")
						.bind(window_floor)
						.execute(&mut *tx)
						.await?;
				}

				tx.commit().await?;

				Ok(AppendOutcome {
					message: WireMessage {
						message_id: MessageId(message_id),
						room_id: draft.room_id,
						sender_id: draft.sender_id,
						kind: draft.kind,
						content: draft.content,
						created_at,
						edited_at: None,
						deleted: false,
						reply_to: draft.reply_to,
						attachments: draft.attachments,
					},
					duplicate: false,
				})
			}
			SqlStore::Postgres(pool) => {
				let mut tx = pool.begin().await?;

				if let (Some(sender), Some(client_id)) = (draft.sender_id, draft.client_id.as_deref()) {
					let hit: Option<(i64,)> = sqlx::query_as(
						"SELECT message_id FROM client_sends WHERE sender_id = $1 AND client_id = $2 AND created_at >= $3",
					)
					.bind(sender.as_i64())
					.bind(client_id)
					.bind(window_floor)
					.fetch_optional(&mut *tx)
					.await?;

					if let Some((existing,)) = hit {
						let row: MessageRow =
							sqlx::query_as(&format!("SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE message_id = $1"))
								.bind(existing)
								.fetch_one(&mut *tx)
								.await?;
						tx.commit().await?;
						return Ok(AppendOutcome {
							message: row_to_message(row)?,
							duplicate: true,
						});
					}
				}

				let prev: Option<(Option<i64>,)> =
					sqlx::query_as("SELECT MAX(created_at) FROM messages WHERE room_id = $1")
						.bind(draft.room_id.as_str())
						.fetch_optional(&mut *tx)
						.await?;
				let created_at = now_ms.max(prev.and_then(|(v,)| v).map(|v| v + 1).unwrap_or(now_ms));

				let (message_id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (room_id, sender_id, kind, content, reply_to, attachments, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING message_id",
				)
				.bind(draft.room_id.as_str())
				.bind(draft.sender_id.map(|u| u.as_i64()))
				.bind(draft.kind.as_str())
				.bind(&draft.content)
				.bind(draft.reply_to.map(|m| m.as_i64()))
				.bind(&attachments)
				.bind(created_at)
				.fetch_one(&mut *tx)
				.await?;

				if let (Some(sender), Some(client_id)) = (draft.sender_id, draft.client_id.as_deref()) {
					sqlx::query(
						"INSERT INTO client_sends (sender_id, client_id, message_id, created_at) VALUES ($1, $2, $3, $4) \
						ON CONFLICT (sender_id, client_id) DO UPDATE SET message_id = EXCLUDED.message_id, created_at = EXCLUDED.created_at",
					)
					.bind(sender.as_i64())
					.bind(client_id)
					.bind(message_id)
					.bind(now_ms)
					.execute(&mut *tx)
					.await?;

					sqlx::query("DELETE FROM client_sends WHERE created_at < $1")
						.bind(window_floor)
						.execute(&mut *tx)
						.await?;
				}

				tx.commit().await?;

				Ok(AppendOutcome {
					message: WireMessage {
						message_id: MessageId(message_id),
						room_id: draft.room_id,
						sender_id: draft.sender_id,
						kind: draft.kind,
						content: draft.content,
						created_at,
						edited_at: None,
						deleted: false,
						reply_to: draft.reply_to,
						attachments: draft.attachments,
					},
					duplicate: false,
				})
			}
		}
	}

	async fn list(
		&self,
		room: &RoomId,
		before: Option<MessageId>,
		after: Option<MessageId>,
		limit: usize,
	) -> Result<Vec<WireMessage>, StoreError> {
		let limit = limit.clamp(1, HISTORY_PAGE_LIMIT) as i64;

		let rows: Vec<MessageRow> = match self {
			SqlStore::Sqlite(pool) => match (before, after) {
				(Some(before), _) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = ? AND message_id < ? \
						ORDER BY message_id DESC LIMIT ?"
					))
					.bind(room.as_str())
					.bind(before.as_i64())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
				(None, Some(after)) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = ? AND message_id > ? \
						ORDER BY message_id ASC LIMIT ?"
					))
					.bind(room.as_str())
					.bind(after.as_i64())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
				(None, None) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = ? \
						ORDER BY message_id DESC LIMIT ?"
					))
					.bind(room.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
			},
			SqlStore::Postgres(pool) => match (before, after) {
				(Some(before), _) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = $1 AND message_id < $2 \
						ORDER BY message_id DESC LIMIT $3"
					))
					.bind(room.as_str())
					.bind(before.as_i64())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
				(None, Some(after)) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = $1 AND message_id > $2 \
						ORDER BY message_id ASC LIMIT $3"
					))
					.bind(room.as_str())
					.bind(after.as_i64())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
				(None, None) => {
					sqlx::query_as(&format!(
						"SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE room_id = $1 \
						ORDER BY message_id DESC LIMIT $2"
					))
					.bind(room.as_str())
					.bind(limit)
					.fetch_all(pool)
					.await?
				}
			},
		};

		let descending = after.is_none();
		let mut messages = rows.into_iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
		if descending {
			messages.reverse();
		}
		Ok(messages)
	}

	async fn get(&self, message_id: MessageId) -> Result<Option<WireMessage>, StoreError> {
		self.fetch_message(message_id).await
	}

	async fn edit(
		&self,
		actor: UserId,
		message_id: MessageId,
		new_content: &str,
		edit_window: Duration,
	) -> Result<WireMessage, StoreError> {
		let now_ms = unix_ms_now();
		let row = self.fetch_message(message_id).await?.ok_or(StoreError::NotFound)?;

		if row.deleted || row.sender_id != Some(actor) {
			return Err(StoreError::Denied);
		}
		if now_ms.saturating_sub(row.created_at) >= edit_window.as_millis() as i64 {
			return Err(StoreError::Denied);
		}

		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET content = ?, edited_at = ? WHERE message_id = ?")
					.bind(new_content)
					.bind(now_ms)
					.bind(message_id.as_i64())
					.execute(pool)
					.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query("UPDATE messages SET content = $1, edited_at = $2 WHERE message_id = $3")
					.bind(new_content)
					.bind(now_ms)
					.bind(message_id.as_i64())
					.execute(pool)
					.await?;
			}
		}

		Ok(WireMessage {
			content: new_content.to_string(),
			edited_at: Some(now_ms),
			..row
		})
	}

	async fn soft_delete(
		&self,
		actor: UserId,
		message_id: MessageId,
		actor_is_moderator: bool,
	) -> Result<WireMessage, StoreError> {
		let now_ms = unix_ms_now();
		let row = self.fetch_message(message_id).await?.ok_or(StoreError::NotFound)?;

		if row.deleted {
			return Err(StoreError::NotFound);
		}
		if row.sender_id != Some(actor) && !actor_is_moderator {
			return Err(StoreError::Denied);
		}

		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted_at = ? WHERE message_id = ?")
					.bind(now_ms)
					.bind(message_id.as_i64())
					.execute(pool)
					.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted_at = $1 WHERE message_id = $2")
					.bind(now_ms)
					.bind(message_id.as_i64())
					.execute(pool)
					.await?;
			}
		}

		Ok(WireMessage {
			content: String::new(),
			attachments: Vec::new(),
			deleted: true,
			..row
		})
	}

	async fn set_read_cursor(&self, user: UserId, room: &RoomId, message_id: MessageId) -> Result<(), StoreError> {
		let now = unix_secs_now();
		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query(
					"UPDATE room_members SET last_read_message_id = ?, updated_at = ? \
					WHERE room_id = ? AND user_id = ? AND last_read_message_id < ?",
				)
				.bind(message_id.as_i64())
				.bind(now)
				.bind(room.as_str())
				.bind(user.as_i64())
				.bind(message_id.as_i64())
				.execute(pool)
				.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query(
					"UPDATE room_members SET last_read_message_id = $1, updated_at = $2 \
					WHERE room_id = $3 AND user_id = $4 AND last_read_message_id < $1",
				)
				.bind(message_id.as_i64())
				.bind(now)
				.bind(room.as_str())
				.bind(user.as_i64())
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}

	async fn unread_counts(&self, user: UserId) -> Result<HashMap<RoomId, i64>, StoreError> {
		let rows: Vec<(String, i64)> = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT rm.room_id, COUNT(m.message_id) FROM room_members rm \
					LEFT JOIN messages m ON m.room_id = rm.room_id \
						AND m.message_id > rm.last_read_message_id AND m.deleted_at IS NULL \
					WHERE rm.user_id = ? GROUP BY rm.room_id",
				)
				.bind(user.as_i64())
				.fetch_all(pool)
				.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as(
					"SELECT rm.room_id, COUNT(m.message_id) FROM room_members rm \
					LEFT JOIN messages m ON m.room_id = rm.room_id \
						AND m.message_id > rm.last_read_message_id AND m.deleted_at IS NULL \
					WHERE rm.user_id = $1 GROUP BY rm.room_id",
				)
				.bind(user.as_i64())
				.fetch_all(pool)
				.await?
			}
		};

		let mut out = HashMap::with_capacity(rows.len());
		for (room, count) in rows {
			out.insert(RoomId::new(room).map_err(|_| StoreError::NotFound)?, count);
		}
		Ok(out)
	}

	async fn insert_report(&self, message_id: MessageId, reporter: UserId, reason: &str) -> Result<i64, StoreError> {
		if self.fetch_message(message_id).await?.is_none() {
			return Err(StoreError::NotFound);
		}

		let now = unix_ms_now();
		let (report_id,): (i64,) = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as(
					"INSERT INTO message_reports (message_id, reporter_id, reason, created_at) \
					VALUES (?, ?, ?, ?) RETURNING report_id",
				)
				.bind(message_id.as_i64())
				.bind(reporter.as_i64())
				.bind(reason)
				.bind(now)
				.fetch_one(pool)
				.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as(
					"INSERT INTO message_reports (message_id, reporter_id, reason, created_at) \
					VALUES ($1, $2, $3, $4) RETURNING report_id",
				)
				.bind(message_id.as_i64())
				.bind(reporter.as_i64())
				.bind(reason)
				.bind(now)
				.fetch_one(pool)
				.await?
			}
		};

		Ok(report_id)
	}

	async fn load_user(&self, user: UserId) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<(i64, String, String, bool)> = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id, username, roles, is_banned FROM users WHERE user_id = ?")
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as("SELECT user_id, username, roles, is_banned FROM users WHERE user_id = $1")
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await?
			}
		};

		let Some((user_id, username, roles, is_banned)) = row else {
			return Ok(None);
		};

		Ok(Some(UserRecord {
			user_id: UserId(user_id),
			username,
			roles: serde_json::from_str(&roles).unwrap_or_default(),
			is_banned,
		}))
	}

	async fn insert_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
		let config = serde_json::to_string(&room.config)?;
		let result = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (room_id, name, kind, creator_id, config, created_at) VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(room.id.as_str())
				.bind(&room.name)
				.bind(room.kind.as_str())
				.bind(room.creator.map(|u| u.as_i64()))
				.bind(&config)
				.bind(room.created_at)
				.execute(pool)
				.await
				.map(|_| ())
			}
			SqlStore::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (room_id, name, kind, creator_id, config, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(room.id.as_str())
				.bind(&room.name)
				.bind(room.kind.as_str())
				.bind(room.creator.map(|u| u.as_i64()))
				.bind(&config)
				.bind(room.created_at)
				.execute(pool)
				.await
				.map(|_| ())
			}
		};

		match result {
			Ok(_) => Ok(()),
			Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict),
			Err(e) => Err(StoreError::Backend(e)),
		}
	}

	async fn load_rooms(&self) -> Result<(Vec<RoomRecord>, Vec<MemberRecord>), StoreError> {
		let room_rows: Vec<(String, String, String, Option<i64>, String, i64)> = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT room_id, name, kind, creator_id, config, created_at FROM rooms WHERE deleted_at IS NULL",
				)
				.fetch_all(pool)
				.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as(
					"SELECT room_id, name, kind, creator_id, config, created_at FROM rooms WHERE deleted_at IS NULL",
				)
				.fetch_all(pool)
				.await?
			}
		};

		let member_rows: Vec<(String, i64, String, i64, i64)> = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT rm.room_id, rm.user_id, rm.role, rm.joined_at, rm.last_read_message_id \
					FROM room_members rm JOIN rooms r ON r.room_id = rm.room_id WHERE r.deleted_at IS NULL",
				)
				.fetch_all(pool)
				.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as(
					"SELECT rm.room_id, rm.user_id, rm.role, rm.joined_at, rm.last_read_message_id \
					FROM room_members rm JOIN rooms r ON r.room_id = rm.room_id WHERE r.deleted_at IS NULL",
				)
				.fetch_all(pool)
				.await?
			}
		};

		let mut rooms = Vec::with_capacity(room_rows.len());
		for (room_id, name, kind, creator, config, created_at) in room_rows {
			rooms.push(RoomRecord {
				id: RoomId::new(room_id).map_err(|_| StoreError::NotFound)?,
				name,
				kind: kind.parse().map_err(|_| StoreError::NotFound)?,
				creator: creator.map(UserId),
				config: serde_json::from_str(&config).unwrap_or_default(),
				created_at,
			});
		}

		let mut members = Vec::with_capacity(member_rows.len());
		for (room_id, user_id, role, joined_at, last_read) in member_rows {
			members.push(MemberRecord {
				room_id: RoomId::new(room_id).map_err(|_| StoreError::NotFound)?,
				user_id: UserId(user_id),
				role: role.parse().map_err(|_| StoreError::NotFound)?,
				joined_at,
				last_read: MessageId(last_read),
			});
		}

		Ok((rooms, members))
	}

	async fn update_room_config(&self, room: &RoomId, config: &RoomConfigBlob) -> Result<(), StoreError> {
		let config = serde_json::to_string(config)?;
		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET config = ? WHERE room_id = ?")
					.bind(&config)
					.bind(room.as_str())
					.execute(pool)
					.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET config = $1 WHERE room_id = $2")
					.bind(&config)
					.bind(room.as_str())
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}

	async fn mark_room_deleted(&self, room: &RoomId) -> Result<(), StoreError> {
		let now = unix_ms_now();
		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET deleted_at = ? WHERE room_id = ?")
					.bind(now)
					.bind(room.as_str())
					.execute(pool)
					.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET deleted_at = $1 WHERE room_id = $2")
					.bind(now)
					.bind(room.as_str())
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}

	async fn upsert_member(&self, member: &MemberRecord) -> Result<(), StoreError> {
		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO room_members (room_id, user_id, role, joined_at, last_read_message_id, updated_at) \
					VALUES (?, ?, ?, ?, ?, 0) \
					ON CONFLICT(room_id, user_id) DO UPDATE SET role = excluded.role",
				)
				.bind(member.room_id.as_str())
				.bind(member.user_id.as_i64())
				.bind(member.role.as_str())
				.bind(member.joined_at)
				.bind(member.last_read.as_i64())
				.execute(pool)
				.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO room_members (room_id, user_id, role, joined_at, last_read_message_id, updated_at) \
					VALUES ($1, $2, $3, $4, $5, 0) \
					ON CONFLICT (room_id, user_id) DO UPDATE SET role = EXCLUDED.role",
				)
				.bind(member.room_id.as_str())
				.bind(member.user_id.as_i64())
				.bind(member.role.as_str())
				.bind(member.joined_at)
				.bind(member.last_read.as_i64())
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}

	async fn remove_member(&self, room: &RoomId, user: UserId) -> Result<(), StoreError> {
		match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
					.bind(room.as_str())
					.bind(user.as_i64())
					.execute(pool)
					.await?;
			}
			SqlStore::Postgres(pool) => {
				sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
					.bind(room.as_str())
					.bind(user.as_i64())
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}
}

impl SqlStore {
	async fn fetch_message(&self, message_id: MessageId) -> Result<Option<WireMessage>, StoreError> {
		let row: Option<MessageRow> = match self {
			SqlStore::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE message_id = ?"))
					.bind(message_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
			SqlStore::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {SELECT_MESSAGE_COLS} FROM messages WHERE message_id = $1"))
					.bind(message_id.as_i64())
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(row_to_message).transpose()
	}
}
