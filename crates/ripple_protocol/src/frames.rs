#![forbid(unsafe_code)]

use ripple_domain::{MemberRole, MessageId, MessageKind, PresenceStatus, RoomId, RoomKind, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// One inbound client frame: `{ "type": ..., "id": ..., "ts": ..., "data": ... }`.
///
/// `id` is an opaque client token echoed on the matching acknowledgement.
/// `ts` is advisory; the server re-stamps on persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ts: Option<i64>,

	#[serde(flatten)]
	pub command: Command,
}

/// The closed set of client commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
	Auth(Auth),
	SendMessage(SendMessage),
	SendDirect(SendDirect),
	JoinRoom(JoinRoom),
	LeaveRoom(LeaveRoom),
	CreateRoom(RoomSpec),
	InviteUser(InviteUser),
	KickUser(KickUser),
	EditMessage(EditMessage),
	DeleteMessage(DeleteMessage),
	UpdateRoom(UpdateRoom),
	TypingStart(TypingTarget),
	TypingStop(TypingTarget),
	MarkRead(MarkRead),
	FetchHistory(FetchHistory),
	ListRooms(ListRooms),
	ReportMessage(ReportMessage),
	Ping,
}

impl Command {
	/// Wire names of every recognized command, in dispatch order.
	pub const KINDS: &'static [&'static str] = &[
		"auth",
		"send_message",
		"send_direct",
		"join_room",
		"leave_room",
		"create_room",
		"invite_user",
		"kick_user",
		"edit_message",
		"delete_message",
		"update_room",
		"typing_start",
		"typing_stop",
		"mark_read",
		"fetch_history",
		"list_rooms",
		"report_message",
		"ping",
	];

	/// Wire name of this command, used in logs and metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			Command::Auth(_) => "auth",
			Command::SendMessage(_) => "send_message",
			Command::SendDirect(_) => "send_direct",
			Command::JoinRoom(_) => "join_room",
			Command::LeaveRoom(_) => "leave_room",
			Command::CreateRoom(_) => "create_room",
			Command::InviteUser(_) => "invite_user",
			Command::KickUser(_) => "kick_user",
			Command::EditMessage(_) => "edit_message",
			Command::DeleteMessage(_) => "delete_message",
			Command::UpdateRoom(_) => "update_room",
			Command::TypingStart(_) => "typing_start",
			Command::TypingStop(_) => "typing_stop",
			Command::MarkRead(_) => "mark_read",
			Command::FetchHistory(_) => "fetch_history",
			Command::ListRooms(_) => "list_rooms",
			Command::ReportMessage(_) => "report_message",
			Command::Ping => "ping",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
	pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
	pub room_id: RoomId,
	pub content: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDirect {
	pub to_user_id: UserId,
	pub content: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoom {
	pub room_id: RoomId,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRoom {
	pub room_id: RoomId,
}

/// Client-supplied room creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSpec {
	pub name: String,
	pub kind: RoomKind,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub password: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_members: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteUser {
	pub room_id: RoomId,
	pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickUser {
	pub room_id: RoomId,
	pub user_id: UserId,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessage {
	pub message_id: MessageId,
	pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessage {
	pub message_id: MessageId,
}

/// Partial room-configuration update. Absent fields are left unchanged;
/// `password: Some(None)` clears the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRoom {
	pub room_id: RoomId,

	#[serde(default, skip_serializing_if = "Option::is_none", with = "serde_double_option")]
	pub password: Option<Option<String>>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_members: Option<usize>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub banned_tokens: Option<Vec<String>>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub block: Vec<UserId>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub unblock: Vec<UserId>,
}

/// Distinguishes "field absent" from "field explicitly null".
mod serde_double_option {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
	where
		T: Serialize,
		S: Serializer,
	{
		match value {
			Some(inner) => inner.serialize(serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
	where
		T: Deserialize<'de>,
		D: Deserializer<'de>,
	{
		Ok(Some(Option::<T>::deserialize(deserializer)?))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingTarget {
	pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkRead {
	pub room_id: RoomId,
	pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchHistory {
	pub room_id: RoomId,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub before: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub after: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRooms {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMessage {
	pub message_id: MessageId,
	pub reason: String,
}

/// Attachment descriptor. Validation of the referenced object is the upload
/// service's responsibility; the hub only records the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
	pub url: String,
	pub mime: String,
	pub size_bytes: u64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,
}

/// One outbound server frame. Events additionally carry `subject` and `seq`;
/// acknowledgements echo the client frame `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,

	pub ts: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subject: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seq: Option<u64>,

	#[serde(flatten)]
	pub body: ServerBody,
}

impl ServerFrame {
	/// Acknowledgement frame echoing a client id.
	pub fn ack(id: Option<String>, ts: i64, body: ServerBody) -> Self {
		Self {
			id,
			ts,
			subject: None,
			seq: None,
			body,
		}
	}

	/// Event frame with subject/seq assigned by the event bus.
	pub fn event(subject: String, seq: u64, ts: i64, body: ServerBody) -> Self {
		Self {
			id: None,
			ts,
			subject: Some(subject),
			seq: Some(seq),
			body,
		}
	}
}

/// The closed set of server frame bodies: acks, in-band responses and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerBody {
	Welcome(Welcome),
	Pong(Pong),
	Ok,
	SendAck(SendAck),
	CreateAck(RoomSummary),
	JoinAck(JoinAck),
	LeaveAck(LeaveAck),
	ReadAck(ReadAck),
	ReportAck(ReportAck),
	History(History),
	RoomsList(RoomsList),
	Error(ErrorPayload),

	MessageCreated(WireMessage),
	MessageEdited(WireMessage),
	MessageDeleted(MessageDeleted),
	RoomCreated(RoomSummary),
	RoomUpdated(RoomSummary),
	MemberJoined(MemberChange),
	MemberLeft(MemberChange),
	MemberKicked(MemberKicked),
	TypingIndicator(TypingIndicator),
	PresenceUpdate(PresenceUpdate),
	ReadReceipt(ReadReceipt),
	ModerationAction(ModerationAction),
}

impl ServerBody {
	/// Frames that may be shed under outbound-queue pressure.
	pub const fn is_droppable(&self) -> bool {
		matches!(self, ServerBody::TypingIndicator(_) | ServerBody::PresenceUpdate(_))
	}

	/// Coalescing key for typing updates: newer state replaces older for the
	/// same `(room, user)` pair.
	pub fn typing_key(&self) -> Option<(&RoomId, UserId)> {
		match self {
			ServerBody::TypingIndicator(t) => Some((&t.room_id, t.user_id)),
			_ => None,
		}
	}

	/// Wire name, used in logs and metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			ServerBody::Welcome(_) => "welcome",
			ServerBody::Pong(_) => "pong",
			ServerBody::Ok => "ok",
			ServerBody::SendAck(_) => "send_ack",
			ServerBody::CreateAck(_) => "create_ack",
			ServerBody::JoinAck(_) => "join_ack",
			ServerBody::LeaveAck(_) => "leave_ack",
			ServerBody::ReadAck(_) => "read_ack",
			ServerBody::ReportAck(_) => "report_ack",
			ServerBody::History(_) => "history",
			ServerBody::RoomsList(_) => "rooms_list",
			ServerBody::Error(_) => "error",
			ServerBody::MessageCreated(_) => "message_created",
			ServerBody::MessageEdited(_) => "message_edited",
			ServerBody::MessageDeleted(_) => "message_deleted",
			ServerBody::RoomCreated(_) => "room_created",
			ServerBody::RoomUpdated(_) => "room_updated",
			ServerBody::MemberJoined(_) => "member_joined",
			ServerBody::MemberLeft(_) => "member_left",
			ServerBody::MemberKicked(_) => "member_kicked",
			ServerBody::TypingIndicator(_) => "typing_indicator",
			ServerBody::PresenceUpdate(_) => "presence_update",
			ServerBody::ReadReceipt(_) => "read_receipt",
			ServerBody::ModerationAction(_) => "moderation_action",
		}
	}
}

/// Sent once after successful authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
	pub server: String,
	pub session_id: SessionId,
	pub user_id: UserId,
	pub heartbeat_interval_ms: u64,
	pub max_frame_bytes: usize,

	/// The caller's rooms with unread counts, for initial sync.
	pub rooms: Vec<RoomSync>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSync {
	pub room: RoomSummary,
	pub unread: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
	pub client_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
	pub message: WireMessage,

	/// True when an idempotent retry matched a previously persisted send.
	#[serde(default)]
	pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
	pub room_id: RoomId,
	pub name: String,
	pub kind: RoomKind,
	pub member_count: usize,
	pub max_members: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAck {
	pub room: RoomSummary,
	pub role: MemberRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveAck {
	pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAck {
	pub room_id: RoomId,
	pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
	pub report_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
	pub room_id: RoomId,
	pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsList {
	pub rooms: Vec<RoomSummary>,
}

/// A message as delivered on the wire. System messages have no sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
	pub message_id: MessageId,
	pub room_id: RoomId,
	pub sender_id: Option<UserId>,
	pub kind: MessageKind,
	pub content: String,
	pub created_at: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edited_at: Option<i64>,

	#[serde(default)]
	pub deleted: bool,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeleted {
	pub room_id: RoomId,
	pub message_id: MessageId,
	pub deleted_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberChange {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub username: String,
	pub role: MemberRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberKicked {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub kicked_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
	pub user_id: UserId,
	pub status: PresenceStatus,
	pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationAction {
	pub room_id: RoomId,
	pub action: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_user_id: Option<UserId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
}

/// Typed command failures surfaced to the client, matched by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorPayload {
	AuthFailed {
		message: String,
	},
	RateLimited {
		action: String,
		retry_after_secs: u64,
	},
	ValidationFailed {
		field: String,
		message: String,
	},
	NotFound {
		resource: String,
	},
	Forbidden {
		reason: String,
	},
	Conflict {
		reason: String,
	},
	ModerationRejected {
		reason: String,
	},
	SendFailed {
		retryable: bool,
		reason: String,
	},
	ServerError {
		message: String,
	},
}
