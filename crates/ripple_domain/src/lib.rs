#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Stable numeric user identifier, owned by the account service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<i64>()
			.map(UserId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer user id, got {s:?}")))
	}
}

/// Store-assigned message identifier. Globally unique, strictly increasing per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Server-assigned identifier for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	/// Fresh random session id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Opaque room identifier.
///
/// Registry-created rooms use `r:<uuid>`; direct rooms use the deterministic
/// `direct:<hash>` form from [`RoomId::direct`]. Always a JSON string on the
/// wire. Lock-ordering for cross-room operations is lexicographic over the
/// id text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Prefix carried by every deterministically derived two-party room id.
pub const DIRECT_ROOM_PREFIX: &str = "direct:";

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh registry room id.
	pub fn generate() -> Self {
		Self(format!("r:{}", uuid::Uuid::new_v4().simple()))
	}

	/// Deterministic id for the direct room of an unordered user pair.
	///
	/// `direct(a, b) == direct(b, a)` for all pairs.
	pub fn direct(a: UserId, b: UserId) -> Self {
		let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
		let digest = Sha256::digest(format!("{}:{}", lo.0, hi.0).as_bytes());
		let mut hex = String::with_capacity(DIRECT_ROOM_PREFIX.len() + 32);
		hex.push_str(DIRECT_ROOM_PREFIX);
		for byte in digest.iter().take(16) {
			hex.push_str(&format!("{byte:02x}"));
		}
		Self(hex)
	}

	pub fn is_direct(&self) -> bool {
		self.0.starts_with(DIRECT_ROOM_PREFIX)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Room visibility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
	Public,
	Private,
	Direct,
}

impl RoomKind {
	/// Stable string identifier, used on the wire and in storage.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomKind::Public => "public",
			RoomKind::Private => "private",
			RoomKind::Direct => "direct",
		}
	}
}

impl fmt::Display for RoomKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"public" => Ok(RoomKind::Public),
			"private" => Ok(RoomKind::Private),
			"direct" => Ok(RoomKind::Direct),
			other => Err(ParseIdError::InvalidFormat(format!("unknown room kind: {other}"))),
		}
	}
}

/// Role of a user inside one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
	Member,
	Moderator,
	Owner,
}

impl MemberRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			MemberRole::Member => "member",
			MemberRole::Moderator => "moderator",
			MemberRole::Owner => "owner",
		}
	}

	/// Whether this role may moderate the room (kick, delete, config).
	pub const fn can_moderate(self) -> bool {
		matches!(self, MemberRole::Moderator | MemberRole::Owner)
	}
}

impl fmt::Display for MemberRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MemberRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"member" => Ok(MemberRole::Member),
			"moderator" => Ok(MemberRole::Moderator),
			"owner" => Ok(MemberRole::Owner),
			other => Err(ParseIdError::InvalidFormat(format!("unknown member role: {other}"))),
		}
	}
}

/// Kind of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	SystemJoin,
	SystemLeave,
	SystemModAction,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::SystemJoin => "system_join",
			MessageKind::SystemLeave => "system_leave",
			MessageKind::SystemModAction => "system_mod_action",
		}
	}

	/// System messages carry no sender.
	pub const fn is_system(self) -> bool {
		!matches!(self, MessageKind::Text)
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"text" => Ok(MessageKind::Text),
			"system_join" => Ok(MessageKind::SystemJoin),
			"system_leave" => Ok(MessageKind::SystemLeave),
			"system_mod_action" => Ok(MessageKind::SystemModAction),
			other => Err(ParseIdError::InvalidFormat(format!("unknown message kind: {other}"))),
		}
	}
}

/// User-level presence derived over all live sessions of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
	Online,
	Away,
	Offline,
}

impl PresenceStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			PresenceStatus::Online => "online",
			PresenceStatus::Away => "away",
			PresenceStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for PresenceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An event-bus topic: `room:<id>` or `user:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Subject {
	Room(RoomId),
	User(UserId),
}

impl Subject {
	const ROOM_PREFIX: &'static str = "room:";
	const USER_PREFIX: &'static str = "user:";

	pub fn room(id: RoomId) -> Self {
		Subject::Room(id)
	}

	pub fn user(id: UserId) -> Self {
		Subject::User(id)
	}

	/// Parse `room:<id>` / `user:<id>`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::ROOM_PREFIX) {
			return Ok(Subject::Room(RoomId::new(rest.to_string())?));
		}
		if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
			return Ok(Subject::User(rest.parse()?));
		}

		Err(ParseIdError::InvalidFormat("expected room:<id> or user:<id>".into()))
	}
}

impl fmt::Display for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Subject::Room(id) => write!(f, "{}{}", Self::ROOM_PREFIX, id),
			Subject::User(id) => write!(f, "{}{}", Self::USER_PREFIX, id),
		}
	}
}

impl FromStr for Subject {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Subject::parse(s)
	}
}

impl From<Subject> for String {
	fn from(s: Subject) -> String {
		s.to_string()
	}
}

impl TryFrom<String> for Subject {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		Subject::parse(&s)
	}
}

/// Room-name validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomNameError {
	#[error("room name must be 3-50 characters, got {0}")]
	BadLength(usize),
	#[error("room name may only contain a-z, 0-9, '-' and '_'")]
	BadCharacter,
}

/// Validate and canonicalize a room name: lowercase, 3-50 chars of `[a-z0-9-_]`.
pub fn validate_room_name(name: &str) -> Result<String, RoomNameError> {
	let name = name.trim().to_lowercase();
	let len = name.chars().count();
	if !(3..=50).contains(&len) {
		return Err(RoomNameError::BadLength(len));
	}
	if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
		return Err(RoomNameError::BadCharacter);
	}
	Ok(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_and_display() {
		assert_eq!("42".parse::<UserId>().unwrap(), UserId(42));
		assert_eq!(UserId(7).to_string(), "7");
		assert!("seven".parse::<UserId>().is_err());
	}

	#[test]
	fn direct_room_id_is_order_independent() {
		let a = UserId(7);
		let b = UserId(9);
		assert_eq!(RoomId::direct(a, b), RoomId::direct(b, a));
		assert!(RoomId::direct(a, b).is_direct());
	}

	#[test]
	fn direct_room_id_distinguishes_pairs() {
		assert_ne!(RoomId::direct(UserId(1), UserId(2)), RoomId::direct(UserId(1), UserId(3)));
	}

	#[test]
	fn subject_parse_roundtrip() {
		let s = Subject::parse("room:r:abc").unwrap();
		assert_eq!(s, Subject::Room(RoomId::new("r:abc").unwrap()));
		assert_eq!(s.to_string(), "room:r:abc");

		let u = Subject::parse("user:9").unwrap();
		assert_eq!(u, Subject::User(UserId(9)));
		assert_eq!(u.to_string(), "user:9");
	}

	#[test]
	fn subject_rejects_garbage() {
		assert!(Subject::parse("").is_err());
		assert!(Subject::parse("channel:3").is_err());
		assert!(Subject::parse("user:bob").is_err());
	}

	#[test]
	fn room_name_rules() {
		assert_eq!(validate_room_name("General-Chat").unwrap(), "general-chat");
		assert_eq!(validate_room_name("abc").unwrap(), "abc");
		assert!(matches!(validate_room_name("ab"), Err(RoomNameError::BadLength(2))));
		assert!(matches!(validate_room_name(&"x".repeat(51)), Err(RoomNameError::BadLength(51))));
		assert!(matches!(validate_room_name("no spaces"), Err(RoomNameError::BadCharacter)));
	}

	#[test]
	fn kinds_roundtrip_storage_form() {
		for kind in [MessageKind::Text, MessageKind::SystemJoin, MessageKind::SystemLeave, MessageKind::SystemModAction] {
			assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
		}
		for kind in [RoomKind::Public, RoomKind::Private, RoomKind::Direct] {
			assert_eq!(kind.as_str().parse::<RoomKind>().unwrap(), kind);
		}
		for role in [MemberRole::Member, MemberRole::Moderator, MemberRole::Owner] {
			assert_eq!(role.as_str().parse::<MemberRole>().unwrap(), role);
		}
	}
}
