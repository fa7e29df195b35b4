#![forbid(unsafe_code)]

pub mod frames;

use thiserror::Error;

pub use frames::{
	Attachment, ClientFrame, Command, DeleteMessage, EditMessage, ErrorPayload, History, JoinAck, LeaveAck,
	MemberChange, MemberKicked, MessageDeleted, ModerationAction, Pong, PresenceUpdate, ReadAck, ReadReceipt,
	ReportAck, RoomSpec, RoomSummary, RoomSync, RoomsList, SendAck, ServerBody, ServerFrame, TypingIndicator,
	UpdateRoom, Welcome, WireMessage,
};

/// Default upper bound on a single inbound frame, in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

/// WebSocket close codes used by the hub.
pub mod close {
	pub const INVALID_TOKEN: u16 = 4001;
	pub const TOKEN_EXPIRED: u16 = 4002;
	pub const BANNED: u16 = 4003;
	pub const RATE_LIMITED_CONNECT: u16 = 4004;
	pub const HANDSHAKE_TIMEOUT: u16 = 4005;
	pub const SLOW_CONSUMER: u16 = 4006;
	pub const DUPLICATE_SESSION: u16 = 4007;
	pub const SERVER_ERROR: u16 = 1011;
}

/// Failures decoding an inbound client frame.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame is missing a string \"type\" field")]
	MissingType,

	#[error("unknown frame type: {0}")]
	UnknownType(String),

	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// Decode one inbound client frame from UTF-8 JSON text.
///
/// Unknown `type` values are reported as [`DecodeError::UnknownType`] so the
/// session can answer with a protocol error instead of dropping the link.
pub fn decode_client_frame(text: &str, max_frame_bytes: usize) -> Result<ClientFrame, DecodeError> {
	if text.len() > max_frame_bytes {
		return Err(DecodeError::FrameTooLarge {
			len: text.len(),
			max: max_frame_bytes,
		});
	}

	let value: serde_json::Value = serde_json::from_str(text)?;
	let kind = value
		.get("type")
		.and_then(|t| t.as_str())
		.ok_or(DecodeError::MissingType)?
		.to_string();

	match serde_json::from_value::<ClientFrame>(value) {
		Ok(frame) => Ok(frame),
		Err(e) => {
			if !Command::KINDS.contains(&kind.as_str()) {
				Err(DecodeError::UnknownType(kind))
			} else {
				Err(DecodeError::Malformed(e))
			}
		}
	}
}

/// Encode a server frame as UTF-8 JSON text.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, serde_json::Error> {
	serde_json::to_string(frame)
}
