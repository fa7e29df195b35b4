use proptest::prelude::*;
use ripple_domain::{MessageId, MessageKind, RoomId, UserId};
use ripple_protocol::{
	Command, DEFAULT_MAX_FRAME_BYTES, DecodeError, ErrorPayload, ServerBody, ServerFrame, WireMessage,
	decode_client_frame, encode_server_frame,
};

#[test]
fn decodes_send_message() {
	let text = r#"{
		"type": "send_message",
		"id": "c-17",
		"ts": 1700000000000,
		"data": { "room_id": "r:abc", "content": "hi", "reply_to": 12 }
	}"#;

	let frame = decode_client_frame(text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
	assert_eq!(frame.id.as_deref(), Some("c-17"));
	match frame.command {
		Command::SendMessage(m) => {
			assert_eq!(m.room_id.as_str(), "r:abc");
			assert_eq!(m.content, "hi");
			assert_eq!(m.reply_to, Some(MessageId(12)));
			assert!(m.attachments.is_empty());
		}
		other => panic!("expected send_message, got {other:?}"),
	}
}

#[test]
fn decodes_bare_ping() {
	let frame = decode_client_frame(r#"{"type":"ping"}"#, DEFAULT_MAX_FRAME_BYTES).expect("decode");
	assert!(matches!(frame.command, Command::Ping));
	assert!(frame.id.is_none());
}

#[test]
fn unknown_type_is_a_typed_error() {
	let err = decode_client_frame(r#"{"type":"teleport","data":{}}"#, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
	match err {
		DecodeError::UnknownType(kind) => assert_eq!(kind, "teleport"),
		other => panic!("expected UnknownType, got {other:?}"),
	}
}

#[test]
fn missing_type_is_rejected() {
	let err = decode_client_frame(r#"{"id":"x","data":{}}"#, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
	assert!(matches!(err, DecodeError::MissingType));
}

#[test]
fn known_type_with_bad_payload_is_malformed() {
	let err = decode_client_frame(r#"{"type":"send_message","data":{"content":"hi"}}"#, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
	assert!(matches!(err, DecodeError::Malformed(_)));
}

#[test]
fn oversize_frame_is_rejected_before_parsing() {
	let padding = "x".repeat(DEFAULT_MAX_FRAME_BYTES);
	let text = format!(r#"{{"type":"ping","data":"{padding}"}}"#);

	let err = decode_client_frame(&text, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
	match err {
		DecodeError::FrameTooLarge { len, max } => {
			assert!(len > max);
			assert_eq!(max, DEFAULT_MAX_FRAME_BYTES);
		}
		other => panic!("expected FrameTooLarge, got {other:?}"),
	}
}

#[test]
fn event_frame_carries_subject_and_seq() {
	let message = WireMessage {
		message_id: MessageId(58201),
		room_id: RoomId::new("r:42").unwrap(),
		sender_id: Some(UserId(7)),
		kind: MessageKind::Text,
		content: "hi".to_string(),
		created_at: 1_700_000_000_000,
		edited_at: None,
		deleted: false,
		reply_to: None,
		attachments: Vec::new(),
	};

	let frame = ServerFrame::event("room:r:42".to_string(), 10817, 1_700_000_000_000, ServerBody::MessageCreated(message));
	let json = encode_server_frame(&frame).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	assert_eq!(value["type"], "message_created");
	assert_eq!(value["subject"], "room:r:42");
	assert_eq!(value["seq"], 10817);
	assert_eq!(value["data"]["message_id"], 58201);
	assert_eq!(value["data"]["sender_id"], 7);
	assert_eq!(value["data"]["room_id"], "r:42");
}

#[test]
fn ack_frame_echoes_client_id_and_omits_subject() {
	let frame = ServerFrame::ack(Some("c-3".to_string()), 1, ServerBody::Ok);
	let json = encode_server_frame(&frame).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	assert_eq!(value["type"], "ok");
	assert_eq!(value["id"], "c-3");
	assert!(value.get("subject").is_none());
	assert!(value.get("seq").is_none());
}

#[test]
fn error_payload_shape_matches_kind_tagging() {
	let frame = ServerFrame::ack(
		None,
		1,
		ServerBody::Error(ErrorPayload::RateLimited {
			action: "send_message".to_string(),
			retry_after_secs: 3,
		}),
	);
	let json = encode_server_frame(&frame).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	assert_eq!(value["type"], "error");
	assert_eq!(value["data"]["kind"], "rate_limited");
	assert_eq!(value["data"]["action"], "send_message");
	assert_eq!(value["data"]["retry_after_secs"], 3);
}

#[test]
fn system_message_serializes_null_sender() {
	let message = WireMessage {
		message_id: MessageId(1),
		room_id: RoomId::new("r:1").unwrap(),
		sender_id: None,
		kind: MessageKind::SystemJoin,
		content: "alice joined".to_string(),
		created_at: 5,
		edited_at: None,
		deleted: false,
		reply_to: None,
		attachments: Vec::new(),
	};

	let json = serde_json::to_value(&message).expect("encode");
	assert!(json["sender_id"].is_null());
	assert_eq!(json["kind"], "system_join");
}

proptest! {
	#[test]
	fn message_content_survives_the_wire(content in "\\PC{0,200}", room in "[a-z0-9]{1,16}") {
		let text = serde_json::json!({
			"type": "send_message",
			"id": "p",
			"data": { "room_id": format!("r:{room}"), "content": content }
		})
		.to_string();

		let frame = decode_client_frame(&text, DEFAULT_MAX_FRAME_BYTES).unwrap();
		match frame.command {
			Command::SendMessage(m) => prop_assert_eq!(m.content, content),
			other => prop_assert!(false, "unexpected command {:?}", other),
		}
	}
}
