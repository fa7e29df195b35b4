#![forbid(unsafe_code)]

use std::time::Duration;

use ripple_domain::{MemberRole, MessageId, MessageKind, RoomId, UserId};

use crate::server::store::{MemberRecord, MessageStore, NewMessage, SqlStore, StoreError};

const WINDOW: Duration = Duration::from_secs(60);

async fn store() -> SqlStore {
	SqlStore::connect("sqlite::memory:").await.expect("in-memory store")
}

fn draft(room: &RoomId, sender: i64, content: &str, client_id: Option<&str>) -> NewMessage {
	NewMessage {
		room_id: room.clone(),
		sender_id: Some(UserId(sender)),
		kind: MessageKind::Text,
		content: content.to_string(),
		reply_to: None,
		attachments: Vec::new(),
		client_id: client_id.map(|s| s.to_string()),
	}
}

#[tokio::test]
async fn append_assigns_increasing_ids_and_timestamps() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();

	let mut last_id = 0;
	let mut last_ts = 0;
	for i in 0..5 {
		let outcome = store.append(draft(&room, 1, &format!("m{i}"), None), WINDOW).await.expect("append");
		assert!(outcome.message.message_id.as_i64() > last_id);
		assert!(outcome.message.created_at > last_ts);
		last_id = outcome.message.message_id.as_i64();
		last_ts = outcome.message.created_at;
	}
}

#[tokio::test]
async fn duplicate_client_id_returns_the_original_message() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();

	let first = store.append(draft(&room, 7, "hi", Some("c-1")), WINDOW).await.expect("append");
	assert!(!first.duplicate);

	let retry = store.append(draft(&room, 7, "hi", Some("c-1")), WINDOW).await.expect("retry");
	assert!(retry.duplicate);
	assert_eq!(retry.message.message_id, first.message.message_id);

	// exactly one message persisted
	let listed = store.list(&room, None, None, 100).await.expect("list");
	assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn same_client_id_from_another_sender_is_a_fresh_message() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();

	let a = store.append(draft(&room, 1, "from a", Some("c-1")), WINDOW).await.expect("append");
	let b = store.append(draft(&room, 2, "from b", Some("c-1")), WINDOW).await.expect("append");
	assert_ne!(a.message.message_id, b.message.message_id);
}

#[tokio::test]
async fn list_pages_in_ascending_order() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();

	let mut ids = Vec::new();
	for i in 0..10 {
		let outcome = store.append(draft(&room, 1, &format!("m{i}"), None), WINDOW).await.expect("append");
		ids.push(outcome.message.message_id);
	}

	let tail = store.list(&room, None, None, 4).await.expect("tail");
	let tail_ids: Vec<MessageId> = tail.iter().map(|m| m.message_id).collect();
	assert_eq!(tail_ids, ids[6..].to_vec());

	let older = store.list(&room, Some(ids[6]), None, 4).await.expect("before page");
	let older_ids: Vec<MessageId> = older.iter().map(|m| m.message_id).collect();
	assert_eq!(older_ids, ids[2..6].to_vec());

	let newer = store.list(&room, None, Some(ids[6]), 100).await.expect("after page");
	let newer_ids: Vec<MessageId> = newer.iter().map(|m| m.message_id).collect();
	assert_eq!(newer_ids, ids[7..].to_vec());
}

#[tokio::test]
async fn list_is_scoped_to_the_room() {
	let store = store().await;
	let room_a = RoomId::new("r:a").unwrap();
	let room_b = RoomId::new("r:b").unwrap();

	store.append(draft(&room_a, 1, "a", None), WINDOW).await.expect("append");
	store.append(draft(&room_b, 1, "b", None), WINDOW).await.expect("append");

	let listed = store.list(&room_a, None, None, 100).await.expect("list");
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].content, "a");
}

#[tokio::test]
async fn edit_is_sender_only_and_window_bound() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();
	let sent = store.append(draft(&room, 7, "original", None), WINDOW).await.expect("append");
	let id = sent.message.message_id;

	// another user cannot edit
	assert!(matches!(
		store.edit(UserId(8), id, "hijacked", Duration::from_secs(900)).await,
		Err(StoreError::Denied)
	));

	// an expired window denies the sender too
	assert!(matches!(
		store.edit(UserId(7), id, "too late", Duration::ZERO).await,
		Err(StoreError::Denied)
	));

	let edited = store.edit(UserId(7), id, "fixed", Duration::from_secs(900)).await.expect("edit");
	assert_eq!(edited.content, "fixed");
	assert!(edited.edited_at.is_some());

	let listed = store.list(&room, None, None, 10).await.expect("list");
	assert_eq!(listed[0].content, "fixed");
}

#[tokio::test]
async fn soft_delete_redacts_but_keeps_the_row() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();
	let sent = store.append(draft(&room, 7, "secret", None), WINDOW).await.expect("append");
	let id = sent.message.message_id;

	// a random user may not delete
	assert!(matches!(store.soft_delete(UserId(8), id, false).await, Err(StoreError::Denied)));

	// a moderator may
	let deleted = store.soft_delete(UserId(8), id, true).await.expect("delete");
	assert!(deleted.deleted);
	assert!(deleted.content.is_empty());

	// deleting twice reports the message gone
	assert!(matches!(store.soft_delete(UserId(7), id, false).await, Err(StoreError::NotFound)));

	// the row survives in history, redacted
	let listed = store.list(&room, None, None, 10).await.expect("list");
	assert_eq!(listed.len(), 1);
	assert!(listed[0].deleted);
	assert!(listed[0].content.is_empty());
}

#[tokio::test]
async fn read_cursor_is_monotonic_and_idempotent() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();
	let user = UserId(7);

	store
		.upsert_member(&MemberRecord {
			room_id: room.clone(),
			user_id: user,
			role: MemberRole::Member,
			joined_at: 0,
			last_read: MessageId(0),
		})
		.await
		.expect("member");

	for i in 0..5 {
		store.append(draft(&room, 1, &format!("m{i}"), None), WINDOW).await.expect("append");
	}
	let listed = store.list(&room, None, None, 10).await.expect("list");
	let third = listed[2].message_id;

	store.set_read_cursor(user, &room, third).await.expect("mark read");
	let unread = store.unread_counts(user).await.expect("unread");
	assert_eq!(unread[&room], 2);

	// repeating is a no-op
	store.set_read_cursor(user, &room, third).await.expect("mark read again");
	assert_eq!(store.unread_counts(user).await.expect("unread")[&room], 2);

	// rewinding is ignored
	store.set_read_cursor(user, &room, listed[0].message_id).await.expect("rewind");
	assert_eq!(store.unread_counts(user).await.expect("unread")[&room], 2);
}

#[tokio::test]
async fn reports_require_an_existing_message() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();
	let sent = store.append(draft(&room, 1, "spam", None), WINDOW).await.expect("append");

	let report_id = store.insert_report(sent.message.message_id, UserId(2), "spam").await.expect("report");
	assert!(report_id > 0);

	assert!(matches!(
		store.insert_report(MessageId(9999), UserId(2), "ghost").await,
		Err(StoreError::NotFound)
	));
}

#[tokio::test]
async fn system_messages_have_no_sender() {
	let store = store().await;
	let room = RoomId::new("r:a").unwrap();

	let outcome = store
		.append(
			NewMessage {
				room_id: room.clone(),
				sender_id: None,
				kind: MessageKind::SystemJoin,
				content: "alice joined".to_string(),
				reply_to: None,
				attachments: Vec::new(),
				client_id: None,
			},
			WINDOW,
		)
		.await
		.expect("append");

	assert!(outcome.message.sender_id.is_none());
	assert_eq!(outcome.message.kind, MessageKind::SystemJoin);
}
