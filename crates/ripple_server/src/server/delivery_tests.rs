#![forbid(unsafe_code)]

use ripple_domain::{MessageId, MessageKind, PresenceStatus, RoomId, UserId};
use ripple_protocol::{PresenceUpdate, ServerBody, ServerFrame, TypingIndicator, WireMessage};

use crate::server::delivery::{CloseReason, OutboundQueue, PushOutcome, QueueItem};

fn room() -> RoomId {
	RoomId::new("r:a").expect("valid room id")
}

fn message_frame(id: i64) -> ServerFrame {
	ServerFrame::event(
		"room:r:a".to_string(),
		id as u64,
		0,
		ServerBody::MessageCreated(WireMessage {
			message_id: MessageId(id),
			room_id: room(),
			sender_id: Some(UserId(1)),
			kind: MessageKind::Text,
			content: format!("m{id}"),
			created_at: id,
			edited_at: None,
			deleted: false,
			reply_to: None,
			attachments: Vec::new(),
		}),
	)
}

fn typing_frame(user: i64, typing: bool) -> ServerFrame {
	ServerFrame::event(
		"room:r:a".to_string(),
		0,
		0,
		ServerBody::TypingIndicator(TypingIndicator {
			room_id: room(),
			user_id: UserId(user),
			typing,
		}),
	)
}

fn presence_frame(user: i64) -> ServerFrame {
	ServerFrame::event(
		format!("user:{user}"),
		0,
		0,
		ServerBody::PresenceUpdate(PresenceUpdate {
			user_id: UserId(user),
			status: PresenceStatus::Online,
			last_seen_at: 0,
		}),
	)
}

#[test]
fn queues_below_capacity() {
	let queue = OutboundQueue::new(4);
	assert_eq!(queue.push(message_frame(1)), PushOutcome::Queued);
	assert_eq!(queue.len(), 1);
}

#[test]
fn at_capacity_typing_coalesces_instead_of_disconnecting() {
	let queue = OutboundQueue::new(2);
	assert_eq!(queue.push(message_frame(1)), PushOutcome::Queued);
	assert_eq!(queue.push(typing_frame(9, true)), PushOutcome::Queued);

	// full, with a typing update for user 9 queued: the newer state replaces it
	assert_eq!(queue.push(typing_frame(9, false)), PushOutcome::Coalesced);
	assert_eq!(queue.len(), 2);
	assert!(!queue.is_closed());
}

#[test]
fn at_capacity_droppable_frames_are_shed_for_essential_ones() {
	let queue = OutboundQueue::new(2);
	queue.push(presence_frame(5));
	queue.push(message_frame(1));

	assert_eq!(queue.push(message_frame(2)), PushOutcome::Dropped);
	assert_eq!(queue.len(), 2);
	assert!(!queue.is_closed());
}

#[test]
fn at_capacity_incoming_droppable_is_shed_when_queue_is_essential() {
	let queue = OutboundQueue::new(2);
	queue.push(message_frame(1));
	queue.push(message_frame(2));

	assert_eq!(queue.push(presence_frame(5)), PushOutcome::Dropped);
	assert_eq!(queue.len(), 2);
	assert!(!queue.is_closed());
}

#[test]
fn overflow_with_only_essential_frames_closes_as_slow_consumer() {
	let queue = OutboundQueue::new(2);
	queue.push(message_frame(1));
	queue.push(message_frame(2));

	assert_eq!(queue.push(message_frame(3)), PushOutcome::Overflow);
	assert!(queue.is_closed());
	assert_eq!(queue.push(message_frame(4)), PushOutcome::Closed);
}

#[tokio::test]
async fn writer_sees_frames_in_push_order() {
	let queue = OutboundQueue::new(8);
	queue.push(message_frame(1));
	queue.push(message_frame(2));

	for expect in [1u64, 2] {
		match queue.next().await {
			QueueItem::Frame(frame) => assert_eq!(frame.seq, Some(expect)),
			other => panic!("expected frame, got {other:?}"),
		}
	}
}

#[tokio::test]
async fn draining_close_flushes_before_closing() {
	let queue = OutboundQueue::new(8);
	queue.push(message_frame(1));
	queue.close(CloseReason::ServerShutdown);

	match queue.next().await {
		QueueItem::Frame(frame) => assert_eq!(frame.seq, Some(1)),
		other => panic!("expected flushed frame, got {other:?}"),
	}
	match queue.next().await {
		QueueItem::Close(reason) => assert_eq!(reason, CloseReason::ServerShutdown),
		other => panic!("expected close, got {other:?}"),
	}
}

#[tokio::test]
async fn slow_consumer_close_discards_queued_frames() {
	let queue = OutboundQueue::new(8);
	queue.push(message_frame(1));
	queue.close(CloseReason::SlowConsumer);

	match queue.next().await {
		QueueItem::Close(reason) => {
			assert_eq!(reason, CloseReason::SlowConsumer);
			assert_eq!(reason.close_code(), 4006);
		}
		other => panic!("expected immediate close, got {other:?}"),
	}
	assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn force_close_overrides_a_draining_close() {
	let queue = OutboundQueue::new(8);
	queue.push(message_frame(1));
	queue.close(CloseReason::ServerShutdown);

	// the drain window elapsed: queued frames are abandoned and the writer
	// sees the escalated reason immediately
	queue.force_close(CloseReason::ShutdownTimeout);
	match queue.next().await {
		QueueItem::Close(reason) => assert_eq!(reason, CloseReason::ShutdownTimeout),
		other => panic!("expected escalated close, got {other:?}"),
	}
	assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn force_close_keeps_an_existing_non_draining_reason() {
	let queue = OutboundQueue::new(8);
	queue.close(CloseReason::SlowConsumer);
	queue.force_close(CloseReason::ShutdownTimeout);

	match queue.next().await {
		QueueItem::Close(reason) => assert_eq!(reason, CloseReason::SlowConsumer),
		other => panic!("expected original close, got {other:?}"),
	}
}

#[test]
fn first_close_reason_wins() {
	let queue = OutboundQueue::new(2);
	queue.close(CloseReason::HeartbeatTimeout);
	queue.close(CloseReason::SlowConsumer);
	assert!(queue.is_closed());

	// the queue reports the original reason to the writer
	let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
	match rt.block_on(queue.next()) {
		QueueItem::Close(reason) => assert_eq!(reason, CloseReason::HeartbeatTimeout),
		other => panic!("expected close, got {other:?}"),
	}
}
