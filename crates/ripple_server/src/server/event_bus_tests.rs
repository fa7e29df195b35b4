#![forbid(unsafe_code)]

use ripple_domain::{MessageId, MessageKind, RoomId, SessionId, Subject, UserId};
use ripple_protocol::{ServerBody, WireMessage};

use crate::server::delivery::{OutboundQueue, QueueItem};
use crate::server::event_bus::EventBus;

fn room_subject(id: &str) -> Subject {
	Subject::room(RoomId::new(id).expect("valid room id"))
}

fn message_body(room: &str, id: i64) -> ServerBody {
	ServerBody::MessageCreated(WireMessage {
		message_id: MessageId(id),
		room_id: RoomId::new(room).expect("valid room id"),
		sender_id: Some(UserId(1)),
		kind: MessageKind::Text,
		content: format!("m{id}"),
		created_at: id,
		edited_at: None,
		deleted: false,
		reply_to: None,
		attachments: Vec::new(),
	})
}

#[tokio::test]
async fn seq_is_monotonic_per_subject() {
	let bus = EventBus::new(None);
	let room_a = room_subject("r:a");
	let room_b = room_subject("r:b");

	assert_eq!(bus.publish(&room_a, message_body("r:a", 1)).await, 1);
	assert_eq!(bus.publish(&room_a, message_body("r:a", 2)).await, 2);
	assert_eq!(bus.publish(&room_b, message_body("r:b", 1)).await, 1);
	assert_eq!(bus.current_seq(&room_a).await, 2);
	assert_eq!(bus.current_seq(&room_b).await, 1);
}

#[tokio::test]
async fn subscriber_receives_events_in_seq_order() {
	let bus = EventBus::new(None);
	let subject = room_subject("r:a");
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(subject.clone(), session, queue.clone()).await;
	for i in 1..=3 {
		bus.publish(&subject, message_body("r:a", i)).await;
	}

	for expect in 1..=3u64 {
		match queue.next().await {
			QueueItem::Frame(frame) => {
				assert_eq!(frame.seq, Some(expect));
				assert_eq!(frame.subject.as_deref(), Some("room:r:a"));
			}
			other => panic!("expected frame, got {other:?}"),
		}
	}
	assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn no_cross_subject_leakage() {
	let bus = EventBus::new(None);
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(room_subject("r:a"), session, queue.clone()).await;
	bus.publish(&room_subject("r:b"), message_body("r:b", 1)).await;

	assert_eq!(queue.len(), 0);

	bus.publish(&room_subject("r:a"), message_body("r:a", 1)).await;
	assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery_but_keeps_seq() {
	let bus = EventBus::new(None);
	let subject = room_subject("r:a");
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(subject.clone(), session, queue.clone()).await;
	bus.publish(&subject, message_body("r:a", 1)).await;
	bus.unsubscribe(&subject, session).await;
	bus.publish(&subject, message_body("r:a", 2)).await;

	assert_eq!(queue.len(), 1);
	// seq advances regardless, so reconnecting clients can detect the gap
	assert_eq!(bus.current_seq(&subject).await, 2);
}

#[tokio::test]
async fn resubscribing_the_same_session_delivers_once() {
	let bus = EventBus::new(None);
	let subject = room_subject("r:a");
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(subject.clone(), session, queue.clone()).await;
	bus.subscribe(subject.clone(), session, queue.clone()).await;
	bus.publish(&subject, message_body("r:a", 1)).await;

	assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn closed_queues_are_pruned_on_publish() {
	let bus = EventBus::new(None);
	let subject = room_subject("r:a");
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(subject.clone(), session, queue.clone()).await;
	assert_eq!(bus.subscriber_count(&subject).await, 1);

	queue.close(crate::server::delivery::CloseReason::ClientClose);
	bus.publish(&subject, message_body("r:a", 1)).await;
	assert_eq!(bus.subscriber_count(&subject).await, 0);
}

#[tokio::test]
async fn unsubscribe_all_clears_every_subject() {
	let bus = EventBus::new(None);
	let session = SessionId::new_v4();
	let queue = OutboundQueue::new(16);

	bus.subscribe(room_subject("r:a"), session, queue.clone()).await;
	bus.subscribe(room_subject("r:b"), session, queue.clone()).await;
	bus.unsubscribe_all(session).await;

	assert_eq!(bus.subscriber_count(&room_subject("r:a")).await, 0);
	assert_eq!(bus.subscriber_count(&room_subject("r:b")).await, 0);
}

#[tokio::test]
async fn external_sink_gets_a_best_effort_copy() {
	let (tx, mut rx) = tokio::sync::mpsc::channel(4);
	let bus = EventBus::new(Some(tx));
	let subject = room_subject("r:a");

	bus.publish(&subject, message_body("r:a", 1)).await;

	let frame = rx.try_recv().expect("sink copy");
	assert_eq!(frame.subject.as_deref(), Some("room:r:a"));
	assert_eq!(frame.seq, Some(1));
}
