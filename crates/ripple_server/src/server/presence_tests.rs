#![forbid(unsafe_code)]

use std::time::Duration;

use ripple_domain::{PresenceStatus, SessionId, UserId};

use crate::server::presence::PresenceIndex;

const LONG_IDLE: Duration = Duration::from_secs(300);

#[test]
fn first_connect_publishes_online_once() {
	let presence = PresenceIndex::new();
	let user = UserId(7);

	let first = presence.on_session_connect(user, SessionId::new_v4());
	assert_eq!(first.map(|u| u.status), Some(PresenceStatus::Online));

	// a second device does not re-announce
	assert!(presence.on_session_connect(user, SessionId::new_v4()).is_none());
}

#[tokio::test]
async fn offline_waits_for_the_grace_window() {
	let presence = PresenceIndex::new();
	let user = UserId(7);
	let session = SessionId::new_v4();

	presence.on_session_connect(user, session);
	presence.on_session_disconnect(user, session, Duration::from_millis(50));

	// inside the grace window nothing is published
	assert!(presence.sweep(LONG_IDLE).is_empty());

	tokio::time::sleep(Duration::from_millis(80)).await;
	let updates = presence.sweep(LONG_IDLE);
	assert_eq!(updates.len(), 1);
	assert_eq!(updates[0].status, PresenceStatus::Offline);
	assert_eq!(updates[0].user_id, user);

	// and only once
	assert!(presence.sweep(LONG_IDLE).is_empty());
}

#[tokio::test]
async fn reconnect_within_grace_suppresses_the_flap() {
	let presence = PresenceIndex::new();
	let user = UserId(7);
	let session = SessionId::new_v4();

	presence.on_session_connect(user, session);
	presence.on_session_disconnect(user, session, Duration::from_millis(60));

	// reconnect inside the window: still published online, so no update
	assert!(presence.on_session_connect(user, SessionId::new_v4()).is_none());

	tokio::time::sleep(Duration::from_millis(90)).await;
	assert!(
		presence.sweep(LONG_IDLE).is_empty(),
		"no presence transition may be published across a tolerated flap"
	);
}

#[test]
fn idle_sessions_go_away_and_frames_bring_them_back() {
	let presence = PresenceIndex::new();
	let user = UserId(7);
	let session = SessionId::new_v4();

	presence.on_session_connect(user, session);

	// zero idle threshold: everything is instantly idle
	let updates = presence.sweep(Duration::ZERO);
	assert_eq!(updates.len(), 1);
	assert_eq!(updates[0].status, PresenceStatus::Away);

	// away is sticky until a client-originated frame arrives
	assert!(presence.sweep(Duration::ZERO).is_empty());

	let back = presence.on_session_frame(user, session);
	assert_eq!(back.map(|u| u.status), Some(PresenceStatus::Online));
}

#[test]
fn one_active_device_keeps_the_user_online() {
	let presence = PresenceIndex::new();
	let user = UserId(7);
	let idle_session = SessionId::new_v4();
	let busy_session = SessionId::new_v4();

	presence.on_session_connect(user, idle_session);
	presence.on_session_connect(user, busy_session);

	std::thread::sleep(Duration::from_millis(30));
	presence.on_session_frame(user, busy_session);

	// idle threshold catches the first session but not the second
	assert!(presence.sweep(Duration::from_millis(20)).is_empty());
}

#[test]
fn snapshot_reports_unknown_users_as_offline() {
	let presence = PresenceIndex::new();
	let known = UserId(1);
	presence.on_session_connect(known, SessionId::new_v4());

	let snapshot = presence.snapshot(&[known, UserId(2)]);
	assert_eq!(snapshot[&known].status, PresenceStatus::Online);
	assert_eq!(snapshot[&UserId(2)].status, PresenceStatus::Offline);
}
