#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ripple_domain::{MemberRole, MessageKind, RoomId, SessionId, Subject, UserId};
use ripple_protocol::{
	Attachment, ClientFrame, Command, DecodeError, ErrorPayload, History, JoinAck, LeaveAck, MemberChange,
	MemberKicked, MessageDeleted, ModerationAction, Pong, ReadAck, ReadReceipt, ReportAck, RoomSync, RoomsList,
	SendAck, ServerBody, ServerFrame, TypingIndicator, Welcome, close, decode_client_frame, encode_server_frame,
};
use tracing::{debug, info, warn};

use crate::server::auth::AuthError;
use crate::server::delivery::{CloseReason, OutboundQueue, QueueItem};
use crate::server::hub::{Hub, SessionHandle};
use crate::server::moderation::{SenderContext, Verdict};
use crate::server::rate_limit::{Action, LimitSubject};
use crate::server::rooms::{Room, RoomError, RoomPatch};
use crate::server::store::{HISTORY_PAGE_LIMIT, NewMessage, StoreError};
use crate::util::time::unix_ms_now;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_ROOM_LIST_LIMIT: usize = 50;

/// Per-session context threaded through the reader and command dispatch.
#[derive(Clone)]
struct SessionCtx {
	session_id: SessionId,
	user_id: UserId,
	username: String,

	/// Ban flag snapshot taken at connect; a mid-session ban lands on the
	/// next connect.
	is_banned: bool,

	queue: OutboundQueue,
}

/// Drive one client connection from accept to close.
///
/// The protocol state machine: `Handshake` until a verified bearer (from the
/// upgrade request or one `auth` frame), then `Active` command dispatch,
/// then `Draining`/`Closed` via the outbound queue's close reason.
pub async fn run_session(
	hub: Arc<Hub>,
	socket: WebSocket,
	remote_ip: IpAddr,
	bearer: Option<String>,
	device_fingerprint: Option<String>,
) {
	metrics::counter!("ripple_server_connections_total").increment(1);

	let (mut sink, mut stream) = socket.split();

	let connect = hub.limiter.check(LimitSubject::Ip(remote_ip), Action::Connect);
	if !connect.allowed {
		debug!(%remote_ip, "connect rate limited");
		close_with(&mut sink, close::RATE_LIMITED_CONNECT, "rate_limited_connect").await;
		return;
	}

	// Handshake: a bearer on the upgrade request authenticates immediately;
	// otherwise exactly one auth frame inside the handshake window.
	let bearer = match bearer {
		Some(token) => token,
		None => {
			match tokio::time::timeout(hub.cfg.hub.handshake_timeout, wait_for_auth_frame(&mut stream, hub.cfg.hub.max_frame_bytes))
				.await
			{
				Ok(Some(token)) => token,
				Ok(None) => {
					close_with(&mut sink, close::INVALID_TOKEN, "invalid_token").await;
					return;
				}
				Err(_) => {
					metrics::counter!("ripple_server_handshake_timeouts_total").increment(1);
					close_with(&mut sink, close::HANDSHAKE_TIMEOUT, "handshake_timeout").await;
					return;
				}
			}
		}
	};

	let claims = match hub.verifier.verify(&bearer) {
		Ok(claims) => claims,
		Err(e) => {
			metrics::counter!("ripple_server_auth_failures_total").increment(1);
			debug!(%remote_ip, error = %e, "token rejected");
			let code = match e {
				AuthError::Expired => close::TOKEN_EXPIRED,
				_ => close::INVALID_TOKEN,
			};
			close_with(&mut sink, code, "auth_failed").await;
			return;
		}
	};

	// the store is the authority for the ban flag; claims only identify
	let user = hub.store.load_user(claims.user_id).await.ok().flatten();
	if user.as_ref().is_some_and(|u| u.is_banned) {
		close_with(&mut sink, close::BANNED, "banned").await;
		return;
	}
	let username = user.map(|u| u.username).unwrap_or_else(|| claims.username.clone());

	let session_id = SessionId::new_v4();
	let queue = OutboundQueue::new(hub.cfg.hub.outbound_queue_capacity);
	let handle = SessionHandle {
		session_id,
		user_id: claims.user_id,
		claim_sid: claims.session_id.clone(),
		queue: queue.clone(),
	};

	if let Err(reason) = hub.register_session(handle) {
		warn!(user = %claims.user_id, reason, "session rejected");
		close_with(&mut sink, close::SERVER_ERROR, reason).await;
		return;
	}

	info!(
		session = %session_id,
		user = %claims.user_id,
		username = %username,
		device = device_fingerprint.as_deref().unwrap_or("unknown"),
		%remote_ip,
		"session active"
	);

	let ctx = SessionCtx {
		session_id,
		user_id: claims.user_id,
		username,
		is_banned: false,
		queue: queue.clone(),
	};

	if let Some(update) = hub.presence.on_session_connect(ctx.user_id, session_id) {
		hub.bus.publish(&Subject::user(ctx.user_id), ServerBody::PresenceUpdate(update)).await;
	}

	send_welcome(&hub, &ctx).await;
	subscribe_initial(&hub, &ctx).await;

	let writer = tokio::spawn(run_writer(sink, queue.clone(), session_id));

	// the reader runs in its own task so a panic is caught here and turned
	// into a 1011 close instead of taking the process down
	let reader_hub = Arc::clone(&hub);
	let reader_ctx = ctx.clone();
	let reader = tokio::spawn(async move { read_loop(reader_hub, reader_ctx, stream).await });

	if let Err(e) = reader.await {
		if e.is_panic() {
			metrics::counter!("ripple_server_session_panics_total").increment(1);
			warn!(session = %session_id, "session reader panicked; closing with server_error");
			queue.close(CloseReason::ServerError);
		}
	}

	let _ = writer.await;

	hub.bus.unsubscribe_all(session_id).await;
	hub.presence.on_session_disconnect(ctx.user_id, session_id, hub.cfg.hub.presence_offline_grace);
	hub.unregister_session(session_id);
	info!(session = %session_id, user = %ctx.user_id, "session closed");
}

/// Handshake state: wait for one `auth` frame. Returns `None` when the
/// client sends anything else or goes away.
async fn wait_for_auth_frame(stream: &mut SplitStream<WebSocket>, max_frame_bytes: usize) -> Option<String> {
	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Text(text)) => {
				let frame = decode_client_frame(text.as_str(), max_frame_bytes).ok()?;
				return match frame.command {
					Command::Auth(auth) => Some(auth.token),
					_ => None,
				};
			}
			Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
			Ok(Message::Close(_)) | Err(_) => return None,
			_ => return None,
		}
	}
	None
}

/// Writer task: drain the outbound queue into the socket until close.
async fn run_writer(mut sink: SplitSink<WebSocket, Message>, queue: OutboundQueue, session_id: SessionId) {
	loop {
		match queue.next().await {
			QueueItem::Frame(frame) => match encode_server_frame(&frame) {
				Ok(text) => {
					metrics::counter!("ripple_server_frames_out_total").increment(1);
					if sink.send(Message::Text(text.into())).await.is_err() {
						queue.close(CloseReason::ClientClose);
						break;
					}
				}
				Err(e) => {
					warn!(session = %session_id, error = %e, "failed to encode outbound frame");
					queue.close(CloseReason::ServerError);
				}
			},
			QueueItem::Close(reason) => {
				metrics::counter!("ripple_server_session_closes_total", "reason" => reason.as_str()).increment(1);
				let _ = sink
					.send(Message::Close(Some(CloseFrame {
						code: reason.close_code(),
						reason: Utf8Bytes::from_static(reason.as_str()),
					})))
					.await;
				break;
			}
		}
	}
}

/// Reader task: parse inbound frames, drive heartbeats, dispatch commands.
async fn read_loop(hub: Arc<Hub>, ctx: SessionCtx, mut stream: SplitStream<WebSocket>) {
	let heartbeat = hub.cfg.hub.heartbeat_interval;
	let mut shutdown = hub.shutdown_signal();
	let mut last_frame = Instant::now();
	let mut tick = tokio::time::interval(heartbeat);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			msg = stream.next() => {
				match msg {
					Some(Ok(Message::Text(text))) => {
						last_frame = Instant::now();
						metrics::counter!("ripple_server_frames_in_total").increment(1);

						if let Some(update) = hub.presence.on_session_frame(ctx.user_id, ctx.session_id) {
							hub.bus.publish(&Subject::user(ctx.user_id), ServerBody::PresenceUpdate(update)).await;
						}

						handle_text(&hub, &ctx, text.as_str()).await;
						if ctx.queue.is_closed() {
							break;
						}
					}
					Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
						last_frame = Instant::now();
					}
					Some(Ok(Message::Binary(_))) => {
						ctx.queue.push(error_frame(None, ErrorPayload::ValidationFailed {
							field: "frame".to_string(),
							message: "binary frames are not supported".to_string(),
						}));
					}
					Some(Ok(Message::Close(_))) | None => {
						ctx.queue.close(CloseReason::ClientClose);
						break;
					}
					Some(Err(e)) => {
						debug!(session = %ctx.session_id, error = %e, "transport error");
						ctx.queue.close(CloseReason::ClientClose);
						break;
					}
				}
			}

			_ = tick.tick() => {
				if last_frame.elapsed() >= heartbeat * 2 {
					debug!(session = %ctx.session_id, "heartbeat timeout");
					ctx.queue.close(CloseReason::HeartbeatTimeout);
					break;
				}
			}

			_ = shutdown.changed() => {
				ctx.queue.close(CloseReason::ServerShutdown);
				break;
			}
		}
	}
}

fn error_frame(id: Option<String>, payload: ErrorPayload) -> ServerFrame {
	ServerFrame::ack(id, unix_ms_now(), ServerBody::Error(payload))
}

/// Parse and dispatch one inbound text frame, pushing the ack or error.
async fn handle_text(hub: &Arc<Hub>, ctx: &SessionCtx, text: &str) {
	let frame = match decode_client_frame(text, hub.cfg.hub.max_frame_bytes) {
		Ok(frame) => frame,
		Err(e) => {
			metrics::counter!("ripple_server_frame_decode_errors_total").increment(1);
			let payload = match e {
				DecodeError::UnknownType(kind) => ErrorPayload::ValidationFailed {
					field: "type".to_string(),
					message: format!("unknown type: {kind}"),
				},
				DecodeError::MissingType => ErrorPayload::ValidationFailed {
					field: "type".to_string(),
					message: "missing type".to_string(),
				},
				DecodeError::FrameTooLarge { len, max } => ErrorPayload::ValidationFailed {
					field: "frame".to_string(),
					message: format!("frame of {len} bytes exceeds {max}"),
				},
				DecodeError::Malformed(e) => ErrorPayload::ValidationFailed {
					field: "data".to_string(),
					message: e.to_string(),
				},
			};
			ctx.queue.push(error_frame(None, payload));
			return;
		}
	};

	let kind = frame.command.kind();
	metrics::counter!("ripple_server_commands_total", "command" => kind).increment(1);

	let id = frame.id.clone();
	let body = match dispatch(hub, ctx, frame).await {
		Ok(body) => body,
		Err(payload) => ServerBody::Error(payload),
	};
	ctx.queue.push(ServerFrame::ack(id, unix_ms_now(), body));
}

async fn dispatch(hub: &Arc<Hub>, ctx: &SessionCtx, frame: ClientFrame) -> Result<ServerBody, ErrorPayload> {
	let client_id = frame.id.clone();
	let client_ts = frame.ts;

	match frame.command {
		Command::Ping => Ok(ServerBody::Pong(Pong { client_ts })),

		Command::Auth(_) => Err(ErrorPayload::ValidationFailed {
			field: "type".to_string(),
			message: "already authenticated".to_string(),
		}),

		Command::SendMessage(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			send_to_room(hub, ctx, &room, cmd.content, cmd.reply_to, cmd.attachments, client_id).await
		}

		Command::SendDirect(cmd) => {
			if cmd.to_user_id == ctx.user_id {
				return Err(ErrorPayload::ValidationFailed {
					field: "to_user_id".to_string(),
					message: "cannot message yourself".to_string(),
				});
			}

			let room = with_deadline(hub, hub.registry.resolve_or_create_direct(ctx.user_id, cmd.to_user_id, hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			// both parties follow the thread and each other's presence
			let subject = Subject::room(room.id.clone());
			hub.subscribe_user_sessions(ctx.user_id, subject.clone()).await;
			hub.subscribe_user_sessions(cmd.to_user_id, subject).await;
			hub.subscribe_user_sessions(ctx.user_id, Subject::user(cmd.to_user_id)).await;
			hub.subscribe_user_sessions(cmd.to_user_id, Subject::user(ctx.user_id)).await;

			send_to_room(hub, ctx, &room, cmd.content, cmd.reply_to, cmd.attachments, client_id).await
		}

		Command::JoinRoom(cmd) => {
			let decision = hub.limiter.check(LimitSubject::User(ctx.user_id), Action::JoinRoom);
			if !decision.allowed {
				return Err(rate_limited(Action::JoinRoom, decision.retry_after.as_secs()));
			}

			let room = resolve_room(hub, &cmd.room_id).await?;
			let outcome = with_deadline(hub, hub.registry.join(ctx.user_id, &room, cmd.password.as_deref(), hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			if outcome.newly_joined {
				hub.subscribe_user_sessions(ctx.user_id, Subject::room(room.id.clone())).await;
				hub.bus
					.publish(
						&Subject::room(room.id.clone()),
						ServerBody::MemberJoined(MemberChange {
							room_id: room.id.clone(),
							user_id: ctx.user_id,
							username: ctx.username.clone(),
							role: outcome.role,
						}),
					)
					.await;
				append_system(hub, &room, MessageKind::SystemJoin, format!("{} joined", ctx.username)).await;
			}

			Ok(ServerBody::JoinAck(JoinAck {
				room: outcome.summary,
				role: outcome.role,
			}))
		}

		Command::LeaveRoom(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			let outcome = with_deadline(hub, hub.registry.leave(ctx.user_id, &room, hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			if outcome.was_member {
				if outcome.room_deleted {
					hub.cache.invalidate(&room.id);
				} else {
					append_system(hub, &room, MessageKind::SystemLeave, format!("{} left", ctx.username)).await;
					hub.bus
						.publish(
							&Subject::room(room.id.clone()),
							ServerBody::MemberLeft(MemberChange {
								room_id: room.id.clone(),
								user_id: ctx.user_id,
								username: ctx.username.clone(),
								role: MemberRole::Member,
							}),
						)
						.await;
				}
				hub.unsubscribe_user_sessions(ctx.user_id, &Subject::room(room.id.clone())).await;
			}

			Ok(ServerBody::LeaveAck(LeaveAck { room_id: room.id.clone() }))
		}

		Command::CreateRoom(spec) => {
			let decision = hub.limiter.check(LimitSubject::User(ctx.user_id), Action::CreateRoom);
			if !decision.allowed {
				return Err(rate_limited(Action::CreateRoom, decision.retry_after.as_secs()));
			}

			let (room, summary) = with_deadline(hub, hub.registry.create(ctx.user_id, &spec, hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			hub.subscribe_user_sessions(ctx.user_id, Subject::room(room.id.clone())).await;
			hub.bus
				.publish(&Subject::room(room.id.clone()), ServerBody::RoomCreated(summary.clone()))
				.await;

			Ok(ServerBody::CreateAck(summary))
		}

		Command::InviteUser(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			hub.registry.invite(ctx.user_id, &room, cmd.user_id).await.map_err(map_room_err)?;
			Ok(ServerBody::Ok)
		}

		Command::KickUser(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			with_deadline(hub, hub.registry.kick(ctx.user_id, &room, cmd.user_id, hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			let subject = Subject::room(room.id.clone());
			hub.bus
				.publish(
					&subject,
					ServerBody::MemberKicked(MemberKicked {
						room_id: room.id.clone(),
						user_id: cmd.user_id,
						kicked_by: ctx.user_id,
					}),
				)
				.await;
			hub.bus
				.publish(
					&subject,
					ServerBody::ModerationAction(ModerationAction {
						room_id: room.id.clone(),
						action: "kick".to_string(),
						target_user_id: Some(cmd.user_id),
						message_id: None,
					}),
				)
				.await;
			let notice = match cmd.reason.as_deref() {
				Some(reason) => format!("user {} was removed: {reason}", cmd.user_id),
				None => format!("user {} was removed", cmd.user_id),
			};
			append_system(hub, &room, MessageKind::SystemModAction, notice).await;
			hub.unsubscribe_user_sessions(cmd.user_id, &subject).await;

			Ok(ServerBody::Ok)
		}

		Command::EditMessage(cmd) => {
			let existing = with_deadline(hub, hub.store.get(cmd.message_id))
				.await
				.map_err(map_store_err)?
				.ok_or(ErrorPayload::NotFound {
					resource: "message".to_string(),
				})?;

			// the replacement content goes through the same gate as a fresh
			// send, with the room's own rules applied
			let room = resolve_room(hub, &existing.room_id).await?;
			let state = room.lock().await;

			let sender = SenderContext {
				is_banned: ctx.is_banned,
				blocked_in_room: state.blocked.contains(&ctx.user_id),
			};
			let content = match hub.gate.review(sender, &state.banned_tokens, &cmd.content) {
				Verdict::Accept => cmd.content,
				Verdict::Transform(trimmed) => trimmed,
				Verdict::Reject(reason) => {
					metrics::counter!("ripple_server_moderation_rejected_total", "reason" => reason.as_str()).increment(1);
					return Err(ErrorPayload::ModerationRejected {
						reason: reason.as_str().to_string(),
					});
				}
			};

			let edited = with_deadline(hub, hub.store.edit(ctx.user_id, cmd.message_id, &content, hub.cfg.hub.edit_window))
				.await
				.map_err(map_store_err)?;

			hub.cache.apply(&edited.room_id, edited.message_id, |m| {
				m.content = edited.content.clone();
				m.edited_at = edited.edited_at;
			});
			hub.bus
				.publish(&Subject::room(edited.room_id.clone()), ServerBody::MessageEdited(edited.clone()))
				.await;
			drop(state);

			Ok(ServerBody::SendAck(SendAck {
				message: edited,
				duplicate: false,
			}))
		}

		Command::DeleteMessage(cmd) => {
			let existing = with_deadline(hub, hub.store.get(cmd.message_id))
				.await
				.map_err(map_store_err)?
				.ok_or(ErrorPayload::NotFound {
					resource: "message".to_string(),
				})?;

			let is_moderator = match hub.registry.resolve(&existing.room_id).await {
				Some(room) => room.lock().await.role_of(ctx.user_id).is_some_and(|r| r.can_moderate()),
				None => false,
			};

			let deleted = with_deadline(hub, hub.store.soft_delete(ctx.user_id, cmd.message_id, is_moderator))
				.await
				.map_err(map_store_err)?;

			hub.cache.apply(&deleted.room_id, deleted.message_id, |m| {
				m.deleted = true;
				m.content.clear();
				m.attachments.clear();
			});

			let subject = Subject::room(deleted.room_id.clone());
			hub.bus
				.publish(
					&subject,
					ServerBody::MessageDeleted(MessageDeleted {
						room_id: deleted.room_id.clone(),
						message_id: deleted.message_id,
						deleted_by: ctx.user_id,
					}),
				)
				.await;
			if deleted.sender_id != Some(ctx.user_id) {
				hub.bus
					.publish(
						&subject,
						ServerBody::ModerationAction(ModerationAction {
							room_id: deleted.room_id.clone(),
							action: "delete_message".to_string(),
							target_user_id: deleted.sender_id,
							message_id: Some(deleted.message_id),
						}),
					)
					.await;
			}

			Ok(ServerBody::Ok)
		}

		Command::UpdateRoom(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			let patch = RoomPatch {
				password: cmd.password,
				max_members: cmd.max_members,
				banned_tokens: cmd.banned_tokens,
				block: cmd.block,
				unblock: cmd.unblock,
			};
			let summary = with_deadline(hub, hub.registry.update_config(ctx.user_id, &room, patch, hub.store.as_ref()))
				.await
				.map_err(map_room_err)?;

			hub.bus
				.publish(&Subject::room(room.id.clone()), ServerBody::RoomUpdated(summary))
				.await;
			Ok(ServerBody::Ok)
		}

		Command::TypingStart(cmd) => {
			let decision = hub.limiter.check(LimitSubject::User(ctx.user_id), Action::SendTyping);
			if !decision.allowed {
				return Err(rate_limited(Action::SendTyping, decision.retry_after.as_secs()));
			}

			let room = resolve_room(hub, &cmd.room_id).await?;
			require_member(&room, ctx.user_id).await?;

			if hub.set_typing(room.id.clone(), ctx.user_id, true) {
				hub.bus
					.publish(
						&Subject::room(room.id.clone()),
						ServerBody::TypingIndicator(TypingIndicator {
							room_id: room.id.clone(),
							user_id: ctx.user_id,
							typing: true,
						}),
					)
					.await;
			}
			Ok(ServerBody::Ok)
		}

		Command::TypingStop(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			if hub.set_typing(room.id.clone(), ctx.user_id, false) {
				hub.bus
					.publish(
						&Subject::room(room.id.clone()),
						ServerBody::TypingIndicator(TypingIndicator {
							room_id: room.id.clone(),
							user_id: ctx.user_id,
							typing: false,
						}),
					)
					.await;
			}
			Ok(ServerBody::Ok)
		}

		Command::MarkRead(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			require_member(&room, ctx.user_id).await?;

			with_deadline(hub, hub.store.set_read_cursor(ctx.user_id, &room.id, cmd.message_id))
				.await
				.map_err(map_store_err)?;

			hub.bus
				.publish(
					&Subject::room(room.id.clone()),
					ServerBody::ReadReceipt(ReadReceipt {
						room_id: room.id.clone(),
						user_id: ctx.user_id,
						message_id: cmd.message_id,
					}),
				)
				.await;

			Ok(ServerBody::ReadAck(ReadAck {
				room_id: room.id.clone(),
				message_id: cmd.message_id,
			}))
		}

		Command::FetchHistory(cmd) => {
			let room = resolve_room(hub, &cmd.room_id).await?;
			require_member(&room, ctx.user_id).await?;

			let limit = cmd.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, HISTORY_PAGE_LIMIT);

			// the warm cache can only answer "latest page" requests
			let messages = if cmd.before.is_none() && cmd.after.is_none() {
				match hub.cache.recent(&room.id, limit) {
					Some(cached) => cached,
					None => {
						with_deadline(hub, hub.store.list(&room.id, None, None, limit))
							.await
							.map_err(map_store_err)?
					}
				}
			} else {
				with_deadline(hub, hub.store.list(&room.id, cmd.before, cmd.after, limit))
					.await
					.map_err(map_store_err)?
			};

			Ok(ServerBody::History(History {
				room_id: room.id.clone(),
				messages,
			}))
		}

		Command::ListRooms(cmd) => {
			let limit = cmd.limit.unwrap_or(DEFAULT_ROOM_LIST_LIMIT).clamp(1, 100);
			Ok(ServerBody::RoomsList(RoomsList {
				rooms: hub.registry.list_public(limit).await,
			}))
		}

		Command::ReportMessage(cmd) => {
			let report_id = with_deadline(hub, hub.store.insert_report(cmd.message_id, ctx.user_id, &cmd.reason))
				.await
				.map_err(map_store_err)?;
			Ok(ServerBody::ReportAck(ReportAck { report_id }))
		}
	}
}

/// The shared send path: rate limit, moderation gate, durable append,
/// cache write, then fan-out. The last three run inside the room's exclusion
/// domain so every subscriber observes the append order.
async fn send_to_room(
	hub: &Arc<Hub>,
	ctx: &SessionCtx,
	room: &Arc<Room>,
	content: String,
	reply_to: Option<ripple_domain::MessageId>,
	attachments: Vec<Attachment>,
	client_id: Option<String>,
) -> Result<ServerBody, ErrorPayload> {
	let decision = hub.limiter.check(LimitSubject::User(ctx.user_id), Action::SendMessage);
	if !decision.allowed {
		return Err(rate_limited(Action::SendMessage, decision.retry_after.as_secs()));
	}

	if attachments.len() > hub.cfg.hub.max_attachments {
		return Err(ErrorPayload::ValidationFailed {
			field: "attachments".to_string(),
			message: format!("at most {} attachments", hub.cfg.hub.max_attachments),
		});
	}

	let state = room.lock().await;
	if state.role_of(ctx.user_id).is_none() {
		return Err(ErrorPayload::Forbidden {
			reason: "not_a_member".to_string(),
		});
	}

	let sender = SenderContext {
		is_banned: ctx.is_banned,
		blocked_in_room: state.blocked.contains(&ctx.user_id),
	};
	let content = match hub.gate.review(sender, &state.banned_tokens, &content) {
		Verdict::Accept => content,
		Verdict::Transform(trimmed) => trimmed,
		Verdict::Reject(reason) => {
			metrics::counter!("ripple_server_moderation_rejected_total", "reason" => reason.as_str()).increment(1);
			return Err(ErrorPayload::ModerationRejected {
				reason: reason.as_str().to_string(),
			});
		}
	};

	let draft = NewMessage {
		room_id: room.id.clone(),
		sender_id: Some(ctx.user_id),
		kind: MessageKind::Text,
		content,
		reply_to,
		attachments,
		client_id,
	};

	let outcome = with_deadline(hub, hub.store.append(draft, hub.cfg.hub.idempotency_window))
		.await
		.map_err(map_store_err)?;

	metrics::counter!("ripple_server_messages_appended_total").increment(1);

	// cache before publish, and publish before releasing the room domain
	hub.cache.push(outcome.message.clone(), unix_ms_now());
	if !outcome.duplicate {
		hub.bus
			.publish(&Subject::room(room.id.clone()), ServerBody::MessageCreated(outcome.message.clone()))
			.await;
	}
	drop(state);

	Ok(ServerBody::SendAck(SendAck {
		message: outcome.message,
		duplicate: outcome.duplicate,
	}))
}

/// Append a system message (no sender) and fan it out, inside the room
/// domain. Best-effort: a store failure skips the event and logs.
async fn append_system(hub: &Arc<Hub>, room: &Arc<Room>, kind: MessageKind, content: String) {
	let state = room.lock().await;
	let draft = NewMessage {
		room_id: room.id.clone(),
		sender_id: None,
		kind,
		content,
		reply_to: None,
		attachments: Vec::new(),
		client_id: None,
	};

	match with_deadline(hub, hub.store.append(draft, hub.cfg.hub.idempotency_window)).await {
		Ok(outcome) => {
			hub.cache.push(outcome.message.clone(), unix_ms_now());
			hub.bus
				.publish(&Subject::room(room.id.clone()), ServerBody::MessageCreated(outcome.message))
				.await;
		}
		Err(e) => {
			warn!(room = %room.id, error = %e, "failed to persist system message");
		}
	}
	drop(state);
}

async fn send_welcome(hub: &Arc<Hub>, ctx: &SessionCtx) {
	let unread = hub.store.unread_counts(ctx.user_id).await.unwrap_or_default();
	let rooms = hub
		.registry
		.rooms_of(ctx.user_id)
		.await
		.into_iter()
		.map(|(_, summary, _)| {
			let unread = unread.get(&summary.room_id).copied().unwrap_or(0);
			RoomSync { room: summary, unread }
		})
		.collect();

	ctx.queue.push(ServerFrame::ack(
		None,
		unix_ms_now(),
		ServerBody::Welcome(Welcome {
			server: format!("ripple-server/{}", env!("CARGO_PKG_VERSION")),
			session_id: ctx.session_id,
			user_id: ctx.user_id,
			heartbeat_interval_ms: hub.cfg.hub.heartbeat_interval.as_millis() as u64,
			max_frame_bytes: hub.cfg.hub.max_frame_bytes,
			rooms,
		}),
	));
}

/// Subscribe the fresh session to its room subjects, its own presence
/// subject, and its direct-partners' presence subjects. Partners' current
/// presence is pushed up front so the client starts from a known state.
async fn subscribe_initial(hub: &Arc<Hub>, ctx: &SessionCtx) {
	hub.bus
		.subscribe(Subject::user(ctx.user_id), ctx.session_id, ctx.queue.clone())
		.await;

	let mut partners: Vec<UserId> = Vec::new();
	for (room, _, _) in hub.registry.rooms_of(ctx.user_id).await {
		hub.bus
			.subscribe(Subject::room(room.id.clone()), ctx.session_id, ctx.queue.clone())
			.await;

		if room.id.is_direct() {
			let state = room.lock().await;
			partners.extend(state.members.keys().copied().filter(|u| *u != ctx.user_id));
		}
	}

	partners.sort_unstable();
	partners.dedup();
	for partner in &partners {
		hub.bus.subscribe(Subject::user(*partner), ctx.session_id, ctx.queue.clone()).await;
	}

	for (user, update) in hub.presence.snapshot(&partners) {
		let seq = hub.bus.current_seq(&Subject::user(user)).await;
		ctx.queue.push(ServerFrame::event(
			Subject::user(user).to_string(),
			seq,
			unix_ms_now(),
			ServerBody::PresenceUpdate(update),
		));
	}
}

async fn resolve_room(hub: &Arc<Hub>, room_id: &RoomId) -> Result<Arc<Room>, ErrorPayload> {
	hub.registry.resolve(room_id).await.ok_or(ErrorPayload::NotFound {
		resource: "room".to_string(),
	})
}

async fn require_member(room: &Arc<Room>, user: UserId) -> Result<MemberRole, ErrorPayload> {
	room.lock().await.role_of(user).ok_or(ErrorPayload::Forbidden {
		reason: "not_a_member".to_string(),
	})
}

fn rate_limited(action: Action, retry_after_secs: u64) -> ErrorPayload {
	ErrorPayload::RateLimited {
		action: action.as_str().to_string(),
		retry_after_secs,
	}
}

/// Bound a store-backed operation by the per-command deadline.
async fn with_deadline<T, E>(hub: &Arc<Hub>, fut: impl Future<Output = Result<T, E>>) -> Result<T, E>
where
	E: From<StoreError>,
{
	match tokio::time::timeout(hub.cfg.hub.store_deadline, fut).await {
		Ok(result) => result,
		Err(_) => {
			metrics::counter!("ripple_server_store_deadline_exceeded_total").increment(1);
			Err(E::from(StoreError::Timeout))
		}
	}
}

fn map_store_err(e: StoreError) -> ErrorPayload {
	match e {
		StoreError::NotFound => ErrorPayload::NotFound {
			resource: "message".to_string(),
		},
		StoreError::Denied => ErrorPayload::Forbidden {
			reason: "denied".to_string(),
		},
		StoreError::Conflict => ErrorPayload::Conflict {
			reason: "conflict".to_string(),
		},
		e @ (StoreError::Backend(_) | StoreError::Timeout) => ErrorPayload::SendFailed {
			retryable: e.retryable(),
			reason: e.to_string(),
		},
		StoreError::Encode(e) => ErrorPayload::ServerError { message: e.to_string() },
	}
}

fn map_room_err(e: RoomError) -> ErrorPayload {
	match e {
		RoomError::InvalidName(e) => ErrorPayload::ValidationFailed {
			field: "name".to_string(),
			message: e.to_string(),
		},
		RoomError::NameTaken => ErrorPayload::Conflict {
			reason: "name_taken".to_string(),
		},
		RoomError::QuotaExceeded => ErrorPayload::Forbidden {
			reason: "room_quota_exceeded".to_string(),
		},
		RoomError::NotFound => ErrorPayload::NotFound {
			resource: "room".to_string(),
		},
		RoomError::Full => ErrorPayload::Forbidden {
			reason: "room_full".to_string(),
		},
		RoomError::BadPassword => ErrorPayload::Forbidden {
			reason: "bad_password".to_string(),
		},
		RoomError::Denied(reason) => ErrorPayload::Forbidden {
			reason: reason.to_string(),
		},
		RoomError::Store(e) => map_store_err(e),
	}
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
	let _ = sink
		.send(Message::Close(Some(CloseFrame {
			code,
			reason: Utf8Bytes::from_static(reason),
		})))
		.await;
}
