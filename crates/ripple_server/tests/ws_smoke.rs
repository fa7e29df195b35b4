#![forbid(unsafe_code)]

use std::net::TcpListener;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SECRET: &str = "smoke-test-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn mint_token(user_id: i64, name: &str, sid: &str) -> String {
	let exp = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("clock")
		.as_secs() + 3600;
	let payload = json!({ "sub": user_id, "name": name, "roles": ["user"], "sid": sid, "exp": exp });
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("claims"));

	let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac key");
	mac.update(payload_b64.as_bytes());
	let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
	format!("v1.{payload_b64}.{sig}")
}

fn free_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
	listener.local_addr().expect("local addr").port()
}

fn spawn_server(port: u16, config_path: Option<&std::path::Path>) -> Child {
	let mut cmd = Command::new(env!("CARGO_BIN_EXE_ripple_server"));
	cmd.env("RIPPLE_LISTEN", format!("127.0.0.1:{port}"))
		.env("RIPPLE_DATABASE_URL", "sqlite::memory:")
		.env("RIPPLE_AUTH_HMAC_SECRET", SECRET)
		.env("RUST_LOG", "warn")
		.arg("--config")
		.arg(config_path.unwrap_or(std::path::Path::new("/nonexistent/ripple-smoke.toml")))
		.kill_on_drop(true);
	cmd.spawn().expect("spawn ripple_server")
}

async fn connect_client(port: u16, token: &str) -> anyhow::Result<WsClient> {
	let url = format!("ws://127.0.0.1:{port}/ws/chat?token={token}");
	for _ in 0..50 {
		match connect_async(&url).await {
			Ok((ws, _resp)) => return Ok(ws),
			Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
		}
	}
	Err(anyhow!("server did not come up on port {port}"))
}

async fn send_json(ws: &mut WsClient, value: Value) -> anyhow::Result<()> {
	ws.send(WsMessage::text(value.to_string())).await.context("send frame")
}

/// Read frames until one matches `type == kind`; unrelated frames
/// (presence, typing, events for other assertions) are skipped.
async fn recv_until(ws: &mut WsClient, kind: &str) -> anyhow::Result<Value> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let remaining = deadline
			.checked_duration_since(tokio::time::Instant::now())
			.ok_or_else(|| anyhow!("timed out waiting for {kind}"))?;
		let msg = tokio::time::timeout(remaining, ws.next())
			.await
			.map_err(|_| anyhow!("timed out waiting for {kind}"))?
			.ok_or_else(|| anyhow!("connection closed waiting for {kind}"))?
			.context("read frame")?;

		if let WsMessage::Text(text) = msg {
			let value: Value = serde_json::from_str(text.as_str()).context("parse frame")?;
			if value["type"] == kind {
				return Ok(value);
			}
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_message_reaches_the_other_party() -> anyhow::Result<()> {
	let port = free_port();
	let _server = spawn_server(port, None);

	let mut alice = connect_client(port, &mint_token(7, "alice", "sid-alice")).await?;
	let welcome = recv_until(&mut alice, "welcome").await?;
	assert_eq!(welcome["data"]["user_id"], 7);

	let mut bob = connect_client(port, &mint_token(9, "bob", "sid-bob")).await?;
	recv_until(&mut bob, "welcome").await?;

	send_json(
		&mut alice,
		json!({ "type": "send_direct", "id": "c-1", "data": { "to_user_id": 9, "content": "hi" } }),
	)
	.await?;

	let ack = recv_until(&mut alice, "send_ack").await?;
	assert_eq!(ack["id"], "c-1");
	assert_eq!(ack["data"]["duplicate"], false);
	assert_eq!(ack["data"]["message"]["message_id"], 1);
	assert_eq!(ack["data"]["message"]["content"], "hi");
	let room_id = ack["data"]["message"]["room_id"].as_str().expect("room id").to_string();
	assert!(room_id.starts_with("direct:"), "direct room id, got {room_id}");

	let event = recv_until(&mut bob, "message_created").await?;
	assert_eq!(event["subject"], format!("room:{room_id}"));
	assert_eq!(event["data"]["sender_id"], 7);
	assert_eq!(event["data"]["content"], "hi");
	assert_eq!(event["data"]["message_id"], 1);
	assert!(event["seq"].as_u64().expect("seq") >= 1);

	// an idempotent retry with the same client id yields the same message
	send_json(
		&mut alice,
		json!({ "type": "send_direct", "id": "c-1", "data": { "to_user_id": 9, "content": "hi" } }),
	)
	.await?;
	let retry = recv_until(&mut alice, "send_ack").await?;
	assert_eq!(retry["data"]["duplicate"], true);
	assert_eq!(retry["data"]["message"]["message_id"], 1);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_burst_hits_the_rate_limit_without_disconnecting() -> anyhow::Result<()> {
	let port = free_port();

	// pin the bucket so refill cannot race the assertions
	let config_path = std::env::temp_dir().join(format!("ripple-smoke-{port}.toml"));
	std::fs::write(
		&config_path,
		"[rate_limits.send_message]\ncapacity = 3\nper_minute = 0.01\n",
	)
	.context("write smoke config")?;
	let _server = spawn_server(port, Some(&config_path));

	let mut alice = connect_client(port, &mint_token(7, "alice", "sid-alice")).await?;
	recv_until(&mut alice, "welcome").await?;
	let mut bob = connect_client(port, &mint_token(9, "bob", "sid-bob")).await?;
	recv_until(&mut bob, "welcome").await?;

	let mut room_id = String::new();
	for i in 0..3 {
		send_json(
			&mut alice,
			json!({ "type": "send_direct", "id": format!("b-{i}"), "data": { "to_user_id": 9, "content": format!("m{i}") } }),
		)
		.await?;
		let ack = recv_until(&mut alice, "send_ack").await?;
		room_id = ack["data"]["message"]["room_id"].as_str().expect("room id").to_string();
	}

	send_json(
		&mut alice,
		json!({ "type": "send_direct", "id": "b-over", "data": { "to_user_id": 9, "content": "over" } }),
	)
	.await?;
	let rejected = recv_until(&mut alice, "error").await?;
	assert_eq!(rejected["data"]["kind"], "rate_limited");
	assert_eq!(rejected["data"]["action"], "send_message");
	assert!(rejected["data"]["retry_after_secs"].as_u64().expect("retry") > 0);

	// the session stays open and other commands are unaffected
	send_json(&mut alice, json!({ "type": "ping", "id": "p-1" })).await?;
	let pong = recv_until(&mut alice, "pong").await?;
	assert_eq!(pong["id"], "p-1");

	send_json(
		&mut alice,
		json!({ "type": "fetch_history", "id": "h-1", "data": { "room_id": room_id, "limit": 100 } }),
	)
	.await?;
	let history = recv_until(&mut alice, "history").await?;
	let messages = history["data"]["messages"].as_array().expect("messages");
	assert_eq!(messages.len(), 3, "all persisted messages come back");
	let ids: Vec<i64> = messages.iter().map(|m| m["message_id"].as_i64().expect("id")).collect();
	let mut sorted = ids.clone();
	sorted.sort_unstable();
	assert_eq!(ids, sorted, "history is in message_id order");

	let _ = std::fs::remove_file(&config_path);
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_frame_type_is_an_error_not_a_disconnect() -> anyhow::Result<()> {
	let port = free_port();
	let _server = spawn_server(port, None);

	let mut alice = connect_client(port, &mint_token(7, "alice", "sid-alice")).await?;
	recv_until(&mut alice, "welcome").await?;

	send_json(&mut alice, json!({ "type": "teleport", "data": {} })).await?;
	let error = recv_until(&mut alice, "error").await?;
	assert_eq!(error["data"]["kind"], "validation_failed");
	assert_eq!(error["data"]["field"], "type");

	send_json(&mut alice, json!({ "type": "ping" })).await?;
	recv_until(&mut alice, "pong").await?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_token_closes_with_auth_code() -> anyhow::Result<()> {
	let port = free_port();
	let _server = spawn_server(port, None);

	// wait for the server with a valid client first
	let mut ok = connect_client(port, &mint_token(7, "alice", "sid-alice")).await?;
	recv_until(&mut ok, "welcome").await?;

	let url = format!("ws://127.0.0.1:{port}/ws/chat?token=v1.garbage.token");
	let (mut ws, _resp) = connect_async(&url).await.context("upgrade")?;

	let deadline = Duration::from_secs(5);
	let close = tokio::time::timeout(deadline, async {
		while let Some(msg) = ws.next().await {
			if let Ok(WsMessage::Close(frame)) = msg {
				return frame;
			}
		}
		None
	})
	.await
	.context("waiting for close")?;

	let frame = close.expect("close frame with code");
	assert_eq!(u16::from(frame.code), 4001);

	Ok(())
}
