#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::server::rate_limit::{LimitParams, RateLimitConfig};
use crate::util::secret::SecretString;

/// Default config path: `~/.ripple/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".ripple").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// WebSocket listen address.
	pub listen: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Database URL (sqlite: or postgres:).
	pub database_url: String,
	/// HMAC secret for stateless bearer tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Global banned-token regex patterns for the moderation gate.
	pub banned_tokens: Vec<String>,

	pub hub: HubOptions,
	pub rate_limits: RateLimitConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: "127.0.0.1:8090".to_string(),
			metrics_bind: None,
			database_url: "sqlite::memory:".to_string(),
			auth_hmac_secret: None,
			banned_tokens: Vec::new(),
			hub: HubOptions::default(),
			rate_limits: RateLimitConfig::default(),
		}
	}
}

/// Hub behavior knobs. Defaults follow the protocol contract; every one is
/// overridable from the config file.
#[derive(Debug, Clone)]
pub struct HubOptions {
	/// Expected client frame cadence; silence past twice this closes the
	/// session.
	pub heartbeat_interval: Duration,
	/// How long an unauthenticated connection may sit before it is closed.
	pub handshake_timeout: Duration,
	/// Bounded per-session outbound buffer.
	pub outbound_queue_capacity: usize,
	/// Upper bound on message content length, in code points.
	pub message_max_length: usize,
	/// How long a message remains editable by its sender.
	pub edit_window: Duration,
	/// Delay before a vanished user is published offline.
	pub presence_offline_grace: Duration,
	/// Silence before a user is published away.
	pub idle_threshold: Duration,
	/// Default member cap per room unless overridden at creation.
	pub room_max_members: usize,
	/// How long writers get to drain on graceful shutdown.
	pub shutdown_grace: Duration,
	/// Per-command deadline for store operations.
	pub store_deadline: Duration,
	/// Window for `(sender, client_id)` send deduplication.
	pub idempotency_window: Duration,
	/// Lifetime of a typing indicator without a refresh.
	pub typing_ttl: Duration,
	pub max_sessions: usize,
	pub max_rooms_per_user: usize,
	pub max_attachments: usize,
	pub max_frame_bytes: usize,
	/// Warm-cache depth per active room.
	pub cache_per_room: usize,
}

impl Default for HubOptions {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(30),
			handshake_timeout: Duration::from_secs(10),
			outbound_queue_capacity: 256,
			message_max_length: 2000,
			edit_window: Duration::from_secs(15 * 60),
			presence_offline_grace: Duration::from_secs(10),
			idle_threshold: Duration::from_secs(5 * 60),
			room_max_members: 256,
			shutdown_grace: Duration::from_secs(10),
			store_deadline: Duration::from_secs(5),
			idempotency_window: Duration::from_secs(60),
			typing_ttl: Duration::from_secs(10),
			max_sessions: 10_000,
			max_rooms_per_user: 128,
			max_attachments: 10,
			max_frame_bytes: ripple_protocol::DEFAULT_MAX_FRAME_BYTES,
			cache_per_room: 200,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	listen: Option<String>,
	metrics_bind: Option<String>,
	database_url: Option<String>,
	auth_hmac_secret: Option<String>,

	#[serde(default)]
	banned_tokens: Vec<String>,

	#[serde(default)]
	hub: FileHubOptions,

	#[serde(default)]
	rate_limits: FileRateLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubOptions {
	heartbeat_interval_secs: Option<u64>,
	handshake_timeout_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	message_max_length: Option<usize>,
	edit_window_secs: Option<u64>,
	presence_offline_grace_secs: Option<u64>,
	idle_threshold_secs: Option<u64>,
	room_max_members: Option<usize>,
	shutdown_grace_secs: Option<u64>,
	store_deadline_secs: Option<u64>,
	idempotency_window_secs: Option<u64>,
	typing_ttl_secs: Option<u64>,
	max_sessions: Option<usize>,
	max_rooms_per_user: Option<usize>,
	max_attachments: Option<usize>,
	max_frame_bytes: Option<usize>,
	cache_per_room: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimits {
	connect: Option<FileLimitParams>,
	send_message: Option<FileLimitParams>,
	create_room: Option<FileLimitParams>,
	join_room: Option<FileLimitParams>,
	send_typing: Option<FileLimitParams>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileLimitParams {
	capacity: u32,
	per_minute: f64,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = HubOptions::default();
		let hub = HubOptions {
			heartbeat_interval: secs_or(file.hub.heartbeat_interval_secs, defaults.heartbeat_interval),
			handshake_timeout: secs_or(file.hub.handshake_timeout_secs, defaults.handshake_timeout),
			outbound_queue_capacity: file.hub.outbound_queue_capacity.unwrap_or(defaults.outbound_queue_capacity),
			message_max_length: file.hub.message_max_length.unwrap_or(defaults.message_max_length),
			edit_window: secs_or(file.hub.edit_window_secs, defaults.edit_window),
			presence_offline_grace: secs_or(file.hub.presence_offline_grace_secs, defaults.presence_offline_grace),
			idle_threshold: secs_or(file.hub.idle_threshold_secs, defaults.idle_threshold),
			room_max_members: file.hub.room_max_members.unwrap_or(defaults.room_max_members),
			shutdown_grace: secs_or(file.hub.shutdown_grace_secs, defaults.shutdown_grace),
			store_deadline: secs_or(file.hub.store_deadline_secs, defaults.store_deadline),
			idempotency_window: secs_or(file.hub.idempotency_window_secs, defaults.idempotency_window),
			typing_ttl: secs_or(file.hub.typing_ttl_secs, defaults.typing_ttl),
			max_sessions: file.hub.max_sessions.unwrap_or(defaults.max_sessions),
			max_rooms_per_user: file.hub.max_rooms_per_user.unwrap_or(defaults.max_rooms_per_user),
			max_attachments: file.hub.max_attachments.unwrap_or(defaults.max_attachments),
			max_frame_bytes: file.hub.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
			cache_per_room: file.hub.cache_per_room.unwrap_or(defaults.cache_per_room),
		};

		let limit_defaults = RateLimitConfig::default();
		let rate_limits = RateLimitConfig {
			connect: limit_or(file.rate_limits.connect, limit_defaults.connect),
			send_message: limit_or(file.rate_limits.send_message, limit_defaults.send_message),
			create_room: limit_or(file.rate_limits.create_room, limit_defaults.create_room),
			join_room: limit_or(file.rate_limits.join_room, limit_defaults.join_room),
			send_typing: limit_or(file.rate_limits.send_typing, limit_defaults.send_typing),
		};

		let defaults = ServerConfig::default();
		Self {
			listen: file.listen.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.listen),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
			database_url: file
				.database_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.database_url),
			auth_hmac_secret: file
				.auth_hmac_secret
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			banned_tokens: file.banned_tokens,
			hub,
			rate_limits,
		}
	}
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
	value.map(Duration::from_secs).unwrap_or(default)
}

fn limit_or(value: Option<FileLimitParams>, default: LimitParams) -> LimitParams {
	value
		.map(|p| LimitParams {
			capacity: p.capacity,
			per_minute: p.per_minute,
		})
		.unwrap_or(default)
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("RIPPLE_LISTEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.listen = v;
			info!("server config: listen overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RIPPLE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database_url = v;
			info!("server config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RIPPLE_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RIPPLE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RIPPLE_MAX_SESSIONS")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.hub.max_sessions = max;
		info!(max, "server config: max_sessions overridden by env");
	}

	if let Ok(v) = std::env::var("RIPPLE_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.hub.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "server config: heartbeat_interval overridden by env");
	}

	if let Ok(v) = std::env::var("RIPPLE_SHUTDOWN_GRACE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.hub.shutdown_grace = Duration::from_secs(secs);
		info!(secs, "server config: shutdown_grace overridden by env");
	}
}
