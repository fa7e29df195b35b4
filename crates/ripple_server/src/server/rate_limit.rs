#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ripple_domain::UserId;

const SHARD_COUNT: usize = 16;

/// Gated actions. Every gate in the hub flows through [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
	Connect,
	SendMessage,
	CreateRoom,
	JoinRoom,
	SendTyping,
}

impl Action {
	pub const fn as_str(self) -> &'static str {
		match self {
			Action::Connect => "connect",
			Action::SendMessage => "send_message",
			Action::CreateRoom => "create_room",
			Action::JoinRoom => "join_room",
			Action::SendTyping => "send_typing",
		}
	}
}

/// Who a bucket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitSubject {
	User(UserId),
	Ip(IpAddr),
}

/// Bucket parameters: burst capacity and sustained refill per minute.
#[derive(Debug, Clone, Copy)]
pub struct LimitParams {
	pub capacity: u32,
	pub per_minute: f64,
}

/// Per-action bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
	pub connect: LimitParams,
	pub send_message: LimitParams,
	pub create_room: LimitParams,
	pub join_room: LimitParams,
	pub send_typing: LimitParams,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			// 10/min per ip, burst 20
			connect: LimitParams {
				capacity: 20,
				per_minute: 10.0,
			},
			// 30/min per user, burst 10
			send_message: LimitParams {
				capacity: 10,
				per_minute: 30.0,
			},
			// 5/h per user
			create_room: LimitParams {
				capacity: 5,
				per_minute: 5.0 / 60.0,
			},
			// 20/min per user
			join_room: LimitParams {
				capacity: 20,
				per_minute: 20.0,
			},
			// 10/10s per user
			send_typing: LimitParams {
				capacity: 10,
				per_minute: 60.0,
			},
		}
	}
}

impl RateLimitConfig {
	fn params(&self, action: Action) -> LimitParams {
		match action {
			Action::Connect => self.connect,
			Action::SendMessage => self.send_message,
			Action::CreateRoom => self.create_room,
			Action::JoinRoom => self.join_room,
			Action::SendTyping => self.send_typing,
		}
	}
}

/// Outcome of a rate-limit check. Never blocks the caller; a rejection
/// carries the wait until one token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
	pub allowed: bool,
	pub retry_after: Duration,
}

#[derive(Debug)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(params: LimitParams) -> Self {
		Self {
			capacity: params.capacity as f64,
			tokens: params.capacity as f64,
			refill_per_sec: params.per_minute / 60.0,
			last: Instant::now(),
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
	}

	fn take(&mut self, now: Instant) -> Decision {
		self.refill(now);
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			return Decision {
				allowed: true,
				retry_after: Duration::ZERO,
			};
		}

		let missing = 1.0 - self.tokens;
		let secs = if self.refill_per_sec > 0.0 {
			(missing / self.refill_per_sec).ceil().max(1.0)
		} else {
			60.0
		};
		Decision {
			allowed: false,
			retry_after: Duration::from_secs(secs as u64),
		}
	}

	/// `last` is only advanced on take/refill, so an untouched bucket keeps
	/// its timestamp and can be judged without mutation.
	fn is_stale(&self, now: Instant, max_idle: Duration) -> bool {
		let idle = now.duration_since(self.last);
		let refilled = (self.tokens + idle.as_secs_f64() * self.refill_per_sec).min(self.capacity);
		refilled >= self.capacity && idle >= max_idle
	}
}

/// Process-wide token-bucket limiter keyed by `(subject, action)`.
pub struct RateLimiter {
	cfg: RateLimitConfig,
	shards: Vec<Mutex<HashMap<(LimitSubject, Action), TokenBucket>>>,
}

impl RateLimiter {
	pub fn new(cfg: RateLimitConfig) -> Self {
		let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
		Self { cfg, shards }
	}

	fn shard(&self, key: &(LimitSubject, Action)) -> &Mutex<HashMap<(LimitSubject, Action), TokenBucket>> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		&self.shards[(hasher.finish() as usize) % SHARD_COUNT]
	}

	/// Take one token for `(subject, action)`.
	pub fn check(&self, subject: LimitSubject, action: Action) -> Decision {
		let key = (subject, action);
		let now = Instant::now();
		let mut shard = self.shard(&key).lock();
		let params = self.cfg.params(action);
		let bucket = shard.entry(key).or_insert_with(|| TokenBucket::new(params));
		let decision = bucket.take(now);

		if !decision.allowed {
			metrics::counter!("ripple_server_rate_limited_total", "action" => action.as_str()).increment(1);
		}

		decision
	}

	/// Drop buckets that have been full and untouched for `max_idle`.
	pub fn prune_stale(&self, max_idle: Duration) {
		let now = Instant::now();
		for shard in &self.shards {
			let mut shard = shard.lock();
			shard.retain(|_, bucket| !bucket.is_stale(now, max_idle));
		}
	}

	/// Total live buckets, for sweeps and tests.
	#[allow(dead_code)]
	pub fn bucket_count(&self) -> usize {
		self.shards.iter().map(|s| s.lock().len()).sum()
	}
}
