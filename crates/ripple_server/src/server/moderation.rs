#![forbid(unsafe_code)]

use regex::RegexSet;

/// Why a draft was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	Empty,
	TooLong,
	BannedToken,
	SenderBanned,
	BlockedInRoom,
}

impl RejectReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			RejectReason::Empty => "empty",
			RejectReason::TooLong => "too_long",
			RejectReason::BannedToken => "banned_token",
			RejectReason::SenderBanned => "sender_banned",
			RejectReason::BlockedInRoom => "blocked_in_room",
		}
	}
}

/// Gate decision. `Transform` replaces the draft content before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Accept,
	Transform(String),
	Reject(RejectReason),
}

/// What the gate needs to know about the sender, resolved by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderContext {
	pub is_banned: bool,
	pub blocked_in_room: bool,
}

/// Synchronous pre-publish content gate. Pure with respect to its inputs;
/// no durable state is touched here.
pub struct ModerationGate {
	max_len: usize,
	banned: RegexSet,
}

impl ModerationGate {
	/// Compile the global banned-token patterns. Patterns are matched
	/// case-insensitively.
	pub fn new(max_len: usize, patterns: &[String]) -> Result<Self, regex::Error> {
		let wrapped: Vec<String> = patterns.iter().map(|p| format!("(?i){p}")).collect();
		Ok(Self {
			max_len,
			banned: RegexSet::new(wrapped)?,
		})
	}

	/// Review a draft. `room_tokens` are the room's extra banned substrings.
	pub fn review(&self, sender: SenderContext, room_tokens: &[String], content: &str) -> Verdict {
		if sender.is_banned {
			return Verdict::Reject(RejectReason::SenderBanned);
		}
		if sender.blocked_in_room {
			return Verdict::Reject(RejectReason::BlockedInRoom);
		}

		let trimmed = content.trim();
		if trimmed.is_empty() {
			return Verdict::Reject(RejectReason::Empty);
		}
		if trimmed.chars().count() > self.max_len {
			return Verdict::Reject(RejectReason::TooLong);
		}

		if self.banned.is_match(trimmed) {
			return Verdict::Reject(RejectReason::BannedToken);
		}
		if !room_tokens.is_empty() {
			let lowered = trimmed.to_lowercase();
			if room_tokens.iter().any(|t| !t.is_empty() && lowered.contains(&t.to_lowercase())) {
				return Verdict::Reject(RejectReason::BannedToken);
			}
		}

		if trimmed.len() != content.len() {
			Verdict::Transform(trimmed.to_string())
		} else {
			Verdict::Accept
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gate(max_len: usize, patterns: &[&str]) -> ModerationGate {
		let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
		ModerationGate::new(max_len, &patterns).expect("valid patterns")
	}

	#[test]
	fn accepts_plain_content() {
		let g = gate(2000, &[]);
		assert_eq!(g.review(SenderContext::default(), &[], "hello"), Verdict::Accept);
	}

	#[test]
	fn rejects_banned_pattern_case_insensitively() {
		let g = gate(2000, &["badword"]);
		assert_eq!(
			g.review(SenderContext::default(), &[], "so BadWord much"),
			Verdict::Reject(RejectReason::BannedToken)
		);
	}

	#[test]
	fn rejects_room_level_token() {
		let g = gate(2000, &[]);
		let tokens = vec!["banned_word".to_string()];
		assert_eq!(
			g.review(SenderContext::default(), &tokens, "a banned_word b"),
			Verdict::Reject(RejectReason::BannedToken)
		);
	}

	#[test]
	fn rejects_banned_sender_before_content_checks() {
		let g = gate(2000, &[]);
		let sender = SenderContext {
			is_banned: true,
			blocked_in_room: false,
		};
		assert_eq!(g.review(sender, &[], ""), Verdict::Reject(RejectReason::SenderBanned));
	}

	#[test]
	fn rejects_room_blocked_sender() {
		let g = gate(2000, &[]);
		let sender = SenderContext {
			is_banned: false,
			blocked_in_room: true,
		};
		assert_eq!(g.review(sender, &[], "hi"), Verdict::Reject(RejectReason::BlockedInRoom));
	}

	#[test]
	fn length_boundary_is_exact() {
		let g = gate(10, &[]);
		assert_eq!(g.review(SenderContext::default(), &[], &"x".repeat(10)), Verdict::Accept);
		assert_eq!(
			g.review(SenderContext::default(), &[], &"x".repeat(11)),
			Verdict::Reject(RejectReason::TooLong)
		);
	}

	#[test]
	fn length_counts_code_points_not_bytes() {
		let g = gate(4, &[]);
		// four code points, twelve bytes
		assert_eq!(g.review(SenderContext::default(), &[], "日本語だ"), Verdict::Accept);
	}

	#[test]
	fn trims_surrounding_whitespace() {
		let g = gate(2000, &[]);
		assert_eq!(
			g.review(SenderContext::default(), &[], "  hi  "),
			Verdict::Transform("hi".to_string())
		);
	}

	#[test]
	fn rejects_whitespace_only() {
		let g = gate(2000, &[]);
		assert_eq!(g.review(SenderContext::default(), &[], "   "), Verdict::Reject(RejectReason::Empty));
	}
}
