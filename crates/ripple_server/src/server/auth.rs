#![forbid(unsafe_code)]

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use ripple_domain::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

/// Claims carried by a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
	pub user_id: UserId,
	pub username: String,
	pub roles: Vec<String>,

	/// Opaque per-login session id; a second live connection presenting the
	/// same value evicts the first (close code 4007).
	pub session_id: String,

	pub expires_at: u64,
}

/// Token verification failures, mapped to close codes at the transport edge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("malformed token")]
	Malformed,
	#[error("invalid token signature")]
	InvalidSignature,
	#[error("token expired")]
	Expired,
	#[error("token revoked")]
	Revoked,
}

/// Validates bearer tokens. Idempotent and side-effect free from the hub's
/// point of view.
pub trait TokenVerifier: Send + Sync {
	fn verify(&self, bearer: &str) -> Result<TokenClaims, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WireClaims {
	sub: i64,
	name: String,

	#[serde(default)]
	roles: Vec<String>,

	sid: String,
	exp: u64,
}

/// HMAC-SHA256 verifier for `v1.<payload_b64>.<sig_b64>` tokens, with an
/// in-memory revocation set for kicked logins.
pub struct HmacTokenVerifier {
	secret: SecretString,
	revoked: RwLock<HashSet<String>>,
}

impl HmacTokenVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self {
			secret,
			revoked: RwLock::new(HashSet::new()),
		}
	}

	/// Revoke every token carrying this `sid` claim.
	pub fn revoke(&self, session_id: &str) {
		self.revoked.write().insert(session_id.to_string());
	}
}

impl TokenVerifier for HmacTokenVerifier {
	fn verify(&self, bearer: &str) -> Result<TokenClaims, AuthError> {
		let parts = bearer.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(AuthError::Malformed);
		}

		let payload_b64 = parts[1];
		let sig_b64 = parts[2];

		let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
		let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(AuthError::InvalidSignature);
		}

		let claims: WireClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
		if claims.exp <= unix_secs_now() as u64 {
			return Err(AuthError::Expired);
		}
		if self.revoked.read().contains(&claims.sid) {
			return Err(AuthError::Revoked);
		}

		Ok(TokenClaims {
			user_id: UserId(claims.sub),
			username: claims.name,
			roles: claims.roles,
			session_id: claims.sid,
			expires_at: claims.exp,
		})
	}
}

/// Mint a token the verifier accepts. Used by ops tooling and tests.
#[allow(dead_code)]
pub fn mint_token(secret: &str, claims: &TokenClaims) -> String {
	let wire = WireClaims {
		sub: claims.user_id.as_i64(),
		name: claims.username.clone(),
		roles: claims.roles.clone(),
		sid: claims.session_id.clone(),
		exp: claims.expires_at,
	};

	let payload = serde_json::to_vec(&wire).expect("serialize claims");
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(sid: &str, exp: u64) -> TokenClaims {
		TokenClaims {
			user_id: UserId(7),
			username: "alice".to_string(),
			roles: vec!["user".to_string()],
			session_id: sid.to_string(),
			expires_at: exp,
		}
	}

	#[test]
	fn verifies_minted_token() {
		let verifier = HmacTokenVerifier::new(SecretString::new("s3cret"));
		let token = mint_token("s3cret", &claims("sid-1", unix_secs_now() as u64 + 60));

		let got = verifier.verify(&token).expect("valid token");
		assert_eq!(got.user_id, UserId(7));
		assert_eq!(got.username, "alice");
		assert_eq!(got.session_id, "sid-1");
	}

	#[test]
	fn rejects_wrong_secret() {
		let verifier = HmacTokenVerifier::new(SecretString::new("s3cret"));
		let token = mint_token("other", &claims("sid-1", unix_secs_now() as u64 + 60));
		assert_eq!(verifier.verify(&token), Err(AuthError::InvalidSignature));
	}

	#[test]
	fn rejects_expired_token() {
		let verifier = HmacTokenVerifier::new(SecretString::new("s3cret"));
		let token = mint_token("s3cret", &claims("sid-1", 1));
		assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
	}

	#[test]
	fn rejects_garbage() {
		let verifier = HmacTokenVerifier::new(SecretString::new("s3cret"));
		assert_eq!(verifier.verify("not-a-token"), Err(AuthError::Malformed));
		assert_eq!(verifier.verify("v1.only-two"), Err(AuthError::Malformed));
		assert_eq!(verifier.verify("v2.a.b"), Err(AuthError::Malformed));
	}

	#[test]
	fn rejects_revoked_session() {
		let verifier = HmacTokenVerifier::new(SecretString::new("s3cret"));
		let token = mint_token("s3cret", &claims("sid-9", unix_secs_now() as u64 + 60));
		verifier.revoke("sid-9");
		assert_eq!(verifier.verify(&token), Err(AuthError::Revoked));
	}
}
