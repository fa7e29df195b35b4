#![forbid(unsafe_code)]

use core::fmt;

/// A string that must not leak into logs. `Debug` and `Display` redact.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Access the underlying secret.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(***)")
	}
}

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Self(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn debug_output_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(***)");
		assert_eq!(s.expose(), "hunter2");
	}
}
