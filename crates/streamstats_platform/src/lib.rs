#![forbid(unsafe_code)]

pub mod clips;
pub mod connection;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod eventsub;
pub mod helix;
pub mod host;
pub mod lifecycle;
pub mod rest;
pub mod sink;
pub mod stats;

use std::fmt;

pub use error::{Result, StreamStatsError};

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
