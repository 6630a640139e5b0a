#![forbid(unsafe_code)]

//! Error taxonomy shared by the session core.

use std::fmt;

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, StreamStatsError>;

/// Failures surfaced by the session core.
///
/// Only the serve loop decides what is fatal; every variant here is recovered
/// locally (reconnect, skip, retry) unless the caller is the startup path.
#[derive(Error, Debug)]
pub enum StreamStatsError {
	/// Dial/read/write failure on the notification transport or a REST call.
	#[error("transport error: {0}")]
	Transport(String),

	/// Credential invalid or refresh rejected by the identity provider.
	#[error("auth error: {0}")]
	Auth(String),

	/// Malformed or unexpected payload shape.
	#[error("decode error: {0}")]
	Decode(String),

	/// One subscription registration failed at welcome time.
	#[error("subscription error (type={kind}): {reason}")]
	Subscription { kind: String, reason: String },

	/// Malformed persisted config or credential file.
	#[error("config error: {0}")]
	Config(String),
}

impl StreamStatsError {
	pub fn transport(msg: impl fmt::Display) -> Self {
		Self::Transport(msg.to_string())
	}

	pub fn auth(msg: impl fmt::Display) -> Self {
		Self::Auth(msg.to_string())
	}

	pub fn decode(msg: impl fmt::Display) -> Self {
		Self::Decode(msg.to_string())
	}

	pub fn subscription(kind: impl Into<String>, reason: impl fmt::Display) -> Self {
		Self::Subscription {
			kind: kind.into(),
			reason: reason.to_string(),
		}
	}

	pub fn config(msg: impl fmt::Display) -> Self {
		Self::Config(msg.to_string())
	}

	/// Whether this error means the access credential must be refreshed.
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Auth(_))
	}
}
