#![forbid(unsafe_code)]

//! Contracts between the session core and the host application.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct UserClip {
	pub id: String,
	pub url: String,
	pub title: String,
	pub thumbnail: String,
	pub view_count: u64,
	pub duration: f32,
	pub mp4: String,
}

/// An incoming raid and the raider's recent clips.
#[derive(Debug, Clone, PartialEq)]
pub struct RaidNotice {
	pub from: String,
	pub clips: Vec<UserClip>,
}

/// Host-visible signals. None of them report errors.
pub trait HostCallbacks: Send + Sync {
	fn on_keep_alive(&self) {}

	/// Fires on the first welcome of the process only, not on reconnects.
	fn on_connected(&self) {}

	fn on_raid(&self, _notice: &RaidNotice) {}
}

/// Host with no interest in callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl HostCallbacks for NoopCallbacks {}

/// Streaming-software control, used to end the stream after an outgoing raid.
#[async_trait]
pub trait StreamControl: Send + Sync {
	async fn stop_stream(&self) -> anyhow::Result<()>;
}
