#![forbid(unsafe_code)]

//! Host-side collaborators for a headless run: callbacks land in the log.

use std::path::PathBuf;

use async_trait::async_trait;
use streamstats_platform::host::{HostCallbacks, RaidNotice, StreamControl};
use tracing::{debug, info, warn};

use crate::config::ObsSettings;

pub struct LoggingCallbacks {
	notify_sound: Option<PathBuf>,
}

impl LoggingCallbacks {
	pub fn new(notify_sound: Option<PathBuf>) -> Self {
		Self { notify_sound }
	}
}

impl HostCallbacks for LoggingCallbacks {
	fn on_keep_alive(&self) {
		debug!("keepalive");
	}

	fn on_connected(&self) {
		info!("connected to eventsub");
	}

	fn on_raid(&self, notice: &RaidNotice) {
		info!(from = %notice.from, clips = notice.clips.len(), "raid received");
		for clip in &notice.clips {
			debug!(title = %clip.title, views = clip.view_count, mp4 = %clip.mp4, "raider clip");
		}
		if let Some(sound) = &self.notify_sound {
			info!(sound = %sound.display(), "raid notify sound");
		}
	}
}

/// Records the stop request; the streaming-software client lives in the host.
pub struct LoggingStreamControl {
	obs: ObsSettings,
}

impl LoggingStreamControl {
	pub fn new(obs: ObsSettings) -> Self {
		Self { obs }
	}
}

#[async_trait]
impl StreamControl for LoggingStreamControl {
	async fn stop_stream(&self) -> anyhow::Result<()> {
		match (&self.obs.ip, self.obs.port) {
			(Some(ip), Some(port)) => info!(%ip, port, "stop stream requested"),
			_ => warn!("stop stream requested but no obs address is configured"),
		}
		Ok(())
	}
}
