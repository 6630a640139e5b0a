#![forbid(unsafe_code)]

//! Periodic poll for clips created on the broadcaster's channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::helix::HelixClient;
use crate::sink::StatsSink;

pub const NEW_CLIP_LABEL: &str = "新規クリップ";

pub struct ClipWatcher {
	stop_tx: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

impl ClipWatcher {
	/// Every `interval`, log the newest clip created since the previous tick.
	/// The sink is read from `sink_rx` each time so rotation is picked up.
	pub fn spawn(
		helix: Arc<HelixClient>,
		broadcaster_id: String,
		interval: Duration,
		sink_rx: watch::Receiver<StatsSink>,
	) -> Self {
		let (stop_tx, mut stop_rx) = oneshot::channel();
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			let mut since = Utc::now();

			loop {
				tokio::select! {
					_ = &mut stop_rx => return,
					_ = ticker.tick() => {}
				}

				match helix.clips_since(&broadcaster_id, since).await {
					Ok(clips) => {
						if let Some(newest) = clips.first() {
							debug!(clip_id = %newest.id, "new clip");
							sink_rx.borrow().record(
								NEW_CLIP_LABEL,
								&[("by", newest.creator_name.clone()), ("title", newest.title.clone())],
							);
						}
					}
					Err(e) => warn!(error = %e, "clip watcher lookup failed"),
				}
				since = Utc::now();
			}
		});

		Self { stop_tx, task }
	}

	pub async fn stop(self) {
		let _ = self.stop_tx.send(());
		let _ = self.task.await;
	}
}
