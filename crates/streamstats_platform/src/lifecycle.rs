#![forbid(unsafe_code)]

//! Proactive credential refresh.
//!
//! A background timer refreshes the access token `REFRESH_MARGIN` before it
//! expires and emits a "rotated" signal so the connection can be cycled onto
//! the new token. Failed refreshes are retried every `REFRESH_RETRY_INTERVAL`
//! forever; they never stop the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credential::{CredentialPersistence, CredentialStore, commit_credential};

pub const REFRESH_MARGIN: Duration = Duration::from_secs(120);
pub const REFRESH_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Performs one refresh and returns the new token lifetime in seconds.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
	async fn refresh(&self) -> crate::Result<u64>;
}

/// Refresh through the credential store, persist, and revalidate.
pub struct StoreRefresher {
	store: Arc<CredentialStore>,
	persistence: Arc<dyn CredentialPersistence>,
}

impl StoreRefresher {
	pub fn new(store: Arc<CredentialStore>, persistence: Arc<dyn CredentialPersistence>) -> Self {
		Self { store, persistence }
	}
}

#[async_trait]
impl TokenRefresher for StoreRefresher {
	async fn refresh(&self) -> crate::Result<u64> {
		let refresh_token = self.store.credential().refresh_token;
		self.store.refresh(&refresh_token).await?;
		commit_credential(&self.store, self.persistence.as_ref()).await
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Idle,
	Armed,
	Firing,
	RetryArmed,
	Cancelled,
}

/// Delay until the next refresh for a token that lives `expires_in` seconds.
pub fn next_refresh_delay(expires_in: u64) -> Duration {
	Duration::from_secs(expires_in).saturating_sub(REFRESH_MARGIN)
}

struct Inner {
	state: Mutex<LifecycleState>,
	refresher: Arc<dyn TokenRefresher>,
	rotated_tx: mpsc::Sender<()>,
	cancel_tx: watch::Sender<bool>,
}

impl Inner {
	fn set_state(&self, next: LifecycleState) {
		let mut state = self.state.lock();
		if *state != LifecycleState::Cancelled {
			*state = next;
		}
	}

	fn is_cancelled(&self) -> bool {
		*self.cancel_tx.borrow()
	}

	/// One refresh attempt; returns the delay before the next one.
	async fn fire(&self) -> Duration {
		self.set_state(LifecycleState::Firing);
		match self.refresher.refresh().await {
			Ok(expires_in) => {
				let delay = next_refresh_delay(expires_in);
				info!(expires_in, next_in = ?delay, "session credential refreshed");
				self.set_state(LifecycleState::Armed);
				delay
			}
			Err(e) => {
				warn!(error = %e, retry_in = ?REFRESH_RETRY_INTERVAL, "session credential refresh failed");
				self.set_state(LifecycleState::RetryArmed);
				REFRESH_RETRY_INTERVAL
			}
		}
	}
}

pub struct SessionLifecycle {
	inner: Arc<Inner>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionLifecycle {
	/// Build the manager and the receiver for its "rotated" signal.
	///
	/// The signal channel holds one slot; a pending signal absorbs later ones,
	/// so the timer never waits on the consumer.
	pub fn new(refresher: Arc<dyn TokenRefresher>) -> (Self, mpsc::Receiver<()>) {
		let (rotated_tx, rotated_rx) = mpsc::channel(1);
		let (cancel_tx, _) = watch::channel(false);
		let lifecycle = Self {
			inner: Arc::new(Inner {
				state: Mutex::new(LifecycleState::Idle),
				refresher,
				rotated_tx,
				cancel_tx,
			}),
			task: Mutex::new(None),
		};
		(lifecycle, rotated_rx)
	}

	pub fn state(&self) -> LifecycleState {
		*self.inner.state.lock()
	}

	/// Arm the refresh timer and return the delay to the first refresh.
	///
	/// A token that already expires within the margin is refreshed right away;
	/// that initial refresh does not emit "rotated" since no connection exists yet.
	pub async fn start(&self, initial_expiry_secs: u64) -> Duration {
		if self.inner.is_cancelled() {
			return Duration::ZERO;
		}

		let delay = if Duration::from_secs(initial_expiry_secs) > REFRESH_MARGIN {
			self.inner.set_state(LifecycleState::Armed);
			next_refresh_delay(initial_expiry_secs)
		} else {
			debug!(initial_expiry_secs, "credential near expiry; refreshing before arming");
			self.inner.fire().await
		};

		let inner = self.inner.clone();
		let mut cancel_rx = self.inner.cancel_tx.subscribe();
		let handle = tokio::spawn(async move {
			let mut delay = delay;
			loop {
				tokio::select! {
					_ = tokio::time::sleep(delay) => {}
					_ = cancel_rx.changed() => return,
				}
				if inner.is_cancelled() {
					return;
				}

				delay = inner.fire().await;
				if inner.is_cancelled() {
					return;
				}
				if *inner.state.lock() == LifecycleState::Armed {
					let _ = inner.rotated_tx.try_send(());
				}
			}
		});

		if let Some(old) = self.task.lock().replace(handle) {
			old.abort();
		}
		delay
	}

	/// Cancel the timer. Idempotent; nothing fires after this returns.
	pub fn shutdown(&self) {
		self.inner.cancel_tx.send_replace(true);
		*self.inner.state.lock() = LifecycleState::Cancelled;
		if let Some(handle) = self.task.lock().take() {
			handle.abort();
		}
	}
}

impl Drop for SessionLifecycle {
	fn drop(&mut self) {
		self.shutdown();
	}
}
