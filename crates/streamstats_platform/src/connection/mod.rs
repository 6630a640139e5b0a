#![forbid(unsafe_code)]

//! EventSub WebSocket connection: dial, receive loop and the outer serve loop
//! that reconnects, rotates onto refreshed credentials and shuts down.

#[cfg(test)]
mod tests;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::clips::ClipWatcher;
use crate::credential::CredentialStore;
use crate::dispatch::{Dispatcher, NotificationOutcome};
use crate::eventsub::{self, MessageType};
use crate::host::HostCallbacks;
use crate::lifecycle::SessionLifecycle;

pub const PRODUCTION_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const SANDBOX_WS_URL: &str = "ws://127.0.0.1:8080/ws";

/// Extra time past the advertised keepalive before the socket counts as dead.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionConfig {
	/// Target the local EventSub test server instead of production.
	pub sandbox: bool,
	/// Overrides both the sandbox and the production address.
	pub eventsub_ws_url: Option<String>,
	pub keepalive_timeout: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// `None` disables the clip watcher.
	pub clip_watch_interval: Option<Duration>,
	/// How long a graceful close may take on shutdown.
	pub shutdown_grace: Duration,
	/// Log every received text frame at debug level.
	pub log_raw_frames: bool,
	pub ws_connector: Option<WsConnector>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			sandbox: false,
			eventsub_ws_url: None,
			keepalive_timeout: Duration::from_secs(30),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			clip_watch_interval: Some(Duration::from_secs(128)),
			shutdown_grace: Duration::from_secs(1),
			log_raw_frames: false,
			ws_connector: None,
		}
	}
}

impl ConnectionConfig {
	/// The dial address, carrying the requested keepalive (10..=600 seconds).
	pub fn ws_url(&self) -> anyhow::Result<Url> {
		let base = match &self.eventsub_ws_url {
			Some(u) => u.as_str(),
			None if self.sandbox => SANDBOX_WS_URL,
			None => PRODUCTION_WS_URL,
		};
		let mut url = Url::parse(base).with_context(|| format!("parse eventsub ws url {base}"))?;
		let secs = self.keepalive_timeout.as_secs().clamp(10, 600);
		url.query_pairs_mut().append_pair("keepalive_timeout_seconds", &secs.to_string());
		Ok(url)
	}
}

/// Why one receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
	StreamFinished,
	ConnectionCanceled,
}

/// Why the serve loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
	StreamFinished,
	Shutdown,
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<EventSubWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

/// Dial, retrying with backoff. `None` when shutdown fired first.
async fn connect_with_backoff<S>(
	connector: &WsConnector,
	url: &Url,
	min: Duration,
	max: Duration,
	shutdown: &mut Pin<&mut S>,
) -> Option<EventSubWs>
where
	S: Future<Output = ()>,
{
	let mut attempt: u32 = 0;

	loop {
		if attempt > 0 {
			let delay = backoff_delay(attempt - 1, min, max);
			info!(delay = ?delay, attempt, "reconnecting eventsub ws");
			tokio::select! {
				_ = sleep(delay) => {}
				_ = shutdown.as_mut() => return None,
			}
		}

		tokio::select! {
			res = (connector)(url.clone()) => match res {
				Ok(ws) => return Some(ws),
				Err(e) => {
					warn!(error = ?e, url = %url, "eventsub ws connect failed");
					attempt = attempt.saturating_add(1);
				}
			},
			_ = shutdown.as_mut() => return None,
		}
	}
}

/// State one receive loop needs from its manager.
struct LoopContext<'a> {
	dispatcher: &'a Dispatcher,
	callbacks: &'a dyn HostCallbacks,
	broadcaster_id: &'a str,
	keepalive_timeout: Duration,
	shutdown_grace: Duration,
	log_raw_frames: bool,
}

pub struct ConnectionManager {
	cfg: ConnectionConfig,
	dispatcher: Arc<Dispatcher>,
	credential: Arc<CredentialStore>,
	callbacks: Arc<dyn HostCallbacks>,
	lifecycle: Arc<SessionLifecycle>,
	rotated: mpsc::Receiver<()>,
}

impl ConnectionManager {
	pub fn new(
		cfg: ConnectionConfig,
		dispatcher: Arc<Dispatcher>,
		credential: Arc<CredentialStore>,
		callbacks: Arc<dyn HostCallbacks>,
		lifecycle: Arc<SessionLifecycle>,
		rotated: mpsc::Receiver<()>,
	) -> Self {
		Self {
			cfg,
			dispatcher,
			credential,
			callbacks,
			lifecycle,
			rotated,
		}
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move { connect_eventsub_ws(url).await }) as BoxFuture<'static, anyhow::Result<EventSubWs>>
		})
	}

	/// Run until the stream ends or `shutdown` resolves.
	///
	/// `initial_expiry_secs` is the remaining lifetime of the confirmed access
	/// token and seeds the refresh timer.
	pub async fn serve<S>(mut self, initial_expiry_secs: u64, shutdown: S) -> anyhow::Result<ServeExit>
	where
		S: Future<Output = ()>,
	{
		let broadcaster_id = self
			.credential
			.broadcaster_id()
			.context("broadcaster id unknown; confirm the access token before serving")?;
		let url = self.cfg.ws_url()?;
		let connector = self.ws_connector();

		tokio::pin!(shutdown);

		let next_refresh = self.lifecycle.start(initial_expiry_secs).await;
		info!(next_refresh = ?next_refresh, "credential refresh armed");

		let watcher = self.cfg.clip_watch_interval.map(|interval| {
			ClipWatcher::spawn(
				self.dispatcher.helix().clone(),
				broadcaster_id.clone(),
				interval,
				self.dispatcher.sink_updates(),
			)
		});

		let mut first_time = true;
		let exit = loop {
			let dialed = connect_with_backoff(
				&connector,
				&url,
				self.cfg.reconnect_min_delay,
				self.cfg.reconnect_max_delay,
				&mut shutdown,
			)
			.await;
			let Some(ws) = dialed else {
				self.lifecycle.shutdown();
				break ServeExit::Shutdown;
			};
			info!(url = %url, first_time, "eventsub ws connected");

			// A rotation that landed while dialing is already reflected in this connection.
			while self.rotated.try_recv().is_ok() {
				debug!("dropping rotation signal raised before connect");
			}

			let ctx = LoopContext {
				dispatcher: self.dispatcher.as_ref(),
				callbacks: self.callbacks.as_ref(),
				broadcaster_id: &broadcaster_id,
				keepalive_timeout: self.cfg.keepalive_timeout,
				shutdown_grace: self.cfg.shutdown_grace,
				log_raw_frames: self.cfg.log_raw_frames,
			};
			let (close_tx, close_rx) = oneshot::channel();
			let receive = receive_loop(ws, ctx, first_time, close_rx);
			tokio::pin!(receive);

			let mut close_tx = Some(close_tx);
			let status = loop {
				tokio::select! {
					status = &mut receive => break Some(status),
					Some(()) = self.rotated.recv(), if close_tx.is_some() => {
						info!("credential rotated; cycling eventsub connection");
						if let Some(tx) = close_tx.take() {
							let _ = tx.send(());
						}
					}
					_ = shutdown.as_mut() => break None,
				}
			};

			let Some(status) = status else {
				info!("shutdown requested; closing eventsub ws");
				self.lifecycle.shutdown();
				if let Some(tx) = close_tx.take() {
					let _ = tx.send(());
				}
				if timeout(self.cfg.shutdown_grace, &mut receive).await.is_err() {
					debug!("eventsub ws close did not finish within grace");
				}
				break ServeExit::Shutdown;
			};

			match status {
				ExitStatus::StreamFinished => {
					info!("stream finished; leaving serve loop");
					self.lifecycle.shutdown();
					break ServeExit::StreamFinished;
				}
				ExitStatus::ConnectionCanceled => {
					metrics::counter!("streamstats_reconnects_total").increment(1);
					first_time = false;
				}
			}
		};

		if let Some(w) = watcher {
			w.stop().await;
		}
		Ok(exit)
	}
}

/// Read frames one at a time and dispatch them in arrival order.
async fn receive_loop(
	mut ws: EventSubWs,
	ctx: LoopContext<'_>,
	first_time: bool,
	mut close_rx: oneshot::Receiver<()>,
) -> ExitStatus {
	let mut keepalive = ctx.keepalive_timeout;
	let mut last_activity = Instant::now();
	let mut welcomed = false;

	loop {
		tokio::select! {
			biased;

			_ = &mut close_rx => {
				let _ = ws.send(Message::Close(None)).await;
				let drain = async { while let Some(Ok(_)) = ws.next().await {} };
				let _ = timeout(ctx.shutdown_grace, drain).await;
				return ExitStatus::ConnectionCanceled;
			}

			msg = ws.next() => {
				let msg = match msg {
					Some(Ok(m)) => m,
					Some(Err(e)) => {
						warn!(error = ?e, "eventsub ws read error");
						return ExitStatus::ConnectionCanceled;
					}
					None => {
						info!("eventsub ws ended");
						return ExitStatus::ConnectionCanceled;
					}
				};
				last_activity = Instant::now();

				match msg {
					Message::Text(t) => {
						if ctx.log_raw_frames {
							debug!(raw = %t.as_str(), "eventsub frame");
						}
						let env = match eventsub::parse_envelope(t.as_str()) {
							Ok(env) => env,
							Err(e) => {
								warn!(error = ?e, "undecodable eventsub frame");
								continue;
							}
						};

						match env.message_type {
							MessageType::Welcome => {
								let Some(session) = env.session else {
									warn!(message_id = %env.message_id, "welcome without session");
									continue;
								};
								if let Some(secs) = session.keepalive_timeout_seconds {
									keepalive = Duration::from_secs(secs);
								}
								info!(session_id = %session.id, keepalive = ?keepalive, "eventsub session welcome");

								ctx.dispatcher
									.register_subscriptions(ctx.broadcaster_id, &session.id)
									.await;

								if first_time && !welcomed {
									ctx.callbacks.on_connected();
								}
								welcomed = true;
							}
							MessageType::Keepalive => {
								debug!("eventsub keepalive");
								ctx.callbacks.on_keep_alive();
							}
							MessageType::Reconnect => {
								let reconnect_url = env.session.and_then(|s| s.reconnect_url).unwrap_or_default();
								info!(reconnect_url = %reconnect_url, "eventsub session_reconnect received; not followed");
							}
							MessageType::Notification => {
								if ctx.dispatcher.handle_notification(&env).await == NotificationOutcome::StreamFinished {
									let _ = timeout(ctx.shutdown_grace, ws.close(None)).await;
									return ExitStatus::StreamFinished;
								}
							}
							MessageType::Revocation => {
								warn!(
									subscription_type = %env.subscription_type.as_deref().unwrap_or_default(),
									"eventsub subscription revoked"
								);
							}
							MessageType::Unknown => {
								debug!(message_id = %env.message_id, "unknown eventsub message type");
							}
						}
					}
					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(c) => {
						info!(close = ?c, "eventsub ws closed by peer");
						return ExitStatus::ConnectionCanceled;
					}
					_ => {}
				}

				// Time spent in handlers is not silence on the wire.
				last_activity = Instant::now();
			}

			_ = sleep_until(last_activity + keepalive + KEEPALIVE_GRACE) => {
				warn!(keepalive = ?keepalive, "eventsub keepalive missed; reconnecting");
				return ExitStatus::ConnectionCanceled;
			}
		}
	}
}
