#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{ConnectionConfig, ConnectionManager, ServeExit, backoff_delay};
use crate::SecretString;
use crate::credential::{Credential, CredentialStore};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::helix::{HelixClient, HelixEndpoints};
use crate::host::testing::RecordingHost;
use crate::lifecycle::{LifecycleState, SessionLifecycle, TokenRefresher};
use crate::rest::RestBody;
use crate::rest::testing::RecordingTransport;
use crate::sink::StatsSink;
use crate::stats;

struct FixedRefresher;

#[async_trait]
impl TokenRefresher for FixedRefresher {
	async fn refresh(&self) -> crate::Result<u64> {
		Ok(3600)
	}
}

struct Harness {
	transport: Arc<RecordingTransport>,
	host: Arc<RecordingHost>,
	stats: stats::SharedStats,
	lifecycle: Arc<SessionLifecycle>,
	rotated_tx: mpsc::Sender<()>,
	manager: Option<ConnectionManager>,
	dir: PathBuf,
}

impl Drop for Harness {
	fn drop(&mut self) {
		let _ = std::fs::remove_dir_all(&self.dir);
	}
}

async fn harness(name: &str, ws_url: String) -> Harness {
	let dir = std::env::temp_dir().join(format!("streamstats-conn-{}-{}", name, std::process::id()));
	let _ = std::fs::remove_dir_all(&dir);

	let transport = Arc::new(RecordingTransport::new());
	transport.push(200, r#"{"client_id":"cid","login":"streamer","user_id":"42","expires_in":3600}"#);
	let store = Arc::new(
		CredentialStore::new(transport.clone(), "cid", SecretString::new("s"), Credential::new("a", "r"))
			.expect("store"),
	);
	store.validate().await.expect("validate");

	let helix = Arc::new(HelixClient::new(
		transport.clone(),
		HelixEndpoints::production().expect("endpoints"),
		store.clone(),
	));
	let host = Arc::new(RecordingHost::default());
	let sink = StatsSink::open(&dir, true).expect("sink");
	let stats = stats::shared();
	let dispatcher = Arc::new(Dispatcher::new(
		stats.clone(),
		sink,
		helix,
		host.clone(),
		DispatchOptions::default(),
	));

	let (lifecycle, _lifecycle_rx) = SessionLifecycle::new(Arc::new(FixedRefresher));
	let lifecycle = Arc::new(lifecycle);
	let (rotated_tx, rotated_rx) = mpsc::channel(1);

	let cfg = ConnectionConfig {
		eventsub_ws_url: Some(ws_url),
		reconnect_min_delay: Duration::from_millis(10),
		reconnect_max_delay: Duration::from_millis(50),
		clip_watch_interval: None,
		..ConnectionConfig::default()
	};
	let manager = ConnectionManager::new(cfg, dispatcher, store, host.clone(), lifecycle.clone(), rotated_rx);

	Harness {
		transport,
		host,
		stats,
		lifecycle,
		rotated_tx,
		manager: Some(manager),
		dir,
	}
}

fn welcome(session_id: &str) -> Message {
	welcome_with_keepalive(session_id, 30)
}

fn welcome_with_keepalive(session_id: &str, keepalive_secs: u64) -> Message {
	Message::Text(
		serde_json::json!({
			"metadata": {"message_id": format!("w-{session_id}"), "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z"},
			"payload": {"session": {"id": session_id, "status": "connected", "keepalive_timeout_seconds": keepalive_secs, "reconnect_url": null}}
		})
		.to_string()
		.into(),
	)
}

fn keepalive() -> Message {
	Message::Text(
		serde_json::json!({
			"metadata": {"message_id": "k-1", "message_type": "session_keepalive", "message_timestamp": "2024-01-01T00:00:01Z"},
			"payload": {}
		})
		.to_string()
		.into(),
	)
}

fn session_reconnect() -> Message {
	Message::Text(
		serde_json::json!({
			"metadata": {"message_id": "r-1", "message_type": "session_reconnect", "message_timestamp": "2024-01-01T00:00:02Z"},
			"payload": {"session": {"id": "S1", "status": "reconnecting", "keepalive_timeout_seconds": null, "reconnect_url": "wss://eventsub.wss.twitch.tv/ws?reconnect=1"}}
		})
		.to_string()
		.into(),
	)
}

fn revocation() -> Message {
	Message::Text(
		serde_json::json!({
			"metadata": {"message_id": "v-1", "message_type": "revocation", "message_timestamp": "2024-01-01T00:00:03Z", "subscription_type": "channel.follow", "subscription_version": "2"},
			"payload": {"subscription": {"id": "sub-follow", "type": "channel.follow", "version": "2", "status": "authorization_revoked"}}
		})
		.to_string()
		.into(),
	)
}

fn offline() -> Message {
	Message::Text(
		serde_json::json!({
			"metadata": {"message_id": "n-off", "message_type": "notification", "message_timestamp": "2024-01-01T00:00:00Z", "subscription_type": "stream.offline", "subscription_version": "1"},
			"payload": {
				"subscription": {"id": "sub-off", "type": "stream.offline", "version": "1"},
				"event": {"broadcaster_user_id": "42", "broadcaster_user_login": "streamer", "broadcaster_user_name": "Streamer"}
			}
		})
		.to_string()
		.into(),
	)
}

async fn listen() -> (TcpListener, String) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");
	(listener, format!("ws://{addr}/ws"))
}

/// Session ids carried by the subscription-creation requests, in order.
fn subscribed_sessions(t: &RecordingTransport) -> Vec<String> {
	t.requests()
		.into_iter()
		.filter(|r| r.url.path().ends_with("/eventsub/subscriptions"))
		.filter_map(|r| match r.body {
			Some(RestBody::Json(bytes)) => {
				let v: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
				v["transport"]["session_id"].as_str().map(str::to_string)
			}
			_ => None,
		})
		.collect()
}

async fn never() {
	std::future::pending::<()>().await
}

#[test]
fn ws_url_selects_address_and_keepalive() {
	let cfg = ConnectionConfig::default();
	assert_eq!(
		cfg.ws_url().unwrap().as_str(),
		"wss://eventsub.wss.twitch.tv/ws?keepalive_timeout_seconds=30"
	);

	let cfg = ConnectionConfig {
		sandbox: true,
		keepalive_timeout: Duration::from_secs(2),
		..ConnectionConfig::default()
	};
	assert_eq!(cfg.ws_url().unwrap().as_str(), "ws://127.0.0.1:8080/ws?keepalive_timeout_seconds=10");

	let cfg = ConnectionConfig {
		sandbox: true,
		eventsub_ws_url: Some("ws://localhost:9000/eventsub".into()),
		..ConnectionConfig::default()
	};
	assert_eq!(
		cfg.ws_url().unwrap().as_str(),
		"ws://localhost:9000/eventsub?keepalive_timeout_seconds=30"
	);
}

#[test]
fn backoff_doubles_up_to_max() {
	let min = Duration::from_millis(500);
	let max = Duration::from_secs(30);
	assert_eq!(backoff_delay(0, min, max), min);
	assert_eq!(backoff_delay(1, min, max), Duration::from_secs(1));
	assert_eq!(backoff_delay(3, min, max), Duration::from_secs(4));
	assert_eq!(backoff_delay(40, min, max), max);
}

#[tokio::test]
async fn stream_offline_ends_serving() {
	let (listener, url) = listen().await;
	let server = tokio::spawn(async move {
		let (tcp, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S1")).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(msg)) = ws.next().await {
			if msg.is_close() {
				break;
			}
		}
	});

	let mut h = harness("offline", url).await;
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(Duration::from_secs(10), manager.serve(3600, never()))
		.await
		.expect("serve finished in time")
		.unwrap();

	assert_eq!(exit, ServeExit::StreamFinished);
	assert_eq!(h.host.connected(), 1);
	assert_eq!(h.lifecycle.state(), LifecycleState::Cancelled);

	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 11);
	assert!(sessions.iter().all(|s| s == "S1"));
	let _ = server.await;
}

#[tokio::test]
async fn dropped_connection_reconnects_without_second_connected_callback() {
	let (listener, url) = listen().await;
	let server = tokio::spawn(async move {
		{
			let (tcp, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
			ws.send(welcome("S1")).await.expect("send welcome");
			let _ = ws.close(None).await;
		}

		let (tcp, _) = listener.accept().await.expect("accept again");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S2")).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("reconnect", url).await;
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(Duration::from_secs(10), manager.serve(3600, never()))
		.await
		.expect("serve finished in time")
		.unwrap();

	assert_eq!(exit, ServeExit::StreamFinished);
	assert_eq!(h.host.connected(), 1);

	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 22);
	assert!(sessions[..11].iter().all(|s| s == "S1"));
	assert!(sessions[11..].iter().all(|s| s == "S2"));
	let _ = server.await;
}

#[tokio::test]
async fn rotation_cycles_the_connection() {
	let (listener, url) = listen().await;
	let (closed_tx, closed_rx) = oneshot::channel::<bool>();
	let server = tokio::spawn(async move {
		{
			let (tcp, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
			ws.send(welcome("S1")).await.expect("send welcome");
			let mut saw_close = false;
			while let Some(Ok(msg)) = ws.next().await {
				if msg.is_close() {
					saw_close = true;
					break;
				}
			}
			let _ = closed_tx.send(saw_close);
		}

		let (tcp, _) = listener.accept().await.expect("accept again");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S2")).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("rotate", url).await;
	let manager = h.manager.take().unwrap();
	let serving = tokio::spawn(manager.serve(3600, never()));

	for _ in 0..200 {
		if h.host.connected() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	h.rotated_tx.send(()).await.unwrap();

	let exit = tokio::time::timeout(Duration::from_secs(10), serving)
		.await
		.expect("serve finished in time")
		.unwrap()
		.unwrap();
	assert_eq!(exit, ServeExit::StreamFinished);
	assert!(closed_rx.await.unwrap());
	assert_eq!(h.host.connected(), 1);
	assert_eq!(subscribed_sessions(&h.transport).last().map(String::as_str), Some("S2"));
	let _ = server.await;
}

#[tokio::test]
async fn shutdown_returns_within_grace() {
	let (listener, url) = listen().await;
	let server = tokio::spawn(async move {
		let (tcp, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S1")).await.expect("send welcome");
		while let Some(Ok(msg)) = ws.next().await {
			if msg.is_close() {
				break;
			}
		}
	});

	let mut h = harness("shutdown", url).await;
	let manager = h.manager.take().unwrap();
	let (stop_tx, stop_rx) = oneshot::channel::<()>();
	let serving = tokio::spawn(manager.serve(3600, async move {
		let _ = stop_rx.await;
	}));

	for _ in 0..200 {
		if h.host.connected() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	stop_tx.send(()).unwrap();

	let exit = tokio::time::timeout(Duration::from_secs(5), serving)
		.await
		.expect("serve finished in time")
		.unwrap()
		.unwrap();
	assert_eq!(exit, ServeExit::Shutdown);
	assert_eq!(h.lifecycle.state(), LifecycleState::Cancelled);
	let _ = server.await;
}

#[tokio::test]
async fn unreachable_server_still_honours_shutdown() {
	let (listener, url) = listen().await;
	drop(listener);

	let mut h = harness("unreachable", url).await;
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(
		Duration::from_secs(5),
		manager.serve(3600, tokio::time::sleep(Duration::from_millis(200))),
	)
	.await
	.expect("serve finished in time")
	.unwrap();

	assert_eq!(exit, ServeExit::Shutdown);
	assert_eq!(h.host.connected(), 0);
}

#[tokio::test]
async fn keepalive_ping_and_silence() {
	let (listener, url) = listen().await;
	let (pong_tx, pong_rx) = oneshot::channel::<bool>();
	let server = tokio::spawn(async move {
		{
			let (tcp, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
			ws.send(welcome_with_keepalive("S1", 1)).await.expect("send welcome");
			ws.send(keepalive()).await.expect("send keepalive");
			ws.send(Message::Ping(b"hb".to_vec().into())).await.expect("send ping");

			let pong = async {
				while let Some(Ok(msg)) = ws.next().await {
					if let Message::Pong(p) = msg {
						return p.as_ref() == b"hb";
					}
				}
				false
			};
			let got = tokio::time::timeout(Duration::from_secs(5), pong).await.unwrap_or(false);
			let _ = pong_tx.send(got);

			// Silent until the client gives up on this session.
			while let Some(Ok(_)) = ws.next().await {}
		}

		let (tcp, _) = listener.accept().await.expect("accept again");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S2")).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("keepalive", url).await;
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(Duration::from_secs(15), manager.serve(3600, never()))
		.await
		.expect("serve finished in time")
		.unwrap();

	assert_eq!(exit, ServeExit::StreamFinished);
	assert!(pong_rx.await.unwrap());
	assert_eq!(h.host.keep_alives.load(Ordering::SeqCst), 1);
	assert_eq!(h.host.connected(), 1);

	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 22);
	assert!(sessions[..11].iter().all(|s| s == "S1"));
	assert!(sessions[11..].iter().all(|s| s == "S2"));
	let _ = server.await;
}

#[tokio::test]
async fn reconnect_and_revocation_frames_change_nothing() {
	let (listener, url) = listen().await;
	let server = tokio::spawn(async move {
		let (tcp, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S1")).await.expect("send welcome");
		ws.send(session_reconnect()).await.expect("send reconnect");
		ws.send(revocation()).await.expect("send revocation");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("revocation", url).await;
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(Duration::from_secs(10), manager.serve(3600, never()))
		.await
		.expect("serve finished in time")
		.unwrap();

	assert_eq!(exit, ServeExit::StreamFinished);
	assert_eq!(h.host.connected(), 1);

	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 11);
	assert!(sessions.iter().all(|s| s == "S1"));

	let stats = h.stats.read();
	assert!(stats.follows().is_empty());
	assert_eq!(stats.n_chats(), 0);
	assert_eq!(stats.raid_result(), (0, 0));
	assert!(stats.subscribed().is_empty());
	drop(stats);
	let _ = server.await;
}

#[tokio::test]
async fn slow_welcome_handling_does_not_trip_the_watchdog() {
	let (listener, url) = listen().await;
	let server = tokio::spawn(async move {
		let (tcp, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome_with_keepalive("S1", 1)).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("slow-handler", url).await;
	// 11 registrations take longer than keepalive plus grace.
	h.transport.set_latency(Duration::from_millis(600));
	let manager = h.manager.take().unwrap();
	let exit = tokio::time::timeout(Duration::from_secs(15), manager.serve(3600, never()))
		.await
		.expect("serve finished in time")
		.unwrap();

	assert_eq!(exit, ServeExit::StreamFinished);
	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 11);
	assert!(sessions.iter().all(|s| s == "S1"));
	let _ = server.await;
}

#[tokio::test]
async fn rotation_raised_while_dialing_is_dropped() {
	let (listener, url) = listen().await;
	let (gate_tx, gate_rx) = oneshot::channel::<()>();
	let server = tokio::spawn(async move {
		let _ = gate_rx.await;
		let (tcp, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
		ws.send(welcome("S1")).await.expect("send welcome");
		ws.send(offline()).await.expect("send offline");
		while let Some(Ok(_)) = ws.next().await {}
	});

	let mut h = harness("rotate-dialing", url).await;
	let manager = h.manager.take().unwrap();
	let serving = tokio::spawn(manager.serve(3600, never()));

	// The handshake is pending until the server accepts.
	tokio::time::sleep(Duration::from_millis(200)).await;
	h.rotated_tx.send(()).await.unwrap();
	gate_tx.send(()).unwrap();

	let exit = tokio::time::timeout(Duration::from_secs(10), serving)
		.await
		.expect("serve finished in time")
		.unwrap()
		.unwrap();
	assert_eq!(exit, ServeExit::StreamFinished);

	let sessions = subscribed_sessions(&h.transport);
	assert_eq!(sessions.len(), 11);
	assert!(sessions.iter().all(|s| s == "S1"));
	let _ = server.await;
}
