#![forbid(unsafe_code)]

mod callbacks;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use streamstats_platform::connection::{ConnectionConfig, ConnectionManager, ServeExit};
use streamstats_platform::credential::{
	Credential, CredentialPersistence, CredentialStore, FileCredentialPersistence, OAuthEndpoints, commit_credential,
	confirm_access_token,
};
use streamstats_platform::dispatch::{DispatchOptions, Dispatcher};
use streamstats_platform::helix::{HelixClient, HelixEndpoints};
use streamstats_platform::lifecycle::{SessionLifecycle, StoreRefresher};
use streamstats_platform::rest::ReqwestTransport;
use streamstats_platform::sink::StatsSink;
use streamstats_platform::stats;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::callbacks::{LoggingCallbacks, LoggingStreamControl};
use crate::config::AppConfig;

const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
	config: Option<PathBuf>,
	auth_code: Option<String>,
	redirect_uri: String,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamstats_server [--config path] [--auth-code code [--redirect-uri uri]]\n\
\n\
Options:\n\
\t--config        Config file (default: ~/.streamstats/config.toml)\n\
\t--auth-code     Exchange a one-time authorization code for tokens\n\
\t--redirect-uri  Redirect URI used when the code was issued (default: http://localhost)\n\
\t--help          Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		auth_code: None,
		redirect_uri: "http://localhost".to_string(),
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--auth-code" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--auth-code must be non-empty");
					usage_and_exit();
				}
				args.auth_code = Some(v);
			}
			"--redirect-uri" => {
				args.redirect_uri = it.next().unwrap_or_else(|| usage_and_exit());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,streamstats_server=debug,streamstats_platform=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn helix_endpoints(cfg: &AppConfig) -> anyhow::Result<HelixEndpoints> {
	match (&cfg.twitch.helix_base_url, cfg.local_test) {
		(Some(base), _) => HelixEndpoints::with_base(base),
		(None, true) => HelixEndpoints::sandbox(),
		(None, false) => HelixEndpoints::production(),
	}
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		error!(error = %e, "ctrl-c handler failed; serving until the stream ends");
		std::future::pending::<()>().await;
	}
	info!("ctrl-c received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	if cfg.overlay_enabled {
		info!(
			port = cfg.server_port,
			width = cfg.clip_player_width,
			height = cfg.clip_player_height,
			"clip overlay is served by the host"
		);
	}

	let client_id = cfg
		.twitch
		.client_id
		.clone()
		.context("twitch client_id is required ([twitch] client_id or STREAMSTATS_TWITCH_CLIENT_ID)")?;
	let client_secret = cfg.twitch.client_secret.clone().unwrap_or_default();

	let rest = Arc::new(ReqwestTransport::new()?);
	let mut store = CredentialStore::new(
		rest.clone(),
		client_id,
		client_secret,
		Credential::new("", ""),
	)?;
	if let Some(base) = &cfg.twitch.identity_base_url {
		store = store.with_endpoints(OAuthEndpoints::with_base(base)?);
	}
	let store = Arc::new(store);
	let persistence: Arc<dyn CredentialPersistence> =
		Arc::new(FileCredentialPersistence::new(crate::config::default_auth_path()?));

	let expires_in = match &args.auth_code {
		Some(code) => {
			info!("exchanging authorization code");
			store.exchange_code(code, &args.redirect_uri).await?;
			commit_credential(&store, persistence.as_ref()).await?
		}
		None => confirm_access_token(&store, persistence.as_ref()).await?,
	};

	let sink = StatsSink::open(&cfg.log_dest, cfg.local_test)?;
	info!(path = %sink.path().display(), "stats sink opened");
	sink.record("ToolVersion", &[("value", TOOL_VERSION.to_string())]);
	if let Some(identity) = store.identity() {
		sink.record("TargetUser", &[("name", identity.login), ("id", identity.user_id)]);
	}

	let helix = Arc::new(HelixClient::new(rest.clone(), helix_endpoints(&cfg)?, store.clone()));
	let host = Arc::new(LoggingCallbacks::new(cfg.notify_sound.clone()));
	let options = DispatchOptions {
		stop_stream_after_raid: cfg.stop_stream_after_raid,
		delay_to_stop: cfg.delay_to_stop,
	};
	let stats = stats::shared();
	let dispatcher = Arc::new(
		Dispatcher::new(stats.clone(), sink, helix, host.clone(), options)
			.with_stream_control(Arc::new(LoggingStreamControl::new(cfg.obs.clone()))),
	);

	let (lifecycle, rotated) = SessionLifecycle::new(Arc::new(StoreRefresher::new(store.clone(), persistence)));

	let conn_cfg = ConnectionConfig {
		sandbox: cfg.local_test,
		eventsub_ws_url: cfg.twitch.eventsub_ws_url.clone(),
		keepalive_timeout: cfg.keepalive_timeout,
		clip_watch_interval: Some(cfg.new_clip_interval).filter(|d| !d.is_zero()),
		log_raw_frames: cfg.debug,
		..ConnectionConfig::default()
	};
	let manager = ConnectionManager::new(conn_cfg, dispatcher, store, host, Arc::new(lifecycle), rotated);

	let exit = manager.serve(expires_in, shutdown_signal()).await?;
	match exit {
		ServeExit::StreamFinished => info!("stream finished"),
		ServeExit::Shutdown => info!("shut down"),
	}

	let report = stats.read().report();
	info!("session report\n{report}");
	Ok(())
}
