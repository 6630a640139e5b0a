#![forbid(unsafe_code)]


use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::{Deserialize, Serialize};
use streamstats_platform::SecretString;
use tracing::{debug, info, warn};

const APP_DIR: &str = ".streamstats";

/// Default config path: `~/.streamstats/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(APP_DIR).join("config.toml"))
}

/// Default credential path: `~/.streamstats/auth.toml`.
pub fn default_auth_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(APP_DIR).join("auth.toml"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
	/// Log every raw EventSub frame.
	pub debug: bool,
	/// Use the local EventSub test server and `local.test.txt`.
	pub local_test: bool,
	/// Directory for the stats log, stream history and raid log.
	pub log_dest: PathBuf,
	pub stop_stream_after_raid: bool,
	pub delay_to_stop: Duration,
	pub new_clip_interval: Duration,
	pub keepalive_timeout: Duration,
	/// Port of the clip overlay page served by the host.
	pub server_port: u16,
	pub overlay_enabled: bool,
	pub clip_player_width: u32,
	pub clip_player_height: u32,
	pub notify_sound: Option<PathBuf>,
	pub obs: ObsSettings,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub twitch: TwitchSettings,
}

/// Streaming-software control endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObsSettings {
	pub ip: Option<String>,
	pub port: Option<u16>,
	pub pass: Option<SecretString>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwitchSettings {
	/// Twitch App Client ID.
	pub client_id: Option<String>,
	/// Twitch App Client Secret, used for code exchange and token refresh.
	pub client_secret: Option<SecretString>,

	/// EventSub websocket URL (optional override).
	pub eventsub_ws_url: Option<String>,
	/// Helix API base URL (optional override).
	pub helix_base_url: Option<String>,
	/// OAuth identity base URL (optional override).
	pub identity_base_url: Option<String>,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct FileConfig {
	debug: Option<bool>,
	local_test: Option<bool>,
	log_dest: Option<String>,
	stop_stream_after_raid: Option<bool>,
	delay_to_stop_secs: Option<u64>,
	new_clip_interval_secs: Option<u64>,
	keepalive_timeout_secs: Option<u64>,
	server_port: Option<u16>,
	overlay_enabled: Option<bool>,
	clip_player_width: Option<u32>,
	clip_player_height: Option<u32>,
	notify_sound: Option<String>,
	obs_ip: Option<String>,
	obs_port: Option<u16>,
	obs_pass: Option<String>,
	metrics_bind: Option<String>,

	#[serde(default)]
	twitch: FileTwitchSettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	identity_base_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl AppConfig {
	fn from_file(file: FileConfig) -> Self {
		let twitch = TwitchSettings {
			client_id: non_empty(file.twitch.client_id),
			client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
			eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
			helix_base_url: non_empty(file.twitch.helix_base_url),
			identity_base_url: non_empty(file.twitch.identity_base_url),
		};

		Self {
			debug: file.debug.unwrap_or(false),
			local_test: file.local_test.unwrap_or(false),
			log_dest: non_empty(file.log_dest)
				.map(PathBuf::from)
				.unwrap_or_else(|| PathBuf::from(".")),
			stop_stream_after_raid: file.stop_stream_after_raid.unwrap_or(true),
			delay_to_stop: Duration::from_secs(file.delay_to_stop_secs.unwrap_or(180)),
			new_clip_interval: Duration::from_secs(file.new_clip_interval_secs.unwrap_or(128)),
			keepalive_timeout: Duration::from_secs(file.keepalive_timeout_secs.unwrap_or(30)),
			server_port: file.server_port.unwrap_or(8930),
			overlay_enabled: file.overlay_enabled.unwrap_or(true),
			clip_player_width: file.clip_player_width.unwrap_or(640),
			clip_player_height: file.clip_player_height.unwrap_or(480),
			notify_sound: non_empty(file.notify_sound).map(PathBuf::from),
			obs: ObsSettings {
				ip: non_empty(file.obs_ip),
				port: file.obs_port,
				pass: non_empty(file.obs_pass).map(SecretString::new),
			},
			metrics_bind: non_empty(file.metrics_bind),
			twitch,
		}
	}

	fn to_file(&self) -> FileConfig {
		FileConfig {
			debug: Some(self.debug),
			local_test: Some(self.local_test),
			log_dest: Some(self.log_dest.display().to_string()),
			stop_stream_after_raid: Some(self.stop_stream_after_raid),
			delay_to_stop_secs: Some(self.delay_to_stop.as_secs()),
			new_clip_interval_secs: Some(self.new_clip_interval.as_secs()),
			keepalive_timeout_secs: Some(self.keepalive_timeout.as_secs()),
			server_port: Some(self.server_port),
			overlay_enabled: Some(self.overlay_enabled),
			clip_player_width: Some(self.clip_player_width),
			clip_player_height: Some(self.clip_player_height),
			notify_sound: self.notify_sound.as_ref().map(|p| p.display().to_string()),
			obs_ip: self.obs.ip.clone(),
			obs_port: self.obs.port,
			obs_pass: self.obs.pass.as_ref().map(|s| s.expose().to_string()),
			metrics_bind: self.metrics_bind.clone(),
			twitch: FileTwitchSettings {
				client_id: self.twitch.client_id.clone(),
				client_secret: self.twitch.client_secret.as_ref().map(|s| s.expose().to_string()),
				eventsub_ws_url: self.twitch.eventsub_ws_url.clone(),
				helix_base_url: self.twitch.helix_base_url.clone(),
				identity_base_url: self.twitch.identity_base_url.clone(),
			},
		}
	}
}

/// Load the config at `path`, then apply `STREAMSTATS_*` env overrides.
///
/// A missing file is created with defaults. A malformed file is replaced by
/// the defaults after a warning.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
	let mut cfg = load_file_config(path)?;
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

fn load_file_config(path: &Path) -> anyhow::Result<AppConfig> {
	match read_toml_if_exists(path) {
		Ok(Some(file)) => Ok(AppConfig::from_file(file)),
		Ok(None) => {
			info!(path = %path.display(), "no config file; writing defaults");
			let cfg = AppConfig::default();
			save_config(path, &cfg)?;
			Ok(cfg)
		}
		Err(ReadError::Malformed(e)) => {
			warn!(path = %path.display(), error = ?e, "malformed config; falling back to defaults");
			let cfg = AppConfig::default();
			save_config(path, &cfg)?;
			Ok(cfg)
		}
		Err(ReadError::Io(e)) => Err(e.context(format!("read config from {}", path.display()))),
	}
}

pub fn save_config(path: &Path, cfg: &AppConfig) -> anyhow::Result<()> {
	if let Some(parent) = path.parent()
		&& !parent.as_os_str().is_empty()
	{
		fs::create_dir_all(parent).with_context(|| format!("create config dir {}", parent.display()))?;
	}
	let s = toml::to_string_pretty(&cfg.to_file()).context("serialize config")?;
	fs::write(path, s).with_context(|| format!("write config to {}", path.display()))?;
	debug!(path = %path.display(), "config saved");
	Ok(())
}

enum ReadError {
	Malformed(anyhow::Error),
	Io(anyhow::Error),
}

fn read_toml_if_exists(path: &Path) -> Result<Option<FileConfig>, ReadError> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s)
				.context("parse TOML")
				.map_err(ReadError::Malformed)?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(ReadError::Io(anyhow!(e).context("read config file"))),
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn apply_env_overrides(cfg: &mut AppConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides read through `var`, so tests need not touch the process env.
fn apply_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("STREAMSTATS_DEBUG")
		&& let Some(debug) = parse_env_bool(&v)
	{
		cfg.debug = debug;
		info!(debug = cfg.debug, "config: debug overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_LOCAL_TEST")
		&& let Some(local_test) = parse_env_bool(&v)
	{
		cfg.local_test = local_test;
		info!(local_test, "config: local_test overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_LOG_DEST") {
		cfg.log_dest = PathBuf::from(v);
		info!("config: log_dest overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_STOP_STREAM_AFTER_RAID")
		&& let Some(stop) = parse_env_bool(&v)
	{
		cfg.stop_stream_after_raid = stop;
		info!(stop, "config: stop_stream_after_raid overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_DELAY_TO_STOP_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.delay_to_stop = Duration::from_secs(secs);
		info!(secs, "config: delay_to_stop overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_NEW_CLIP_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.new_clip_interval = Duration::from_secs(secs);
		info!(secs, "config: new_clip_interval overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_KEEPALIVE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.keepalive_timeout = Duration::from_secs(secs);
		info!(secs, "config: keepalive_timeout overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("config: metrics_bind overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_OBS_IP") {
		cfg.obs.ip = Some(v);
		info!("obs config: ip overridden by env");
	}

	if let Some(v) = var("STREAMSTATS_OBS_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.obs.port = Some(port);
		info!(port, "obs config: port overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_OBS_PASS") {
		cfg.obs.pass = Some(SecretString::new(v));
		info!("obs config: pass overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		debug!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = text("STREAMSTATS_TWITCH_IDENTITY_BASE_URL") {
		cfg.twitch.identity_base_url = Some(v);
		debug!("twitch config: identity_base_url overridden by env");
	}

	if cfg.twitch.client_id.is_none() {
		warn!("twitch config: no client_id configured");
	}
}
