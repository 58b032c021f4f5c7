#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML, then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.validate();

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Trust `?user_id=` on upgrade when no secret is set. Development only.
	pub allow_insecure_user_id: bool,
	/// `join_room` requires durable room membership.
	pub join_requires_membership: bool,
	/// Inbound rate limiting: per-connection burst size (0 disables).
	pub rate_limit_burst: u32,
	/// Inbound rate limiting: per-connection envelopes per minute (0 disables).
	pub rate_limit_per_minute: u32,
	pub outbound_queue_capacity: usize,
	pub hub_command_capacity: usize,
	pub max_message_bytes: usize,
	pub pong_wait: Duration,
	pub write_wait: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			allow_insecure_user_id: false,
			join_requires_membership: false,
			rate_limit_burst: 0,
			rate_limit_per_minute: 0,
			outbound_queue_capacity: 256,
			hub_command_capacity: 4096,
			max_message_bytes: 10_000,
			pong_wait: Duration::from_secs(60),
			write_wait: Duration::from_secs(10),
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQLite store.
	pub enabled: bool,
	/// Database URL (`sqlite:` only).
	pub database_url: Option<String>,
	/// `name#tag` handles seeded into the in-memory store.
	pub seed_users: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	allow_insecure_user_id: Option<bool>,
	join_requires_membership: Option<bool>,
	rate_limit_burst: Option<u32>,
	rate_limit_per_minute: Option<u32>,
	outbound_queue_capacity: Option<usize>,
	hub_command_capacity: Option<usize>,
	max_message_bytes: Option<usize>,
	pong_wait_secs: Option<u64>,
	write_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	#[serde(default)]
	seed_users: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allow_insecure_user_id: file.server.allow_insecure_user_id.unwrap_or(false),
				join_requires_membership: file.server.join_requires_membership.unwrap_or(false),
				rate_limit_burst: file.server.rate_limit_burst.unwrap_or(0),
				rate_limit_per_minute: file.server.rate_limit_per_minute.unwrap_or(0),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.unwrap_or(defaults.outbound_queue_capacity),
				hub_command_capacity: file.server.hub_command_capacity.unwrap_or(defaults.hub_command_capacity),
				max_message_bytes: file.server.max_message_bytes.unwrap_or(defaults.max_message_bytes),
				pong_wait: file
					.server
					.pong_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.pong_wait),
				write_wait: file
					.server
					.write_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.write_wait),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				seed_users: file
					.persistence
					.seed_users
					.into_iter()
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect(),
			},
		}
	}

	/// Clamp values that would stall or disable the server.
	fn validate(&mut self) {
		let defaults = ServerSettings::default();
		let server = &mut self.server;

		if server.outbound_queue_capacity == 0 {
			warn!("server config: outbound_queue_capacity must be > 0; using default");
			server.outbound_queue_capacity = defaults.outbound_queue_capacity;
		}
		if server.hub_command_capacity == 0 {
			warn!("server config: hub_command_capacity must be > 0; using default");
			server.hub_command_capacity = defaults.hub_command_capacity;
		}
		if server.max_message_bytes == 0 {
			warn!("server config: max_message_bytes must be > 0; using default");
			server.max_message_bytes = defaults.max_message_bytes;
		}
		if server.pong_wait.is_zero() {
			warn!("server config: pong_wait_secs must be > 0; using default");
			server.pong_wait = defaults.pong_wait;
		}
		if server.write_wait.is_zero() {
			warn!("server config: write_wait_secs must be > 0; using default");
			server.write_wait = defaults.write_wait;
		}

		if server.auth_hmac_secret.is_some() && server.allow_insecure_user_id {
			warn!("server auth: allow_insecure_user_id ignored while auth_hmac_secret is set");
			server.allow_insecure_user_id = false;
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("PARLEY_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_ALLOW_INSECURE_USER_ID")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.server.allow_insecure_user_id = allow;
		info!(allow, "server auth: allow_insecure_user_id overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_JOIN_REQUIRES_MEMBERSHIP")
		&& let Some(required) = parse_env_bool(&v)
	{
		cfg.server.join_requires_membership = required;
		info!(required, "server config: join_requires_membership overridden by env");
	}

	if let Some(v) = env_string("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_burst = burst;
		info!(burst, "server config: rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_minute = rate;
		info!(rate, "server config: rate_limit_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_MESSAGE_BYTES")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.server.max_message_bytes = max;
		info!(max, "server config: max_message_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PONG_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.pong_wait = Duration::from_secs(secs);
		info!(secs, "server config: pong_wait_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_WRITE_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.write_wait = Duration::from_secs(secs);
		info!(secs, "server config: write_wait_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("PARLEY_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}
}
