#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use sip2_domain::{ScStationConfig, SessionSettings};
use sip2_protocol::DEFAULT_MAX_FRAME_SIZE;
use tracing::{info, warn};

use crate::server::resolver::ResolverSpec;
use crate::server::session::SessionConfig;

pub const DEFAULT_LISTEN: &str = "tcp://0.0.0.0:6443";
const DEFAULT_TOKEN_CACHE_CAPACITY: usize = 1024;

/// Default config path: `~/.sip2-gateway/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".sip2-gateway").join("config.toml"))
}

/// Load the gateway config from TOML and `SIP2_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Parse a TOML document without consulting the environment.
pub fn parse_server_config(raw: &str) -> anyhow::Result<ServerConfig> {
	let file_cfg: FileConfig = toml::from_str(raw).context("parse TOML")?;
	Ok(ServerConfig::from_file(file_cfg))
}

/// Gateway config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub platform: PlatformSettings,
	pub token_cache: TokenCacheSettings,
	pub tenants: TenantSourceSettings,
	/// Station answer used until a tenant profile overrides it.
	pub station: ScStationConfig,
	/// Wire settings used until a tenant profile overrides them.
	pub session: SessionSettings,
	pub resolvers: Vec<ResolverSpec>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoints (`tcp://host:port`); each gets its own accept loop.
	pub listen: Vec<String>,
	pub idle_timeout: Duration,
	pub upstream_timeout: Duration,
	pub max_frame_bytes: usize,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformSettings {
	/// Base URL of the upstream library platform.
	pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenCacheSettings {
	pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct TenantSourceSettings {
	/// File path or http(s) URL of the tenant configuration document.
	pub source: Option<String>,
	pub refresh: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl ServerConfig {
	/// Session limits handed to every listener.
	pub fn session_config(&self) -> SessionConfig {
		SessionConfig {
			idle_timeout: self.server.idle_timeout,
			upstream_timeout: self.server.upstream_timeout,
			max_frame_bytes: self.server.max_frame_bytes,
			default_settings: self.session.clone(),
			default_station: self.station.clone(),
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let listen: Vec<String> = file
			.server
			.listen
			.into_iter()
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();

		let defaults = ScStationConfig::default();
		let station = ScStationConfig {
			retries_allowed: file.station.retries_allowed.unwrap_or(defaults.retries_allowed),
			timeout_period: file.station.timeout_period.unwrap_or(defaults.timeout_period),
			checkin_ok: file.station.checkin_ok.unwrap_or(defaults.checkin_ok),
			checkout_ok: file.station.checkout_ok.unwrap_or(defaults.checkout_ok),
			acs_renewal_policy: file.station.acs_renewal_policy.unwrap_or(defaults.acs_renewal_policy),
			library_name: file.station.library_name.unwrap_or_default(),
			terminal_location: file.station.terminal_location.unwrap_or_default(),
		};

		let session_defaults = SessionSettings::default();
		let session = SessionSettings {
			error_detection_enabled: file
				.session
				.error_detection_enabled
				.unwrap_or(session_defaults.error_detection_enabled),
			field_delimiter: first_char(file.session.field_delimiter).unwrap_or(session_defaults.field_delimiter),
			message_delimiter: first_char(file.session.message_delimiter).unwrap_or(session_defaults.message_delimiter),
			close_on_end_session: file
				.session
				.close_on_end_session
				.unwrap_or(session_defaults.close_on_end_session),
		};

		Self {
			server: ServerSettings {
				listen: if listen.is_empty() {
					vec![DEFAULT_LISTEN.to_string()]
				} else {
					listen
				},
				idle_timeout: Duration::from_secs(file.server.idle_timeout_secs.unwrap_or(300)),
				upstream_timeout: Duration::from_secs(file.server.upstream_timeout_secs.unwrap_or(15).max(1)),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			platform: PlatformSettings {
				base_url: file.platform.base_url.filter(|s| !s.trim().is_empty()),
			},
			token_cache: TokenCacheSettings {
				capacity: file
					.token_cache
					.capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_TOKEN_CACHE_CAPACITY),
			},
			tenants: TenantSourceSettings {
				source: file.tenants.source.filter(|s| !s.trim().is_empty()),
				refresh: Duration::from_secs(file.tenants.refresh_secs.unwrap_or(60).max(1)),
			},
			station,
			session,
			resolvers: file.resolvers,
		}
	}
}

fn first_char(s: Option<String>) -> Option<char> {
	s.and_then(|s| s.chars().next())
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	platform: FilePlatformSettings,

	#[serde(default)]
	token_cache: FileTokenCacheSettings,

	#[serde(default)]
	tenants: FileTenantSourceSettings,

	#[serde(default)]
	station: FileStationSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	resolvers: Vec<ResolverSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	#[serde(default)]
	listen: Vec<String>,
	idle_timeout_secs: Option<u64>,
	upstream_timeout_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePlatformSettings {
	base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTokenCacheSettings {
	capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTenantSourceSettings {
	source: Option<String>,
	refresh_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStationSettings {
	retries_allowed: Option<u16>,
	timeout_period: Option<u16>,
	checkin_ok: Option<bool>,
	checkout_ok: Option<bool>,
	acs_renewal_policy: Option<bool>,
	library_name: Option<String>,
	terminal_location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	error_detection_enabled: Option<bool>,
	field_delimiter: Option<String>,
	message_delimiter: Option<String>,
	close_on_end_session: Option<bool>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("SIP2_LISTEN") {
		cfg.server.listen = v
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
		info!(listen = ?cfg.server.listen, "server config: listen overridden by env");
	}

	if let Some(v) = non_empty("SIP2_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.idle_timeout = Duration::from_secs(secs);
		info!(secs, "server config: idle_timeout overridden by env");
	}

	if let Some(v) = non_empty("SIP2_UPSTREAM_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.upstream_timeout = Duration::from_secs(secs.max(1));
		info!(secs, "server config: upstream_timeout overridden by env");
	}

	if let Some(v) = non_empty("SIP2_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = non_empty("SIP2_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("SIP2_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("SIP2_PLATFORM_BASE_URL") {
		cfg.platform.base_url = Some(v);
		info!("platform config: base_url overridden by env");
	}

	if let Some(v) = non_empty("SIP2_TOKEN_CACHE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.token_cache.capacity = capacity;
		info!(capacity, "token cache: capacity overridden by env");
	}

	if let Some(v) = non_empty("SIP2_TENANTS_SOURCE") {
		cfg.tenants.source = Some(v);
		info!("tenant config: source overridden by env");
	}

	if let Some(v) = non_empty("SIP2_TENANTS_REFRESH_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.tenants.refresh = Duration::from_secs(secs.max(1));
		info!(secs, "tenant config: refresh overridden by env");
	}

	if let Some(v) = non_empty("SIP2_ERROR_DETECTION")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.session.error_detection_enabled = enabled;
		info!(enabled, "session config: error_detection_enabled overridden by env");
	}

	if let Some(v) = non_empty("SIP2_CLOSE_ON_END_SESSION")
		&& let Some(close) = parse_env_bool(&v)
	{
		cfg.session.close_on_end_session = close;
		info!(close, "session config: close_on_end_session overridden by env");
	}

	if cfg.platform.base_url.is_none() {
		warn!("platform config: no base_url configured; logins will fail");
	}
	if cfg.resolvers.is_empty() {
		warn!("resolver config: no resolvers configured; every connection will be refused");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::server::resolver::{ResolvePhase, build_pipeline};

	const SAMPLE: &str = r#"
[server]
listen = ["tcp://0.0.0.0:6443", "tcp://0.0.0.0:6444"]
idle_timeout_secs = 120
metrics_bind = "127.0.0.1:9100"

[platform]
base_url = "https://okapi.example.org/"

[token_cache]
capacity = 50

[tenants]
source = "/etc/sip2/tenants.json"

[station]
checkout_ok = false
library_name = "Main"

[session]
field_delimiter = "^"

[[resolvers]]
kind = "port"
ports = { "6444" = "diku" }

[[resolvers]]
kind = "username_prefix"
separator = "/"
"#;

	#[test]
	fn missing_sections_take_defaults() {
		let cfg = parse_server_config("").unwrap();
		assert_eq!(cfg.server.listen, vec![DEFAULT_LISTEN.to_string()]);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.token_cache.capacity, DEFAULT_TOKEN_CACHE_CAPACITY);
		assert_eq!(cfg.station, ScStationConfig::default());
		assert_eq!(cfg.session, SessionSettings::default());
		assert!(cfg.resolvers.is_empty());
	}

	#[test]
	fn sample_file_is_normalized() {
		let cfg = parse_server_config(SAMPLE).unwrap();
		assert_eq!(cfg.server.listen.len(), 2);
		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(120));
		assert_eq!(cfg.token_cache.capacity, 50);
		assert!(!cfg.station.checkout_ok);
		assert!(cfg.station.checkin_ok);
		assert_eq!(cfg.station.library_name, "Main");
		assert_eq!(cfg.session.field_delimiter, '^');
		assert_eq!(cfg.session.message_delimiter, '\r');

		let pipeline = build_pipeline(&cfg.resolvers).unwrap();
		assert_eq!(pipeline.len(), 2);
		assert!(pipeline.has_phase(ResolvePhase::Login));

		let session = cfg.session_config();
		assert_eq!(session.idle_timeout, Duration::from_secs(120));
		assert_eq!(session.default_settings.field_delimiter, '^');
	}

	#[test]
	fn env_overrides_win() {
		let mut cfg = parse_server_config(SAMPLE).unwrap();
		let env: HashMap<&str, &str> = HashMap::from([
			("SIP2_LISTEN", "tcp://127.0.0.1:7000, tcp://127.0.0.1:7001"),
			("SIP2_TOKEN_CACHE_CAPACITY", "0"),
			("SIP2_ERROR_DETECTION", "off"),
			("SIP2_PLATFORM_BASE_URL", "  "),
			("SIP2_UPSTREAM_TIMEOUT_SECS", "5"),
		]);
		apply_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.listen, vec!["tcp://127.0.0.1:7000", "tcp://127.0.0.1:7001"]);
		assert_eq!(cfg.token_cache.capacity, 50);
		assert!(!cfg.session.error_detection_enabled);
		assert_eq!(cfg.platform.base_url.as_deref(), Some("https://okapi.example.org/"));
		assert_eq!(cfg.server.upstream_timeout, Duration::from_secs(5));
	}

	#[test]
	fn env_bool_forms() {
		assert_eq!(parse_env_bool(" YES "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_default() {
		let path = std::env::temp_dir().join("sip2-gateway-config-does-not-exist.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
