#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use arc_swap::ArcSwap;
use sip2_domain::TenantConfigDocument;
use tracing::{debug, info, warn};
use url::Url;

use crate::server::health::HealthState;

/// Process-wide tenant policy snapshot.
///
/// Readers get a consistent `Arc` of one document; `replace` swaps the whole
/// document atomically. Starts with an empty document.
#[derive(Debug)]
pub struct TenantConfigStore {
	current: ArcSwap<TenantConfigDocument>,
}

impl Default for TenantConfigStore {
	fn default() -> Self {
		Self::new()
	}
}

impl TenantConfigStore {
	pub fn new() -> Self {
		Self {
			current: ArcSwap::from_pointee(TenantConfigDocument::default()),
		}
	}

	pub fn get(&self) -> Arc<TenantConfigDocument> {
		self.current.load_full()
	}

	pub fn replace(&self, doc: TenantConfigDocument) {
		let tenants = doc.tenants.len();
		self.current.store(Arc::new(doc));
		metrics::counter!("sip2_gateway_tenant_config_reloads_total").increment(1);
		debug!(tenants, "tenant config replaced");
	}
}

/// Where tenant documents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantConfigSource {
	File(PathBuf),
	Http(Url),
}

impl TenantConfigSource {
	/// `http(s)://` values are URLs; anything else is a filesystem path.
	pub fn parse(s: &str) -> anyhow::Result<Self> {
		let s = s.trim();
		if s.is_empty() {
			return Err(anyhow!("tenant config source must be non-empty"));
		}
		if s.starts_with("http://") || s.starts_with("https://") {
			let url = Url::parse(s).with_context(|| format!("parse tenant config url {s}"))?;
			return Ok(Self::Http(url));
		}
		Ok(Self::File(PathBuf::from(s)))
	}

	/// Fetch and parse one document. A missing document is the empty default.
	pub async fn pull(&self, client: &reqwest::Client) -> anyhow::Result<TenantConfigDocument> {
		match self {
			TenantConfigSource::File(path) => pull_file(path).await,
			TenantConfigSource::Http(url) => pull_http(client, url).await,
		}
	}
}

async fn pull_file(path: &Path) -> anyhow::Result<TenantConfigDocument> {
	let raw = match tokio::fs::read_to_string(path).await {
		Ok(raw) => raw,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			debug!(path = %path.display(), "tenant config file not found; using empty document");
			return Ok(TenantConfigDocument::default());
		}
		Err(e) => return Err(anyhow!(e).context(format!("read tenant config {}", path.display()))),
	};

	let is_toml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
	if is_toml {
		toml::from_str(&raw).context("parse tenant config TOML")
	} else {
		parse_document(&raw)
	}
}

async fn pull_http(client: &reqwest::Client, url: &Url) -> anyhow::Result<TenantConfigDocument> {
	let resp = client
		.get(url.clone())
		.send()
		.await
		.with_context(|| format!("fetch tenant config from {url}"))?;

	if resp.status() == reqwest::StatusCode::NOT_FOUND {
		debug!(%url, "tenant config not found upstream; using empty document");
		return Ok(TenantConfigDocument::default());
	}

	let resp = resp
		.error_for_status()
		.with_context(|| format!("fetch tenant config from {url}"))?;
	let raw = resp.text().await.context("read tenant config body")?;
	parse_document(&raw)
}

/// JSON tenant document; blank input is the empty default.
pub fn parse_document(raw: &str) -> anyhow::Result<TenantConfigDocument> {
	if raw.trim().is_empty() {
		return Ok(TenantConfigDocument::default());
	}
	serde_json::from_str(raw).context("parse tenant config JSON")
}

/// Pull once and install the result. On failure the previous snapshot stays.
pub async fn refresh_once(store: &TenantConfigStore, source: &TenantConfigSource, client: &reqwest::Client) -> bool {
	match source.pull(client).await {
		Ok(doc) => {
			store.replace(doc);
			true
		}
		Err(e) => {
			metrics::counter!("sip2_gateway_tenant_config_reload_failures_total").increment(1);
			warn!(error = %format!("{e:#}"), "tenant config refresh failed; keeping previous snapshot");
			false
		}
	}
}

/// Periodically refresh `store` from `source`; marks `health` ready after the first load.
pub fn spawn_tenant_config_refresher(
	store: Arc<TenantConfigStore>,
	source: TenantConfigSource,
	interval: Duration,
	health: HealthState,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let client = reqwest::Client::new();
		// The caller has just done the initial load; the first refresh waits a full period.
		let period = interval.max(Duration::from_secs(1));
		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			if refresh_once(&store, &source, &client).await && !health.is_config_loaded() {
				health.mark_config_loaded();
				info!(tenants = store.get().tenants.len(), "tenant config loaded");
			}
		}
	})
}
