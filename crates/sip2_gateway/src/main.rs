#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use sip2_gateway::config::{ServerConfig, default_config_path, load_server_config_from_path};
use sip2_gateway::server::health::{HealthState, spawn_health_server};
use sip2_gateway::server::listener::{bind_listeners, run_listener};
use sip2_gateway::server::renderer::ResponseRenderer;
use sip2_gateway::server::resolver::build_pipeline;
use sip2_gateway::server::services::{GatewayParts, GatewayServices};
use sip2_gateway::server::tenant_config::{
	TenantConfigSource, TenantConfigStore, refresh_once, spawn_tenant_config_refresher,
};
use sip2_platform::{HttpPlatform, HttpPlatformConfig, LoginClient, PlatformClient};
use sip2_util::endpoint::parse_listen_addr;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct Args {
	listen: Vec<String>,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: sip2_gateway [--listen tcp://host:port]... [--config PATH]\n\
\n\
Options:\n\
\t--listen  Listen endpoint, repeatable (default: from config, else tcp://0.0.0.0:6443)\n\
\t         Format: tcp://host:port\n\
\t--config  Config file (default: ~/.sip2-gateway/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		listen: Vec::new(),
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--listen" | "--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--listen must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				args.listen.push(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn listen_addrs(endpoints: &[String]) -> Vec<SocketAddr> {
	endpoints
		.iter()
		.map(|raw| {
			parse_listen_addr(raw).unwrap_or_else(|e| {
				eprintln!("{e}");
				usage_and_exit();
			})
		})
		.collect()
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sip2_gateway=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("sip2_gateway");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
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

/// Initial pull, then keep the store fresh in the background.
async fn start_tenant_config(cfg: &ServerConfig, store: &Arc<TenantConfigStore>, health: &HealthState) -> anyhow::Result<()> {
	let Some(raw) = cfg.tenants.source.as_deref() else {
		warn!("tenant config: no source configured; every tenant uses the empty profile");
		health.mark_config_loaded();
		return Ok(());
	};

	let source = TenantConfigSource::parse(raw)?;
	let client = reqwest::Client::new();
	if refresh_once(store, &source, &client).await {
		health.mark_config_loaded();
		info!(source = %raw, tenants = store.get().tenants.len(), "tenant config loaded");
	}

	spawn_tenant_config_refresher(Arc::clone(store), source, cfg.tenants.refresh, health.clone());
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let mut server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded gateway config (toml + env overrides)");
	if !args.listen.is_empty() {
		server_cfg.server.listen = args.listen;
	}
	let addrs = listen_addrs(&server_cfg.server.listen);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let base_url = server_cfg
		.platform
		.base_url
		.as_deref()
		.ok_or_else(|| anyhow::anyhow!("platform.base_url is required (or SIP2_PLATFORM_BASE_URL)"))?;
	let base_url = url::Url::parse(base_url).with_context(|| format!("invalid platform base_url {base_url:?}"))?;
	let http = Arc::new(HttpPlatform::new(HttpPlatformConfig::new(base_url)));
	let login_client: Arc<dyn LoginClient> = http.clone();
	let platform: Arc<dyn PlatformClient> = http;

	let tenant_config = Arc::new(TenantConfigStore::new());
	start_tenant_config(&server_cfg, &tenant_config, &health_state).await?;

	let resolvers = build_pipeline(&server_cfg.resolvers).context("build tenant resolvers")?;
	info!(resolvers = ?resolvers, "tenant resolver pipeline ready");

	let renderer = ResponseRenderer::embedded().context("load response templates")?;

	let services = Arc::new(GatewayServices::assemble(GatewayParts {
		session: server_cfg.session_config(),
		token_cache_capacity: server_cfg.token_cache.capacity,
		resolvers,
		tenant_config,
		renderer,
		login_client,
		platform,
	}));

	let listeners = bind_listeners(&addrs).await?;
	health_state.mark_listening();

	futures::future::try_join_all(
		listeners
			.into_iter()
			.map(|listener| run_listener(listener, Arc::clone(&services))),
	)
	.await?;

	Ok(())
}
