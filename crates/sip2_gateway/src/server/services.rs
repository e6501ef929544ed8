#![forbid(unsafe_code)]

use std::sync::Arc;

use sip2_platform::{LoginClient, PlatformClient};

use crate::server::dispatcher::{Dispatcher, HandlerMap};
use crate::server::handlers::default_handlers;
use crate::server::metrics::MetricsRegistry;
use crate::server::renderer::ResponseRenderer;
use crate::server::resolver::TenantResolverPipeline;
use crate::server::session::SessionConfig;
use crate::server::tenant_config::TenantConfigStore;
use crate::server::token_cache::TokenCache;

/// Inputs for [`GatewayServices::assemble`].
pub struct GatewayParts {
	pub session: SessionConfig,
	pub token_cache_capacity: usize,
	pub resolvers: TenantResolverPipeline,
	pub tenant_config: Arc<TenantConfigStore>,
	pub renderer: ResponseRenderer,
	pub login_client: Arc<dyn LoginClient>,
	pub platform: Arc<dyn PlatformClient>,
}

/// Process-wide shared state. Built once at startup and handed to every listener.
pub struct GatewayServices {
	session: SessionConfig,
	tenant_config: Arc<TenantConfigStore>,
	token_cache: Arc<TokenCache>,
	resolvers: Arc<TenantResolverPipeline>,
	dispatcher: Arc<Dispatcher>,
	renderer: Arc<ResponseRenderer>,
	metrics: Arc<MetricsRegistry>,
}

impl GatewayServices {
	pub fn assemble(parts: GatewayParts) -> Self {
		// Logins give up before the dispatch deadline so the terminal gets a login answer.
		let login_timeout = parts.session.upstream_timeout * 3 / 4;
		let token_cache = Arc::new(TokenCache::new(parts.token_cache_capacity, login_timeout));
		let resolvers = Arc::new(parts.resolvers);
		let handlers = default_handlers(
			Arc::clone(&resolvers),
			Arc::clone(&parts.tenant_config),
			Arc::clone(&token_cache),
			parts.login_client,
			parts.platform,
		);

		Self {
			session: parts.session,
			tenant_config: parts.tenant_config,
			token_cache,
			resolvers,
			dispatcher: Arc::new(Dispatcher::new(handlers)),
			renderer: Arc::new(parts.renderer),
			metrics: Arc::new(MetricsRegistry::new()),
		}
	}

	/// Replace the command table, keeping every shared service.
	pub fn with_handlers(mut self, handlers: HandlerMap) -> Self {
		self.dispatcher = Arc::new(Dispatcher::new(handlers));
		self
	}

	pub fn session_config(&self) -> &SessionConfig {
		&self.session
	}

	pub fn tenant_config(&self) -> &Arc<TenantConfigStore> {
		&self.tenant_config
	}

	pub fn token_cache(&self) -> &Arc<TokenCache> {
		&self.token_cache
	}

	pub fn resolvers(&self) -> &Arc<TenantResolverPipeline> {
		&self.resolvers
	}

	pub fn dispatcher(&self) -> &Arc<Dispatcher> {
		&self.dispatcher
	}

	pub fn renderer(&self) -> &ResponseRenderer {
		&self.renderer
	}

	pub fn metrics(&self) -> &Arc<MetricsRegistry> {
		&self.metrics
	}
}
