#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sip2_domain::{AcsTenantConfig, Command};
use sip2_platform::{LoginClient, PlatformClient, PlatformError, PlatformRequest, SecretString};
use sip2_protocol::Message;
use tracing::{info, warn};

use crate::server::context::{Credentials, SessionContext};
use crate::server::dispatcher::{CommandHandler, HandlerMap};
use crate::server::error::GatewayError;
use crate::server::resolver::{ResolveContext, ResolvePhase, TenantResolverPipeline};
use crate::server::tenant_config::TenantConfigStore;
use crate::server::token_cache::{TokenCache, TokenKey};
use crate::util::time::sip2_now;

/// Order of the `BX` supported-messages flags in the ACS status answer.
const SUPPORTED_MESSAGES_ORDER: [Command; 16] = [
	Command::PatronStatusRequest,
	Command::Checkout,
	Command::Checkin,
	Command::BlockPatron,
	Command::ScStatus,
	Command::RequestAcsResend,
	Command::Login,
	Command::PatronInformation,
	Command::EndPatronSession,
	Command::FeePaid,
	Command::ItemInformation,
	Command::ItemStatusUpdate,
	Command::PatronEnable,
	Command::Hold,
	Command::Renew,
	Command::RenewAll,
];

const PROTOCOL_VERSION: &str = "2.00";

/// `BX` flags: session-control commands are always supported.
pub fn supported_messages_flags(acs: &AcsTenantConfig) -> String {
	SUPPORTED_MESSAGES_ORDER
		.iter()
		.map(|c| if c.is_session_control() || acs.supports(*c) { 'Y' } else { 'N' })
		.collect()
}

/// `93` login: resolves the tenant if still unbound, then authenticates upstream.
pub struct LoginHandler {
	resolvers: Arc<TenantResolverPipeline>,
	tenant_config: Arc<TenantConfigStore>,
	token_cache: Arc<TokenCache>,
	login_client: Arc<dyn LoginClient>,
}

impl LoginHandler {
	pub fn new(
		resolvers: Arc<TenantResolverPipeline>,
		tenant_config: Arc<TenantConfigStore>,
		token_cache: Arc<TokenCache>,
		login_client: Arc<dyn LoginClient>,
	) -> Self {
		Self {
			resolvers,
			tenant_config,
			token_cache,
			login_client,
		}
	}
}

fn login_rejected() -> Value {
	json!({ "ok": false })
}

#[async_trait]
impl CommandHandler for LoginHandler {
	async fn handle(&self, message: &Message, ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		let login_user = message.field("CN").unwrap_or_default().trim();
		let password = SecretString::new(message.field("CO").unwrap_or_default());
		if login_user.is_empty() {
			return Err(GatewayError::missing_access_token("login without a user id").with_answer(login_rejected()));
		}

		// Tenants bound at login are resolved again on every attempt so the
		// upstream user id is rewritten the same way each time.
		let mut upstream_user = login_user.to_string();
		if ctx.tenant().is_none() || ctx.resolved_at() == Some(ResolvePhase::Login) {
			let resolve_ctx = ResolveContext {
				session_id: ctx.session_id(),
				local_port: ctx.local_port(),
				peer: ctx.peer().ip(),
				login_user: Some(login_user),
				location_code: message.field("CP"),
			};
			let resolved = self
				.resolvers
				.resolve(ResolvePhase::Login, &resolve_ctx)
				.map_err(|e| e.with_answer(login_rejected()))?;

			ctx.bind_and_configure(resolved.tenant, ResolvePhase::Login, &self.tenant_config.get())
				.map_err(|e| e.with_answer(login_rejected()))?;
			if let Some(user) = resolved.login_user {
				upstream_user = user;
			}
		}

		let Some(tenant) = ctx.tenant().cloned() else {
			return Err(GatewayError::tenant_not_resolved(ctx.session_id()).with_answer(login_rejected()));
		};

		match self
			.token_cache
			.get_or_authenticate(&tenant, &upstream_user, &password, self.login_client.as_ref())
			.await
		{
			Ok(_) => {
				info!(session_id = %ctx.session_id(), %tenant, user = %upstream_user, "terminal logged in");
				metrics::counter!("sip2_gateway_logins_total", "outcome" => "ok").increment(1);
				ctx.authenticate(Credentials {
					user: upstream_user,
					password,
				});
				Ok(json!({ "ok": true }))
			}
			Err(e) => {
				warn!(session_id = %ctx.session_id(), %tenant, user = %upstream_user, error = %e, "terminal login rejected");
				metrics::counter!("sip2_gateway_logins_total", "outcome" => "rejected").increment(1);
				Err(GatewayError::missing_access_token(format!("login for {upstream_user} failed: {e}"))
					.with_answer(login_rejected()))
			}
		}
	}
}

/// `99` SC status: answers from tenant policy and station settings, no upstream call.
pub struct ScStatusHandler {
	tenant_config: Arc<TenantConfigStore>,
}

impl ScStatusHandler {
	pub fn new(tenant_config: Arc<TenantConfigStore>) -> Self {
		Self { tenant_config }
	}
}

#[async_trait]
impl CommandHandler for ScStatusHandler {
	async fn handle(&self, _message: &Message, ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		let tenant = ctx
			.tenant()
			.cloned()
			.ok_or_else(|| GatewayError::tenant_not_resolved(ctx.session_id()))?;
		let doc = self.tenant_config.get();
		let acs = &doc.profile(&tenant).acs;
		let station = ctx.station();

		Ok(json!({
			"online_status": true,
			"checkin_ok": station.checkin_ok,
			"checkout_ok": station.checkout_ok,
			"acs_renewal_policy": station.acs_renewal_policy,
			"status_update_ok": acs.status_update_ok,
			"offline_ok": acs.offline_ok,
			"timeout_period": station.timeout_period,
			"retries_allowed": station.retries_allowed,
			"date_time_sync": sip2_now(),
			"protocol_version": PROTOCOL_VERSION,
			"institution_id": tenant.as_str(),
			"library_name": station.library_name,
			"supported_messages": supported_messages_flags(acs),
			"terminal_location": station.terminal_location,
		}))
	}
}

/// Forwards a business command to the platform and returns its answer as the model.
pub struct PlatformHandler {
	token_cache: Arc<TokenCache>,
	login_client: Arc<dyn LoginClient>,
	platform: Arc<dyn PlatformClient>,
}

impl PlatformHandler {
	pub fn new(token_cache: Arc<TokenCache>, login_client: Arc<dyn LoginClient>, platform: Arc<dyn PlatformClient>) -> Self {
		Self {
			token_cache,
			login_client,
			platform,
		}
	}
}

#[async_trait]
impl CommandHandler for PlatformHandler {
	async fn handle(&self, message: &Message, ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		let command = message
			.command
			.ok_or_else(|| GatewayError::unrecognized(&message.code))?;
		let tenant = ctx
			.tenant()
			.cloned()
			.ok_or_else(|| GatewayError::tenant_not_resolved(ctx.session_id()))?;
		let credentials = ctx
			.credentials()
			.cloned()
			.ok_or_else(|| GatewayError::missing_access_token("session has no login credentials"))?;

		let token = self
			.token_cache
			.get_or_authenticate(&tenant, &credentials.user, &credentials.password, self.login_client.as_ref())
			.await
			.map_err(|e| GatewayError::missing_access_token(format!("re-authentication failed: {e}")))?;

		let request = PlatformRequest {
			tenant: tenant.clone(),
			access_token: token.token,
			command,
			payload: json!({
				"sessionId": ctx.session_id(),
				"message": message,
				"station": ctx.station(),
			}),
		};

		match self.platform.execute(request).await {
			Ok(answer) => Ok(with_defaults(command, message, answer)),
			Err(PlatformError::Unauthorized) => {
				self.token_cache.invalidate(&TokenKey::new(tenant, credentials.user));
				Err(GatewayError::missing_access_token("platform rejected the access token"))
			}
			Err(e) => Err(GatewayError::upstream(&e)),
		}
	}
}

fn put(map: &mut Map<String, Value>, key: &str, value: impl Into<Value>) {
	map.insert(key.to_string(), value.into());
}

/// Request-derived defaults overlaid by the platform answer.
pub fn with_defaults(command: Command, message: &Message, answer: Value) -> Value {
	let mut model = Map::new();
	put(&mut model, "ok", false);
	put(&mut model, "transaction_date", sip2_now());
	put(&mut model, "institution_id", message.field("AO").unwrap_or_default());
	put(&mut model, "language", message.fixed("language").unwrap_or("000"));
	put(&mut model, "patron_status", " ".repeat(14));
	put(&mut model, "personal_name", "");
	put(&mut model, "title_identifier", "");
	put(&mut model, "due_date", "");
	put(&mut model, "permanent_location", "");
	if let Some(patron) = message.field("AA") {
		put(&mut model, "patron_identifier", patron);
	}
	if let Some(item) = message.field("AB") {
		put(&mut model, "item_identifier", item);
	}

	match command {
		Command::Checkout | Command::Renew => {
			put(&mut model, "renewal_ok", false);
			put(&mut model, "magnetic_media", "U");
			put(&mut model, "desensitize", "U");
		}
		Command::Checkin => {
			put(&mut model, "resensitize", "U");
			put(&mut model, "magnetic_media", "U");
			put(&mut model, "alert", false);
		}
		Command::PatronInformation => {
			for count in [
				"hold_items_count",
				"overdue_items_count",
				"charged_items_count",
				"fine_items_count",
				"recall_items_count",
				"unavailable_holds_count",
			] {
				put(&mut model, count, 0);
			}
		}
		Command::EndPatronSession => put(&mut model, "end_session", true),
		Command::FeePaid => put(&mut model, "payment_accepted", false),
		Command::Hold => put(&mut model, "available", false),
		Command::ItemInformation => {
			put(&mut model, "circulation_status", "01");
			put(&mut model, "security_marker", "00");
			put(&mut model, "fee_type", "01");
		}
		Command::ItemStatusUpdate => put(&mut model, "item_properties_ok", false),
		Command::RenewAll => {
			put(&mut model, "renewed_count", 0);
			put(&mut model, "unrenewed_count", 0);
		}
		_ => {}
	}

	match answer {
		Value::Object(answer) => model.extend(answer),
		Value::Null => {}
		other => put(&mut model, "result", other),
	}
	Value::Object(model)
}

/// The stock command table: login, SC status, and every business command forwarded to the platform.
pub fn default_handlers(
	resolvers: Arc<TenantResolverPipeline>,
	tenant_config: Arc<TenantConfigStore>,
	token_cache: Arc<TokenCache>,
	login_client: Arc<dyn LoginClient>,
	platform: Arc<dyn PlatformClient>,
) -> HandlerMap {
	let mut handlers = HandlerMap::new();
	handlers.insert(
		Command::Login,
		Arc::new(LoginHandler::new(
			resolvers,
			Arc::clone(&tenant_config),
			Arc::clone(&token_cache),
			Arc::clone(&login_client),
		)),
	);
	handlers.insert(Command::ScStatus, Arc::new(ScStatusHandler::new(tenant_config)));

	let forward: Arc<dyn CommandHandler> = Arc::new(PlatformHandler::new(token_cache, login_client, platform));
	for command in Command::ALL {
		if !command.is_session_control() {
			handlers.insert(command, Arc::clone(&forward));
		}
	}
	handlers
}
