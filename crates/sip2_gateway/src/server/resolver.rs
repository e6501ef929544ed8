#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use sip2_domain::{SessionId, TenantId};
use sip2_util::cidr::Cidr;
use tracing::debug;

use crate::server::error::GatewayError;

/// When a resolver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePhase {
	/// Right after accept, before any bytes are read.
	Connect,
	/// On the SIP2 login message (only if no tenant was bound at connect).
	Login,
}

/// Facts available to resolvers.
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
	pub session_id: SessionId,
	pub local_port: u16,
	pub peer: IpAddr,
	/// Login user id (`CN`); only set in the login phase.
	pub login_user: Option<&'a str>,
	/// Login location code (`CP`); only set in the login phase.
	pub location_code: Option<&'a str>,
}

/// A resolved tenant, plus the upstream user when the resolver rewrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant {
	pub tenant: TenantId,
	pub login_user: Option<String>,
}

impl ResolvedTenant {
	pub fn tenant(tenant: TenantId) -> Self {
		Self {
			tenant,
			login_user: None,
		}
	}
}

/// One tenant-resolution strategy. `None` declines and lets the next one try.
pub trait TenantResolver: Send + Sync {
	fn name(&self) -> &'static str;
	fn phase(&self) -> ResolvePhase;
	fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<ResolvedTenant>;
}

/// Binds by the local port the terminal connected to.
#[derive(Debug, Clone)]
pub struct PortResolver {
	ports: BTreeMap<u16, TenantId>,
}

impl PortResolver {
	pub fn new(ports: BTreeMap<u16, TenantId>) -> Self {
		Self { ports }
	}
}

impl TenantResolver for PortResolver {
	fn name(&self) -> &'static str {
		"port"
	}

	fn phase(&self) -> ResolvePhase {
		ResolvePhase::Connect
	}

	fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<ResolvedTenant> {
		self.ports.get(&ctx.local_port).cloned().map(ResolvedTenant::tenant)
	}
}

/// Binds by the peer address; first matching network wins.
#[derive(Debug, Clone)]
pub struct SubnetResolver {
	networks: Vec<(Cidr, TenantId)>,
}

impl SubnetResolver {
	pub fn new(networks: Vec<(Cidr, TenantId)>) -> Self {
		Self { networks }
	}
}

impl TenantResolver for SubnetResolver {
	fn name(&self) -> &'static str {
		"subnet"
	}

	fn phase(&self) -> ResolvePhase {
		ResolvePhase::Connect
	}

	fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<ResolvedTenant> {
		self.networks
			.iter()
			.find(|(net, _)| net.contains(ctx.peer))
			.map(|(_, tenant)| ResolvedTenant::tenant(tenant.clone()))
	}
}

/// Reads `tenant<separator>user` from the login user id and strips the prefix.
#[derive(Debug, Clone)]
pub struct UsernamePrefixResolver {
	separator: String,
	/// Empty means any prefix is accepted.
	allowed: BTreeSet<TenantId>,
}

impl UsernamePrefixResolver {
	pub fn new(separator: impl Into<String>, allowed: BTreeSet<TenantId>) -> Self {
		Self {
			separator: separator.into(),
			allowed,
		}
	}
}

impl TenantResolver for UsernamePrefixResolver {
	fn name(&self) -> &'static str {
		"username_prefix"
	}

	fn phase(&self) -> ResolvePhase {
		ResolvePhase::Login
	}

	fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<ResolvedTenant> {
		if self.separator.is_empty() {
			return None;
		}
		let (prefix, user) = ctx.login_user?.split_once(self.separator.as_str())?;
		if user.is_empty() {
			return None;
		}
		let tenant = TenantId::new(prefix).ok()?;
		if !self.allowed.is_empty() && !self.allowed.contains(&tenant) {
			return None;
		}
		Some(ResolvedTenant {
			tenant,
			login_user: Some(user.to_string()),
		})
	}
}

/// Maps the login location code (`CP`) to a tenant.
#[derive(Debug, Clone)]
pub struct LocationCodeResolver {
	codes: BTreeMap<String, TenantId>,
}

impl LocationCodeResolver {
	pub fn new(codes: BTreeMap<String, TenantId>) -> Self {
		Self { codes }
	}
}

impl TenantResolver for LocationCodeResolver {
	fn name(&self) -> &'static str {
		"location_code"
	}

	fn phase(&self) -> ResolvePhase {
		ResolvePhase::Login
	}

	fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<ResolvedTenant> {
		let code = ctx.location_code?.trim();
		self.codes.get(code).cloned().map(ResolvedTenant::tenant)
	}
}

/// Always resolves to one tenant.
#[derive(Debug, Clone)]
pub struct DefaultResolver {
	phase: ResolvePhase,
	tenant: TenantId,
}

impl DefaultResolver {
	pub fn new(phase: ResolvePhase, tenant: TenantId) -> Self {
		Self { phase, tenant }
	}
}

impl TenantResolver for DefaultResolver {
	fn name(&self) -> &'static str {
		"default"
	}

	fn phase(&self) -> ResolvePhase {
		self.phase
	}

	fn resolve(&self, _ctx: &ResolveContext<'_>) -> Option<ResolvedTenant> {
		Some(ResolvedTenant::tenant(self.tenant.clone()))
	}
}

/// Ordered resolvers; the first one that accepts wins.
#[derive(Clone, Default)]
pub struct TenantResolverPipeline {
	resolvers: Vec<Arc<dyn TenantResolver>>,
}

impl std::fmt::Debug for TenantResolverPipeline {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.resolvers.iter().map(|r| r.name())).finish()
	}
}

impl TenantResolverPipeline {
	pub fn new(resolvers: Vec<Arc<dyn TenantResolver>>) -> Self {
		Self { resolvers }
	}

	pub fn len(&self) -> usize {
		self.resolvers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.resolvers.is_empty()
	}

	pub fn has_phase(&self, phase: ResolvePhase) -> bool {
		self.resolvers.iter().any(|r| r.phase() == phase)
	}

	pub fn resolve(&self, phase: ResolvePhase, ctx: &ResolveContext<'_>) -> Result<ResolvedTenant, GatewayError> {
		for resolver in self.resolvers.iter().filter(|r| r.phase() == phase) {
			if let Some(resolved) = resolver.resolve(ctx) {
				debug!(
					session_id = %ctx.session_id,
					resolver = resolver.name(),
					tenant = %resolved.tenant,
					"tenant resolved"
				);
				return Ok(resolved);
			}
		}
		Err(GatewayError::tenant_not_resolved(ctx.session_id))
	}
}

/// Resolver entry as written in the config file (`[[resolvers]]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverSpec {
	Port {
		ports: BTreeMap<String, String>,
	},
	Subnet {
		networks: BTreeMap<String, String>,
	},
	UsernamePrefix {
		#[serde(default = "default_prefix_separator")]
		separator: String,
		#[serde(default)]
		allowed: Vec<String>,
	},
	LocationCode {
		codes: BTreeMap<String, String>,
	},
	Default {
		tenant: String,
		#[serde(default = "default_phase")]
		phase: ResolvePhase,
	},
}

fn default_prefix_separator() -> String {
	"/".to_string()
}

fn default_phase() -> ResolvePhase {
	ResolvePhase::Connect
}

fn tenant_id(raw: &str) -> anyhow::Result<TenantId> {
	TenantId::new(raw).map_err(|e| anyhow::anyhow!("invalid tenant id {raw:?}: {e}"))
}

impl ResolverSpec {
	pub fn build(&self) -> anyhow::Result<Arc<dyn TenantResolver>> {
		Ok(match self {
			ResolverSpec::Port { ports } => {
				let ports = ports
					.iter()
					.map(|(port, tenant)| {
						let port: u16 = port
							.trim()
							.parse()
							.map_err(|_| anyhow::anyhow!("invalid resolver port {port:?}"))?;
						Ok((port, tenant_id(tenant)?))
					})
					.collect::<anyhow::Result<_>>()?;
				Arc::new(PortResolver::new(ports))
			}
			ResolverSpec::Subnet { networks } => {
				let networks = networks
					.iter()
					.map(|(cidr, tenant)| {
						let cidr: Cidr = cidr.parse().map_err(|e: String| anyhow::anyhow!(e))?;
						Ok((cidr, tenant_id(tenant)?))
					})
					.collect::<anyhow::Result<Vec<_>>>()?;
				// Most specific network first.
				let mut networks = networks;
				networks.sort_by_key(|(cidr, _)| std::cmp::Reverse(cidr.prefix()));
				Arc::new(SubnetResolver::new(networks))
			}
			ResolverSpec::UsernamePrefix { separator, allowed } => {
				let allowed = allowed.iter().map(|t| tenant_id(t)).collect::<anyhow::Result<_>>()?;
				Arc::new(UsernamePrefixResolver::new(separator.clone(), allowed))
			}
			ResolverSpec::LocationCode { codes } => {
				let codes = codes
					.iter()
					.map(|(code, tenant)| Ok((code.trim().to_string(), tenant_id(tenant)?)))
					.collect::<anyhow::Result<_>>()?;
				Arc::new(LocationCodeResolver::new(codes))
			}
			ResolverSpec::Default { tenant, phase } => Arc::new(DefaultResolver::new(*phase, tenant_id(tenant)?)),
		})
	}
}

/// Build the pipeline in configuration order.
pub fn build_pipeline(specs: &[ResolverSpec]) -> anyhow::Result<TenantResolverPipeline> {
	let resolvers = specs.iter().map(ResolverSpec::build).collect::<anyhow::Result<Vec<_>>>()?;
	Ok(TenantResolverPipeline::new(resolvers))
}
