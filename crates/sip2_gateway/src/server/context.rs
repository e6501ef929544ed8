#![forbid(unsafe_code)]

use std::net::SocketAddr;

use sip2_domain::{ScStationConfig, SessionId, SessionSettings, TenantConfigDocument, TenantId, TenantProfile};
use sip2_platform::SecretString;
use tracing::debug;

use crate::server::error::{ErrorKind, GatewayError, PROBLEM_HANDLING_REQUEST};
use crate::server::resolver::ResolvePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	AwaitingLogin,
	Authenticated,
	Closed,
}

/// Upstream credentials captured by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
	pub user: String,
	pub password: SecretString,
}

/// Per-connection state visible to command handlers.
#[derive(Debug, Clone)]
pub struct SessionContext {
	session_id: SessionId,
	peer: SocketAddr,
	local_port: u16,
	state: SessionState,
	tenant: Option<TenantId>,
	resolved_at: Option<ResolvePhase>,
	credentials: Option<Credentials>,
	settings: SessionSettings,
	station: ScStationConfig,
	default_station: ScStationConfig,
}

impl SessionContext {
	pub fn new(peer: SocketAddr, local_port: u16, settings: SessionSettings, station: ScStationConfig) -> Self {
		Self {
			session_id: SessionId::new_v4(),
			peer,
			local_port,
			state: SessionState::Connecting,
			tenant: None,
			resolved_at: None,
			credentials: None,
			settings,
			default_station: station.clone(),
			station,
		}
	}

	pub fn session_id(&self) -> SessionId {
		self.session_id
	}

	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	pub fn local_port(&self) -> u16 {
		self.local_port
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn tenant(&self) -> Option<&TenantId> {
		self.tenant.as_ref()
	}

	/// Phase whose resolver bound the tenant.
	pub fn resolved_at(&self) -> Option<ResolvePhase> {
		self.resolved_at
	}

	pub fn credentials(&self) -> Option<&Credentials> {
		self.credentials.as_ref()
	}

	pub fn settings(&self) -> &SessionSettings {
		&self.settings
	}

	pub fn station(&self) -> &ScStationConfig {
		&self.station
	}

	pub fn is_authenticated(&self) -> bool {
		self.state == SessionState::Authenticated
	}

	/// Bind the session to `tenant`. A bound tenant never changes.
	pub fn bind_tenant(&mut self, tenant: TenantId) -> Result<(), GatewayError> {
		match &self.tenant {
			Some(bound) if *bound == tenant => Ok(()),
			Some(bound) => Err(GatewayError::new(
				ErrorKind::TenantNotResolved,
				PROBLEM_HANDLING_REQUEST,
				format!("session {} is bound to {bound}, refusing {tenant}", self.session_id),
			)),
			None => {
				debug!(session_id = %self.session_id, %tenant, "session bound to tenant");
				self.tenant = Some(tenant);
				Ok(())
			}
		}
	}

	/// Bind `tenant` and adopt its profile when `doc` knows it; unknown tenants keep the gateway defaults.
	pub fn bind_and_configure(
		&mut self,
		tenant: TenantId,
		phase: ResolvePhase,
		doc: &TenantConfigDocument,
	) -> Result<(), GatewayError> {
		let known = doc.contains(&tenant);
		let profile = doc.profile(&tenant);
		self.bind_tenant(tenant)?;
		self.resolved_at.get_or_insert(phase);
		if known {
			self.apply_profile(profile);
		}
		Ok(())
	}

	/// Adopt the tenant's wire settings and station overrides.
	pub fn apply_profile(&mut self, profile: &TenantProfile) {
		self.settings = profile.session.clone();
		self.station = profile.station.clone().unwrap_or_else(|| self.default_station.clone());
	}

	pub fn await_login(&mut self) {
		if self.state == SessionState::Connecting {
			self.state = SessionState::AwaitingLogin;
		}
	}

	pub fn authenticate(&mut self, credentials: Credentials) {
		self.credentials = Some(credentials);
		self.state = SessionState::Authenticated;
	}

	pub fn close(&mut self) {
		self.state = SessionState::Closed;
	}
}
