#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sip2_domain::TenantId;
use tracing::debug;
use url::Url;

use crate::{AccessToken, LoginClient, PlatformClient, PlatformError, PlatformRequest, SecretString};

/// Header carrying the tenant on every upstream call.
pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug, Clone)]
pub struct HttpPlatformConfig {
	pub base_url: Url,
	pub login_path: String,
	pub command_path_prefix: String,
	/// Used when the login answer carries no expirations.
	pub default_access_ttl: Duration,
	pub default_refresh_ttl: Duration,
}

impl HttpPlatformConfig {
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			login_path: "authn/login-with-expiry".to_string(),
			command_path_prefix: "sip2".to_string(),
			default_access_ttl: Duration::from_secs(10 * 60),
			default_refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
		}
	}
}

/// reqwest-backed platform client.
#[derive(Debug, Clone)]
pub struct HttpPlatform {
	cfg: HttpPlatformConfig,
	client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
	username: &'a str,
	password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
	access_token: String,
	access_token_expiration: Option<DateTime<Utc>>,
	refresh_token_expiration: Option<DateTime<Utc>>,
}

fn map_reqwest_error(e: reqwest::Error) -> PlatformError {
	if e.is_timeout() {
		PlatformError::Timeout
	} else if e.is_decode() {
		PlatformError::Decode(e.to_string())
	} else {
		PlatformError::Transport(e.to_string())
	}
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
	match resp.status() {
		s if s.is_success() => Ok(resp),
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PlatformError::Unauthorized),
		status => {
			let mut detail = resp.text().await.unwrap_or_default();
			detail.truncate(256);
			Err(PlatformError::Status {
				status: status.as_u16(),
				detail,
			})
		}
	}
}

impl HttpPlatform {
	pub fn new(mut cfg: HttpPlatformConfig) -> Self {
		if !cfg.base_url.path().ends_with('/') {
			let path = format!("{}/", cfg.base_url.path());
			cfg.base_url.set_path(&path);
		}

		Self {
			cfg,
			client: reqwest::Client::new(),
		}
	}

	fn url(&self, path: &str) -> Result<Url, PlatformError> {
		self.cfg
			.base_url
			.join(path.trim_start_matches('/'))
			.map_err(|e| PlatformError::Transport(format!("invalid platform url: {e}")))
	}

	fn command_url(&self, command: sip2_domain::Command) -> Result<Url, PlatformError> {
		let prefix = self.cfg.command_path_prefix.trim_matches('/');
		self.url(&format!("{prefix}/{}", command.as_str().to_ascii_lowercase()))
	}
}

#[async_trait]
impl LoginClient for HttpPlatform {
	async fn login(&self, tenant: &TenantId, username: &str, password: &SecretString) -> Result<AccessToken, PlatformError> {
		let url = self.url(&self.cfg.login_path)?;
		debug!(%tenant, username, %url, "platform login");

		let resp = self
			.client
			.post(url)
			.header(TENANT_HEADER, tenant.as_str())
			.json(&LoginRequest {
				username,
				password: password.expose(),
			})
			.send()
			.await
			.map_err(map_reqwest_error)?;

		let body: LoginResponse = check_status(resp).await?.json().await.map_err(map_reqwest_error)?;
		if body.access_token.trim().is_empty() {
			return Err(PlatformError::Decode("login answer carried an empty access token".to_string()));
		}

		let now = Utc::now();
		let access_ttl = chrono::Duration::from_std(self.cfg.default_access_ttl).unwrap_or(chrono::Duration::minutes(10));
		let refresh_ttl = chrono::Duration::from_std(self.cfg.default_refresh_ttl).unwrap_or(chrono::Duration::days(7));

		Ok(AccessToken {
			token: SecretString::new(body.access_token),
			access_token_expiration: body.access_token_expiration.unwrap_or(now + access_ttl),
			refresh_token_expiration: body.refresh_token_expiration.unwrap_or(now + refresh_ttl),
		})
	}
}

#[async_trait]
impl PlatformClient for HttpPlatform {
	async fn execute(&self, request: PlatformRequest) -> Result<serde_json::Value, PlatformError> {
		let url = self.command_url(request.command)?;
		debug!(tenant = %request.tenant, command = %request.command, %url, "platform command");

		let resp = self
			.client
			.post(url)
			.header(TENANT_HEADER, request.tenant.as_str())
			.bearer_auth(request.access_token.expose())
			.json(&request.payload)
			.send()
			.await
			.map_err(map_reqwest_error)?;

		check_status(resp).await?.json().await.map_err(map_reqwest_error)
	}
}
