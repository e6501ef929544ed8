#![forbid(unsafe_code)]

pub mod http;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sip2_domain::{Command, TenantId};
use thiserror::Error;

pub use http::{HttpPlatform, HttpPlatformConfig};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Upstream access token with its two expirations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
	pub token: SecretString,
	pub access_token_expiration: DateTime<Utc>,
	pub refresh_token_expiration: DateTime<Utc>,
}

impl AccessToken {
	/// True once the access expiration has passed.
	pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
		self.access_token_expiration <= now
	}

	pub fn is_stale(&self) -> bool {
		self.is_stale_at(Utc::now())
	}
}

/// Upstream platform failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
	#[error("platform rejected credentials")]
	Unauthorized,

	#[error("platform returned status {status}: {detail}")]
	Status {
		status: u16,
		detail: String,
	},

	#[error("platform transport error: {0}")]
	Transport(String),

	#[error("platform response could not be decoded: {0}")]
	Decode(String),

	#[error("platform call timed out")]
	Timeout,
}

/// Business request forwarded to the platform for one SIP2 command.
#[derive(Debug, Clone)]
pub struct PlatformRequest {
	pub tenant: TenantId,
	pub access_token: SecretString,
	pub command: Command,
	/// Parsed SIP2 message plus session context, as JSON.
	pub payload: serde_json::Value,
}

/// Exchanges terminal credentials for an upstream access token.
#[async_trait]
pub trait LoginClient: Send + Sync {
	async fn login(&self, tenant: &TenantId, username: &str, password: &SecretString) -> Result<AccessToken, PlatformError>;
}

/// Executes the business side of a SIP2 command.
///
/// The returned JSON is the model handed to the response renderer.
#[async_trait]
pub trait PlatformClient: Send + Sync {
	async fn execute(&self, request: PlatformRequest) -> Result<serde_json::Value, PlatformError>;
}
