#![forbid(unsafe_code)]

use sip2_domain::{Command, SessionId};
use sip2_platform::PlatformError;
use sip2_protocol::FrameError;
use thiserror::Error;

use crate::server::renderer::RenderError;

/// Text rendered into the generic failure response.
pub const PROBLEM_HANDLING_REQUEST: &str = "There was a problem handling the request";

/// Coarse failure categories, used for logging and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	MalformedMessage,
	TenantNotResolved,
	MissingAccessToken,
	Unsupported,
	Upstream,
	Render,
}

impl ErrorKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorKind::MalformedMessage => "malformed_message",
			ErrorKind::TenantNotResolved => "tenant_not_resolved",
			ErrorKind::MissingAccessToken => "missing_access_token",
			ErrorKind::Unsupported => "unsupported",
			ErrorKind::Upstream => "upstream",
			ErrorKind::Render => "render",
		}
	}
}

/// Failure surfaced by a handler, a gate or the session itself.
///
/// `message` is what the terminal sees; `detail` only goes to the logs.
/// `answer` is an optional model rendered with the command's own template
/// instead of the generic failure template (e.g. a `940` login response).
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {detail}")]
pub struct GatewayError {
	kind: ErrorKind,
	message: String,
	detail: String,
	answer: Option<serde_json::Value>,
}

impl GatewayError {
	pub fn new(kind: ErrorKind, message: impl Into<String>, detail: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			detail: detail.into(),
			answer: None,
		}
	}

	pub fn tenant_not_resolved(session_id: SessionId) -> Self {
		Self::new(
			ErrorKind::TenantNotResolved,
			PROBLEM_HANDLING_REQUEST,
			format!("no tenant resolved for session {session_id}"),
		)
	}

	pub fn malformed(err: &FrameError) -> Self {
		Self::new(ErrorKind::MalformedMessage, PROBLEM_HANDLING_REQUEST, err.to_string())
	}

	pub fn render(err: &RenderError) -> Self {
		Self::new(ErrorKind::Render, PROBLEM_HANDLING_REQUEST, err.to_string())
	}

	pub fn missing_access_token(detail: impl Into<String>) -> Self {
		Self::new(ErrorKind::MissingAccessToken, PROBLEM_HANDLING_REQUEST, detail)
	}

	pub fn unsupported(command: Command) -> Self {
		Self::new(
			ErrorKind::Unsupported,
			PROBLEM_HANDLING_REQUEST,
			format!("{command} is not supported for this tenant or station"),
		)
	}

	pub fn unrecognized(code: &str) -> Self {
		Self::new(
			ErrorKind::Unsupported,
			PROBLEM_HANDLING_REQUEST,
			format!("no handler for message code {code:?}"),
		)
	}

	pub fn upstream(err: &PlatformError) -> Self {
		Self::new(ErrorKind::Upstream, PROBLEM_HANDLING_REQUEST, err.to_string())
	}

	pub fn upstream_timeout(command: Command) -> Self {
		Self::new(
			ErrorKind::Upstream,
			PROBLEM_HANDLING_REQUEST,
			format!("{command} did not complete before the upstream timeout"),
		)
	}

	pub fn with_answer(mut self, answer: serde_json::Value) -> Self {
		self.answer = Some(answer);
		self
	}

	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	/// User-visible text.
	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn detail(&self) -> &str {
		&self.detail
	}

	pub fn answer(&self) -> Option<&serde_json::Value> {
		self.answer.as_ref()
	}
}
