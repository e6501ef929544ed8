#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use sip2_domain::{Command, ScStationConfig, SessionSettings};
use sip2_protocol::wire::{DEFAULT_FIELD_DELIMITER, DEFAULT_MESSAGE_DELIMITER, SEQUENCE_MODULUS};
use sip2_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FrameError, Message, Trailer, encode_frame, parse, resend_request, try_split_frame,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::server::context::SessionContext;
use crate::server::dispatcher::HandlerResult;
use crate::server::error::GatewayError;
use crate::server::metrics::PortMetrics;
use crate::server::resolver::{ResolveContext, ResolvePhase};
use crate::server::services::GatewayServices;

/// Per-session limits and the wire defaults used until a tenant profile applies.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Close the session after this long without inbound bytes; zero disables.
	pub idle_timeout: Duration,
	/// Upper bound for one command's handler, including upstream calls.
	pub upstream_timeout: Duration,
	pub max_frame_bytes: usize,
	pub default_settings: SessionSettings,
	pub default_station: ScStationConfig,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(300),
			upstream_timeout: Duration::from_secs(15),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			default_settings: SessionSettings::default(),
			default_station: ScStationConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceVerdict {
	New,
	Resend,
	Invalid,
}

/// Expected sequence digit plus the (sequence, checksum) of the last accepted request.
#[derive(Debug, Default)]
struct SequenceTracker {
	expected: Option<u8>,
	previous: Option<(u8, String)>,
}

impl SequenceTracker {
	fn classify(&self, message: &Message, error_detection: bool) -> SequenceVerdict {
		if !error_detection {
			return SequenceVerdict::New;
		}
		let (Some(seq), Some(checksum)) = (message.sequence, message.checksum.as_deref()) else {
			return SequenceVerdict::Invalid;
		};

		if let Some((prev_seq, prev_checksum)) = &self.previous
			&& *prev_seq == seq
			&& prev_checksum == checksum
		{
			return SequenceVerdict::Resend;
		}

		match self.expected {
			None => SequenceVerdict::New,
			Some(expected) if expected == seq => SequenceVerdict::New,
			Some(_) => SequenceVerdict::Invalid,
		}
	}

	fn advance(&mut self, message: &Message) {
		if let (Some(seq), Some(checksum)) = (message.sequence, &message.checksum) {
			self.previous = Some((seq, checksum.clone()));
			self.expected = Some((seq + 1) % SEQUENCE_MODULUS);
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Continue,
	Close,
}

fn ascii_or(c: char, fallback: u8) -> u8 {
	if c.is_ascii() { c as u8 } else { fallback }
}

/// One terminal connection: framing, sequencing, gating and dispatch, in strict request order.
pub struct Session<S> {
	stream: S,
	ctx: SessionContext,
	services: Arc<GatewayServices>,
	metrics: Arc<PortMetrics>,
	sequence: SequenceTracker,
	last_response: Option<Vec<u8>>,
	buf: BytesMut,
}

impl<S> Session<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	pub fn new(stream: S, peer: SocketAddr, local_port: u16, services: Arc<GatewayServices>) -> Self {
		let cfg = services.session_config();
		let ctx = SessionContext::new(
			peer,
			local_port,
			cfg.default_settings.clone(),
			cfg.default_station.clone(),
		);
		let metrics = services.metrics().for_port(local_port);

		Self {
			stream,
			ctx,
			services,
			metrics,
			sequence: SequenceTracker::default(),
			last_response: None,
			buf: BytesMut::with_capacity(4096),
		}
	}

	pub fn context(&self) -> &SessionContext {
		&self.ctx
	}

	/// Drive the session until the terminal disconnects, idles out or is told to close.
	pub async fn run(mut self) -> anyhow::Result<()> {
		struct ActiveSessionGuard(String);
		impl Drop for ActiveSessionGuard {
			fn drop(&mut self) {
				metrics::gauge!("sip2_gateway_active_sessions", "port" => self.0.clone()).decrement(1.0);
			}
		}
		let port_label = self.ctx.local_port().to_string();
		metrics::gauge!("sip2_gateway_active_sessions", "port" => port_label.clone()).increment(1.0);
		let _active = ActiveSessionGuard(port_label);
		self.metrics.record_session();

		if let Err(e) = self.resolve_at_connect() {
			self.ctx.close();
			let _ = self.stream.shutdown().await;
			return Err(anyhow!(e).context("tenant resolution at connect"));
		}

		let result = self.read_loop().await;
		self.ctx.close();
		let _ = self.stream.shutdown().await;
		result
	}

	fn resolve_at_connect(&mut self) -> Result<(), GatewayError> {
		let resolvers = Arc::clone(self.services.resolvers());
		let resolve_ctx = ResolveContext {
			session_id: self.ctx.session_id(),
			local_port: self.ctx.local_port(),
			peer: self.ctx.peer().ip(),
			login_user: None,
			location_code: None,
		};

		match resolvers.resolve(ResolvePhase::Connect, &resolve_ctx) {
			Ok(resolved) => {
				let doc = self.services.tenant_config().get();
				self.ctx.bind_and_configure(resolved.tenant, ResolvePhase::Connect, &doc)?;
			}
			Err(_) if resolvers.has_phase(ResolvePhase::Login) => {
				debug!(session_id = %self.ctx.session_id(), "no tenant at connect; deferring to login");
			}
			Err(e) => {
				warn!(
					session_id = %self.ctx.session_id(),
					peer = %self.ctx.peer(),
					port = self.ctx.local_port(),
					"no resolver accepted the connection"
				);
				metrics::counter!("sip2_gateway_tenant_not_resolved_total").increment(1);
				return Err(e);
			}
		}

		self.ctx.await_login();
		Ok(())
	}

	fn message_delimiter(&self) -> u8 {
		ascii_or(self.ctx.settings().message_delimiter, DEFAULT_MESSAGE_DELIMITER)
	}

	fn field_delimiter(&self) -> u8 {
		ascii_or(self.ctx.settings().field_delimiter, DEFAULT_FIELD_DELIMITER)
	}

	async fn read_loop(&mut self) -> anyhow::Result<()> {
		let idle_timeout = self.services.session_config().idle_timeout;
		let max_frame = self.services.session_config().max_frame_bytes;
		let mut tmp = [0u8; 4096];

		loop {
			loop {
				let delimiter = self.message_delimiter();
				match try_split_frame(&mut self.buf, delimiter, max_frame) {
					Ok(Some(frame)) => {
						if self.handle_frame(&frame).await? == Flow::Close {
							debug!(session_id = %self.ctx.session_id(), "session close requested");
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						self.buf.clear();
						self.reject_malformed(&e).await?;
						break;
					}
				}
			}

			let read = if idle_timeout.is_zero() {
				Ok(self.stream.read(&mut tmp).await)
			} else {
				tokio::time::timeout(idle_timeout, self.stream.read(&mut tmp)).await
			};

			match read {
				Err(_) => {
					info!(session_id = %self.ctx.session_id(), ?idle_timeout, "idle timeout; closing session");
					metrics::counter!("sip2_gateway_idle_timeouts_total").increment(1);
					return Ok(());
				}
				Ok(Ok(0)) => {
					debug!(session_id = %self.ctx.session_id(), "terminal closed the connection");
					return Ok(());
				}
				Ok(Ok(n)) => self.buf.extend_from_slice(&tmp[..n]),
				Ok(Err(e)) => {
					self.metrics.record_socket_error();
					return Err(anyhow!(e).context("read from terminal"));
				}
			}
		}
	}

	async fn handle_frame(&mut self, frame: &[u8]) -> anyhow::Result<Flow> {
		let message = match parse(frame, self.field_delimiter()) {
			Ok(message) => message,
			Err(e) => {
				self.reject_malformed(&e).await?;
				return Ok(Flow::Continue);
			}
		};

		if message.command == Some(Command::RequestAcsResend) {
			self.resend_last_response().await?;
			return Ok(Flow::Continue);
		}

		match self
			.sequence
			.classify(&message, self.ctx.settings().error_detection_enabled)
		{
			SequenceVerdict::New => {}
			SequenceVerdict::Resend => {
				self.metrics.record_resend();
				debug!(session_id = %self.ctx.session_id(), sequence = ?message.sequence, "duplicate request; replaying last response");
				self.resend_last_response().await?;
				return Ok(Flow::Continue);
			}
			SequenceVerdict::Invalid => {
				self.metrics.record_invalid_message();
				warn!(
					session_id = %self.ctx.session_id(),
					sequence = ?message.sequence,
					expected = ?self.sequence.expected,
					"unexpected sequence number; requesting resend"
				);
				self.send_resend_request().await?;
				return Ok(Flow::Continue);
			}
		}

		let label = message.command.map(Command::as_str).unwrap_or("UNKNOWN");
		let timer = self.metrics.start_command(label);

		let result = self.execute(&message).await;
		let body = self.render(&message, &result);
		let wire = self.encode(&body, message.sequence);

		self.sequence.advance(&message);
		self.last_response = Some(wire.clone());
		self.write_raw(&wire).await?;

		let elapsed = timer.stop();
		debug!(
			session_id = %self.ctx.session_id(),
			command = label,
			ok = result.is_success(),
			elapsed_us = elapsed.as_micros() as u64,
			"command handled"
		);

		let end_session = message.command == Some(Command::EndPatronSession)
			&& result.is_success()
			&& self.ctx.settings().close_on_end_session;
		if end_session {
			return Ok(Flow::Close);
		}
		Ok(Flow::Continue)
	}

	async fn execute(&mut self, message: &Message) -> HandlerResult {
		let dispatcher = Arc::clone(self.services.dispatcher());
		let Some(command) = message.command else {
			return dispatcher.dispatch(message, &mut self.ctx).await;
		};

		if !command.is_session_control() {
			if !self.ctx.is_authenticated() {
				return HandlerResult::failure(
					Some(command),
					GatewayError::missing_access_token(format!("{command} received before login")),
				);
			}
			if let Err(e) = self.check_policy(command) {
				return HandlerResult::failure(Some(command), e);
			}
		}

		let upstream_timeout = self.services.session_config().upstream_timeout;
		match tokio::time::timeout(upstream_timeout, dispatcher.dispatch(message, &mut self.ctx)).await {
			Ok(result) => result,
			Err(_) => HandlerResult::failure(Some(command), GatewayError::upstream_timeout(command)),
		}
	}

	/// Tenant-supported messages, then station checkin/checkout switches.
	fn check_policy(&self, command: Command) -> Result<(), GatewayError> {
		let Some(tenant) = self.ctx.tenant() else {
			return Err(GatewayError::tenant_not_resolved(self.ctx.session_id()));
		};
		let doc = self.services.tenant_config().get();
		if !doc.profile(tenant).acs.supports(command) {
			return Err(GatewayError::unsupported(command));
		}

		let station = self.ctx.station();
		let station_allows = match command {
			Command::Checkin => station.checkin_ok,
			Command::Checkout => station.checkout_ok,
			_ => true,
		};
		if !station_allows {
			return Err(GatewayError::unsupported(command));
		}
		Ok(())
	}

	/// Count the frame by kind and ask the terminal to send it again.
	async fn reject_malformed(&mut self, e: &FrameError) -> anyhow::Result<()> {
		self.metrics.record_malformed(e.kind());
		let error = GatewayError::malformed(e);
		warn!(
			session_id = %self.ctx.session_id(),
			kind = error.kind().as_str(),
			malformed = e.kind().as_str(),
			detail = error.detail(),
			"malformed message; requesting resend"
		);
		self.send_resend_request().await
	}

	/// Response body for `result`; a template failure yields an empty body.
	fn render(&self, message: &Message, result: &HandlerResult) -> String {
		let renderer = self.services.renderer();
		let rendered = match result {
			HandlerResult::Success { command, model } => renderer.render(*command, model),
			HandlerResult::Failure { command, error } => {
				self.metrics.record_request_error();
				warn!(
					session_id = %self.ctx.session_id(),
					code = %message.code,
					kind = error.kind().as_str(),
					detail = error.detail(),
					"command failed"
				);
				match (command, error.answer()) {
					(Some(command), Some(answer)) => renderer.render(*command, answer),
					_ => renderer.render_failure(*command, &message.code, error.message()),
				}
			}
		};

		let body = match rendered {
			Ok(body) => body,
			Err(e) => {
				let error = GatewayError::render(&e);
				self.metrics.record_response_error();
				warn!(
					session_id = %self.ctx.session_id(),
					code = %message.code,
					kind = error.kind().as_str(),
					detail = error.detail(),
					"response render failed; sending empty body"
				);
				String::new()
			}
		};

		let delimiter = self.field_delimiter();
		if delimiter == DEFAULT_FIELD_DELIMITER {
			body
		} else {
			body.replace(DEFAULT_FIELD_DELIMITER as char, &(delimiter as char).to_string())
		}
	}

	fn encode(&self, body: &str, sequence: Option<u8>) -> Vec<u8> {
		let trailer = match (self.ctx.settings().error_detection_enabled, sequence) {
			(false, _) => Trailer::None,
			(true, Some(seq)) => Trailer::SequenceAndChecksum(seq),
			(true, None) => Trailer::Checksum,
		};
		encode_frame(body, trailer, self.message_delimiter())
	}

	async fn resend_last_response(&mut self) -> anyhow::Result<()> {
		match self.last_response.clone() {
			Some(last) => self.write_raw(&last).await,
			None => self.send_resend_request().await,
		}
	}

	async fn send_resend_request(&mut self) -> anyhow::Result<()> {
		let frame = resend_request(self.ctx.settings().error_detection_enabled, self.message_delimiter());
		self.write_raw(&frame).await
	}

	async fn write_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
		let written = async {
			self.stream.write_all(bytes).await?;
			self.stream.flush().await
		}
		.await;

		if let Err(e) = written {
			self.metrics.record_socket_error();
			return Err(e).context("write to terminal");
		}
		Ok(())
	}
}
