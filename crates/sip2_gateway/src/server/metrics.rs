#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sip2_protocol::MalformedKind;

/// Point-in-time copy of one port's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMetricsSnapshot {
	pub sessions: u64,
	pub socket_errors: u64,
	pub request_errors: u64,
	pub response_errors: u64,
	pub resends: u64,
	pub invalid_messages: u64,
	pub bad_checksums: u64,
	pub missing_delimiters: u64,
	pub other_malformed: u64,
}

/// Per-port counters.
///
/// Every increment is kept locally (for snapshots) and mirrored into the
/// `metrics` facade, labelled with the port.
#[derive(Debug)]
pub struct PortMetrics {
	port: u16,
	port_label: String,
	sessions: AtomicU64,
	socket_errors: AtomicU64,
	request_errors: AtomicU64,
	response_errors: AtomicU64,
	resends: AtomicU64,
	invalid_messages: AtomicU64,
	bad_checksums: AtomicU64,
	missing_delimiters: AtomicU64,
	other_malformed: AtomicU64,
}

impl PortMetrics {
	pub fn new(port: u16) -> Self {
		Self {
			port,
			port_label: port.to_string(),
			sessions: AtomicU64::new(0),
			socket_errors: AtomicU64::new(0),
			request_errors: AtomicU64::new(0),
			response_errors: AtomicU64::new(0),
			resends: AtomicU64::new(0),
			invalid_messages: AtomicU64::new(0),
			bad_checksums: AtomicU64::new(0),
			missing_delimiters: AtomicU64::new(0),
			other_malformed: AtomicU64::new(0),
		}
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn record_session(&self) {
		self.sessions.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_sessions_total", "port" => self.port_label.clone()).increment(1);
	}

	pub fn record_socket_error(&self) {
		self.socket_errors.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_socket_errors_total", "port" => self.port_label.clone()).increment(1);
	}

	pub fn record_request_error(&self) {
		self.request_errors.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_request_errors_total", "port" => self.port_label.clone()).increment(1);
	}

	pub fn record_response_error(&self) {
		self.response_errors.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_response_errors_total", "port" => self.port_label.clone()).increment(1);
	}

	pub fn record_resend(&self) {
		self.resends.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_resends_total", "port" => self.port_label.clone()).increment(1);
	}

	/// Sequence violations and other well-formed but unacceptable requests.
	pub fn record_invalid_message(&self) {
		self.invalid_messages.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_invalid_messages_total", "port" => self.port_label.clone()).increment(1);
	}

	pub fn record_malformed(&self, kind: MalformedKind) {
		let counter = match kind {
			MalformedKind::BadChecksum => &self.bad_checksums,
			MalformedKind::MissingDelimiter => &self.missing_delimiters,
			_ => &self.other_malformed,
		};
		counter.fetch_add(1, Ordering::Relaxed);
		metrics::counter!(
			"sip2_gateway_malformed_messages_total",
			"port" => self.port_label.clone(),
			"kind" => kind.as_str()
		)
		.increment(1);
	}

	/// Start timing one command; call [`CommandTimer::stop`] once the response is written.
	pub fn start_command(&self, command: &'static str) -> CommandTimer {
		CommandTimer {
			started: Instant::now(),
			port_label: self.port_label.clone(),
			command,
		}
	}

	pub fn snapshot(&self) -> PortMetricsSnapshot {
		PortMetricsSnapshot {
			sessions: self.sessions.load(Ordering::Relaxed),
			socket_errors: self.socket_errors.load(Ordering::Relaxed),
			request_errors: self.request_errors.load(Ordering::Relaxed),
			response_errors: self.response_errors.load(Ordering::Relaxed),
			resends: self.resends.load(Ordering::Relaxed),
			invalid_messages: self.invalid_messages.load(Ordering::Relaxed),
			bad_checksums: self.bad_checksums.load(Ordering::Relaxed),
			missing_delimiters: self.missing_delimiters.load(Ordering::Relaxed),
			other_malformed: self.other_malformed.load(Ordering::Relaxed),
		}
	}
}

/// Running timer for one command.
#[derive(Debug)]
#[must_use = "a timer records nothing until stopped"]
pub struct CommandTimer {
	started: Instant,
	port_label: String,
	command: &'static str,
}

impl CommandTimer {
	/// Stop and record. The returned duration is never zero.
	pub fn stop(self) -> Duration {
		let elapsed = self.started.elapsed().max(Duration::from_nanos(1));
		metrics::histogram!(
			"sip2_gateway_command_duration_seconds",
			"port" => self.port_label,
			"command" => self.command
		)
		.record(elapsed.as_secs_f64());
		elapsed
	}
}

/// One [`PortMetrics`] per listening port, created on first use.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
	ports: Mutex<HashMap<u16, Arc<PortMetrics>>>,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn for_port(&self, port: u16) -> Arc<PortMetrics> {
		let mut ports = self.ports.lock();
		Arc::clone(ports.entry(port).or_insert_with(|| Arc::new(PortMetrics::new(port))))
	}
}
