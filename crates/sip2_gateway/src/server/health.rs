#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Readiness: the SIP2 listener is bound and a tenant document has been loaded.
#[derive(Clone, Default)]
pub struct HealthState {
	listening: Arc<AtomicBool>,
	config_loaded: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_listening(&self) {
		self.listening.store(true, Ordering::Relaxed);
	}

	pub fn mark_config_loaded(&self) {
		self.config_loaded.store(true, Ordering::Relaxed);
	}

	pub fn is_config_loaded(&self) -> bool {
		self.config_loaded.load(Ordering::Relaxed)
	}

	pub fn is_ready(&self) -> bool {
		self.listening.load(Ordering::Relaxed) && self.is_config_loaded()
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	Ok(match req.uri().path() {
		"/healthz" => reply(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, b"ready"),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => reply(StatusCode::NOT_FOUND, b""),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_needs_listener_and_config() {
		let state = HealthState::new();
		assert!(!state.is_ready());
		state.mark_listening();
		assert!(!state.is_ready());
		state.clone().mark_config_loaded();
		assert!(state.is_ready());
	}
}
