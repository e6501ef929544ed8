#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::services::GatewayServices;
use crate::server::session::Session;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Bind every configured endpoint before any of them starts accepting.
pub async fn bind_listeners(addrs: &[SocketAddr]) -> anyhow::Result<Vec<TcpListener>> {
	let mut listeners = Vec::with_capacity(addrs.len());
	for addr in addrs {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("bind sip2 listener on {addr}"))?;
		info!(addr = %listener.local_addr()?, "sip2 listener bound");
		listeners.push(listener);
	}
	Ok(listeners)
}

/// Accept terminals forever; each connection runs its own session task.
pub async fn run_listener(listener: TcpListener, services: Arc<GatewayServices>) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local addr")?;
	let port = local.port();
	let port_metrics = services.metrics().for_port(port);

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				port_metrics.record_socket_error();
				warn!(port, error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(100)).await;
				continue;
			}
		};

		let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("sip2_gateway_connections_total", "port" => port.to_string()).increment(1);
		if let Err(e) = stream.set_nodelay(true) {
			warn!(conn_id, error = %e, "failed to set TCP_NODELAY");
		}

		let services = Arc::clone(&services);
		tokio::spawn(async move {
			let session = Session::new(stream, peer, port, services);
			let session_id = session.context().session_id();
			info!(conn_id, %session_id, %peer, port, "accepted terminal connection");

			match session.run().await {
				Ok(()) => info!(conn_id, %session_id, "session closed"),
				Err(e) => warn!(conn_id, %session_id, error = %format!("{e:#}"), "session ended with error"),
			}
		});
	}
}
