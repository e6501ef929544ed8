#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sip2_domain::{Command, TenantId};
use sip2_platform::{AccessToken, LoginClient, PlatformClient, PlatformError, PlatformRequest, SecretString};
use sip2_protocol::{Message, Trailer, encode_frame, resend_request};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::server::context::{Credentials, SessionContext};
use crate::server::dispatcher::{CommandHandler, HandlerMap};
use crate::server::error::GatewayError;
use crate::server::metrics::PortMetricsSnapshot;
use crate::server::renderer::ResponseRenderer;
use crate::server::resolver::{
	DefaultResolver, ResolvePhase, TenantResolver, TenantResolverPipeline, UsernamePrefixResolver,
};
use crate::server::services::{GatewayParts, GatewayServices};
use crate::server::session::{Session, SessionConfig};
use crate::server::tenant_config::{TenantConfigStore, parse_document};

const PORT: u16 = 6443;
const DATE: &str = "20261016    120000";
const PROBLEM: &str = "There was a problem handling the request";

const TENANTS: &str = r#"{
	"tenants": {
		"diku": {
			"acs": {
				"supportedMessages": [
					{ "messageName": "CHECKOUT", "isSupported": "Y" },
					{ "messageName": "CHECKIN", "isSupported": "Y" },
					{ "messageName": "END_PATRON_SESSION", "isSupported": "Y" },
					{ "messageName": "RENEW_ALL", "isSupported": "Y" },
					{ "messageName": "FEE_PAID", "isSupported": "Y" },
					{ "messageName": "PATRON_INFORMATION", "isSupported": "N" }
				]
			},
			"station": { "checkinOk": false },
			"session": { "errorDetectionEnabled": true, "closeOnEndSession": true }
		}
	}
}"#;

/// Per-command invocation counters shared by the fake handlers.
#[derive(Default)]
struct Calls(parking_lot::Mutex<HashMap<Command, usize>>);

impl Calls {
	fn bump(&self, command: Command) {
		*self.0.lock().entry(command).or_default() += 1;
	}

	fn get(&self, command: Command) -> usize {
		self.0.lock().get(&command).copied().unwrap_or(0)
	}

	fn total(&self) -> usize {
		self.0.lock().values().sum()
	}
}

struct FakeLogin(Arc<Calls>);

#[async_trait]
impl CommandHandler for FakeLogin {
	async fn handle(&self, message: &Message, ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		self.0.bump(Command::Login);
		ctx.authenticate(Credentials {
			user: message.field("CN").unwrap_or_default().to_string(),
			password: SecretString::new(message.field("CO").unwrap_or_default()),
		});
		Ok(json!({ "ok": true }))
	}
}

struct Counting(Arc<Calls>);

#[async_trait]
impl CommandHandler for Counting {
	async fn handle(&self, message: &Message, _ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		if let Some(command) = message.command {
			self.0.bump(command);
		}
		Ok(json!({}))
	}
}

struct Slow;

#[async_trait]
impl CommandHandler for Slow {
	async fn handle(&self, _message: &Message, _ctx: &mut SessionContext) -> Result<Value, GatewayError> {
		tokio::time::sleep(Duration::from_secs(5)).await;
		Ok(json!({}))
	}
}

struct Unreachable;

#[async_trait]
impl LoginClient for Unreachable {
	async fn login(&self, _: &TenantId, _: &str, _: &SecretString) -> Result<AccessToken, PlatformError> {
		Err(PlatformError::Transport("unreachable".to_string()))
	}
}

#[async_trait]
impl PlatformClient for Unreachable {
	async fn execute(&self, _: PlatformRequest) -> Result<Value, PlatformError> {
		Err(PlatformError::Transport("unreachable".to_string()))
	}
}

/// Accepts `alice`/`right` and records every user id it was asked to log in.
#[derive(Default)]
struct RecordingLogin(parking_lot::Mutex<Vec<String>>);

impl RecordingLogin {
	fn users(&self) -> Vec<String> {
		self.0.lock().clone()
	}
}

#[async_trait]
impl LoginClient for RecordingLogin {
	async fn login(&self, _: &TenantId, username: &str, password: &SecretString) -> Result<AccessToken, PlatformError> {
		self.0.lock().push(username.to_string());
		if username != "alice" || password.expose() != "right" {
			return Err(PlatformError::Unauthorized);
		}
		let now = Utc::now();
		Ok(AccessToken {
			token: SecretString::new("token"),
			access_token_expiration: now + chrono::Duration::minutes(10),
			refresh_token_expiration: now + chrono::Duration::days(1),
		})
	}
}

struct StalledLogin;

#[async_trait]
impl LoginClient for StalledLogin {
	async fn login(&self, _: &TenantId, _: &str, _: &SecretString) -> Result<AccessToken, PlatformError> {
		tokio::time::sleep(Duration::from_secs(5)).await;
		Err(PlatformError::Timeout)
	}
}

fn renderer() -> ResponseRenderer {
	ResponseRenderer::from_sources(
		[
			(Command::Login, "94{{#ok}}"),
			(Command::ScStatus, "98Y"),
			(Command::Checkout, "121"),
			(Command::Checkin, "101"),
			(Command::PatronInformation, "64ok|"),
			(Command::EndPatronSession, "36Y"),
			(Command::FeePaid, "38{{payment_accepted}}"),
		],
		"{{code}}AF{{message}}|",
	)
	.expect("templates parse")
}

fn connect_resolver() -> Vec<Arc<dyn TenantResolver>> {
	vec![Arc::new(DefaultResolver::new(
		ResolvePhase::Connect,
		TenantId::new("diku").expect("tenant"),
	))]
}

struct Harness {
	services: Arc<GatewayServices>,
	calls: Arc<Calls>,
}

impl Harness {
	fn new(resolvers: Vec<Arc<dyn TenantResolver>>) -> Self {
		Self::with_config(resolvers, SessionConfig {
			idle_timeout: Duration::from_secs(5),
			upstream_timeout: Duration::from_millis(200),
			..SessionConfig::default()
		})
	}

	fn with_config(resolvers: Vec<Arc<dyn TenantResolver>>, session: SessionConfig) -> Self {
		let calls = Arc::new(Calls::default());
		let tenant_config = Arc::new(TenantConfigStore::new());
		tenant_config.replace(parse_document(TENANTS).expect("tenant doc"));

		let mut handlers = HandlerMap::new();
		handlers.insert(Command::Login, Arc::new(FakeLogin(Arc::clone(&calls))));
		let counting: Arc<dyn CommandHandler> = Arc::new(Counting(Arc::clone(&calls)));
		for command in [
			Command::ScStatus,
			Command::Checkout,
			Command::Checkin,
			Command::PatronInformation,
			Command::EndPatronSession,
			Command::FeePaid,
		] {
			handlers.insert(command, Arc::clone(&counting));
		}
		handlers.insert(Command::RenewAll, Arc::new(Slow));

		let services = GatewayServices::assemble(GatewayParts {
			session,
			token_cache_capacity: 8,
			resolvers: TenantResolverPipeline::new(resolvers),
			tenant_config,
			renderer: renderer(),
			login_client: Arc::new(Unreachable),
			platform: Arc::new(Unreachable),
		})
		.with_handlers(handlers);

		Self {
			services: Arc::new(services),
			calls,
		}
	}

	fn start(&self) -> (DuplexStream, JoinHandle<anyhow::Result<()>>) {
		let (client, server) = tokio::io::duplex(8192);
		let session = Session::new(
			server,
			"10.1.2.3:40000".parse().expect("peer addr"),
			PORT,
			Arc::clone(&self.services),
		);
		(client, tokio::spawn(session.run()))
	}

	fn metrics(&self) -> PortMetricsSnapshot {
		self.services.metrics().for_port(PORT).snapshot()
	}
}

fn frame(body: &str, seq: u8) -> Vec<u8> {
	encode_frame(body, Trailer::SequenceAndChecksum(seq), b'\r')
}

async fn send(client: &mut DuplexStream, bytes: &[u8]) {
	client.write_all(bytes).await.expect("write");
}

async fn read_frame(client: &mut DuplexStream) -> Vec<u8> {
	let mut out = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		timeout(Duration::from_secs(2), client.read_exact(&mut byte))
			.await
			.expect("response in time")
			.expect("read");
		out.push(byte[0]);
		if byte[0] == b'\r' {
			return out;
		}
	}
}

async fn exchange(client: &mut DuplexStream, bytes: &[u8]) -> String {
	send(client, bytes).await;
	String::from_utf8(read_frame(client).await).expect("ascii response")
}

async fn login(client: &mut DuplexStream) -> String {
	exchange(client, &frame("9300CNsc|COpw|", 0)).await
}

fn checkout() -> String {
	format!("11YN{DATE}{DATE}AOinst|AApatron|ABitem|AC|")
}

fn checkin() -> String {
	format!("09N{DATE}{DATE}AOinst|ABitem|AC|")
}

#[tokio::test]
async fn login_response_carries_the_request_sequence() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let response = login(&mut client).await;
	assert_eq!(response.as_bytes(), frame("941", 0).as_slice());
	assert_eq!(h.calls.get(Command::Login), 1);
}

#[tokio::test]
async fn duplicate_request_replays_identical_bytes_without_dispatch() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let request = frame("9300CNsc|COpw|", 0);
	let first = exchange(&mut client, &request).await;
	let second = exchange(&mut client, &request).await;

	assert_eq!(first, second);
	assert_eq!(h.calls.get(Command::Login), 1);
	assert_eq!(h.metrics().resends, 1);
}

#[tokio::test]
async fn business_command_before_login_is_rejected() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let response = exchange(&mut client, &frame(&checkout(), 0)).await;
	assert_eq!(
		response.as_bytes(),
		frame(&format!("12AF{PROBLEM}|"), 0).as_slice()
	);
	assert_eq!(h.calls.get(Command::Checkout), 0);
	assert_eq!(h.metrics().request_errors, 1);
}

#[tokio::test]
async fn sc_status_is_answered_before_login() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let response = exchange(&mut client, &frame("9900302.00", 3)).await;
	assert_eq!(response.as_bytes(), frame("98Y", 3).as_slice());
	assert_eq!(h.calls.get(Command::ScStatus), 1);
}

#[tokio::test]
async fn unknown_code_gets_generic_failure_and_no_handler_runs() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();
	login(&mut client).await;

	let response = exchange(&mut client, &frame("XXAOinst|", 1)).await;
	assert_eq!(response.as_bytes(), frame(&format!("XXAF{PROBLEM}|"), 1).as_slice());
	assert_eq!(h.calls.total(), 1, "only the login handler ran");
}

#[tokio::test]
async fn out_of_order_sequence_requests_resend() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();
	login(&mut client).await;

	let response = exchange(&mut client, &frame("9900302.00", 5)).await;
	assert_eq!(response.as_bytes(), resend_request(true, b'\r').as_slice());
	assert_eq!(h.calls.get(Command::ScStatus), 0);
	assert_eq!(h.metrics().invalid_messages, 1);

	// The expected sequence is still accepted afterwards.
	let response = exchange(&mut client, &frame("9900302.00", 1)).await;
	assert_eq!(response.as_bytes(), frame("98Y", 1).as_slice());
}

#[tokio::test]
async fn sequence_wraps_after_nine() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	for seq in (0..10).chain(0..2) {
		let response = exchange(&mut client, &frame("9900302.00", seq)).await;
		assert_eq!(response.as_bytes(), frame("98Y", seq).as_slice());
	}
	assert_eq!(h.calls.get(Command::ScStatus), 12);
	assert_eq!(h.metrics().invalid_messages, 0);
}

#[tokio::test]
async fn malformed_messages_are_counted_by_kind() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let bad_checksum = exchange(&mut client, b"9900302.00AY1AZFCA6\r").await;
	assert_eq!(bad_checksum.as_bytes(), resend_request(true, b'\r').as_slice());

	let missing_delimiter = exchange(&mut client, &frame("9300CNsc|COpw", 0)).await;
	assert_eq!(missing_delimiter.as_bytes(), resend_request(true, b'\r').as_slice());

	let metrics = h.metrics();
	assert_eq!(metrics.bad_checksums, 1);
	assert_eq!(metrics.missing_delimiters, 1);
	assert_eq!(h.calls.total(), 0);
}

#[tokio::test]
async fn tenant_policy_and_station_gate_commands() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();
	login(&mut client).await;

	let response = exchange(&mut client, &frame(&checkout(), 1)).await;
	assert_eq!(response.as_bytes(), frame("121", 1).as_slice());

	// Supported by the tenant but switched off for the station.
	let response = exchange(&mut client, &frame(&checkin(), 2)).await;
	assert_eq!(response.as_bytes(), frame(&format!("10AF{PROBLEM}|"), 2).as_slice());

	// Not supported by the tenant.
	let patron_info = format!("63001{DATE}          AOinst|AApatron|");
	let response = exchange(&mut client, &frame(&patron_info, 3)).await;
	assert_eq!(response.as_bytes(), frame(&format!("64AF{PROBLEM}|"), 3).as_slice());

	assert_eq!(h.calls.get(Command::Checkout), 1);
	assert_eq!(h.calls.get(Command::Checkin), 0);
	assert_eq!(h.calls.get(Command::PatronInformation), 0);
	assert_eq!(h.metrics().request_errors, 2);
}

#[tokio::test]
async fn acs_resend_request_reemits_last_response() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let resend = encode_frame("97", Trailer::Checksum, b'\r');
	let nothing_yet = exchange(&mut client, &resend).await;
	assert_eq!(nothing_yet.as_bytes(), resend_request(true, b'\r').as_slice());

	let first = login(&mut client).await;
	let again = exchange(&mut client, &resend).await;
	assert_eq!(first, again);
	assert_eq!(h.calls.get(Command::Login), 1);
}

#[tokio::test]
async fn end_session_closes_when_tenant_asks_for_it() {
	let h = Harness::new(connect_resolver());
	let (mut client, task) = h.start();
	login(&mut client).await;

	let end = format!("35{DATE}AOinst|AApatron|");
	let response = exchange(&mut client, &frame(&end, 1)).await;
	assert_eq!(response.as_bytes(), frame("36Y", 1).as_slice());

	let mut rest = Vec::new();
	let n = timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
		.await
		.expect("closed in time")
		.expect("read");
	assert_eq!(n, 0);
	task.await.expect("join").expect("clean close");
}

#[tokio::test]
async fn slow_handler_times_out_with_generic_failure() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();
	login(&mut client).await;

	let renew_all = format!("65{DATE}AOinst|AApatron|");
	let response = exchange(&mut client, &frame(&renew_all, 1)).await;
	assert_eq!(response.as_bytes(), frame(&format!("66AF{PROBLEM}|"), 1).as_slice());
	assert_eq!(h.metrics().request_errors, 1);
}

#[tokio::test]
async fn unresolved_tenant_closes_the_connection() {
	let h = Harness::new(Vec::new());
	let (mut client, task) = h.start();

	let mut rest = Vec::new();
	let n = timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
		.await
		.expect("closed in time")
		.expect("read");
	assert_eq!(n, 0);
	assert!(task.await.expect("join").is_err());
}

#[tokio::test]
async fn login_phase_resolver_keeps_connection_open() {
	let h = Harness::new(vec![Arc::new(DefaultResolver::new(
		ResolvePhase::Login,
		TenantId::new("diku").expect("tenant"),
	))]);
	let (mut client, _task) = h.start();

	let response = exchange(&mut client, &frame("9900302.00", 0)).await;
	assert_eq!(response.as_bytes(), frame("98Y", 0).as_slice());
}

#[tokio::test]
async fn idle_session_is_closed() {
	let h = Harness::with_config(connect_resolver(), SessionConfig {
		idle_timeout: Duration::from_millis(50),
		..SessionConfig::default()
	});
	let (mut client, task) = h.start();

	let mut rest = Vec::new();
	let n = timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
		.await
		.expect("closed in time")
		.expect("read");
	assert_eq!(n, 0);
	task.await.expect("join").expect("idle close is not an error");
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();

	let mut burst = frame("9300CNsc|COpw|", 0);
	burst.extend(frame(&checkout(), 1));
	burst.extend(frame("9900302.00", 2));
	send(&mut client, &burst).await;

	assert_eq!(read_frame(&mut client).await, frame("941", 0));
	assert_eq!(read_frame(&mut client).await, frame("121", 1));
	assert_eq!(read_frame(&mut client).await, frame("98Y", 2));
}

#[tokio::test]
async fn template_failure_sends_empty_body_and_counts_response_error() {
	let h = Harness::new(connect_resolver());
	let (mut client, _task) = h.start();
	login(&mut client).await;

	let fee_paid = format!("37{DATE}0100USDAOinst|AApatron|BV1.00|");
	let response = exchange(&mut client, &frame(&fee_paid, 1)).await;
	assert_eq!(response.as_bytes(), frame("", 1).as_slice());
	assert_eq!(h.calls.get(Command::FeePaid), 1);

	let metrics = h.metrics();
	assert_eq!(metrics.response_errors, 1);
	assert_eq!(metrics.request_errors, 0);
}

/// Harness running the stock handler table against `login_client`.
fn with_default_handlers(resolvers: Vec<Arc<dyn TenantResolver>>, login_client: Arc<dyn LoginClient>) -> Harness {
	let tenant_config = Arc::new(TenantConfigStore::new());
	tenant_config.replace(parse_document(TENANTS).expect("tenant doc"));

	let services = GatewayServices::assemble(GatewayParts {
		session: SessionConfig {
			idle_timeout: Duration::from_secs(5),
			upstream_timeout: Duration::from_millis(400),
			..SessionConfig::default()
		},
		token_cache_capacity: 8,
		resolvers: TenantResolverPipeline::new(resolvers),
		tenant_config,
		renderer: renderer(),
		login_client,
		platform: Arc::new(Unreachable),
	});
	Harness {
		services: Arc::new(services),
		calls: Arc::new(Calls::default()),
	}
}

#[tokio::test]
async fn stalled_upstream_login_is_answered_before_the_dispatch_deadline() {
	let h = with_default_handlers(connect_resolver(), Arc::new(StalledLogin));
	let (mut client, _task) = h.start();

	let response = login(&mut client).await;
	assert_eq!(response.as_bytes(), frame("940", 0).as_slice());
	assert_eq!(h.services.token_cache().pending_logins(), 0);
}

#[tokio::test]
async fn login_retry_keeps_stripping_the_tenant_prefix() {
	let upstream = Arc::new(RecordingLogin::default());
	let h = with_default_handlers(
		vec![Arc::new(UsernamePrefixResolver::new("/", BTreeSet::new()))],
		upstream.clone(),
	);
	let (mut client, _task) = h.start();

	let rejected = exchange(&mut client, &frame("9300CNdiku/alice|COwrong|", 0)).await;
	assert_eq!(rejected.as_bytes(), frame("940", 0).as_slice());

	// A different prefix cannot rebind the session and never reaches upstream.
	let other = exchange(&mut client, &frame("9300CNother/alice|COright|", 1)).await;
	assert_eq!(other.as_bytes(), frame("940", 1).as_slice());

	let accepted = exchange(&mut client, &frame("9300CNdiku/alice|COright|", 2)).await;
	assert_eq!(accepted.as_bytes(), frame("941", 2).as_slice());

	assert_eq!(upstream.users(), ["alice", "alice"]);
}
