#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sip2_domain::TenantId;
use sip2_platform::{AccessToken, LoginClient, PlatformError, SecretString};
use tracing::debug;

/// Cache key: one token per (tenant, upstream user).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
	pub tenant: TenantId,
	pub user: String,
}

impl TokenKey {
	pub fn new(tenant: TenantId, user: impl Into<String>) -> Self {
		Self {
			tenant,
			user: user.into(),
		}
	}
}

struct Slot {
	token: AccessToken,
	stamp: u64,
}

#[derive(Default)]
struct LruState {
	entries: HashMap<TokenKey, Slot>,
	/// Recency order: smallest stamp is the least recently used key.
	order: BTreeMap<u64, TokenKey>,
	clock: u64,
}

impl LruState {
	fn tick(&mut self) -> u64 {
		self.clock += 1;
		self.clock
	}

	fn touch(&mut self, key: &TokenKey) -> Option<&AccessToken> {
		let stamp = self.tick();
		let slot = self.entries.get_mut(key)?;
		self.order.remove(&slot.stamp);
		slot.stamp = stamp;
		self.order.insert(stamp, key.clone());
		Some(&slot.token)
	}

	fn remove(&mut self, key: &TokenKey) -> Option<AccessToken> {
		let slot = self.entries.remove(key)?;
		self.order.remove(&slot.stamp);
		Some(slot.token)
	}

	fn insert(&mut self, key: TokenKey, token: AccessToken, capacity: usize) -> Option<TokenKey> {
		self.remove(&key);

		let mut evicted = None;
		if self.entries.len() >= capacity
			&& let Some((_, oldest)) = self.order.pop_first()
		{
			self.entries.remove(&oldest);
			evicted = Some(oldest);
		}

		let stamp = self.tick();
		self.order.insert(stamp, key.clone());
		self.entries.insert(key, Slot { token, stamp });
		evicted
	}
}

/// Bounded LRU of upstream access tokens.
///
/// Concurrent misses for the same key share a single login call; other keys
/// are never blocked by it. A stale token stays cached until replaced.
pub struct TokenCache {
	capacity: usize,
	login_timeout: Duration,
	state: Mutex<LruState>,
	inflight: Mutex<HashMap<TokenKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for TokenCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenCache")
			.field("capacity", &self.capacity)
			.field("len", &self.len())
			.finish()
	}
}

impl TokenCache {
	pub fn new(capacity: usize, login_timeout: Duration) -> Self {
		Self {
			capacity: capacity.max(1),
			login_timeout,
			state: Mutex::new(LruState::default()),
			inflight: Mutex::new(HashMap::new()),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, key: &TokenKey) -> bool {
		self.state.lock().entries.contains_key(key)
	}

	/// Cached token if present and not stale. Refreshes recency either way.
	pub fn get_fresh(&self, key: &TokenKey) -> Option<AccessToken> {
		let now = Utc::now();
		let mut state = self.state.lock();
		state.touch(key).filter(|t| !t.is_stale_at(now)).cloned()
	}

	/// Insert or replace; returns the evicted key when capacity was reached.
	pub fn insert(&self, key: TokenKey, token: AccessToken) -> Option<TokenKey> {
		let evicted = self.state.lock().insert(key, token, self.capacity);
		if let Some(evicted) = &evicted {
			debug!(tenant = %evicted.tenant, user = %evicted.user, "token cache evicted least recently used entry");
			metrics::counter!("sip2_gateway_token_cache_evictions_total").increment(1);
		}
		evicted
	}

	/// Drop the entry for `key` (e.g. after the platform rejected it).
	pub fn invalidate(&self, key: &TokenKey) -> bool {
		self.state.lock().remove(key).is_some()
	}

	/// Return a fresh token for `(tenant, user)`, logging in through `client` on a miss.
	pub async fn get_or_authenticate(
		&self,
		tenant: &TenantId,
		user: &str,
		password: &SecretString,
		client: &dyn LoginClient,
	) -> Result<AccessToken, PlatformError> {
		let key = TokenKey::new(tenant.clone(), user);
		self.get_or_authenticate_with(key, || client.login(tenant, user, password))
			.await
	}

	/// Same as [`TokenCache::get_or_authenticate`] with an arbitrary login future.
	pub async fn get_or_authenticate_with<F, Fut>(&self, key: TokenKey, login: F) -> Result<AccessToken, PlatformError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<AccessToken, PlatformError>>,
	{
		if let Some(token) = self.get_fresh(&key) {
			metrics::counter!("sip2_gateway_token_cache_hits_total").increment(1);
			return Ok(token);
		}

		let inflight = InflightLogin::join(self, key.clone());
		let _guard = inflight.gate.lock().await;

		// Another task may have logged in while we waited.
		if let Some(token) = self.get_fresh(&key) {
			metrics::counter!("sip2_gateway_token_cache_hits_total").increment(1);
			return Ok(token);
		}

		metrics::counter!("sip2_gateway_token_cache_misses_total").increment(1);
		let result = match tokio::time::timeout(self.login_timeout, login()).await {
			Ok(result) => result,
			Err(_) => Err(PlatformError::Timeout),
		};

		if let Ok(token) = &result {
			self.insert(key, token.clone());
		}
		result
	}

	/// Keys with a login in progress or callers waiting on one.
	pub fn pending_logins(&self) -> usize {
		self.inflight.lock().len()
	}
}

/// A caller's share of a key's single-flight gate.
///
/// Dropping it (including when the caller's future is cancelled) removes the
/// gate once no other caller holds it.
struct InflightLogin<'a> {
	cache: &'a TokenCache,
	key: TokenKey,
	gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InflightLogin<'a> {
	fn join(cache: &'a TokenCache, key: TokenKey) -> Self {
		let gate = Arc::clone(cache.inflight.lock().entry(key.clone()).or_default());
		Self { cache, key, gate }
	}
}

impl Drop for InflightLogin<'_> {
	fn drop(&mut self) {
		let mut inflight = self.cache.inflight.lock();
		// Map entry plus ours; anything more means another caller still needs it.
		if Arc::strong_count(&self.gate) <= 2
			&& let Some(current) = inflight.get(&self.key)
			&& Arc::ptr_eq(current, &self.gate)
		{
			inflight.remove(&self.key);
		}
	}
}
