//! Resilient acquisition facade.
//!
//! Every live operation runs the same pipeline: result cache, rate limiter,
//! risk gate, sidecar readiness, protocol call with retries, risk analysis
//! of each HTTP response, transformation, cache write-through. Policy
//! refusals (rate limit, risk block) surface as errors; infrastructure and
//! protocol failures degrade to tagged fallback data instead.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{CacheConfig, ClientConfig, IntegrationConfig};
use crate::models::{
	BatchFailure, BatchOutcome, DataSource, Fetched, Post, SearchOptions, SearchResult, SortBy,
	TrendingPost, UserProfile, rank_trending,
};
use crate::modules::cache::{CacheKey, ResultCache};
use crate::modules::clock::{Clock, system_clock};
use crate::modules::events::{
	AttemptEvent, CacheHitEvent, ClientEvent, EventDispatcher, EventHandler, FallbackEvent,
	RateLimitedEvent, ResponseEvent, RetryEvent, RiskBlockedEvent,
};
use crate::modules::fallback::FallbackGenerator;
use crate::modules::ledger::RequestCategory;
use crate::modules::rate_limiter::{RateLimitExceeded, RateLimiter, RateLimiterStats};
use crate::modules::risk::{ResponseProbe, RiskLevel, RiskMonitor, RiskStatus, RiskVerdict};
use crate::sidecar::rpc::{RawResponse, RpcRequest};
use crate::sidecar::transform::{self, TransformError};
use crate::sidecar::{
	ReqwestSidecarTransport, ServiceControl, ServiceManager, ServiceStatus, SidecarTransport,
	TransportError,
};

/// JSON-RPC code used when a payload cannot be decoded or normalized.
const INVALID_PAYLOAD_CODE: i64 = -32700;
const TRENDING_FETCH_CAP: usize = 20;

/// Result alias used across the facade.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ClientError {
	#[error(transparent)]
	RateLimitExceeded(#[from] RateLimitExceeded),
	#[error("blocked by risk monitor ({level}), retry in {}s", wait.as_secs())]
	RiskBlocked { level: RiskLevel, wait: Duration },
	#[error("sidecar unavailable: {cause}")]
	ServiceUnavailable { cause: String },
	#[error("protocol error {code}: {message}")]
	Protocol { code: i64, message: String },
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("operation cancelled")]
	Cancelled,
}

impl ClientError {
	/// Refusals the caller must back off from. Never degraded to fallback.
	pub fn is_policy(&self) -> bool {
		matches!(self, ClientError::RateLimitExceeded(_) | ClientError::RiskBlocked { .. })
	}

	/// Wait suggested by a policy refusal.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			ClientError::RateLimitExceeded(err) => Some(err.wait),
			ClientError::RiskBlocked { wait, .. } => Some(*wait),
			_ => None,
		}
	}

	fn degrades_to_fallback(&self) -> bool {
		!self.is_policy() && !matches!(self, ClientError::Cancelled | ClientError::InvalidInput(_))
	}
}

impl From<TransformError> for ClientError {
	fn from(err: TransformError) -> Self {
		ClientError::Protocol {
			code: INVALID_PAYLOAD_CODE,
			message: err.to_string(),
		}
	}
}

/// Combined operational snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
	pub service: ServiceStatus,
	pub risk: RiskStatus,
	pub rate_limits: RateLimiterStats,
}

/// Fluent builder for [`Client`].
pub struct ClientBuilder {
	config: IntegrationConfig,
	transport: Option<Arc<dyn SidecarTransport>>,
	service: Option<Arc<dyn ServiceControl>>,
	clock: Option<Arc<dyn Clock>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	logging: bool,
}

impl ClientBuilder {
	pub fn new(config: IntegrationConfig) -> Self {
		Self {
			config,
			transport: None,
			service: None,
			clock: None,
			handlers: Vec::new(),
			logging: true,
		}
	}

	pub fn with_transport(mut self, transport: Arc<dyn SidecarTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Replaces the default [`ServiceManager`].
	pub fn with_service_control(mut self, service: Arc<dyn ServiceControl>) -> Self {
		self.service = Some(service);
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_logging_events(mut self) -> Self {
		self.logging = false;
		self
	}

	pub fn build(self) -> ClientResult<Client> {
		let config = self.config;
		let clock = self.clock.unwrap_or_else(system_clock);
		let transport: Arc<dyn SidecarTransport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestSidecarTransport::new(
				&config.sidecar,
				config.client.request_timeout(),
			)?),
		};

		let (service, manager): (Arc<dyn ServiceControl>, Option<ServiceManager>) = match self.service {
			Some(service) => (service, None),
			None => {
				let manager = ServiceManager::new(config.sidecar.clone(), transport.clone());
				let service: Arc<dyn ServiceControl> = Arc::new(manager.clone());
				(service, Some(manager))
			}
		};

		let mut events = if self.logging {
			EventDispatcher::with_logging()
		} else {
			EventDispatcher::new()
		};
		for handler in self.handlers {
			events.register_handler(handler);
		}

		Ok(Client {
			rate_limiter: Arc::new(RateLimiter::new(
				config.rate_limit.clone(),
				config.time_slots.clone(),
				clock.clone(),
			)),
			risk: Arc::new(RiskMonitor::new(&config.risk_monitoring, clock.clone())),
			searches: ResultCache::new(config.cache.search_ttl(), clock.clone()),
			posts: ResultCache::new(config.cache.post_ttl(), clock.clone()),
			profiles: ResultCache::new(config.cache.profile_ttl(), clock.clone()),
			fallback: FallbackGenerator::new(clock.clone()),
			events: Arc::new(events),
			settings: config.client,
			cache_config: config.cache,
			transport,
			service,
			manager,
			clock,
		})
	}
}

/// Entry point for collaborators.
pub struct Client {
	transport: Arc<dyn SidecarTransport>,
	service: Arc<dyn ServiceControl>,
	manager: Option<ServiceManager>,
	rate_limiter: Arc<RateLimiter>,
	risk: Arc<RiskMonitor>,
	searches: ResultCache<SearchResult>,
	posts: ResultCache<Post>,
	profiles: ResultCache<UserProfile>,
	fallback: FallbackGenerator,
	events: Arc<EventDispatcher>,
	settings: ClientConfig,
	cache_config: CacheConfig,
	clock: Arc<dyn Clock>,
}

impl Client {
	/// Client wired with the reqwest transport and a process manager.
	pub fn new(config: IntegrationConfig) -> ClientResult<Self> {
		ClientBuilder::new(config).build()
	}

	pub fn builder(config: IntegrationConfig) -> ClientBuilder {
		ClientBuilder::new(config)
	}

	pub fn rate_limiter(&self) -> &RateLimiter {
		&self.rate_limiter
	}

	pub fn risk_monitor(&self) -> &RiskMonitor {
		&self.risk
	}

	/// Process manager, when the client created its own.
	pub fn service_manager(&self) -> Option<&ServiceManager> {
		self.manager.as_ref()
	}

	pub fn clear_cache(&self) {
		self.searches.clear();
		self.posts.clear();
		self.profiles.clear();
	}

	/// Searches posts for `keyword`.
	pub async fn search_posts(&self, keyword: &str, options: SearchOptions) -> ClientResult<SearchResult> {
		const OPERATION: &str = "search_posts";
		let keyword = keyword.trim();
		if keyword.is_empty() {
			return Err(ClientError::InvalidInput("search keyword is empty".into()));
		}
		let key = CacheKey::new(
			"search",
			keyword,
			&[
				("limit", options.limit.to_string()),
				("sortBy", options.sort_by.as_str().to_string()),
			],
		);
		if let Some(hit) = self.searches.get(&key) {
			self.cache_hit(OPERATION, &key);
			return Ok(hit.as_cached());
		}

		let live = self
			.live(
				OPERATION,
				RequestCategory::Search,
				|| RpcRequest::search_feeds(keyword),
				|value| transform::search_result(keyword, value, self.clock.now()),
			)
			.await;

		match self.degrade(OPERATION, live)? {
			Some(result) => {
				let result = shape_search(result, options);
				self.searches.put(key, result.clone(), self.cache_config.search_ttl());
				for post in &result.posts {
					self.posts.put(post_key(&post.url), post.clone(), self.cache_config.post_ttl());
				}
				Ok(result)
			}
			None => Ok(self.fallback.search_result(keyword, options.limit)),
		}
	}

	/// Fetches one post by URL.
	pub async fn get_post_details(&self, url: &str) -> ClientResult<Fetched<Post>> {
		const OPERATION: &str = "get_post_details";
		let url = url.trim();
		if url.is_empty() {
			return Err(ClientError::InvalidInput("post url is empty".into()));
		}
		let key = post_key(url);
		if let Some(hit) = self.posts.get(&key) {
			self.cache_hit(OPERATION, &key);
			return Ok(Fetched::new(hit, DataSource::Cache));
		}

		let feed_id = transform::extract_post_id(url);
		let live = self
			.live(
				OPERATION,
				RequestCategory::PostDetail,
				|| RpcRequest::get_feed_detail(url, feed_id.as_deref()),
				|value| transform::post_detail(value, url, self.clock.now()),
			)
			.await;

		match self.degrade(OPERATION, live)? {
			Some(post) => {
				self.posts.put(key, post.clone(), self.cache_config.post_ttl());
				Ok(Fetched::new(post, DataSource::Live))
			}
			None => Ok(Fetched::new(self.fallback.post(url), DataSource::Fallback)),
		}
	}

	/// Fetches a profile by user id or by any URL carrying one.
	pub async fn get_user_profile(&self, user_id_or_url: &str) -> ClientResult<Fetched<UserProfile>> {
		const OPERATION: &str = "get_user_profile";
		let input = user_id_or_url.trim();
		let user_id = if input.contains('/') {
			transform::extract_user_id(input)
				.ok_or_else(|| ClientError::InvalidInput(format!("no user id in '{input}'")))?
		} else {
			input.to_string()
		};
		if user_id.is_empty() {
			return Err(ClientError::InvalidInput("user id is empty".into()));
		}

		let key = CacheKey::new("profile", &user_id, &[]);
		if let Some(hit) = self.profiles.get(&key) {
			self.cache_hit(OPERATION, &key);
			return Ok(Fetched::new(hit, DataSource::Cache));
		}

		let live = self
			.live(
				OPERATION,
				RequestCategory::Profile,
				|| RpcRequest::user_profile(&user_id),
				|value| transform::user_profile(value, &user_id, self.clock.now()),
			)
			.await;

		match self.degrade(OPERATION, live)? {
			Some(profile) => {
				self.profiles.put(key, profile.clone(), self.cache_config.profile_ttl());
				Ok(Fetched::new(profile, DataSource::Live))
			}
			None => Ok(Fetched::new(self.fallback.profile(&user_id), DataSource::Fallback)),
		}
	}

	/// Profile lookup from a profile, short-link or explore URL.
	pub async fn get_user_from_profile_url(&self, url: &str) -> ClientResult<Fetched<UserProfile>> {
		let user_id = transform::extract_user_id(url)
			.ok_or_else(|| ClientError::InvalidInput(format!("unrecognized profile url '{url}'")))?;
		self.get_user_profile(&user_id).await
	}

	/// Fetches posts in concurrent chunks with a pause between chunks.
	/// Failures are listed in the outcome rather than aborting the batch.
	pub async fn get_batch_post_details(&self, urls: &[String]) -> BatchOutcome {
		let mut outcome = BatchOutcome::default();
		let chunk_size = self.settings.batch_size.max(1);
		let chunks: Vec<&[String]> = urls.chunks(chunk_size).collect();
		let total = chunks.len();

		for (index, chunk) in chunks.into_iter().enumerate() {
			let results = join_all(chunk.iter().map(|url| self.get_post_details(url))).await;
			for (url, result) in chunk.iter().zip(results) {
				match result {
					Ok(post) => outcome.posts.push(post),
					Err(err) => {
						log::warn!("batch fetch of {url} failed: {err}");
						outcome.failures.push(BatchFailure {
							url: url.clone(),
							error: err.to_string(),
						});
					}
				}
			}
			if index + 1 < total {
				sleep(self.settings.batch_delay()).await;
			}
		}
		outcome
	}

	/// Over-fetches, then ranks by weighted engagement.
	pub async fn search_trending(&self, keyword: &str, limit: usize) -> ClientResult<Vec<TrendingPost>> {
		let fetch = (limit * 2).clamp(1, TRENDING_FETCH_CAP);
		let options = SearchOptions {
			limit: fetch,
			sort_by: SortBy::Popular,
		};
		let result = self.search_posts(keyword, options).await?;
		Ok(rank_trending(result.posts, limit))
	}

	/// Searches keywords one after another. A failed keyword yields an empty
	/// fallback-tagged result.
	pub async fn batch_search(&self, keywords: &[String], options: SearchOptions) -> Vec<SearchResult> {
		let mut results = Vec::with_capacity(keywords.len());
		for (index, keyword) in keywords.iter().enumerate() {
			if index > 0 {
				sleep(self.settings.batch_delay()).await;
			}
			match self.search_posts(keyword, options).await {
				Ok(result) => results.push(result),
				Err(err) => {
					log::warn!("batch search for '{keyword}' failed: {err}");
					results.push(SearchResult {
						keyword: keyword.clone(),
						posts: Vec::new(),
						total: 0,
						has_more: false,
						next_cursor: None,
						cached: false,
						source: DataSource::Fallback,
					});
				}
			}
		}
		results
	}

	/// Health snapshot. A non-2xx health answer is fed to the risk monitor
	/// first, so the reported risk level reflects it.
	pub async fn check_health(&self) -> HealthReport {
		let service = self.service.service_status().await;
		if let Err(err) = self.analyze_health("check_health", &service) {
			log::warn!("sidecar health answer tripped the risk monitor: {err}");
		}
		HealthReport {
			service,
			risk: self.risk.status(),
			rate_limits: self.rate_limiter.stats(),
		}
	}

	/// Races `operation` against `cancel`. Cancelling drops the in-flight
	/// call, which records its rate-limiter slot as a failure, and skips
	/// fallback.
	pub async fn with_cancellation<T, F, C>(&self, operation: F, cancel: C) -> ClientResult<T>
	where
		F: Future<Output = ClientResult<T>>,
		C: Future<Output = ()>,
	{
		tokio::select! {
			result = operation => result,
			_ = cancel => {
				log::info!("client operation cancelled by caller");
				Err(ClientError::Cancelled)
			}
		}
	}

	async fn live<T, B, P>(
		&self,
		operation: &'static str,
		category: RequestCategory,
		build: B,
		parse: P,
	) -> ClientResult<T>
	where
		B: Fn() -> RpcRequest,
		P: Fn(&Value) -> Result<T, TransformError>,
	{
		self.risk_gate(operation)?;
		let result = self
			.rate_limiter
			.execute(category, || self.call_sidecar(operation, &build, &parse))
			.await;
		if let Err(ClientError::RateLimitExceeded(err)) = &result {
			self.events.dispatch(ClientEvent::RateLimited(RateLimitedEvent {
				operation,
				category,
				reason: err.reason.clone(),
				wait: err.wait,
				timestamp: self.clock.now(),
			}));
		}
		result
	}

	async fn call_sidecar<T, B, P>(&self, operation: &'static str, build: &B, parse: &P) -> ClientResult<T>
	where
		B: Fn() -> RpcRequest,
		P: Fn(&Value) -> Result<T, TransformError>,
	{
		self.ensure_service(operation).await?;

		let attempts = self.settings.retry_attempts.max(1);
		let mut last_error = None;
		for attempt in 1..=attempts {
			if attempt > 1 {
				let delay = self.settings.backoff(attempt - 1);
				self.events.dispatch(ClientEvent::Retry(RetryEvent {
					operation,
					attempt,
					reason: last_error
						.as_ref()
						.map(ToString::to_string)
						.unwrap_or_default(),
					scheduled_after: delay,
					timestamp: self.clock.now(),
				}));
				sleep(delay).await;
				self.risk_gate(operation)?;
			}

			let request = build();
			self.events.dispatch(ClientEvent::Attempt(AttemptEvent {
				operation,
				method: request.method.clone(),
				attempt,
				timestamp: self.clock.now(),
			}));
			let started = Instant::now();
			let response = match self.transport.call(&request).await {
				Ok(response) => response,
				Err(err) => {
					log::warn!("{operation} attempt {attempt}/{attempts} failed: {err}");
					last_error = Some(ClientError::Transport(err));
					continue;
				}
			};
			self.events.dispatch(ClientEvent::Response(ResponseEvent {
				operation,
				method: request.method.clone(),
				status: response.status,
				latency: started.elapsed(),
				timestamp: self.clock.now(),
			}));

			let decoded = decode_response(&response);
			let verdict = self
				.risk
				.analyze(&ResponseProbe::new(Some(response.status), &response.text()), decoded.is_ok());
			if verdict.is_blocked() {
				return Err(self.risk_blocked(operation, &verdict));
			}

			match decoded.and_then(|value| parse(&value).map_err(ClientError::from)) {
				Ok(data) => return Ok(data),
				Err(err) => {
					log::warn!("{operation} attempt {attempt}/{attempts} failed: {err}");
					last_error = Some(err);
				}
			}
		}

		Err(last_error.unwrap_or_else(|| ClientError::ServiceUnavailable {
			cause: "no attempt was made".into(),
		}))
	}

	async fn ensure_service(&self, operation: &'static str) -> ClientResult<()> {
		let status = self.service.service_status().await;
		self.analyze_health(operation, &status)?;
		if status.running {
			return Ok(());
		}
		self.service
			.ensure_running()
			.await
			.map_err(|err| ClientError::ServiceUnavailable { cause: err.to_string() })
	}

	/// Non-2xx health answers count as failed responses. Healthy answers are
	/// not analysed so they cannot reset the failure streak of real calls.
	fn analyze_health(&self, operation: &'static str, status: &ServiceStatus) -> ClientResult<()> {
		let Some(code) = status.http_status.filter(|_| !status.healthy) else {
			return Ok(());
		};
		let body = status.health_body.as_deref().unwrap_or_default();
		let verdict = self.risk.analyze(&ResponseProbe::new(Some(code), body), false);
		if verdict.is_blocked() {
			return Err(self.risk_blocked(operation, &verdict));
		}
		Ok(())
	}

	fn risk_gate(&self, operation: &'static str) -> ClientResult<()> {
		let verdict = self.risk.check();
		if verdict.is_blocked() {
			return Err(self.risk_blocked(operation, &verdict));
		}
		Ok(())
	}

	fn risk_blocked(&self, operation: &'static str, verdict: &RiskVerdict) -> ClientError {
		let wait = verdict.wait.unwrap_or_else(|| self.risk.cooldown_period());
		self.events.dispatch(ClientEvent::RiskBlocked(RiskBlockedEvent {
			operation,
			level: verdict.level,
			action: verdict.action.clone(),
			wait,
			timestamp: self.clock.now(),
		}));
		ClientError::RiskBlocked {
			level: verdict.level,
			wait,
		}
	}

	/// `Some` on success, `None` when the caller should serve fallback data,
	/// `Err` for errors that must reach the caller.
	fn degrade<T>(&self, operation: &'static str, result: ClientResult<T>) -> ClientResult<Option<T>> {
		match result {
			Ok(data) => Ok(Some(data)),
			Err(err) if err.degrades_to_fallback() => {
				log::warn!("{operation} degraded to fallback data: {err}");
				self.events.dispatch(ClientEvent::Fallback(FallbackEvent {
					operation,
					reason: err.to_string(),
					timestamp: self.clock.now(),
				}));
				Ok(None)
			}
			Err(err) => Err(err),
		}
	}

	fn cache_hit(&self, operation: &'static str, key: &CacheKey) {
		self.events.dispatch(ClientEvent::CacheHit(CacheHitEvent {
			operation,
			key: key.to_string(),
			timestamp: self.clock.now(),
		}));
	}
}

fn post_key(url: &str) -> CacheKey {
	CacheKey::new("post", url, &[])
}

fn decode_response(response: &RawResponse) -> ClientResult<Value> {
	if !response.is_success() {
		let reason = http::StatusCode::from_u16(response.status)
			.ok()
			.and_then(|status| status.canonical_reason())
			.unwrap_or("unexpected status");
		return Err(ClientError::Protocol {
			code: i64::from(response.status),
			message: format!("HTTP {}: {reason}", response.status),
		});
	}
	let envelope = response.rpc().map_err(|err| ClientError::Protocol {
		code: INVALID_PAYLOAD_CODE,
		message: err.to_string(),
	})?;
	envelope.into_result().map_err(|err| ClientError::Protocol {
		code: err.code,
		message: err.message,
	})
}

fn shape_search(mut result: SearchResult, options: SearchOptions) -> SearchResult {
	if options.sort_by == SortBy::Latest {
		result.posts.sort_by(|a, b| b.published_at.cmp(&a.published_at));
	}
	if result.posts.len() > options.limit {
		result.posts.truncate(options.limit);
		result.has_more = true;
	}
	result.total = result.total.max(result.posts.len());
	result
}
