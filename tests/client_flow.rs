use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use xhs_bridge::modules::{ClientEvent, EventHandler, ManualClock, RiskLevel};
use xhs_bridge::sidecar::rpc::{RawResponse, RpcRequest};
use xhs_bridge::{
    Client, ClientError, DataSource, Environment, IntegrationConfig, SearchOptions, ServiceControl,
    ServiceError, ServiceStatus, SidecarTransport, TimeSlotConfig, TransportError,
};

type Responder = Box<dyn Fn(&RpcRequest) -> Result<RawResponse, TransportError> + Send + Sync>;

struct FakeTransport {
    responder: Mutex<Responder>,
    calls: AtomicUsize,
    hang: AtomicBool,
    health_status: AtomicU16,
}

impl FakeTransport {
    fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder: Mutex::new(responder),
            calls: AtomicUsize::new(0),
            hang: AtomicBool::new(false),
            health_status: AtomicU16::new(200),
        })
    }

    fn respond_with(&self, responder: Responder) {
        *self.responder.lock().unwrap() = responder;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SidecarTransport for FakeTransport {
    async fn call(&self, request: &RpcRequest) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        (self.responder.lock().unwrap())(request)
    }

    async fn health(&self) -> Result<RawResponse, TransportError> {
        match self.health_status.load(Ordering::SeqCst) {
            200 => Ok(RawResponse::new(200, "{}")),
            status => Ok(RawResponse::new(status, "too many requests")),
        }
    }
}

struct FakeService {
    running: bool,
    start_fails: bool,
}

#[async_trait]
impl ServiceControl for FakeService {
    async fn service_status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.running,
            healthy: self.running,
            ..ServiceStatus::default()
        }
    }

    async fn ensure_running(&self) -> Result<(), ServiceError> {
        if self.start_fails {
            Err(ServiceError::StartupTimeout(Duration::from_secs(30)))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct FallbackCounter(AtomicUsize);

impl EventHandler for FallbackCounter {
    fn handle(&self, event: &ClientEvent) {
        if matches!(event, ClientEvent::Fallback(_)) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn config(per_minute: u32, retry_attempts: u32) -> IntegrationConfig {
    let mut config = IntegrationConfig::for_environment(Environment::Test);
    config.rate_limit.requests_per_minute = per_minute;
    config.rate_limit.requests_per_hour = 1_000;
    config.rate_limit.requests_per_day = 1_000;
    config.rate_limit.random_delay_range = [0, 0];
    config.rate_limit.utc_offset_minutes = Some(0);
    config.time_slots = TimeSlotConfig::unrestricted();
    config.client.retry_attempts = retry_attempts;
    config.client.retry_base_delay_ms = 1;
    config.client.batch_delay_ms = 0;
    config
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()))
}

fn client_with(
    config: IntegrationConfig,
    transport: Arc<FakeTransport>,
    service: FakeService,
) -> Client {
    Client::builder(config)
        .with_transport(transport)
        .with_service_control(Arc::new(service))
        .with_clock(clock())
        .build()
        .unwrap()
}

fn running() -> FakeService {
    FakeService {
        running: true,
        start_fails: false,
    }
}

fn rpc_ok(result: Value) -> Result<RawResponse, TransportError> {
    Ok(RawResponse::new(
        200,
        json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string(),
    ))
}

fn mcp_text(payload: Value) -> Value {
    json!({ "content": [{ "type": "text", "text": payload.to_string() }] })
}

fn search_payload() -> Value {
    mcp_text(json!({
        "feeds": [
            {
                "id": "n1",
                "note_card": {
                    "display_title": "手冲咖啡入门",
                    "user": { "user_id": "u1", "nickname": "阿杰" },
                    "interact_info": {
                        "liked_count": "1.2万",
                        "comment_count": "30",
                        "collected_count": "800",
                        "share_count": "12"
                    }
                }
            },
            {
                "id": "n2",
                "note_card": {
                    "display_title": "拿铁拉花",
                    "user": { "user_id": "u2", "nickname": "小满" },
                    "interact_info": {
                        "liked_count": "450",
                        "comment_count": "80",
                        "collected_count": "90",
                        "share_count": "3"
                    }
                }
            }
        ]
    }))
}

fn sidecar_responder() -> Responder {
    Box::new(|request: &RpcRequest| match request.method.as_str() {
        "search_feeds" => rpc_ok(search_payload()),
        "get_feed_detail" => rpc_ok(json!({
            "data": { "note": { "title": "详情", "interact_info": { "liked_count": "10" } } }
        })),
        "user_profile" => rpc_ok(mcp_text(json!({
            "userBasicInfo": { "nickname": "咖啡师", "desc": "每天一杯" },
            "interactions": [
                { "type": "follows", "count": "12" },
                { "type": "fans", "count": "3.4万" },
                { "type": "interaction", "count": "1000" }
            ]
        }))),
        other => Err(TransportError::Other(format!("unexpected method {other}"))),
    })
}

fn unreachable() -> Responder {
    Box::new(|_: &RpcRequest| {
        Err(TransportError::Connect {
            url: "http://localhost:18060/mcp".into(),
            message: "connection refused".into(),
        })
    })
}

#[tokio::test]
async fn live_search_is_cached_and_seeds_post_cache() {
    let transport = FakeTransport::new(sidecar_responder());
    let client = client_with(config(10, 3), transport.clone(), running());

    let first = client.search_posts("咖啡", SearchOptions::default()).await.unwrap();
    assert_eq!(first.source, DataSource::Live);
    assert!(!first.cached);
    assert_eq!(first.posts.len(), 2);
    assert_eq!(first.posts[0].stats.likes, 12_000);

    let second = client.search_posts(" 咖啡 ", SearchOptions::default()).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.source, DataSource::Cache);

    let detail = client.get_post_details(&first.posts[0].url).await.unwrap();
    assert!(detail.is_cached());
    assert_eq!(detail.data.id, "n1");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn third_search_in_a_minute_is_rate_limited() {
    let transport = FakeTransport::new(unreachable());
    let client = client_with(config(2, 1), transport.clone(), running());

    let first = client.search_posts("ai", SearchOptions::default()).await.unwrap();
    assert!(first.is_fallback());
    assert_eq!(first.posts[0].id, "mock_ai_0");
    let second = client.search_posts("ai", SearchOptions::default()).await.unwrap();
    assert!(second.is_fallback());
    assert!(!second.cached);

    let err = client.search_posts("ai", SearchOptions::default()).await.unwrap_err();
    match err {
        ClientError::RateLimitExceeded(limit) => assert!(limit.wait > Duration::ZERO),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn http_429_blocks_until_cooldown_is_ended() {
    let transport = FakeTransport::new(Box::new(|_: &RpcRequest| Ok(RawResponse::new(429, ""))));
    let client = client_with(config(10, 3), transport.clone(), running());

    let err = client.search_posts("ai", SearchOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::RiskBlocked { level: RiskLevel::Blocked, .. }));
    assert!(err.retry_after().unwrap() > Duration::ZERO);

    let err = client.search_posts("ml", SearchOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::RiskBlocked { .. }));
    assert_eq!(transport.calls(), 1);
    assert!(client.risk_monitor().status().cooldown_until.is_some());

    transport.respond_with(sidecar_responder());
    client.risk_monitor().end_cooldown();
    assert_eq!(client.risk_monitor().check().level, RiskLevel::Safe);
    let result = client.search_posts("ml", SearchOptions::default()).await.unwrap();
    assert_eq!(result.source, DataSource::Live);
    assert_eq!(client.risk_monitor().status().consecutive_failures, 0);
}

#[tokio::test]
async fn health_429_starts_cooldown_without_respawning() {
    let transport = FakeTransport::new(sidecar_responder());
    transport.health_status.store(429, Ordering::SeqCst);
    let client = Client::builder(config(10, 3))
        .with_transport(transport.clone())
        .with_clock(clock())
        .build()
        .unwrap();

    let err = client.search_posts("ai", SearchOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::RiskBlocked { level: RiskLevel::Blocked, .. }));
    assert!(client.risk_monitor().status().cooldown_until.is_some());

    let err = client.search_posts("ml", SearchOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::RiskBlocked { .. }));
    assert_eq!(transport.calls(), 0);

    let manager = client.service_manager().unwrap();
    assert!(manager.pid().is_none());
    assert!(!manager.is_health_loop_active());

    let health = client.check_health().await;
    assert!(health.service.running && !health.service.healthy);
    assert_eq!(health.service.http_status, Some(429));
    assert_eq!(health.risk.level, RiskLevel::Blocked);
}

#[tokio::test]
async fn check_health_reports_throttled_sidecar_as_blocked() {
    let transport = FakeTransport::new(sidecar_responder());
    transport.health_status.store(429, Ordering::SeqCst);
    let client = Client::builder(config(10, 3))
        .with_transport(transport)
        .with_clock(clock())
        .build()
        .unwrap();

    assert_eq!(client.risk_monitor().status().level, RiskLevel::Safe);
    let health = client.check_health().await;
    assert_eq!(health.risk.level, RiskLevel::Blocked);
    assert!(health.risk.consecutive_failures >= 1);
}

#[tokio::test]
async fn unreachable_sidecar_degrades_post_details() {
    let transport = FakeTransport::new(unreachable());
    let counter = Arc::new(FallbackCounter::default());
    let client = Client::builder(config(10, 3))
        .with_transport(transport.clone())
        .with_service_control(Arc::new(running()))
        .with_clock(clock())
        .with_event_handler(counter.clone())
        .build()
        .unwrap();

    let url = "https://www.xiaohongshu.com/explore/64b1c2d3e4f5";
    let post = client.get_post_details(url).await.unwrap();
    assert!(post.is_fallback());
    assert_eq!(post.data.id, "64b1c2d3e4f5");
    assert_eq!(transport.calls(), 3);

    let again = client.get_post_details(url).await.unwrap();
    assert!(again.is_fallback());
    assert_eq!(transport.calls(), 6);
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_service_start_degrades_without_calling_sidecar() {
    let transport = FakeTransport::new(sidecar_responder());
    let service = FakeService {
        running: false,
        start_fails: true,
    };
    let client = client_with(config(10, 3), transport.clone(), service);

    let profile = client.get_user_profile("5f3a9b2c").await.unwrap();
    assert!(profile.is_fallback());
    assert_eq!(profile.data.user_id, "5f3a9b2c");
    assert_eq!(transport.calls(), 0);
    assert_eq!(client.rate_limiter().stats().failed, 1);
}

#[tokio::test]
async fn cancelled_search_records_failure_and_skips_fallback() {
    let transport = FakeTransport::new(sidecar_responder());
    transport.hang.store(true, Ordering::SeqCst);
    let client = client_with(config(10, 3), transport.clone(), running());

    let result = client
        .with_cancellation(
            client.search_posts("ai", SearchOptions::default()),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(ClientError::Cancelled)));

    let stats = client.rate_limiter().stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn profile_urls_resolve_to_user_ids() {
    let transport = FakeTransport::new(sidecar_responder());
    let client = client_with(config(10, 3), transport, running());

    let profile = client
        .get_user_from_profile_url("https://www.xiaohongshu.com/user/profile/5f3a9b2c?xsec_source=pc")
        .await
        .unwrap();
    assert_eq!(profile.source, DataSource::Live);
    assert_eq!(profile.data.user_id, "5f3a9b2c");
    assert_eq!(profile.data.nickname, "咖啡师");
    assert_eq!(profile.data.stats.followers, 34_000);

    let err = client
        .get_user_from_profile_url("https://example.com/somebody")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
}

#[tokio::test]
async fn batch_details_list_failures_next_to_posts() {
    let transport = FakeTransport::new(sidecar_responder());
    let client = client_with(config(10, 3), transport, running());

    let urls = vec![
        "https://www.xiaohongshu.com/explore/aaa111".to_string(),
        "   ".to_string(),
        "https://www.xiaohongshu.com/explore/bbb222".to_string(),
    ];
    let outcome = client.get_batch_post_details(&urls).await;
    assert_eq!(outcome.posts.len(), 2);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].url, "   ");
    let ids: Vec<_> = outcome.posts.iter().map(|p| p.data.id.as_str()).collect();
    assert!(ids.contains(&"aaa111") && ids.contains(&"bbb222"));
}

#[tokio::test]
async fn trending_ranks_by_weighted_engagement() {
    let transport = FakeTransport::new(sidecar_responder());
    let client = client_with(config(10, 3), transport, running());

    let trending = client.search_trending("咖啡", 1).await.unwrap();
    assert_eq!(trending.len(), 1);
    assert_eq!(trending[0].post.id, "n1");
    assert!((trending[0].trending_score - 81.25).abs() < 1e-9);
}

#[tokio::test]
async fn batch_search_tags_failed_keywords() {
    let transport = FakeTransport::new(sidecar_responder());
    let client = client_with(config(10, 3), transport, running());

    let keywords = vec!["咖啡".to_string(), " ".to_string()];
    let results = client.batch_search(&keywords, SearchOptions::default()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].source, DataSource::Live);
    assert!(results[1].is_fallback());
    assert!(results[1].posts.is_empty());

    let health = client.check_health().await;
    assert!(health.service.running);
    assert_eq!(health.rate_limits.successful, 1);
}
