//! # xhs-bridge
//!
//! Data-acquisition layer for Xiaohongshu content, served through a local
//! MCP sidecar process.
//!
//! The platform actively resists automated access, so every call goes
//! through a multi-window rate limiter and a risk monitor that enters a
//! cooldown when captchas, throttling or ban warnings appear. When the
//! sidecar is down or keeps failing, results degrade to clearly tagged
//! synthetic data instead of errors.
//!
//! ## Features
//!
//! - Minute/hour/day quotas, human-like jitter and time-of-day slots
//! - Data-driven anti-bot signal detection with cooldown escalation
//! - Sidecar process supervision with health polling and auto-restart
//! - TTL result cache and deterministic fallback data
//!
//! ## Example
//!
//! ```no_run
//! use xhs_bridge::{Client, IntegrationConfig, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(IntegrationConfig::from_env()?)?;
//!     let result = client.search_posts("咖啡", SearchOptions::with_limit(5)).await?;
//!     println!("{} posts ({})", result.posts.len(), result.source);
//!     if let Some(manager) = client.service_manager() {
//!         manager.shutdown().await?;
//!     }
//!     Ok(())
//! }
//! ```

mod client;

pub mod config;
pub mod models;
pub mod modules;
pub mod sidecar;

pub use crate::client::{Client, ClientBuilder, ClientError, ClientResult, HealthReport};

pub use crate::config::{
    CacheConfig, ClientConfig, ConfigError, Environment, IntegrationConfig, RateLimitConfig,
    RiskConfig, SidecarConfig, TimeSlotConfig,
};

pub use crate::models::{
    Author, BatchFailure, BatchOutcome, DataSource, Fetched, Post, PostStats, ProfileStats,
    SearchOptions, SearchResult, SortBy, TrendingPost, UserProfile,
};

pub use crate::modules::{
    RateLimitExceeded, RateLimiter, RequestCategory, RiskLevel, RiskMonitor, RiskStatus,
};

pub use crate::sidecar::{
    ConnectionReport, LoginStatus, ReqwestSidecarTransport, ServiceControl, ServiceError,
    ServiceManager, ServiceStatus, SidecarTransport, TransportError,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
