//! Event system for the acquisition client.
//!
//! Provides hooks for logging and custom reactions around each client
//! operation: attempts, responses, retries, cache hits, risk blocks and
//! fallbacks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::modules::ledger::RequestCategory;
use crate::modules::risk::RiskLevel;

/// A protocol call is about to be sent.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub operation: &'static str,
    pub method: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// The sidecar answered with an HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub operation: &'static str,
    pub method: String,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub operation: &'static str,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub operation: &'static str,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskBlockedEvent {
    pub operation: &'static str,
    pub level: RiskLevel,
    pub action: String,
    pub wait: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimitedEvent {
    pub operation: &'static str,
    pub category: RequestCategory,
    pub reason: String,
    pub wait: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub operation: &'static str,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Attempt(AttemptEvent),
    Response(ResponseEvent),
    Retry(RetryEvent),
    CacheHit(CacheHitEvent),
    RiskBlocked(RiskBlockedEvent),
    RateLimited(RateLimitedEvent),
    Fallback(FallbackEvent),
}

impl ClientEvent {
    pub fn operation(&self) -> &'static str {
        match self {
            ClientEvent::Attempt(e) => e.operation,
            ClientEvent::Response(e) => e.operation,
            ClientEvent::Retry(e) => e.operation,
            ClientEvent::CacheHit(e) => e.operation,
            ClientEvent::RiskBlocked(e) => e.operation,
            ClientEvent::RateLimited(e) => e.operation,
            ClientEvent::Fallback(e) => e.operation,
        }
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ClientEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher preloaded with [`LoggingHandler`].
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ClientEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Attempt(attempt) => {
                log::debug!("-> {} {} (attempt {})", attempt.operation, attempt.method, attempt.attempt);
            }
            ClientEvent::Response(response) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    response.operation,
                    response.method,
                    response.status,
                    response.latency.as_secs_f64()
                );
            }
            ClientEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s: {}",
                    retry.operation,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            ClientEvent::CacheHit(hit) => {
                log::debug!("cache hit {} ({})", hit.operation, hit.key);
            }
            ClientEvent::RiskBlocked(blocked) => {
                log::warn!(
                    "{} blocked at {}: {} (wait {}s)",
                    blocked.operation,
                    blocked.level,
                    blocked.action,
                    blocked.wait.as_secs()
                );
            }
            ClientEvent::RateLimited(limited) => {
                log::warn!(
                    "{} rate limited ({}): {} (wait {}s)",
                    limited.operation,
                    limited.category,
                    limited.reason,
                    limited.wait.as_secs()
                );
            }
            ClientEvent::Fallback(fallback) => {
                log::warn!("{} degraded to fallback data: {}", fallback.operation, fallback.reason);
            }
        }
    }
}
