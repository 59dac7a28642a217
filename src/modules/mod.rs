//! Cross-cutting services module
//!
//! Request accounting, quota gating, risk detection, caching, synthetic
//! fallback data and client lifecycle events.

pub mod cache;
pub mod clock;
pub mod events;
pub mod fallback;
pub mod ledger;
pub mod rate_limiter;
pub mod risk;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheKey, ResultCache};
pub use clock::{Clock, ManualClock, SystemClock, system_clock};
pub use events::{
    AttemptEvent, CacheHitEvent, ClientEvent, EventDispatcher, EventHandler, FallbackEvent,
    LoggingHandler, RateLimitedEvent, ResponseEvent, RetryEvent, RiskBlockedEvent,
};
pub use fallback::FallbackGenerator;
pub use ledger::{RequestCategory, RequestLedger, RequestRecord};
pub use rate_limiter::time_slots::TimeRange;
pub use rate_limiter::{RateDecision, RateLimitExceeded, RateLimiter, RateLimiterStats, RatePermit};
pub use risk::{
    PhraseRule, ResponseProbe, RiskLevel, RiskMonitor, RiskSignal, RiskStatus, RiskVerdict,
    Severity, SignalDetector, SignalKind,
};
