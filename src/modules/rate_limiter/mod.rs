//! Quota, time-slot and jitter gating for outbound requests.
//!
//! All admission decisions and ledger mutations happen under one mutex: a
//! permitted call reserves its slot before the lock is released, so two
//! concurrent callers can never both be admitted against the same free slot.

pub mod time_slots;

use chrono::{DateTime, FixedOffset, Utc};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{RateLimitConfig, TimeSlotConfig};
use crate::modules::clock::{Clock, chrono_duration, elapsed_between};
use crate::modules::ledger::{RequestCategory, RequestLedger, RequestRecord, ReservationId};

use self::time_slots::{next_slot_start, within_slots};

const WINDOW_BUFFER: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Policy refusal. The caller decides whether to back off and retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for {category}: {reason} (retry in {}s)", wait.as_secs())]
pub struct RateLimitExceeded {
    pub category: RequestCategory,
    pub reason: String,
    pub wait: Duration,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Delay before the call may start (allowed) or before retrying (denied).
    pub wait: Duration,
    pub reason: Option<String>,
}

impl RateDecision {
    fn allow(wait: Duration) -> Self {
        Self {
            allowed: true,
            wait,
            reason: None,
        }
    }

    fn deny(wait: Duration, reason: String) -> Self {
        Self {
            allowed: false,
            wait,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub average_duration_ms: u64,
    pub last_hour: usize,
    pub last_day: usize,
    pub pending: usize,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    time_slots: TimeSlotConfig,
    offset: FixedOffset,
    ledger: Mutex<RequestLedger>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, time_slots: TimeSlotConfig, clock: Arc<dyn Clock>) -> Self {
        let offset = config.offset();
        Self {
            config,
            time_slots,
            offset,
            ledger: Mutex::new(RequestLedger::new()),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RequestLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evaluates whether a `category` call could start now, without reserving.
    pub fn check_and_wait(&self, category: RequestCategory) -> RateDecision {
        let now = self.clock.now();
        let mut ledger = self.lock();
        ledger.prune(now);
        self.evaluate(&ledger, category, now)
    }

    fn evaluate(&self, ledger: &RequestLedger, category: RequestCategory, now: DateTime<Utc>) -> RateDecision {
        let windows = [
            ("minute", MINUTE, self.config.requests_per_minute),
            ("hour", HOUR, self.config.requests_per_hour),
            ("day", DAY, self.config.requests_per_day),
        ];
        for (label, window, cap) in windows {
            let since = now - chrono_duration(window);
            let used = ledger.count_since(since);
            if used >= cap as usize {
                let oldest = ledger.oldest_since(since).unwrap_or(now);
                let wait = elapsed_between(now, oldest + chrono_duration(window)) + WINDOW_BUFFER;
                return RateDecision::deny(
                    wait,
                    format!("per-{label} quota of {cap} requests reached"),
                );
            }
        }

        if let Some(slots) = self.time_slots.slots_for(category)
            && !within_slots(slots, now, self.offset)
        {
            let wait = next_slot_start(slots, now, self.offset)
                .map(|start| elapsed_between(now, start))
                .unwrap_or(DAY);
            return RateDecision::deny(wait, format!("outside allowed time slots for {category}"));
        }

        RateDecision::allow(self.smart_delay(ledger.last_request(), now))
    }

    /// Larger of the burst gap (`min_jitter - since_last`) and a uniform
    /// random delay in the jitter range.
    fn smart_delay(&self, last_request: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let (min, max) = self.config.jitter_bounds();
        let burst_gap = last_request
            .map(|last| {
                let since_last_ms = (now - last).num_milliseconds();
                let gap = (min.as_millis() as i64).saturating_sub(since_last_ms);
                Duration::from_millis(gap.max(0) as u64)
            })
            .unwrap_or(Duration::ZERO);
        let random = Duration::from_millis(
            rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64),
        );
        burst_gap.max(random)
    }

    /// Admits and reserves a slot for one `category` call.
    pub fn acquire(&self, category: RequestCategory) -> Result<RatePermit<'_>, RateLimitExceeded> {
        let now = self.clock.now();
        let mut ledger = self.lock();
        ledger.prune(now);

        let decision = self.evaluate(&ledger, category, now);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "request not permitted".into());
            log::warn!(
                "rate limiter refused {category}: {reason}, retry in {}s",
                decision.wait.as_secs()
            );
            return Err(RateLimitExceeded {
                category,
                reason,
                wait: decision.wait,
            });
        }
        if decision.wait > self.config.max_wait() {
            return Err(RateLimitExceeded {
                category,
                reason: format!(
                    "computed delay of {}ms exceeds the {}ms ceiling",
                    decision.wait.as_millis(),
                    self.config.max_wait().as_millis()
                ),
                wait: decision.wait,
            });
        }

        let id = ledger.reserve(category, now + chrono_duration(decision.wait));
        log::debug!("rate limiter admitted {category} after {}ms", decision.wait.as_millis());
        Ok(RatePermit {
            limiter: self,
            id,
            category,
            delay: decision.wait,
            started: None,
            finished: false,
        })
    }

    /// Check, wait, run `operation`, then record its outcome. The outcome is
    /// recorded even if the returned future is dropped mid-flight.
    pub async fn execute<F, Fut, T, E>(&self, category: RequestCategory, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitExceeded>,
    {
        let mut permit = self.acquire(category)?;
        permit.wait().await;
        permit.start();
        let result = operation().await;
        permit.finish(result.is_ok());
        result
    }

    /// Appends an already completed request.
    pub fn record_request(&self, category: RequestCategory, success: bool, duration: Duration) {
        let now = self.clock.now();
        let mut ledger = self.lock();
        ledger.push(RequestRecord {
            timestamp: now,
            category,
            success,
            duration,
        });
        ledger.prune(now);
    }

    fn complete(&self, id: ReservationId, started_at: DateTime<Utc>, success: bool, duration: Duration) {
        let mut ledger = self.lock();
        if let Some(record) = ledger.complete(id, started_at, success, duration) {
            log::debug!(
                "recorded {} request success={} in {}ms",
                record.category,
                record.success,
                record.duration.as_millis()
            );
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let mut ledger = self.lock();
        ledger.prune(now);

        let mut successful = 0usize;
        let mut total_ms = 0u128;
        for record in ledger.records() {
            if record.success {
                successful += 1;
            }
            total_ms += record.duration.as_millis();
        }
        let total = ledger.len();
        let hour_ago = now - chrono_duration(HOUR);
        let day_ago = now - chrono_duration(DAY);

        RateLimiterStats {
            total,
            successful,
            failed: total - successful,
            average_duration_ms: if total == 0 {
                0
            } else {
                (total_ms / total as u128) as u64
            },
            last_hour: ledger.records().filter(|r| r.timestamp > hour_ago).count(),
            last_day: ledger.records().filter(|r| r.timestamp > day_ago).count(),
            pending: ledger.pending(),
        }
    }
}

/// Reserved slot. Dropping it unfinished records a failure.
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
    id: ReservationId,
    category: RequestCategory,
    delay: Duration,
    started: Option<(DateTime<Utc>, Instant)>,
    finished: bool,
}

impl RatePermit<'_> {
    pub fn category(&self) -> RequestCategory {
        self.category
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleeps for the computed human-like delay.
    pub async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Marks the actual start of the call.
    pub fn start(&mut self) {
        self.started = Some((self.limiter.clock.now(), Instant::now()));
    }

    pub fn finish(mut self, success: bool) {
        self.record(success);
    }

    fn record(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let (started_at, duration) = match self.started {
            Some((at, instant)) => (at, instant.elapsed()),
            None => (self.limiter.clock.now(), Duration::ZERO),
        };
        self.limiter.complete(self.id, started_at, success, duration);
    }
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("{} request abandoned before completion", self.category);
            self.record(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use crate::modules::rate_limiter::time_slots::TimeRange;
    use chrono::TimeZone;

    fn limiter_with(per_minute: u32, slots: TimeSlotConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            requests_per_minute: per_minute,
            random_delay_range: [0, 0],
            utc_offset_minutes: Some(0),
            ..RateLimitConfig::default()
        };
        (RateLimiter::new(config, slots, Arc::new(clock.clone())), clock)
    }

    fn limiter(per_minute: u32) -> (RateLimiter, ManualClock) {
        limiter_with(per_minute, TimeSlotConfig::unrestricted())
    }

    #[test]
    fn empty_ledger_allows() {
        let (limiter, _clock) = limiter(2);
        let decision = limiter.check_and_wait(RequestCategory::Search);
        assert!(decision.allowed);
        assert_eq!(decision.wait, Duration::ZERO);
        assert!(decision.reason.is_none());
    }

    #[tokio::test]
    async fn third_call_in_a_minute_is_refused_until_oldest_ages_out() {
        let (limiter, clock) = limiter(2);
        for _ in 0..2 {
            limiter
                .execute(RequestCategory::Search, || async { Ok::<_, RateLimitExceeded>(()) })
                .await
                .unwrap();
            clock.advance(Duration::from_secs(10));
        }

        let refused = limiter
            .execute(RequestCategory::Search, || async { Ok::<_, RateLimitExceeded>(()) })
            .await
            .unwrap_err();
        // Oldest call at t=0, now t=20: 60 - 20 + 1.
        assert_eq!(refused.wait, Duration::from_secs(41));
        assert!(refused.reason.contains("minute"));

        clock.advance(Duration::from_secs(41));
        assert!(limiter.check_and_wait(RequestCategory::Search).allowed);
    }

    #[test]
    fn reservations_block_concurrent_admission() {
        let (limiter, _clock) = limiter(1);
        let permit = limiter.acquire(RequestCategory::Profile).unwrap();
        assert!(limiter.acquire(RequestCategory::Search).is_err());
        permit.finish(true);
        assert!(limiter.acquire(RequestCategory::Search).is_err());
        assert_eq!(limiter.stats().total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_admit_exactly_the_cap() {
        let (limiter, _clock) = limiter(3);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(tokio::sync::Barrier::new(12));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    match limiter.acquire(RequestCategory::Search) {
                        Ok(permit) => {
                            permit.finish(true);
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(limiter.stats().total, 3);
    }

    #[test]
    fn outside_time_slot_waits_for_next_start() {
        let slots = TimeSlotConfig {
            keyword_search: vec!["14:00-16:00".parse::<TimeRange>().unwrap()],
            ..TimeSlotConfig::unrestricted()
        };
        let (limiter, _clock) = limiter_with(5, slots);

        let decision = limiter.check_and_wait(RequestCategory::Search);
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_secs(2 * 3600));
        assert!(decision.reason.unwrap().contains("search"));

        assert!(limiter.check_and_wait(RequestCategory::Generic).allowed);
    }

    #[test]
    fn smart_delay_respects_jitter_range() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            requests_per_minute: 100,
            random_delay_range: [3000, 8000],
            utc_offset_minutes: Some(0),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, TimeSlotConfig::unrestricted(), Arc::new(clock));
        for _ in 0..20 {
            let wait = limiter.check_and_wait(RequestCategory::Generic).wait;
            assert!(wait >= Duration::from_millis(3000) && wait <= Duration::from_millis(8000));
        }
    }

    #[test]
    fn delay_above_ceiling_fails_fast() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            random_delay_range: [5000, 5000],
            max_wait_ms: 1000,
            utc_offset_minutes: Some(0),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, TimeSlotConfig::unrestricted(), Arc::new(clock));
        let err = limiter.acquire(RequestCategory::Generic).err().unwrap();
        assert_eq!(err.wait, Duration::from_millis(5000));
        assert_eq!(limiter.stats().pending, 0);
    }

    #[tokio::test]
    async fn failures_and_cancellations_are_recorded() {
        let (limiter, _clock) = limiter(10);

        let failed: Result<(), RateLimitExceeded> = limiter
            .execute(RequestCategory::Search, || async {
                Err(RateLimitExceeded {
                    category: RequestCategory::Search,
                    reason: "downstream".into(),
                    wait: Duration::ZERO,
                })
            })
            .await;
        assert!(failed.is_err());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            limiter.execute(RequestCategory::Search, || {
                std::future::pending::<Result<(), RateLimitExceeded>>()
            }),
        )
        .await;
        assert!(cancelled.is_err());

        limiter.record_request(RequestCategory::Generic, true, Duration::from_millis(300));

        let stats = limiter.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.last_hour, 3);
    }
}
