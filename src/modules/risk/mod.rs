//! Risk monitoring and cooldown control.
//!
//! [`RiskMonitor`] is a pure decision function over (response, counters): it
//! performs no I/O and no retries. Callers feed every HTTP response through
//! [`RiskMonitor::analyze`] and consult [`RiskMonitor::check`] before each
//! attempt.

pub mod detectors;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::RiskConfig;
use crate::modules::clock::{Clock, chrono_duration, elapsed_between};

pub use detectors::{
    DetectedSignal, PhraseRule, ResponseProbe, Severity, SignalDetector, SignalKind,
    StatusCodeDetector, default_phrase_rules,
};

const SIGNAL_HISTORY_LIMIT: usize = 100;

/// Timestamped entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSignal {
    pub kind: SignalKind,
    pub severity: Severity,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Caution,
    Danger,
    Blocked,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Caution => "CAUTION",
            RiskLevel::Danger => "DANGER",
            RiskLevel::Blocked => "BLOCKED",
        };
        f.write_str(label)
    }
}

/// Decision returned for each analysed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskVerdict {
    pub proceed: bool,
    pub level: RiskLevel,
    pub action: String,
    pub wait: Option<Duration>,
    pub signals: Vec<RiskSignal>,
}

impl RiskVerdict {
    fn proceed(level: RiskLevel, action: impl Into<String>, signals: Vec<RiskSignal>) -> Self {
        Self {
            proceed: true,
            level,
            action: action.into(),
            wait: None,
            signals,
        }
    }

    fn blocked(wait: Duration, action: impl Into<String>, signals: Vec<RiskSignal>) -> Self {
        Self {
            proceed: false,
            level: RiskLevel::Blocked,
            action: action.into(),
            wait: Some(wait),
            signals,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.level == RiskLevel::Blocked
    }
}

/// Snapshot for operational dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskStatus {
    pub level: RiskLevel,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub last_failure: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub recent_signals: Vec<RiskSignal>,
}

#[derive(Debug, Default)]
struct RiskState {
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    last_failure: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    signals: VecDeque<RiskSignal>,
}

impl RiskState {
    /// Clears an elapsed cooldown. Clearing also resets the failure streak.
    fn expire_cooldown(&mut self, now: DateTime<Utc>) {
        if let Some(until) = self.cooldown_until
            && now > until
        {
            log::info!("risk cooldown elapsed at {until}, resuming");
            self.cooldown_until = None;
            self.consecutive_failures = 0;
        }
    }

    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| now <= *until)
            .map(|until| elapsed_between(now, until))
    }

    /// Starts (or extends) a cooldown lasting `period` from `now`.
    fn enter_cooldown(&mut self, now: DateTime<Utc>, period: Duration) -> Duration {
        let candidate = now + chrono_duration(period);
        let until = match self.cooldown_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        self.cooldown_until = Some(until);
        elapsed_between(now, until)
    }

    fn record_signals(&mut self, signals: &[RiskSignal]) {
        self.signals.extend(signals.iter().cloned());
        while self.signals.len() > SIGNAL_HISTORY_LIMIT {
            self.signals.pop_front();
        }
    }
}

/// Tracks anti-bot signals and drives the cooldown state machine.
pub struct RiskMonitor {
    max_consecutive_failures: u32,
    cooldown: Duration,
    extended_cooldown: Duration,
    detectors: Vec<Arc<dyn SignalDetector>>,
    state: Mutex<RiskState>,
    clock: Arc<dyn Clock>,
}

impl RiskMonitor {
    /// Monitor with the configured phrase rules plus the HTTP status detector.
    pub fn new(config: &RiskConfig, clock: Arc<dyn Clock>) -> Self {
        let mut detectors: Vec<Arc<dyn SignalDetector>> = config
            .phrase_rules
            .iter()
            .cloned()
            .map(|rule| Arc::new(rule) as Arc<dyn SignalDetector>)
            .collect();
        detectors.push(Arc::new(StatusCodeDetector));

        Self {
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            cooldown: config.cooldown_period(),
            extended_cooldown: config.extended_cooldown(),
            detectors,
            state: Mutex::new(RiskState::default()),
            clock,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn SignalDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn cooldown_period(&self) -> Duration {
        self.cooldown
    }

    pub fn extended_cooldown_period(&self) -> Duration {
        self.extended_cooldown
    }

    fn lock(&self) -> MutexGuard<'_, RiskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn detect(&self, probe: &ResponseProbe, now: DateTime<Utc>) -> Vec<RiskSignal> {
        self.detectors
            .iter()
            .filter_map(|detector| detector.detect(probe))
            .map(|signal| RiskSignal {
                kind: signal.kind,
                severity: signal.severity,
                message: signal.message,
                observed_at: now,
            })
            .collect()
    }

    /// Updates counters from one response and returns the resulting verdict.
    pub fn analyze(&self, probe: &ResponseProbe, was_successful: bool) -> RiskVerdict {
        let now = self.clock.now();
        let signals = self.detect(probe, now);

        let mut state = self.lock();
        state.expire_cooldown(now);
        state.record_signals(&signals);
        state.total_requests = state.total_requests.saturating_add(1);

        let cooling = state.cooldown_until.is_some();
        if !was_successful {
            state.total_failures = state.total_failures.saturating_add(1);
            state.last_failure = Some(now);
            if !cooling {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        } else if !cooling {
            state.consecutive_failures = 0;
        }

        if signals.iter().any(|s| s.severity == Severity::Critical) {
            let wait = state.enter_cooldown(now, self.extended_cooldown);
            log::error!(
                "critical risk signal ({}), extended cooldown for {}s",
                describe(&signals),
                wait.as_secs()
            );
            return RiskVerdict::blocked(
                wait,
                "critical risk detected, emergency cooldown engaged",
                signals,
            );
        }

        if let Some(remaining) = state.cooldown_remaining(now) {
            return RiskVerdict::blocked(remaining, "cooldown active, all requests paused", signals);
        }

        if signals.iter().any(|s| s.severity == Severity::High) {
            let wait = state.enter_cooldown(now, self.cooldown);
            log::warn!(
                "high risk signal ({}), cooldown for {}s",
                describe(&signals),
                wait.as_secs()
            );
            return RiskVerdict::blocked(wait, "high risk detected, cooldown engaged", signals);
        }

        if state.consecutive_failures >= self.max_consecutive_failures {
            let wait = state.enter_cooldown(now, self.cooldown);
            log::warn!(
                "{} consecutive failures, cooldown for {}s",
                state.consecutive_failures,
                wait.as_secs()
            );
            return RiskVerdict::blocked(
                wait,
                "too many consecutive failures, cooldown engaged",
                signals,
            );
        }

        if state.consecutive_failures > 0 {
            RiskVerdict::proceed(RiskLevel::Caution, "recent failures, proceed carefully", signals)
        } else {
            RiskVerdict::proceed(RiskLevel::Safe, "continue normally", signals)
        }
    }

    /// Pre-attempt gate. Does not touch counters beyond expiring a finished
    /// cooldown.
    pub fn check(&self) -> RiskVerdict {
        let now = self.clock.now();
        let mut state = self.lock();
        state.expire_cooldown(now);

        if let Some(remaining) = state.cooldown_remaining(now) {
            return RiskVerdict::blocked(remaining, "cooldown active, all requests paused", Vec::new());
        }
        if state.consecutive_failures > 0 {
            RiskVerdict::proceed(RiskLevel::Caution, "recent failures, proceed carefully", Vec::new())
        } else {
            RiskVerdict::proceed(RiskLevel::Safe, "continue normally", Vec::new())
        }
    }

    /// Operational override, e.g. after a manual re-login.
    pub fn end_cooldown(&self) {
        let mut state = self.lock();
        state.cooldown_until = None;
        state.consecutive_failures = 0;
        log::info!("risk cooldown ended manually");
    }

    pub fn reset(&self) {
        *self.lock() = RiskState::default();
    }

    pub fn recent_signals(&self) -> Vec<RiskSignal> {
        self.lock().signals.iter().cloned().collect()
    }

    pub fn status(&self) -> RiskStatus {
        let now = self.clock.now();
        let mut state = self.lock();
        state.expire_cooldown(now);

        let recent_horizon = now - chrono_duration(self.cooldown);
        let level = if state.cooldown_remaining(now).is_some() {
            RiskLevel::Blocked
        } else if state
            .signals
            .iter()
            .any(|s| s.severity >= Severity::High && s.observed_at > recent_horizon)
        {
            RiskLevel::Danger
        } else if state.consecutive_failures > 0 {
            RiskLevel::Caution
        } else {
            RiskLevel::Safe
        };

        let success_rate = if state.total_requests == 0 {
            1.0
        } else {
            let ok = state.total_requests.saturating_sub(state.total_failures) as f64;
            (ok / state.total_requests as f64 * 100.0).round() / 100.0
        };

        RiskStatus {
            level,
            consecutive_failures: state.consecutive_failures,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            success_rate,
            last_failure: state.last_failure,
            cooldown_until: state.cooldown_until,
            recent_signals: state.signals.iter().cloned().collect(),
        }
    }
}

fn describe(signals: &[RiskSignal]) -> String {
    signals
        .iter()
        .map(|s| format!("{}: {}", s.kind, s.message))
        .collect::<Vec<_>>()
        .join(", ")
}
