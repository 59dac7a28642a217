//! Anti-bot signal detection.
//!
//! Detection is data driven: each [`PhraseRule`] maps a phrase set to a
//! signal kind, evaluated as a case-insensitive substring match over the raw
//! response body. Extra [`SignalDetector`]s can be plugged into the monitor
//! without touching its control flow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of push-back observed from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Captcha,
    RateLimited,
    LoginRequired,
    SuspiciousActivity,
    UnknownError,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalKind::Captcha => "captcha",
            SignalKind::RateLimited => "rate_limited",
            SignalKind::LoginRequired => "login_required",
            SignalKind::SuspiciousActivity => "suspicious_activity",
            SignalKind::UnknownError => "unknown_error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Response view handed to detectors. The body is lowercased once up front.
#[derive(Debug, Clone)]
pub struct ResponseProbe {
    pub status: Option<u16>,
    lowered_body: String,
}

impl ResponseProbe {
    pub fn new(status: Option<u16>, body: &str) -> Self {
        Self {
            status,
            lowered_body: body.to_lowercase(),
        }
    }

    /// Probe for a response carrying only a status code.
    pub fn status_only(status: u16) -> Self {
        Self::new(Some(status), "")
    }

    pub fn body(&self) -> &str {
        &self.lowered_body
    }
}

/// Signal emitted by a detector, before the monitor timestamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSignal {
    pub kind: SignalKind,
    pub severity: Severity,
    pub message: String,
}

/// Pluggable detection rule.
pub trait SignalDetector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, probe: &ResponseProbe) -> Option<DetectedSignal>;
}

/// Phrase set mapped to one signal kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhraseRule {
    pub kind: SignalKind,
    pub severity: Severity,
    pub message: String,
    pub phrases: Vec<String>,
}

impl PhraseRule {
    pub fn new<I, S>(kind: SignalKind, severity: Severity, message: impl Into<String>, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            severity,
            message: message.into(),
            phrases: phrases.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, lowered_body: &str) -> bool {
        !lowered_body.is_empty()
            && self
                .phrases
                .iter()
                .any(|phrase| !phrase.is_empty() && lowered_body.contains(&phrase.to_lowercase()))
    }
}

impl SignalDetector for PhraseRule {
    fn name(&self) -> &str {
        &self.message
    }

    fn detect(&self, probe: &ResponseProbe) -> Option<DetectedSignal> {
        self.matches(probe.body()).then(|| DetectedSignal {
            kind: self.kind,
            severity: self.severity,
            message: self.message.clone(),
        })
    }
}

/// Maps HTTP error statuses to signals: 429 is a HIGH rate limit, any other
/// status >= 400 is a MEDIUM unknown error.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCodeDetector;

impl SignalDetector for StatusCodeDetector {
    fn name(&self) -> &str {
        "http_status"
    }

    fn detect(&self, probe: &ResponseProbe) -> Option<DetectedSignal> {
        match probe.status? {
            429 => Some(DetectedSignal {
                kind: SignalKind::RateLimited,
                severity: Severity::High,
                message: "HTTP 429: Too Many Requests".into(),
            }),
            status if status >= 400 => {
                let reason = http::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|code| code.canonical_reason())
                    .unwrap_or("Unknown Error");
                Some(DetectedSignal {
                    kind: SignalKind::UnknownError,
                    severity: Severity::Medium,
                    message: format!("HTTP {status}: {reason}"),
                })
            }
            _ => None,
        }
    }
}

/// Built-in phrase rules.
pub fn default_phrase_rules() -> Vec<PhraseRule> {
    vec![
        PhraseRule::new(
            SignalKind::Captcha,
            Severity::Critical,
            "captcha challenge detected",
            ["验证码", "captcha", "安全验证"],
        ),
        PhraseRule::new(
            SignalKind::RateLimited,
            Severity::High,
            "platform rate limit detected",
            ["请稍后再试", "访问频率过快", "too many requests"],
        ),
        PhraseRule::new(
            SignalKind::LoginRequired,
            Severity::High,
            "session requires login",
            ["请登录", "login required", "未登录"],
        ),
        PhraseRule::new(
            SignalKind::SuspiciousActivity,
            Severity::Critical,
            "suspicious activity warning",
            ["账号异常", "异常访问", "suspicious activity"],
        ),
    ]
}
