//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Environment-selected profiles (`development`, `production`, `test`)
//! - JSON overlay loading
//! - Environment variable overrides for the sidecar endpoint

use chrono::{FixedOffset, Local, Offset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::modules::ledger::RequestCategory;
use crate::modules::rate_limiter::time_slots::{TimeRange, TimeRangeError};
use crate::modules::risk::{PhraseRule, default_phrase_rules};

pub const ENV_PROFILE: &str = "XHS_ENV";
pub const ENV_HOST: &str = "XHS_MCP_HOST";
pub const ENV_PORT: &str = "XHS_MCP_PORT";
pub const ENV_EXECUTABLE: &str = "XHS_MCP_EXECUTABLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    TimeRange(#[from] TimeRangeError),
    #[error("unknown environment profile '{0}'")]
    UnknownEnvironment(String),
    #[error("invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },
}

/// Deployment profile. Profiles only differ in quota caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    /// Reads [`ENV_PROFILE`], defaulting to development when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(ENV_PROFILE) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(Environment::Development),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    /// Inclusive jitter bounds in milliseconds.
    pub random_delay_range: [u64; 2],
    /// Waits longer than this fail fast instead of sleeping.
    pub max_wait_ms: u64,
    /// Offset used for time-slot checks; host local offset when absent.
    pub utc_offset_minutes: Option<i32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 2,
            requests_per_hour: 30,
            requests_per_day: 200,
            random_delay_range: [3000, 8000],
            max_wait_ms: 10 * 60 * 1000,
            utc_offset_minutes: None,
        }
    }
}

impl RateLimitConfig {
    pub fn jitter_bounds(&self) -> (Duration, Duration) {
        let [min, max] = self.random_delay_range;
        let (min, max) = if max < min { (max, min) } else { (min, max) };
        (Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or_else(|| Local::now().offset().fix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSlotConfig {
    pub keyword_search: Vec<TimeRange>,
    pub profile_crawl: Vec<TimeRange>,
    pub checkin_data_update: Vec<TimeRange>,
}

impl Default for TimeSlotConfig {
    fn default() -> Self {
        let parse = |slots: &[&str]| {
            slots
                .iter()
                .filter_map(|slot| slot.parse::<TimeRange>().ok())
                .collect::<Vec<_>>()
        };
        Self {
            keyword_search: parse(&["09:00-11:00", "14:00-16:00", "19:00-21:00"]),
            profile_crawl: parse(&["14:00-16:00", "20:00-22:00"]),
            checkin_data_update: parse(&["22:00-24:00", "02:00-04:00"]),
        }
    }
}

impl TimeSlotConfig {
    /// Slots restricting `category`; `None` means unrestricted.
    pub fn slots_for(&self, category: RequestCategory) -> Option<&[TimeRange]> {
        let slots = match category {
            RequestCategory::Search => &self.keyword_search,
            RequestCategory::Profile => &self.profile_crawl,
            RequestCategory::PostDetail => &self.checkin_data_update,
            RequestCategory::Generic => return None,
        };
        (!slots.is_empty()).then_some(slots.as_slice())
    }

    /// No restrictions for any category.
    pub fn unrestricted() -> Self {
        Self {
            keyword_search: Vec::new(),
            profile_crawl: Vec::new(),
            checkin_data_update: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    #[serde(rename = "postDataTTL")]
    pub post_data_ttl_hours: u64,
    #[serde(rename = "profileDataTTL")]
    pub profile_data_ttl_hours: u64,
    #[serde(rename = "searchResultTTL")]
    pub search_result_ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            post_data_ttl_hours: 168,
            profile_data_ttl_hours: 72,
            search_result_ttl_hours: 24,
        }
    }
}

impl CacheConfig {
    pub fn post_ttl(&self) -> Duration {
        hours(self.post_data_ttl_hours)
    }

    pub fn profile_ttl(&self) -> Duration {
        hours(self.profile_data_ttl_hours)
    }

    pub fn search_ttl(&self) -> Duration {
        hours(self.search_result_ttl_hours)
    }
}

fn hours(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(3600))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskConfig {
    pub max_consecutive_failures: u32,
    pub cooldown_period_ms: u64,
    pub extended_cooldown_multiplier: u32,
    pub phrase_rules: Vec<PhraseRule>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cooldown_period_ms: 30 * 60 * 1000,
            extended_cooldown_multiplier: 4,
            phrase_rules: default_phrase_rules(),
        }
    }
}

impl RiskConfig {
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_period_ms)
    }

    pub fn extended_cooldown(&self) -> Duration {
        self.cooldown_period()
            .saturating_mul(self.extended_cooldown_multiplier.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarConfig {
    pub host: String,
    pub port: u16,
    pub executable: PathBuf,
    /// Defaults to the executable's parent directory.
    pub working_dir: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub startup_poll_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub status_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 18060,
            executable: PathBuf::from("xiaohongshu-mcp/xiaohongshu-mcp"),
            working_dir: None,
            startup_timeout_ms: 30_000,
            startup_poll_interval_ms: 1_000,
            health_check_interval_ms: 60_000,
            status_timeout_ms: 5_000,
            stop_grace_ms: 5_000,
            restart_delay_ms: 1_000,
        }
    }
}

impl SidecarConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn rpc_url(&self) -> String {
        format!("{}/mcp", self.base_url())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }

    pub fn spawn_args(&self) -> Vec<String> {
        vec!["-headless=true".into(), format!("-port={}", self.port)]
    }

    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(|| {
            self.executable
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    /// Backoff before retry `n` is `base * 2^n`.
    pub retry_base_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            batch_size: 5,
            batch_delay_ms: 2_000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Complete configuration for the acquisition layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntegrationConfig {
    pub environment: Environment,
    pub rate_limit: RateLimitConfig,
    pub time_slots: TimeSlotConfig,
    pub cache: CacheConfig,
    pub risk_monitoring: RiskConfig,
    pub sidecar: SidecarConfig,
    pub client: ClientConfig,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl IntegrationConfig {
    /// Built-in profile for `environment`.
    pub fn for_environment(environment: Environment) -> Self {
        let mut rate_limit = RateLimitConfig::default();
        match environment {
            Environment::Production => {}
            Environment::Development => {
                rate_limit.requests_per_minute = 1;
                rate_limit.requests_per_hour = 20;
                rate_limit.requests_per_day = 100;
            }
            Environment::Test => {
                rate_limit.requests_per_minute = 1;
                rate_limit.requests_per_hour = 10;
                rate_limit.requests_per_day = 50;
            }
        }

        Self {
            environment,
            rate_limit,
            time_slots: TimeSlotConfig::default(),
            cache: CacheConfig::default(),
            risk_monitoring: RiskConfig::default(),
            sidecar: SidecarConfig::default(),
            client: ClientConfig::default(),
        }
    }

    /// Profile selected by [`ENV_PROFILE`] with endpoint overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::for_environment(Environment::from_env()?);
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlays a JSON document on top of the profile named by its
    /// `environment` key (or [`ENV_PROFILE`] when absent).
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut overlay: Value = serde_json::from_str(raw)?;
        let environment = match overlay.get("environment").and_then(Value::as_str) {
            Some(name) => name.parse()?,
            None => Environment::from_env()?,
        };
        if let Some(map) = overlay.as_object_mut() {
            map.remove("environment");
        }

        let mut merged = serde_json::to_value(Self::for_environment(environment))?;
        merge_json(&mut merged, overlay);
        let mut config: Self = serde_json::from_value(merged)?;
        config.environment = environment;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var(ENV_HOST)
            && !host.trim().is_empty()
        {
            self.sidecar.host = host.trim().to_string();
        }
        if let Ok(port) = std::env::var(ENV_PORT)
            && !port.trim().is_empty()
        {
            self.sidecar.port = port.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                name: ENV_PORT,
                value: port.clone(),
            })?;
        }
        if let Ok(executable) = std::env::var(ENV_EXECUTABLE)
            && !executable.trim().is_empty()
        {
            self.sidecar.executable = PathBuf::from(executable.trim());
        }
        Ok(())
    }
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
