//! Sidecar integration: wire protocol, HTTP transport, process lifecycle and
//! payload normalization.
//!
//! The client talks to the sidecar only through the [`SidecarTransport`] and
//! [`ServiceControl`] traits so both can be replaced in tests.

pub mod manager;
pub mod reqwest_transport;
pub mod rpc;
pub mod transform;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use self::rpc::{RawResponse, RpcError, RpcRequest};

pub use manager::ServiceManager;
pub use reqwest_transport::ReqwestSidecarTransport;

/// Failure with no usable HTTP response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to sidecar at {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} timed out after {}ms", timeout.as_millis())]
    Timeout { url: String, timeout: Duration },
    #[error("failed to read sidecar response: {0}")]
    Decode(String),
    #[error("sidecar transport error: {0}")]
    Other(String),
}

/// HTTP access to the sidecar.
#[async_trait]
pub trait SidecarTransport: Send + Sync {
    /// POSTs a JSON-RPC request to the sidecar's `/mcp` endpoint.
    async fn call(&self, request: &RpcRequest) -> Result<RawResponse, TransportError>;

    /// GETs the sidecar's `/health` endpoint.
    async fn health(&self) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("sidecar executable not found at {0}")]
    ExecutableMissing(PathBuf),
    #[error("failed to spawn sidecar: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sidecar did not become healthy within {}s", .0.as_secs())]
    StartupTimeout(Duration),
    #[error("sidecar exited during startup")]
    ExitedDuringStartup,
    #[error("failed to stop sidecar: {0}")]
    Stop(String),
    #[error("failed to read service log {path}: {source}")]
    Logs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("sidecar returned HTTP {0}")]
    Http(u16),
    #[error("invalid sidecar response: {0}")]
    InvalidResponse(String),
}

/// Snapshot of the sidecar, recomputed on every poll.
///
/// `running` means the health endpoint answered at all; `healthy` means it
/// answered with a 2xx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    pub healthy: bool,
    pub logged_in: bool,
    pub version: Option<String>,
    pub uptime: Option<String>,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    /// HTTP status of the health answer, if one arrived.
    pub http_status: Option<u16>,
    /// Body of a non-2xx health answer, kept for risk analysis.
    #[serde(skip)]
    pub health_body: Option<String>,
}

impl ServiceStatus {
    pub fn unavailable(error: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            pid,
            last_error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The sidecar answered its health check with a non-2xx status.
    pub fn rejected(response: &RawResponse, pid: Option<u32>) -> Self {
        Self {
            running: true,
            pid,
            last_error: Some(format!("health check returned HTTP {}", response.status)),
            http_status: Some(response.status),
            health_body: Some(response.text()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatus {
    pub logged_in: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub success: bool,
    pub capabilities: usize,
    pub message: String,
}

/// Readiness contract the client relies on.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Current status. Never fails; problems are reported in `last_error`.
    async fn service_status(&self) -> ServiceStatus;

    /// Starts the sidecar unless it already answers its health check.
    async fn ensure_running(&self) -> Result<(), ServiceError>;
}
