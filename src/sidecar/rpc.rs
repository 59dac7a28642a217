//! JSON-RPC 2.0 envelopes spoken with the sidecar's `/mcp` endpoint.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    SearchFeeds,
    GetFeedDetail,
    UserProfile,
    Initialize,
    CheckLoginStatus,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::SearchFeeds => "search_feeds",
            RpcMethod::GetFeedDetail => "get_feed_detail",
            RpcMethod::UserProfile => "user_profile",
            RpcMethod::Initialize => "initialize",
            RpcMethod::CheckLoginStatus => "check_login_status",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.as_str().to_string(),
            params,
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn search_feeds(keyword: &str) -> Self {
        Self::new(RpcMethod::SearchFeeds, json!({ "keyword": keyword }))
    }

    pub fn get_feed_detail(url: &str, feed_id: Option<&str>) -> Self {
        Self::new(
            RpcMethod::GetFeedDetail,
            json!({ "url": url, "feed_id": feed_id.unwrap_or_default() }),
        )
    }

    pub fn user_profile(user_id: &str) -> Self {
        Self::new(RpcMethod::UserProfile, json!({ "user_id": user_id }))
    }

    pub fn initialize() -> Self {
        Self::new(RpcMethod::Initialize, json!({}))
    }

    pub fn check_login_status() -> Self {
        Self::new(RpcMethod::CheckLoginStatus, json!({}))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcResponse {
    /// `result` on success. A response with neither field yields `Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// HTTP response as received from the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn rpc(&self) -> Result<RpcResponse, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
