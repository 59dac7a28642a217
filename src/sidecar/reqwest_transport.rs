//! Reqwest-based implementation of the `SidecarTransport` trait.
//!
//! Thin adapter around `reqwest::Client` that applies a hard timeout to every
//! call and maps reqwest failures onto [`TransportError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::rpc::{RawResponse, RpcRequest};
use super::{SidecarTransport, TransportError};
use crate::config::SidecarConfig;

/// Reqwest-backed sidecar transport.
#[derive(Debug, Clone)]
pub struct ReqwestSidecarTransport {
    client: Client,
    rpc_url: String,
    health_url: String,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl ReqwestSidecarTransport {
    /// `request_timeout` bounds RPC calls; health checks use the sidecar's
    /// status timeout.
    pub fn new(config: &SidecarConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        Ok(Self::from_client(client, config, request_timeout))
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: Client, config: &SidecarConfig, request_timeout: Duration) -> Self {
        Self {
            client,
            rpc_url: config.rpc_url(),
            health_url: config.health_url(),
            request_timeout,
            health_timeout: config.status_timeout(),
        }
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }
}

#[async_trait]
impl SidecarTransport for ReqwestSidecarTransport {
    async fn call(&self, request: &RpcRequest) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| classify(&self.rpc_url, self.request_timeout, err))?;
        to_raw_response(response, &self.rpc_url, self.request_timeout).await
    }

    async fn health(&self) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .get(&self.health_url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|err| classify(&self.health_url, self.health_timeout, err))?;
        to_raw_response(response, &self.health_url, self.health_timeout).await
    }
}

fn classify(url: &str, timeout: Duration, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else if err.is_connect() {
        TransportError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else if err.is_body() || err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

async fn to_raw_response(
    response: reqwest::Response,
    url: &str,
    timeout: Duration,
) -> Result<RawResponse, TransportError> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|err| classify(url, timeout, err))?;
    Ok(RawResponse { status, body })
}

// Shared across tasks behind `Arc<dyn SidecarTransport>`.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ReqwestSidecarTransport>();
};
