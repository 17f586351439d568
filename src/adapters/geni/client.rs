//! AM gateway HTTP client
//!
//! Speaks the JSON envelope of `super::types` to each aggregate's
//! gateway URL and maps replies onto the `AmClient` port.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{codes, GatewayCall, GatewayReply};
use crate::domain::{AmClient, AmEndpoint, RpcError, SliverStatus};

/// Settings for the gateway client
#[derive(Debug, Clone)]
pub struct GeniGatewayConfig {
    /// Socket-level timeout; the engine applies its own per-call deadline on top
    pub timeout: Duration,
    /// Bearer token presented to the gateway, if it requires one
    pub bearer_token: Option<String>,
}

impl Default for GeniGatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            bearer_token: None,
        }
    }
}

/// AM gateway client
pub struct GeniGatewayClient {
    /// HTTP client
    http: Client,
    /// Bearer token, if configured
    bearer_token: Option<String>,
}

impl GeniGatewayClient {
    /// Create a new gateway client
    pub fn new(config: GeniGatewayConfig) -> Result<Self, RpcError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RpcError::Other(e.to_string()))?;
        Ok(Self {
            http,
            bearer_token: config.bearer_token,
        })
    }

    /// POST one call and decode the reply envelope
    async fn call(&self, url: &str, call: &GatewayCall<'_>) -> Result<GatewayReply, RpcError> {
        tracing::debug!("gateway POST {} {}", url, call.method);

        let mut request = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .json(call);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Other(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RpcError::Auth(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Other(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        response
            .json::<GatewayReply>()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AmClient for GeniGatewayClient {
    async fn reserve(
        &self,
        endpoint: &AmEndpoint,
        slice: &str,
        request: &str,
    ) -> Result<String, RpcError> {
        let call = GatewayCall {
            method: endpoint.api_version.reserve_op(),
            slice_urn: slice,
            rspec: Some(request),
        };
        let reply = self.call(&endpoint.url, &call).await?;
        if reply.code != codes::SUCCESS {
            return Err(reply.into_rpc_error());
        }
        match reply.value {
            Some(serde_json::Value::String(manifest)) => Ok(manifest),
            other => Err(RpcError::Malformed(format!(
                "reserve reply carries no manifest document: {:?}",
                other
            ))),
        }
    }

    async fn delete(&self, endpoint: &AmEndpoint, slice: &str) -> Result<(), RpcError> {
        let call = GatewayCall {
            method: endpoint.api_version.delete_op(),
            slice_urn: slice,
            rspec: None,
        };
        let reply = self.call(&endpoint.url, &call).await?;
        if reply.code != codes::SUCCESS {
            return Err(reply.into_rpc_error());
        }
        Ok(())
    }

    async fn sliver_status(
        &self,
        endpoint: &AmEndpoint,
        slice: &str,
    ) -> Result<SliverStatus, RpcError> {
        let call = GatewayCall {
            method: "sliverstatus",
            slice_urn: slice,
            rspec: None,
        };
        let reply = self.call(&endpoint.url, &call).await?;
        if reply.code != codes::SUCCESS {
            return Err(reply.into_rpc_error());
        }
        let status = reply
            .value
            .as_ref()
            .and_then(|v| v.get("geni_status"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RpcError::Malformed("sliver status reply carries no geni_status".to_string())
            })?;
        match status {
            "ready" => Ok(SliverStatus::Ready),
            "failed" => Ok(SliverStatus::Failed),
            _ => Ok(SliverStatus::Pending),
        }
    }
}
