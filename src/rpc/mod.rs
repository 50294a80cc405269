//! Request/response exchange on top of fire-and-forget messaging.
//!
//! This module contains:
//! - `RpcRequest` / `RpcResponse`: correlated wire records
//! - `RpcClient`: sends requests to the proxy and awaits matching responses
//! - `RpcError`: everything a call can fail with
//!
//! Requests travel on one well-known channel targeted at the proxy; the
//! responder replies on another, targeted back at the requesting server by
//! name. Correlation ids pair the two.

use serde::{Deserialize, Serialize};

use crate::envelope::now_millis;

mod client;
#[cfg(test)]
mod tests;

pub use client::RpcClient;

/// Channel carrying requests, targeted at the proxy.
pub const REQUEST_CHANNEL: &str = "bridgenet:rpc:req";

/// Channel carrying responses, targeted at the requesting server.
pub const RESPONSE_CHANNEL: &str = "bridgenet:rpc:res";

/// Applied when the caller does not pick a timeout explicitly.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// One request on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub correlation_id: String,
    /// Logical service name, e.g. `"bridgenet:netinfo"`.
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// One response on the wire, matched to its request by `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub correlation_id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
}

impl RpcResponse {
    pub fn success(correlation_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: true,
            result: Some(result),
            error: None,
            created_at: now_millis(),
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
            created_at: now_millis(),
        }
    }
}

/// Failure modes of one call.
///
/// `Clone` so results can be fanned out to every waiter of a shared call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("no response to {service}/{method} within the deadline")]
    Timeout { service: String, method: String },

    #[error("remote rejected the call: {message}")]
    Remote { message: String },

    #[error("rpc client is closed")]
    Closed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("failed to encode request payload: {0}")]
    Encode(String),

    #[error("failed to decode response result: {0}")]
    Decode(String),

    #[error("response carried no usable result")]
    NoResult,
}
