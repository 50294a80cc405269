use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use super::{NetworkDirectory, METHOD_LIST_PLAYERS, METHOD_LIST_SERVERS, METHOD_WHO_AM_I, SERVICE};
use crate::bus::{NetworkEventBus, Subscription};
use crate::messenger::Messenger;
use crate::rpc::{RpcRequest, RpcResponse, REQUEST_CHANNEL, RESPONSE_CHANNEL};

/// Proxy-side answerer for the network info service.
///
/// Listens on the rpc request channel, ignores requests for other services,
/// and replies targeted at the requesting server by name. `who_am_i` simply
/// echoes the request's source, which the transport layer has already
/// resolved to the backend's registered name.
pub struct NetworkInfoResponder {
    subscription: Subscription,
}

impl NetworkInfoResponder {
    pub fn new(messenger: Arc<dyn Messenger>, directory: Arc<dyn NetworkDirectory>) -> Self {
        let bus = NetworkEventBus::new(messenger);
        let reply_bus = bus.clone();
        let subscription = bus.register(REQUEST_CHANNEL, move |request: RpcRequest, source: &str| {
            if request.service != SERVICE {
                return;
            }
            let response = answer(&request, source, directory.as_ref());
            let reply_bus = reply_bus.clone();
            let source = source.to_string();
            tokio::spawn(async move {
                reply_bus
                    .send_to_server(RESPONSE_CHANNEL, &source, &response)
                    .await;
            });
        });
        Self { subscription }
    }

    pub fn close(&self) {
        self.subscription.close();
    }
}

fn answer(request: &RpcRequest, source: &str, directory: &dyn NetworkDirectory) -> RpcResponse {
    let correlation_id = request.correlation_id.clone();
    match request.method.as_str() {
        METHOD_WHO_AM_I => RpcResponse::success(correlation_id, json!(source)),
        METHOD_LIST_SERVERS => encode_result(correlation_id, &directory.server_names()),
        METHOD_LIST_PLAYERS => encode_result(correlation_id, &directory.players()),
        other => {
            warn!(service = SERVICE, method = %other, source = %source, "unknown rpc method");
            RpcResponse::failure(correlation_id, format!("unknown method: {other}"))
        }
    }
}

fn encode_result<T: serde::Serialize>(correlation_id: String, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(result) => RpcResponse::success(correlation_id, result),
        Err(error) => {
            warn!(error = %error, "failed to encode rpc result");
            RpcResponse::failure(correlation_id, "internal encoding error")
        }
    }
}
