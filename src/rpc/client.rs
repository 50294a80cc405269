use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{RpcError, RpcRequest, RpcResponse, DEFAULT_TIMEOUT, REQUEST_CHANNEL, RESPONSE_CHANNEL};
use crate::bus::{NetworkEventBus, Subscription};
use crate::envelope::now_millis;
use crate::messenger::Messenger;

type RpcOutcome = Result<Option<serde_json::Value>, RpcError>;

#[derive(Clone, Copy)]
enum Destination<'a> {
    Proxy,
    Server(&'a str),
}

struct PendingCall {
    tx: oneshot::Sender<RpcOutcome>,
    service: String,
    method: String,
}

struct RpcInner {
    pending: Mutex<HashMap<String, PendingCall>>,
    closed: AtomicBool,
}

/// Caller side of the request/response exchange.
///
/// One client serves a whole process; calls may be issued concurrently from
/// any task. The client subscribes to the response channel on construction
/// and keeps a pending-call table keyed by correlation id. Calls fail rather
/// than queue when the transport is down.
pub struct RpcClient {
    bus: NetworkEventBus,
    default_timeout: Duration,
    inner: Arc<RpcInner>,
    response_subscription: Subscription,
}

impl RpcClient {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self::with_default_timeout(messenger, DEFAULT_TIMEOUT)
    }

    pub fn with_default_timeout(messenger: Arc<dyn Messenger>, default_timeout: Duration) -> Self {
        let bus = NetworkEventBus::new(messenger);
        let inner = Arc::new(RpcInner {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let handler_inner = inner.clone();
        let response_subscription = bus.register(RESPONSE_CHANNEL, move |response: RpcResponse, _: &str| {
            handle_response(&handler_inner, response);
        });

        Self {
            bus,
            default_timeout,
            inner,
            response_subscription,
        }
    }

    /// Calls a method on a service hosted by the proxy with the default
    /// timeout.
    pub async fn call_proxy<P, R>(&self, service: &str, method: &str, payload: &P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_proxy_with_timeout(service, method, payload, self.default_timeout)
            .await
    }

    pub async fn call_proxy_with_timeout<P, R>(
        &self,
        service: &str,
        method: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch_call(Destination::Proxy, service, method, payload, timeout)
            .await
    }

    /// Calls a method on a service hosted by a named server with the default
    /// timeout.
    pub async fn call_server<P, R>(
        &self,
        server_name: &str,
        service: &str,
        method: &str,
        payload: &P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_server_with_timeout(server_name, service, method, payload, self.default_timeout)
            .await
    }

    pub async fn call_server_with_timeout<P, R>(
        &self,
        server_name: &str,
        service: &str,
        method: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch_call(Destination::Server(server_name), service, method, payload, timeout)
            .await
    }

    async fn dispatch_call<P, R>(
        &self,
        destination: Destination<'_>,
        service: &str,
        method: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        if !self.bus.messenger().is_connected() {
            return Err(RpcError::NotConnected);
        }

        let payload = serde_json::to_value(payload).map_err(|e| RpcError::Encode(e.to_string()))?;
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let request = RpcRequest {
            correlation_id: correlation_id.clone(),
            service: service.to_string(),
            method: method.to_string(),
            payload,
            created_at: now_millis(),
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().expect("pending table poisoned").insert(
            correlation_id.clone(),
            PendingCall {
                tx,
                service: service.to_string(),
                method: method.to_string(),
            },
        );

        match destination {
            Destination::Proxy => self.bus.send_to_proxy(REQUEST_CHANNEL, &request).await,
            Destination::Server(server_name) => {
                self.bus
                    .send_to_server(REQUEST_CHANNEL, server_name, &request)
                    .await
            }
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome, which only close() causes.
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&correlation_id);
                Err(RpcError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                })
            }
        };

        let result = outcome?.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().expect("pending table poisoned").len()
    }

    /// Fails every in-flight call with [`RpcError::Closed`] and stops
    /// listening for responses. Idempotent; later calls fail immediately.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.response_subscription.close();

        let drained: Vec<PendingCall> = {
            let mut pending = self.inner.pending.lock().expect("pending table poisoned");
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            debug!(service = %call.service, method = %call.method, "failing in-flight call on close");
            let _ = call.tx.send(Err(RpcError::Closed));
        }
    }
}

fn handle_response(inner: &RpcInner, response: RpcResponse) {
    let call = inner
        .pending
        .lock()
        .expect("pending table poisoned")
        .remove(&response.correlation_id);
    let Some(call) = call else {
        // Response for a timed-out or foreign call.
        debug!(correlation_id = %response.correlation_id, "discarding unmatched rpc response");
        return;
    };

    let outcome = if response.ok {
        Ok(response.result)
    } else {
        Err(RpcError::Remote {
            message: response
                .error
                .unwrap_or_else(|| "unspecified remote error".to_string()),
        })
    };
    if call.tx.send(outcome).is_err() {
        warn!(
            service = %call.service,
            method = %call.method,
            "rpc caller went away before the response arrived"
        );
    }
}
