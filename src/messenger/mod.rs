//! Messenger capability trait and its transports.
//!
//! This module contains:
//! - `Messenger` trait: fire-and-forget cross-process messaging
//! - `MessageListener` trait: raw per-channel callbacks
//! - Implementations: in-process, host-relay, Redis broadcast

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;

pub mod host_relay;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use host_relay::{HostChannel, HostRelayMessenger, TRANSPORT_CHANNEL, UNKNOWN_SERVER_NAME};
pub use in_memory::InMemoryMessenger;
#[cfg(feature = "redis")]
pub use self::redis::{ConnectionState, RedisMessenger, RedisPubSubConfig};

/// Callback for raw messages on one channel.
///
/// Receives `(channel, data, source_server)` for every envelope accepted by
/// the transport's targeting rule. Implemented for plain closures.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, channel: &str, data: &str, source_server: &str);
}

impl<F> MessageListener for F
where
    F: Fn(&str, &str, &str) + Send + Sync,
{
    fn on_message(&self, channel: &str, data: &str, source_server: &str) {
        self(channel, data, source_server)
    }
}

/// Fire-and-forget cross-process messaging.
///
/// Sends never block waiting for acknowledgment and never surface delivery
/// failures to the caller; transports make [`Messenger::is_connected`]
/// reflect whether delivery is currently possible instead.
///
/// Implementations:
/// - `InMemoryMessenger`: single-process delivery, testing and standalone use
/// - `HostRelayMessenger`: relays through the host game server's byte channel
/// - `RedisMessenger`: shared broadcast channel with receiver-side filtering
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends to every server on the network, the proxy included.
    async fn send_to_all(&self, channel: &str, data: &str);

    /// Sends to one named server. Targeting is best-effort per transport.
    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str);

    /// Sends to the proxy side of the network.
    async fn send_to_proxy(&self, channel: &str, data: &str);

    /// Registers a listener for a channel. Idempotent per listener identity.
    fn register_listener(&self, channel: &str, listener: Arc<dyn MessageListener>);

    /// Removes a previously registered listener. Removing an absent listener
    /// is a no-op.
    fn unregister_listener(&self, channel: &str, listener: &Arc<dyn MessageListener>);

    /// Whether this messenger can currently deliver messages. Transport
    /// specific: the host relay needs a connected carrier, the Redis
    /// transport an established subscription.
    fn is_connected(&self) -> bool;

    /// The logical name this process sends as `source_server`.
    fn server_name(&self) -> String;

    /// The logical name `Target::Proxy` envelopes are matched against.
    fn proxy_server_name(&self) -> String;
}

/// Channel-keyed listener table shared by all transports.
///
/// Safe under concurrent register/unregister/dispatch: dispatch snapshots the
/// listener list before invoking, and a panicking listener is isolated so the
/// rest of the channel still runs.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn MessageListener>>>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, channel: &str, listener: Arc<dyn MessageListener>) {
        let mut map = self.listeners.write().expect("listener registry poisoned");
        let list = map.entry(channel.to_string()).or_default();
        if list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        list.push(listener);
    }

    pub(crate) fn unregister(&self, channel: &str, listener: &Arc<dyn MessageListener>) {
        let mut map = self.listeners.write().expect("listener registry poisoned");
        let Some(list) = map.get_mut(channel) else {
            return;
        };
        list.retain(|l| !Arc::ptr_eq(l, listener));
        if list.is_empty() {
            map.remove(channel);
        }
    }

    pub(crate) fn dispatch(&self, channel: &str, data: &str, source_server: &str) {
        let snapshot = {
            let map = self.listeners.read().expect("listener registry poisoned");
            match map.get(channel) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return,
            }
        };

        for listener in snapshot {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_message(channel, data, source_server)
            }));
            if outcome.is_err() {
                warn!(channel = %channel, "network listener panicked");
            }
        }
    }
}
