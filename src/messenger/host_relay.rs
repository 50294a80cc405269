//! Transport relaying envelopes through the host game server's byte channel.
//!
//! Some deployments have no network backend of their own; the only
//! inter-process channel is the one the hosting game server exposes, which
//! can only be addressed through a connected game client acting as carrier.
//! The host side is kept behind [`HostChannel`] so platform glue stays out of
//! this crate.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ListenerRegistry, MessageListener, Messenger};
use crate::envelope::Envelope;

/// Host channel name every envelope travels on.
pub const TRANSPORT_CHANNEL: &str = "bridgenet:bridge";

/// Placeholder logical name until the name-resolution exchange supplies one.
pub const UNKNOWN_SERVER_NAME: &str = "unknown";

/// Narrow view of the host's inter-process channel.
pub trait HostChannel: Send + Sync {
    /// Hands a serialized envelope to any currently connected carrier.
    /// Returns `false` when no carrier is available; the message is lost.
    fn send_via_carrier(&self, payload: &str) -> bool;

    /// Whether at least one carrier is currently connected.
    fn has_carrier(&self) -> bool;
}

/// Messenger relaying through the host's byte channel.
///
/// The sender only ever picks *a* carrier, not a destination process, so the
/// receiver still applies the full targeting rule. A backend does not know
/// its own network name locally; it starts as `"unknown"` until
/// [`HostRelayMessenger::set_network_server_name`] is fed by the companion
/// name-resolution exchange.
pub struct HostRelayMessenger {
    host: Arc<dyn HostChannel>,
    proxy_server_name: String,
    network_server_name: RwLock<Option<String>>,
    listeners: ListenerRegistry,
}

impl HostRelayMessenger {
    pub fn new(host: Arc<dyn HostChannel>, proxy_server_name: impl Into<String>) -> Self {
        Self {
            host,
            proxy_server_name: proxy_server_name.into(),
            network_server_name: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn has_network_server_name(&self) -> bool {
        self.network_server_name
            .read()
            .expect("server name lock poisoned")
            .is_some()
    }

    /// Sets the network-visible name once resolved. Blank names are ignored.
    pub fn set_network_server_name(&self, name: impl Into<String>) {
        let name = name.into();
        if name.trim().is_empty() {
            return;
        }
        *self
            .network_server_name
            .write()
            .expect("server name lock poisoned") = Some(name);
    }

    /// Entry point for inbound bytes from the host, on whatever task the
    /// host glue runs. `known_source` overrides the envelope's own source
    /// when the host knows the true origin (the proxy stamps backend names
    /// on ingress).
    pub fn handle_incoming(&self, payload: &str, known_source: Option<&str>) {
        let env = match Envelope::decode(payload) {
            Ok(env) => env,
            Err(error) => {
                warn!(error = %error, "failed to parse network envelope");
                return;
            }
        };
        if env.channel.is_empty() {
            return;
        }

        let env = match known_source {
            Some(source) if !source.trim().is_empty() => env.with_source_server(source),
            _ => env,
        };

        let local = self.server_name();
        if !env.should_deliver(&local, &self.proxy_server_name) {
            return;
        }
        self.listeners.dispatch(&env.channel, &env.data, &env.source_server);
    }

    fn send_envelope(&self, env: Envelope) {
        let payload = match env.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(channel = %env.channel, error = %error, "failed to encode envelope");
                return;
            }
        };
        if !self.host.send_via_carrier(&payload) {
            debug!(channel = %env.channel, "no carrier available, dropping message");
        }
    }
}

#[async_trait]
impl Messenger for HostRelayMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) {
        self.send_envelope(Envelope::to_all(channel, data, self.server_name()));
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) {
        self.send_envelope(Envelope::to_server(channel, server_name, data, self.server_name()));
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) {
        self.send_envelope(Envelope::to_proxy(channel, data, self.server_name()));
    }

    fn register_listener(&self, channel: &str, listener: Arc<dyn MessageListener>) {
        self.listeners.register(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &Arc<dyn MessageListener>) {
        self.listeners.unregister(channel, listener);
    }

    fn is_connected(&self) -> bool {
        self.host.has_carrier()
    }

    fn server_name(&self) -> String {
        self.network_server_name
            .read()
            .expect("server name lock poisoned")
            .clone()
            .unwrap_or_else(|| UNKNOWN_SERVER_NAME.to_string())
    }

    fn proxy_server_name(&self) -> String {
        self.proxy_server_name.clone()
    }
}
