//! In-process transport for testing and standalone deployments.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ListenerRegistry, MessageListener, Messenger};

/// Messenger that delivers synchronously to local listeners only.
///
/// Each instance is an isolated island; there is no network behind it. Local
/// delivery still honors targeting: a `send_to_server` only reaches listeners
/// when the target is this instance's own name, and `send_to_proxy` only when
/// this instance *is* the proxy.
pub struct InMemoryMessenger {
    server_name: String,
    proxy_server_name: String,
    listeners: ListenerRegistry,
}

impl InMemoryMessenger {
    pub fn new(server_name: impl Into<String>, proxy_server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            proxy_server_name: proxy_server_name.into(),
            listeners: ListenerRegistry::new(),
        }
    }
}

#[async_trait]
impl Messenger for InMemoryMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) {
        self.listeners.dispatch(channel, data, &self.server_name);
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) {
        if server_name.eq_ignore_ascii_case(&self.server_name) {
            self.listeners.dispatch(channel, data, &self.server_name);
        }
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) {
        if self.server_name.eq_ignore_ascii_case(&self.proxy_server_name) {
            self.listeners.dispatch(channel, data, &self.server_name);
        }
    }

    fn register_listener(&self, channel: &str, listener: Arc<dyn MessageListener>) {
        self.listeners.register(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &Arc<dyn MessageListener>) {
        self.listeners.unregister(channel, listener);
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    fn proxy_server_name(&self) -> String {
        self.proxy_server_name.clone()
    }
}
