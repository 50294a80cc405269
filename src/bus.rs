//! Typed event bus over a raw [`Messenger`].
//!
//! This module contains:
//! - `NetworkEventBus`: serde-typed publish/subscribe on named channels
//! - `Subscription`: handle used to stop receiving
//!
//! The bus installs at most one raw listener per channel on the underlying
//! messenger and fans messages out to every typed registration for that
//! channel. Payloads that fail to decode are logged and dropped without
//! reaching handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::messenger::{MessageListener, Messenger};

struct TypedRegistration {
    dispatch: Box<dyn Fn(&str, &str, &str) + Send + Sync>,
}

#[derive(Default)]
struct BusInner {
    typed: RwLock<HashMap<String, Vec<Arc<TypedRegistration>>>>,
    bridges: Mutex<HashMap<String, Arc<dyn MessageListener>>>,
}

impl BusInner {
    fn fan_out(&self, channel: &str, data: &str, source_server: &str) {
        let snapshot = {
            let map = self.typed.read().expect("bus registrations poisoned");
            match map.get(channel) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for reg in snapshot {
            (reg.dispatch)(channel, data, source_server);
        }
    }
}

/// Typed publish/subscribe facade for one messenger.
///
/// Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct NetworkEventBus {
    messenger: Arc<dyn Messenger>,
    inner: Arc<BusInner>,
}

impl NetworkEventBus {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            inner: Arc::new(BusInner::default()),
        }
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Subscribes a typed handler to a channel.
    ///
    /// The handler receives the decoded value and the source server name, on
    /// whatever task the transport delivers from. The registration lives
    /// until [`Subscription::close`]; dropping the handle does not
    /// unsubscribe.
    pub fn register<T, F>(&self, channel: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &str) + Send + Sync + 'static,
    {
        let reg = Arc::new(TypedRegistration {
            dispatch: Box::new(move |channel: &str, data: &str, source: &str| {
                match serde_json::from_str::<T>(data) {
                    Ok(value) => handler(value, source),
                    Err(error) => {
                        warn!(channel = %channel, error = %error, "failed to decode typed message");
                    }
                }
            }),
        });

        {
            let mut map = self.inner.typed.write().expect("bus registrations poisoned");
            map.entry(channel.to_string()).or_default().push(reg.clone());
        }
        self.install_bridge(channel);

        Subscription {
            messenger: self.messenger.clone(),
            inner: self.inner.clone(),
            channel: channel.to_string(),
            registration: reg,
            closed: AtomicBool::new(false),
        }
    }

    /// Installs the channel's raw bridge listener if not already present.
    fn install_bridge(&self, channel: &str) {
        let mut bridges = self.inner.bridges.lock().expect("bus bridges poisoned");
        if bridges.contains_key(channel) {
            return;
        }
        let inner = self.inner.clone();
        let bridge: Arc<dyn MessageListener> =
            Arc::new(move |channel: &str, data: &str, source: &str| {
                inner.fan_out(channel, data, source);
            });
        self.messenger.register_listener(channel, bridge.clone());
        bridges.insert(channel.to_string(), bridge);
    }

    pub async fn send_to_all<T: Serialize>(&self, channel: &str, value: &T) {
        if let Some(data) = self.encode(channel, value) {
            self.messenger.send_to_all(channel, &data).await;
        }
    }

    pub async fn send_to_server<T: Serialize>(&self, channel: &str, server_name: &str, value: &T) {
        if let Some(data) = self.encode(channel, value) {
            self.messenger.send_to_server(channel, server_name, &data).await;
        }
    }

    pub async fn send_to_proxy<T: Serialize>(&self, channel: &str, value: &T) {
        if let Some(data) = self.encode(channel, value) {
            self.messenger.send_to_proxy(channel, &data).await;
        }
    }

    fn encode<T: Serialize>(&self, channel: &str, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(data) => Some(data),
            Err(error) => {
                warn!(channel = %channel, error = %error, "failed to encode typed message");
                None
            }
        }
    }
}

/// Handle for one typed registration.
pub struct Subscription {
    messenger: Arc<dyn Messenger>,
    inner: Arc<BusInner>,
    channel: String,
    registration: Arc<TypedRegistration>,
    closed: AtomicBool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Removes the registration. When it was the channel's last one, the raw
    /// bridge listener is removed from the messenger too. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channel_empty = {
            let mut map = self.inner.typed.write().expect("bus registrations poisoned");
            let Some(list) = map.get_mut(&self.channel) else {
                return;
            };
            list.retain(|r| !Arc::ptr_eq(r, &self.registration));
            if list.is_empty() {
                map.remove(&self.channel);
                true
            } else {
                false
            }
        };

        if channel_empty {
            let bridge = self
                .inner
                .bridges
                .lock()
                .expect("bus bridges poisoned")
                .remove(&self.channel);
            if let Some(bridge) = bridge {
                self.messenger.unregister_listener(&self.channel, &bridge);
            }
        }
    }
}
