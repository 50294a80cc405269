//! Redis pub/sub transport.
//!
//! This module contains:
//! - `RedisPubSubConfig`: connection parameters and timeouts
//! - `RedisMessenger`: broadcast messenger over one shared channel
//! - `ConnectionState`: observable lifecycle of the subscription
//!
//! Every process publishes to and subscribes on the same channel; targeting
//! happens on the receiving side. The subscription is owned by a background
//! task that reconnects after a fixed delay for as long as the messenger is
//! not closed. Sends while disconnected are dropped, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ListenerRegistry, MessageListener, Messenger};
use crate::envelope::Envelope;

mod config;

pub use self::config::{RedisConfigError, RedisPubSubConfig};

/// Lifecycle of the subscription connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; a closed messenger never reconnects.
    Closed,
}

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("timed out establishing connection")]
    ConnectTimeout,

    #[error("subscription stream ended")]
    SubscriptionEnded,

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

struct Shared {
    config: RedisPubSubConfig,
    listeners: ListenerRegistry,
    state: StdMutex<ConnectionState>,
    running: AtomicBool,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == ConnectionState::Closed {
            return;
        }
        *state = next;
    }

    /// Decodes and dispatches one raw payload off the shared channel.
    fn handle_payload(&self, payload: &str) {
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
        if !env.should_deliver_broadcast(&self.config.server_name, &self.config.proxy_server_name) {
            return;
        }
        self.listeners.dispatch(&env.channel, &env.data, &env.source_server);
    }
}

/// Broadcast messenger backed by Redis pub/sub.
pub struct RedisMessenger {
    shared: Arc<Shared>,
    subscriber_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RedisMessenger {
    /// Creates the messenger and starts the subscription task. Returns
    /// immediately; [`Messenger::is_connected`] flips once the subscription
    /// is established.
    pub fn start(config: RedisPubSubConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            listeners: ListenerRegistry::new(),
            state: StdMutex::new(ConnectionState::Disconnected),
            running: AtomicBool::new(true),
            publisher: Mutex::new(None),
        });
        let task = tokio::spawn(subscriber_loop(shared.clone()));
        Self {
            shared,
            subscriber_task: StdMutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Stops the subscription task and drops the publisher connection.
    /// Idempotent; the messenger never reconnects afterwards.
    pub async fn close(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.shared.state.lock().expect("state lock poisoned") = ConnectionState::Closed;
        if let Some(task) = self
            .subscriber_task
            .lock()
            .expect("task lock poisoned")
            .take()
        {
            task.abort();
        }
        *self.shared.publisher.lock().await = None;
        info!(server = %self.shared.config.server_name, "redis messenger closed");
    }

    async fn publish(&self, env: Envelope) {
        if self.shared.state() != ConnectionState::Connected {
            debug!(channel = %env.channel, "redis transport not connected, dropping message");
            return;
        }
        let payload = match env.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(channel = %env.channel, error = %error, "failed to encode envelope");
                return;
            }
        };

        if let Err(error) = self.try_publish(&payload).await {
            warn!(channel = %env.channel, error = %error, "publish failed, retrying once");
            if let Err(error) = self.try_publish(&payload).await {
                warn!(channel = %env.channel, error = %error, "publish retry failed, dropping message");
            }
        }
    }

    /// Publishes over a lazily established multiplexed connection. A failed
    /// command invalidates the connection so the next attempt redials.
    async fn try_publish(&self, payload: &str) -> Result<(), TransportError> {
        let config = &self.shared.config;
        let mut guard = self.shared.publisher.lock().await;
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => {
                let client = redis::Client::open(config.connection_info())?;
                let connection_config = redis::AsyncConnectionConfig::new()
                    .set_connection_timeout(config.connect_timeout)
                    .set_response_timeout(config.socket_timeout);
                let mut conn = client
                    .get_multiplexed_async_connection_with_config(&connection_config)
                    .await?;
                let named: Result<(), redis::RedisError> = redis::cmd("CLIENT")
                    .arg("SETNAME")
                    .arg(&config.client_name)
                    .query_async(&mut conn)
                    .await;
                if let Err(error) = named {
                    debug!(error = %error, "could not set redis client name");
                }
                guard.insert(conn)
            }
        };

        let published: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&config.transport_channel)
            .arg(payload)
            .query_async(conn)
            .await;
        match published {
            Ok(_) => Ok(()),
            Err(error) => {
                *guard = None;
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl Messenger for RedisMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) {
        self.publish(Envelope::to_all(channel, data, self.server_name()))
            .await;
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) {
        self.publish(Envelope::to_server(channel, server_name, data, self.server_name()))
            .await;
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) {
        self.publish(Envelope::to_proxy(channel, data, self.server_name()))
            .await;
    }

    fn register_listener(&self, channel: &str, listener: Arc<dyn MessageListener>) {
        self.shared.listeners.register(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &Arc<dyn MessageListener>) {
        self.shared.listeners.unregister(channel, listener);
    }

    fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    fn server_name(&self) -> String {
        self.shared.config.server_name.clone()
    }

    fn proxy_server_name(&self) -> String {
        self.shared.config.proxy_server_name.clone()
    }
}

/// Owns the subscription for the messenger's whole lifetime, reconnecting
/// after `reconnect_delay` on every failure until closed.
async fn subscriber_loop(shared: Arc<Shared>) {
    let mut attempt: u64 = 0;
    while shared.running.load(Ordering::SeqCst) {
        if attempt > 0 {
            shared.set_state(ConnectionState::Reconnecting);
            tokio::time::sleep(shared.config.reconnect_delay).await;
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
        }
        attempt += 1;

        shared.set_state(ConnectionState::Connecting);
        match run_subscription(&shared).await {
            Ok(()) => return,
            Err(error) => {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                warn!(
                    error = %error,
                    attempt = attempt,
                    host = %shared.config.host,
                    port = shared.config.port,
                    "redis subscription lost, will reconnect"
                );
            }
        }
    }
}

/// One subscription session: connect, subscribe, pump messages until the
/// stream breaks. Returns `Ok` only on orderly shutdown.
async fn run_subscription(shared: &Shared) -> Result<(), TransportError> {
    let config = &shared.config;
    let client = redis::Client::open(config.connection_info())?;
    let mut pubsub = tokio::time::timeout(config.connect_timeout, client.get_async_pubsub())
        .await
        .map_err(|_| TransportError::ConnectTimeout)??;
    tokio::time::timeout(
        config.connect_timeout,
        pubsub.subscribe(&config.transport_channel),
    )
    .await
    .map_err(|_| TransportError::ConnectTimeout)??;

    shared.set_state(ConnectionState::Connected);
    info!(
        host = %config.host,
        port = config.port,
        channel = %config.transport_channel,
        server = %config.server_name,
        "redis subscription established"
    );

    // No read timeout here: the shared channel may legitimately stay quiet
    // for long stretches, and the broken-stream path below already covers
    // dead connections.
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        if !shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        match msg.get_payload::<String>() {
            Ok(payload) => shared.handle_payload(&payload),
            Err(error) => warn!(error = %error, "non-text payload on transport channel"),
        }
    }

    if shared.running.load(Ordering::SeqCst) {
        Err(TransportError::SubscriptionEnded)
    } else {
        Ok(())
    }
}
