//! Configuration loading and transport selection.
//!
//! This module contains:
//! - `NetworkConfig`: deserialized settings for the whole messaging stack
//! - `load` / `load_from_path`: file plus environment layering
//! - `select_transport`: turns settings into a running messenger, degrading
//!   to the host relay when the Redis transport cannot be used
//!
//! Environment variables override file values with the `BRIDGENET` prefix
//! and `__` as the nesting separator, e.g. `BRIDGENET_REDIS__HOST`.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::messenger::{HostChannel, HostRelayMessenger, Messenger};
#[cfg(feature = "redis")]
use crate::messenger::{RedisMessenger, RedisPubSubConfig};

pub const ENV_SERVER_NAME: &str = "BRIDGENET_SERVER_NAME";
pub const ENV_PROXY_SERVER_NAME: &str = "BRIDGENET_PROXY_SERVER_NAME";
pub const DEFAULT_PROXY_SERVER_NAME: &str = "velocity";

/// Which transport carries envelopes for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Relay through the host game server's byte channel.
    #[default]
    Plugin,
    /// Shared Redis broadcast channel.
    Redis,
}

/// Root settings for the messaging stack.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub transport: TransportType,
    /// Logical name this process sends as. Backends on the plugin transport
    /// may leave it unset and learn their name from the proxy instead.
    pub server_name: Option<String>,
    pub proxy_server_name: Option<String>,
    pub redis: RedisSection,
}

/// Settings for the Redis transport. Out-of-range values fall back to the
/// documented defaults with a warning instead of failing startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub host: String,
    pub port: i64,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport_channel: String,
    pub connect_timeout_millis: i64,
    pub socket_timeout_millis: i64,
    pub reconnect_delay_millis: i64,
    pub client_name: Option<String>,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            tls: false,
            username: None,
            password: None,
            transport_channel: crate::messenger::TRANSPORT_CHANNEL.to_string(),
            connect_timeout_millis: 5_000,
            socket_timeout_millis: 5_000,
            reconnect_delay_millis: 2_000,
            client_name: None,
        }
    }
}

impl NetworkConfig {
    /// Proxy name after applying config, environment and default layers.
    pub fn resolved_proxy_server_name(&self) -> String {
        non_blank(self.proxy_server_name.clone())
            .or_else(|| non_blank(std::env::var(ENV_PROXY_SERVER_NAME).ok()))
            .unwrap_or_else(|| DEFAULT_PROXY_SERVER_NAME.to_string())
    }

    /// Server name after applying config and environment layers. A proxy
    /// that sets neither falls back to its own proxy name.
    pub fn resolved_server_name(&self, is_proxy: bool) -> Option<String> {
        non_blank(self.server_name.clone())
            .or_else(|| non_blank(std::env::var(ENV_SERVER_NAME).ok()))
            .or_else(|| is_proxy.then(|| self.resolved_proxy_server_name()))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Loads `bridgenet.{yaml,toml,...}` from the working directory, then the
/// environment on top. A missing file yields pure defaults.
pub fn load() -> Result<NetworkConfig, config::ConfigError> {
    load_from_path("bridgenet")
}

pub fn load_from_path(path: &str) -> Result<NetworkConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("BRIDGENET").separator("__"))
        .build()?
        .try_deserialize()
}

/// Messenger produced by [`select_transport`], with enough context to shut
/// it down.
pub struct BuiltMessenger {
    messenger: Arc<dyn Messenger>,
    transport: TransportType,
    #[cfg(feature = "redis")]
    redis: Option<Arc<RedisMessenger>>,
}

impl BuiltMessenger {
    pub fn messenger(&self) -> Arc<dyn Messenger> {
        self.messenger.clone()
    }

    /// The transport actually chosen, after any fallback.
    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub async fn close(&self) {
        #[cfg(feature = "redis")]
        if let Some(redis) = &self.redis {
            redis.close().await;
        }
    }
}

/// Builds the messenger the configuration asks for.
///
/// Misconfiguration never aborts startup: anything that prevents the Redis
/// transport from being built logs a warning and degrades to the host relay,
/// which always works.
pub fn select_transport(
    config: &NetworkConfig,
    is_proxy: bool,
    host: Arc<dyn HostChannel>,
) -> BuiltMessenger {
    let proxy_server_name = config.resolved_proxy_server_name();
    let server_name = config.resolved_server_name(is_proxy);

    match config.transport {
        TransportType::Plugin => {
            plugin_messenger(host, &proxy_server_name, server_name.as_deref())
        }
        #[cfg(feature = "redis")]
        TransportType::Redis => {
            let Some(server_name) = server_name else {
                warn!(
                    "redis transport requires a server name ({ENV_SERVER_NAME} or config), \
                     falling back to the plugin transport"
                );
                return plugin_messenger(host, &proxy_server_name, None);
            };
            match redis_config(config, &server_name, &proxy_server_name) {
                Ok(redis_config) => {
                    info!(
                        server = %server_name,
                        host = %redis_config.host,
                        port = redis_config.port,
                        "starting redis transport"
                    );
                    let redis = Arc::new(RedisMessenger::start(redis_config));
                    BuiltMessenger {
                        messenger: redis.clone(),
                        transport: TransportType::Redis,
                        redis: Some(redis),
                    }
                }
                Err(error) => {
                    warn!(error = %error, "invalid redis settings, falling back to the plugin transport");
                    plugin_messenger(host, &proxy_server_name, Some(&server_name))
                }
            }
        }
        #[cfg(not(feature = "redis"))]
        TransportType::Redis => {
            warn!("built without redis support, falling back to the plugin transport");
            plugin_messenger(host, &proxy_server_name, server_name.as_deref())
        }
    }
}

fn plugin_messenger(
    host: Arc<dyn HostChannel>,
    proxy_server_name: &str,
    server_name: Option<&str>,
) -> BuiltMessenger {
    let messenger = HostRelayMessenger::new(host, proxy_server_name);
    if let Some(name) = server_name {
        messenger.set_network_server_name(name);
    }
    BuiltMessenger {
        messenger: Arc::new(messenger),
        transport: TransportType::Plugin,
        #[cfg(feature = "redis")]
        redis: None,
    }
}

#[cfg(feature = "redis")]
fn redis_config(
    config: &NetworkConfig,
    server_name: &str,
    proxy_server_name: &str,
) -> Result<RedisPubSubConfig, crate::messenger::redis::RedisConfigError> {
    let section = &config.redis;
    let defaults = RedisSection::default();

    let port = if (1..=65_535).contains(&section.port) {
        section.port as u16
    } else {
        warn!(port = section.port, "redis port out of range, using default");
        defaults.port as u16
    };
    let connect_timeout = positive_millis(
        section.connect_timeout_millis,
        defaults.connect_timeout_millis,
        "connect_timeout_millis",
    );
    let socket_timeout = positive_millis(
        section.socket_timeout_millis,
        defaults.socket_timeout_millis,
        "socket_timeout_millis",
    );
    let reconnect_delay = if section.reconnect_delay_millis >= 0 {
        std::time::Duration::from_millis(section.reconnect_delay_millis as u64)
    } else {
        warn!(
            value = section.reconnect_delay_millis,
            "negative reconnect_delay_millis, using default"
        );
        std::time::Duration::from_millis(defaults.reconnect_delay_millis as u64)
    };

    let mut builder = RedisPubSubConfig::builder()
        .host(section.host.clone())
        .port(port)
        .tls(section.tls)
        .transport_channel(section.transport_channel.clone())
        .server_name(server_name)
        .proxy_server_name(proxy_server_name)
        .connect_timeout(connect_timeout)
        .socket_timeout(socket_timeout)
        .reconnect_delay(reconnect_delay);
    if let Some(username) = &section.username {
        builder = builder.username(username.clone());
    }
    if let Some(password) = &section.password {
        builder = builder.password(password.clone());
    }
    if let Some(client_name) = &section.client_name {
        builder = builder.client_name(client_name.clone());
    }
    builder.build()
}

#[cfg(feature = "redis")]
fn positive_millis(value: i64, default: i64, field: &'static str) -> std::time::Duration {
    if value > 0 {
        std::time::Duration::from_millis(value as u64)
    } else {
        warn!(value = value, field = field, "non-positive timeout, using default");
        std::time::Duration::from_millis(default as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHost;

    impl HostChannel for NoHost {
        fn send_via_carrier(&self, _payload: &str) -> bool {
            false
        }

        fn has_carrier(&self) -> bool {
            false
        }
    }

    fn from_yaml(yaml: &str) -> NetworkConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_select_the_plugin_transport() {
        let config = NetworkConfig::default();
        assert_eq!(config.transport, TransportType::Plugin);
        assert!(config.server_name.is_none());
        assert_eq!(config.redis.host, "127.0.0.1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.redis.transport_channel, "bridgenet:bridge");
    }

    #[test]
    fn yaml_shape_deserializes() {
        let config = from_yaml(
            "transport: redis\n\
             serverName: lobby\n\
             redis:\n\
             \x20 host: redis.internal\n\
             \x20 port: 6380\n",
        );
        // serde field names are snake_case; camelCase keys are not aliased.
        assert!(config.server_name.is_none());

        let config = from_yaml(
            "transport: redis\n\
             server_name: lobby\n\
             redis:\n\
             \x20 host: redis.internal\n\
             \x20 port: 6380\n\
             \x20 connect_timeout_millis: 250\n",
        );
        assert_eq!(config.transport, TransportType::Redis);
        assert_eq!(config.server_name.as_deref(), Some("lobby"));
        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.connect_timeout_millis, 250);
        // Untouched fields keep their defaults.
        assert_eq!(config.redis.socket_timeout_millis, 5_000);
    }

    #[test]
    fn proxy_name_defaults_to_velocity() {
        let config = NetworkConfig::default();
        assert_eq!(config.resolved_proxy_server_name(), DEFAULT_PROXY_SERVER_NAME);

        let config = NetworkConfig {
            proxy_server_name: Some("  gate  ".into()),
            ..NetworkConfig::default()
        };
        assert_eq!(config.resolved_proxy_server_name(), "gate");
    }

    #[test]
    fn proxy_falls_back_to_its_own_proxy_name() {
        let config = NetworkConfig::default();
        assert_eq!(
            config.resolved_server_name(true).as_deref(),
            Some(DEFAULT_PROXY_SERVER_NAME)
        );

        let config = NetworkConfig {
            server_name: Some("lobby".into()),
            ..NetworkConfig::default()
        };
        assert_eq!(config.resolved_server_name(false).as_deref(), Some("lobby"));
    }

    #[test]
    fn plugin_transport_is_the_default_selection() {
        let built = select_transport(&NetworkConfig::default(), false, Arc::new(NoHost));
        assert_eq!(built.transport(), TransportType::Plugin);
        assert!(!built.messenger().is_connected());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn redis_without_a_server_name_degrades_to_plugin() {
        let config = NetworkConfig {
            transport: TransportType::Redis,
            ..NetworkConfig::default()
        };
        let built = select_transport(&config, false, Arc::new(NoHost));
        assert_eq!(built.transport(), TransportType::Plugin);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn redis_with_a_server_name_selects_redis() {
        let config = NetworkConfig {
            transport: TransportType::Redis,
            server_name: Some("lobby".into()),
            ..NetworkConfig::default()
        };
        let built = select_transport(&config, false, Arc::new(NoHost));
        assert_eq!(built.transport(), TransportType::Redis);
        assert_eq!(built.messenger().server_name(), "lobby");
        built.close().await;
    }

    #[cfg(feature = "redis")]
    #[test]
    fn out_of_range_redis_settings_fall_back_to_defaults() {
        let config = NetworkConfig {
            redis: RedisSection {
                port: 0,
                connect_timeout_millis: -5,
                socket_timeout_millis: 0,
                reconnect_delay_millis: -1,
                ..RedisSection::default()
            },
            ..NetworkConfig::default()
        };

        let redis = redis_config(&config, "lobby", "velocity").unwrap();
        assert_eq!(redis.port, 6379);
        assert_eq!(redis.connect_timeout, std::time::Duration::from_millis(5_000));
        assert_eq!(redis.socket_timeout, std::time::Duration::from_millis(5_000));
        assert_eq!(redis.reconnect_delay, std::time::Duration::from_millis(2_000));
    }

    #[cfg(feature = "redis")]
    #[test]
    fn blank_redis_host_is_a_build_error() {
        let config = NetworkConfig {
            redis: RedisSection {
                host: "  ".into(),
                ..RedisSection::default()
            },
            ..NetworkConfig::default()
        };
        assert!(redis_config(&config, "lobby", "velocity").is_err());
    }

    #[test]
    fn host_relay_carries_a_configured_server_name() {
        let config = NetworkConfig {
            server_name: Some("lobby".into()),
            ..NetworkConfig::default()
        };
        let built = select_transport(&config, false, Arc::new(NoHost));
        assert_eq!(built.messenger().server_name(), "lobby");
    }
}
