//! Static configuration for the Redis broadcast transport.

use std::time::Duration;

/// Immutable configuration snapshot, built once per transport instantiation.
#[derive(Debug, Clone)]
pub struct RedisPubSubConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Shared channel name every envelope is published on.
    pub transport_channel: String,
    pub server_name: String,
    pub proxy_server_name: String,
    /// Bounds establishing a session.
    pub connect_timeout: Duration,
    /// Bounds waiting on a command reply once connected.
    pub socket_timeout: Duration,
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay: Duration,
    pub client_name: String,
}

impl RedisPubSubConfig {
    pub fn builder() -> Builder {
        Builder::default()
    }

    #[cfg(feature = "redis")]
    pub(crate) fn connection_info(&self) -> redis::ConnectionInfo {
        let addr = if self.tls {
            redis::ConnectionAddr::TcpTls {
                host: self.host.clone(),
                port: self.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(self.host.clone(), self.port)
        };
        redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: self.username.clone(),
                password: self.password.clone(),
                protocol: redis::ProtocolVersion::RESP2,
            },
        }
    }
}

/// Errors from building a [`RedisPubSubConfig`].
#[derive(Debug, thiserror::Error)]
pub enum RedisConfigError {
    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("port must be between 1 and 65535")]
    InvalidPort,
}

/// Builder with the transport's documented defaults.
#[derive(Debug, Clone)]
pub struct Builder {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    transport_channel: String,
    server_name: String,
    proxy_server_name: String,
    connect_timeout: Duration,
    socket_timeout: Duration,
    reconnect_delay: Duration,
    client_name: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            tls: false,
            username: None,
            password: None,
            transport_channel: crate::messenger::TRANSPORT_CHANNEL.to_string(),
            server_name: String::new(),
            proxy_server_name: "velocity".to_string(),
            connect_timeout: Duration::from_millis(5_000),
            socket_timeout: Duration::from_millis(5_000),
            reconnect_delay: Duration::from_millis(2_000),
            client_name: None,
        }
    }
}

impl Builder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = blank_to_none(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = blank_to_none(password.into());
        self
    }

    pub fn transport_channel(mut self, channel: impl Into<String>) -> Self {
        self.transport_channel = channel.into();
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn proxy_server_name(mut self, proxy_server_name: impl Into<String>) -> Self {
        self.proxy_server_name = proxy_server_name.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = blank_to_none(client_name.into());
        self
    }

    pub fn build(self) -> Result<RedisPubSubConfig, RedisConfigError> {
        let host = require_non_blank(self.host, "host")?;
        let transport_channel = require_non_blank(self.transport_channel, "transport_channel")?;
        let server_name = require_non_blank(self.server_name, "server_name")?;
        let proxy_server_name = require_non_blank(self.proxy_server_name, "proxy_server_name")?;
        if self.port == 0 {
            return Err(RedisConfigError::InvalidPort);
        }

        let client_name = self
            .client_name
            .unwrap_or_else(|| format!("bridgenet-{server_name}"));

        Ok(RedisPubSubConfig {
            host,
            port: self.port,
            tls: self.tls,
            username: self.username,
            password: self.password,
            transport_channel,
            server_name,
            proxy_server_name,
            connect_timeout: self.connect_timeout,
            socket_timeout: self.socket_timeout,
            reconnect_delay: self.reconnect_delay,
            client_name,
        })
    }
}

fn require_non_blank(value: String, name: &'static str) -> Result<String, RedisConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RedisConfigError::Blank(name));
    }
    Ok(trimmed.to_string())
}

fn blank_to_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
