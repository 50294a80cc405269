//! Wire envelope and receiver-side targeting.
//!
//! Every message crosses a transport wrapped in exactly one [`Envelope`].
//! Transports that broadcast (the shared Redis channel) still hand the raw
//! payload to every subscriber; each receiving messenger decodes the envelope
//! and decides locally whether its listeners should see it.

use serde::{Deserialize, Serialize};

/// Delivery scope of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    /// Every connected process, the proxy included.
    All,
    /// Only the process whose logical name equals `target_server`.
    Server,
    /// Only the process that considers itself the proxy.
    Proxy,
}

/// Immutable wire record for one message.
///
/// Serialized as a flat JSON object with camelCase keys; `data` is an opaque
/// string, conventionally JSON-encoded by the caller. Envelopes are created
/// at send time and discarded at receive time, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical topic.
    pub channel: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: String,
    /// Delivery scope.
    pub target: Target,
    /// Present iff `target == Target::Server`.
    #[serde(default)]
    pub target_server: Option<String>,
    /// Logical name of the sending server.
    #[serde(default)]
    pub source_server: String,
    /// Sender clock at send time, milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Envelope addressed to every process on the network.
    pub fn to_all(channel: impl Into<String>, data: impl Into<String>, source_server: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            target: Target::All,
            target_server: None,
            source_server: source_server.into(),
            timestamp: now_millis(),
        }
    }

    /// Envelope addressed to one named server.
    pub fn to_server(
        channel: impl Into<String>,
        target_server: impl Into<String>,
        data: impl Into<String>,
        source_server: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            target: Target::Server,
            target_server: Some(target_server.into()),
            source_server: source_server.into(),
            timestamp: now_millis(),
        }
    }

    /// Envelope addressed to the proxy.
    pub fn to_proxy(channel: impl Into<String>, data: impl Into<String>, source_server: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            target: Target::Proxy,
            target_server: None,
            source_server: source_server.into(),
            timestamp: now_millis(),
        }
    }

    /// Returns a copy with the source rewritten.
    ///
    /// Used by the proxy's relay ingress, which knows the true origin of a
    /// message from the backend connection it arrived on.
    pub fn with_source_server(mut self, source_server: impl Into<String>) -> Self {
        self.source_server = source_server.into();
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Receiver-side targeting rule for point-to-point transports.
    ///
    /// Name comparisons are case-insensitive. A `Server` envelope whose
    /// `target_server` does not match the local name is silently dropped,
    /// never an error.
    pub fn should_deliver(&self, local_server: &str, proxy_server: &str) -> bool {
        match self.target {
            Target::All => true,
            Target::Proxy => local_server.eq_ignore_ascii_case(proxy_server),
            Target::Server => self
                .target_server
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(local_server)),
        }
    }

    /// Targeting rule for broadcast transports, where a publisher also
    /// receives its own traffic on the shared channel. Self-published `All`
    /// and `Server` envelopes are dropped by comparing `source_server`.
    pub fn should_deliver_broadcast(&self, local_server: &str, proxy_server: &str) -> bool {
        match self.target {
            Target::All | Target::Server => {
                if self.source_server.eq_ignore_ascii_case(local_server) {
                    return false;
                }
                self.should_deliver(local_server, proxy_server)
            }
            Target::Proxy => self.should_deliver(local_server, proxy_server),
        }
    }
}

/// Milliseconds since the Unix epoch, sender clock.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
