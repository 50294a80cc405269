//! Network introspection service: who am I, which servers exist, who is
//! online.
//!
//! This module contains:
//! - `NetworkInfoClient`: backend-side consumer with a cached identity lookup
//! - `NetworkInfoResponder`: proxy-side answerer backed by a directory
//! - `NetworkPlayerInfo`: one player as seen by the proxy
//!
//! The proxy is the single authority for all three questions; backends reach
//! it over rpc.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod client;
mod responder;

pub use client::NetworkInfoClient;
pub use responder::NetworkInfoResponder;

/// Rpc service name of the network info exchange.
pub const SERVICE: &str = "bridgenet:netinfo";

/// Returns the caller's network-visible server name.
pub const METHOD_WHO_AM_I: &str = "who_am_i";

/// Returns the names of all registered servers.
pub const METHOD_LIST_SERVERS: &str = "list_servers";

/// Returns everyone currently connected to the network.
pub const METHOD_LIST_PLAYERS: &str = "list_players";

/// One connected player, as the proxy sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPlayerInfo {
    pub uuid: Uuid,
    pub name: String,
    /// Absent while the player is mid-transfer between servers.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Proxy-local source of truth the responder answers from.
pub trait NetworkDirectory: Send + Sync {
    fn server_names(&self) -> Vec<String>;
    fn players(&self) -> Vec<NetworkPlayerInfo>;
}
