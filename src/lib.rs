//! Bridgenet - cross-server messaging for proxied networks
//!
//! Fire-and-forget pub/sub between a cluster of backend servers and a single
//! front-end proxy, with a correlation-based RPC layer and a typed event bus
//! on top. Transports are pluggable: in-process delivery, relaying through
//! the host game server's own byte channel, or a shared Redis channel. A
//! file sync endpoint distributes a group of files from one authoritative
//! server to its followers over the same messaging layer.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod filesync;
pub mod info;
pub mod messenger;
pub mod rpc;

pub use bus::{NetworkEventBus, Subscription};
pub use self::config::{select_transport, BuiltMessenger, NetworkConfig, TransportType};
pub use envelope::{Envelope, Target};
pub use filesync::{
    FileSyncEndpoint, FileSyncError, FileSyncOptions, FileSyncResult, FileSyncRole, FileSyncSpec,
};
pub use info::{NetworkDirectory, NetworkInfoClient, NetworkInfoResponder, NetworkPlayerInfo};
pub use messenger::{HostChannel, HostRelayMessenger, InMemoryMessenger, MessageListener, Messenger};
#[cfg(feature = "redis")]
pub use messenger::{ConnectionState, RedisMessenger, RedisPubSubConfig};
pub use rpc::{RpcClient, RpcError};
