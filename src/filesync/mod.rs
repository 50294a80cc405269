//! File-level synchronization between an authority and its followers.
//!
//! One server owns the canonical copy of a file group; followers request a
//! diff against their local manifest and receive only changed files, chunked
//! so transports with small message limits can carry the payload. The
//! authority can broadcast an invalidation to prompt followers to re-sync.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod endpoint;
mod spec;
#[cfg(test)]
mod tests;

pub use endpoint::FileSyncEndpoint;
pub use spec::{ApplyOutcome, FileSyncSpec, FileSyncSpecBuilder};

pub const REQUEST_CHANNEL: &str = "bridgenet:filesync:req";
pub const RESPONSE_META_CHANNEL: &str = "bridgenet:filesync:res_meta";
pub const RESPONSE_CHUNK_CHANNEL: &str = "bridgenet:filesync:res_chunk";
pub const INVALIDATE_CHANNEL: &str = "bridgenet:filesync:invalidate";

pub const DEFAULT_MAX_CHUNK_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(20);

/// Which side of the exchange an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncRole {
    /// Owns the canonical files and answers manifest requests.
    Authority,
    /// Mirrors the authority's files on request.
    Follower,
}

#[derive(Debug, Error)]
pub enum FileSyncError {
    #[error("file sync endpoint is closed")]
    Closed,
    #[error("messenger is not connected")]
    NotConnected,
    #[error("only a follower can request a sync")]
    NotFollower,
    #[error("only the authority can broadcast invalidates")]
    NotAuthority,
    #[error("file sync request timed out for group {group_id}")]
    RequestTimeout { group_id: String },
    #[error("file sync transfer timed out for group {group_id}")]
    TransferTimeout { group_id: String },
    #[error("authority error: {message}")]
    Authority { message: String },
    #[error("payload too large ({size} bytes)")]
    PayloadTooLarge { size: u64 },
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("unsafe relative path: {path}")]
    UnsafePath { path: String },
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("payload bundle error: {0}")]
    Bundle(String),
    #[error("invalid file sync configuration: {0}")]
    Config(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tuning knobs for an endpoint. The zero values for the byte limits fall
/// back to the defaults rather than disabling transfers.
#[derive(Debug, Clone)]
pub struct FileSyncOptions {
    pub auto_request_on_invalidate: bool,
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
    pub max_chunk_bytes: usize,
    pub max_payload_bytes: u64,
}

impl Default for FileSyncOptions {
    fn default() -> Self {
        Self {
            auto_request_on_invalidate: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Follower's view of its files, sent to the authority for diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncRequest {
    pub request_id: String,
    pub group_id: String,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

/// Authority's answer describing the transfer that follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncResponseMeta {
    pub request_id: String,
    pub group_id: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub delete_paths: Vec<String>,
    pub chunk_count: u32,
    pub payload_size: u64,
    #[serde(default)]
    pub payload_sha256: Option<String>,
}

/// One slice of the payload bundle, base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncResponseChunk {
    pub request_id: String,
    pub group_id: String,
    pub index: u32,
    pub data_base64: String,
}

/// Broadcast by the authority when the group's files changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncInvalidate {
    pub group_id: String,
    pub invalidate_id: String,
    pub created_at: i64,
}

/// Outcome of one completed sync on the follower side.
#[derive(Debug, Clone)]
pub struct FileSyncResult {
    pub group_id: String,
    pub written_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
}

impl FileSyncResult {
    pub fn files_written(&self) -> usize {
        self.written_paths.len()
    }

    pub fn files_deleted(&self) -> usize {
        self.deleted_paths.len()
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
