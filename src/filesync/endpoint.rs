use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    sha256_hex, FileSyncError, FileSyncInvalidate, FileSyncOptions, FileSyncRequest,
    FileSyncResponseChunk, FileSyncResponseMeta, FileSyncResult, FileSyncRole, FileSyncSpec,
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_PAYLOAD_BYTES, INVALIDATE_CHANNEL, REQUEST_CHANNEL,
    RESPONSE_CHUNK_CHANNEL, RESPONSE_META_CHANNEL,
};
use crate::bus::{NetworkEventBus, Subscription};
use crate::envelope::now_millis;
use crate::messenger::Messenger;

type SyncOutcome = Result<FileSyncResult, FileSyncError>;

struct InFlightTransfer {
    meta: FileSyncResponseMeta,
    chunks: Vec<Option<String>>,
    received: usize,
}

impl InFlightTransfer {
    fn is_complete(&self) -> bool {
        self.received == self.chunks.len()
    }

    fn assemble(&self) -> Result<Vec<u8>, FileSyncError> {
        let mut payload = Vec::with_capacity(self.meta.payload_size as usize);
        for chunk in &self.chunks {
            let chunk = chunk
                .as_deref()
                .ok_or_else(|| FileSyncError::Bundle("missing chunk".to_string()))?;
            let bytes = BASE64
                .decode(chunk.as_bytes())
                .map_err(|e| FileSyncError::Bundle(e.to_string()))?;
            payload.extend_from_slice(&bytes);
        }
        Ok(payload)
    }
}

struct PendingSync {
    tx: oneshot::Sender<SyncOutcome>,
    transfer: Option<InFlightTransfer>,
}

struct EndpointInner {
    bus: NetworkEventBus,
    spec: Arc<FileSyncSpec>,
    group_id: String,
    role: FileSyncRole,
    authority_server_name: Option<String>,
    options: FileSyncOptions,
    pending: Mutex<HashMap<String, PendingSync>>,
    closed: AtomicBool,
}

/// One side of the file synchronization exchange for a single group.
///
/// An authority endpoint answers manifest requests with a diff payload; a
/// follower endpoint requests syncs and applies what it receives. Both sides
/// of a group share the same channels and tell their traffic apart by group
/// id and role.
pub struct FileSyncEndpoint {
    inner: Arc<EndpointInner>,
    subscriptions: Vec<Subscription>,
}

impl FileSyncEndpoint {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        group_id: &str,
        spec: FileSyncSpec,
        role: FileSyncRole,
        authority_server_name: Option<&str>,
    ) -> Result<Self, FileSyncError> {
        Self::with_options(
            messenger,
            group_id,
            spec,
            role,
            authority_server_name,
            FileSyncOptions::default(),
        )
    }

    pub fn with_options(
        messenger: Arc<dyn Messenger>,
        group_id: &str,
        spec: FileSyncSpec,
        role: FileSyncRole,
        authority_server_name: Option<&str>,
        options: FileSyncOptions,
    ) -> Result<Self, FileSyncError> {
        if group_id.trim().is_empty() {
            return Err(FileSyncError::Config("group id cannot be blank".to_string()));
        }
        let authority_server_name = authority_server_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        if role == FileSyncRole::Follower && authority_server_name.is_none() {
            return Err(FileSyncError::Config(
                "a follower needs an authority server name".to_string(),
            ));
        }

        let mut options = options;
        if options.max_chunk_bytes == 0 {
            warn!(group = %group_id, "zero max chunk size, using default");
            options.max_chunk_bytes = DEFAULT_MAX_CHUNK_BYTES;
        }
        if options.max_payload_bytes == 0 {
            warn!(group = %group_id, "zero max payload size, using default");
            options.max_payload_bytes = DEFAULT_MAX_PAYLOAD_BYTES;
        }

        let bus = NetworkEventBus::new(messenger);
        let inner = Arc::new(EndpointInner {
            bus: bus.clone(),
            spec: Arc::new(spec),
            group_id: group_id.to_string(),
            role,
            authority_server_name,
            options,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let request_inner = inner.clone();
        let request_sub = bus.register(REQUEST_CHANNEL, move |request: FileSyncRequest, source: &str| {
            handle_request(&request_inner, request, source);
        });
        let meta_inner = inner.clone();
        let meta_sub = bus.register(
            RESPONSE_META_CHANNEL,
            move |meta: FileSyncResponseMeta, source: &str| {
                handle_response_meta(&meta_inner, meta, source);
            },
        );
        let chunk_inner = inner.clone();
        let chunk_sub = bus.register(
            RESPONSE_CHUNK_CHANNEL,
            move |chunk: FileSyncResponseChunk, source: &str| {
                handle_response_chunk(&chunk_inner, chunk, source);
            },
        );
        let invalidate_inner = inner.clone();
        let invalidate_sub = bus.register(
            INVALIDATE_CHANNEL,
            move |invalidate: FileSyncInvalidate, source: &str| {
                handle_invalidate(&invalidate_inner, invalidate, source);
            },
        );

        Ok(Self {
            inner,
            subscriptions: vec![request_sub, meta_sub, chunk_sub, invalidate_sub],
        })
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn role(&self) -> FileSyncRole {
        self.inner.role
    }

    /// Tells every follower of the group that its files changed. Followers
    /// configured for it request a sync in response.
    pub async fn broadcast_invalidate(&self) -> Result<(), FileSyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FileSyncError::Closed);
        }
        if self.inner.role != FileSyncRole::Authority {
            return Err(FileSyncError::NotAuthority);
        }
        let invalidate = FileSyncInvalidate {
            group_id: self.inner.group_id.clone(),
            invalidate_id: uuid::Uuid::new_v4().to_string(),
            created_at: now_millis(),
        };
        self.inner.bus.send_to_all(INVALIDATE_CHANNEL, &invalidate).await;
        Ok(())
    }

    /// Sends the local manifest to the authority and applies the diff it
    /// answers with. Bounded by the request and transfer timeouts.
    pub async fn request_sync(&self) -> SyncOutcome {
        run_sync(self.inner.clone()).await
    }

    /// Number of syncs currently awaiting the authority.
    pub fn pending_syncs(&self) -> usize {
        self.inner.pending.lock().expect("pending syncs poisoned").len()
    }

    /// Fails every in-flight sync with [`FileSyncError::Closed`] and stops
    /// listening. Idempotent; later requests fail immediately.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for subscription in &self.subscriptions {
            subscription.close();
        }

        let drained: Vec<PendingSync> = {
            let mut pending = self.inner.pending.lock().expect("pending syncs poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            debug!(group = %self.inner.group_id, "failing in-flight sync on close");
            let _ = entry.tx.send(Err(FileSyncError::Closed));
        }
    }
}

async fn run_sync(inner: Arc<EndpointInner>) -> SyncOutcome {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(FileSyncError::Closed);
    }
    if inner.role != FileSyncRole::Follower {
        return Err(FileSyncError::NotFollower);
    }
    if !inner.bus.messenger().is_connected() {
        return Err(FileSyncError::NotConnected);
    }
    let authority = inner
        .authority_server_name
        .clone()
        .ok_or_else(|| FileSyncError::Config("a follower needs an authority server name".to_string()))?;

    let spec = inner.spec.clone();
    let manifest = tokio::task::spawn_blocking(move || spec.compute_manifest())
        .await
        .map_err(|e| FileSyncError::Task(e.to_string()))??;

    let request_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    inner
        .pending
        .lock()
        .expect("pending syncs poisoned")
        .insert(request_id.clone(), PendingSync { tx, transfer: None });

    // Fires only while the sync is still waiting for the meta reply; once a
    // transfer starts, its own deadline takes over.
    let watchdog_inner = inner.clone();
    let watchdog_id = request_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(watchdog_inner.options.request_timeout).await;
        expire_request(&watchdog_inner, &watchdog_id);
    });

    let request = FileSyncRequest {
        request_id: request_id.clone(),
        group_id: inner.group_id.clone(),
        file_hashes: manifest,
    };
    inner
        .bus
        .send_to_server(REQUEST_CHANNEL, &authority, &request)
        .await;

    match rx.await {
        Ok(outcome) => outcome,
        // Sender dropped without an outcome, which only close() causes.
        Err(_) => Err(FileSyncError::Closed),
    }
}

fn expire_request(inner: &EndpointInner, request_id: &str) {
    let removed = {
        let mut pending = inner.pending.lock().expect("pending syncs poisoned");
        let still_waiting = pending
            .get(request_id)
            .map(|entry| entry.transfer.is_none())
            .unwrap_or(false);
        if still_waiting {
            pending.remove(request_id)
        } else {
            None
        }
    };
    if let Some(entry) = removed {
        warn!(group = %inner.group_id, "file sync request timed out");
        let _ = entry.tx.send(Err(FileSyncError::RequestTimeout {
            group_id: inner.group_id.clone(),
        }));
    }
}

fn expire_transfer(inner: &EndpointInner, request_id: &str) {
    let removed = inner
        .pending
        .lock()
        .expect("pending syncs poisoned")
        .remove(request_id);
    if let Some(entry) = removed {
        warn!(group = %inner.group_id, "file sync transfer timed out");
        let _ = entry.tx.send(Err(FileSyncError::TransferTimeout {
            group_id: inner.group_id.clone(),
        }));
    }
}

fn handle_request(inner: &Arc<EndpointInner>, request: FileSyncRequest, source: &str) {
    if inner.role != FileSyncRole::Authority {
        return;
    }
    if request.group_id != inner.group_id || request.request_id.is_empty() {
        return;
    }
    if source.trim().is_empty() {
        return;
    }

    let inner = inner.clone();
    let source = source.to_string();
    tokio::spawn(async move {
        let request_id = request.request_id.clone();
        if let Err(error) = answer_request(&inner, request, &source).await {
            warn!(
                group = %inner.group_id,
                source = %source,
                error = %error,
                "file sync authority handler failed"
            );
            send_error_meta(&inner, &request_id, &source, &error.to_string()).await;
        }
    });
}

async fn answer_request(
    inner: &Arc<EndpointInner>,
    request: FileSyncRequest,
    source: &str,
) -> Result<(), FileSyncError> {
    let spec = inner.spec.clone();
    let request_id = request.request_id;
    let remote = request.file_hashes;
    let (payload, delete_paths) = tokio::task::spawn_blocking(
        move || -> Result<(Vec<u8>, Vec<String>), FileSyncError> {
            let local = spec.compute_manifest()?;

            let mut changed = BTreeSet::new();
            for (path, hash) in &local {
                match remote.get(path) {
                    Some(remote_hash) if remote_hash.eq_ignore_ascii_case(hash) => {}
                    _ => {
                        changed.insert(path.clone());
                    }
                }
            }

            let mut delete_paths = Vec::new();
            if spec.delete_extraneous() && !remote.is_empty() {
                for path in remote.keys() {
                    if !local.contains_key(path) {
                        delete_paths.push(path.clone());
                    }
                }
            }

            let payload = if changed.is_empty() {
                Vec::new()
            } else {
                spec.build_bundle(&changed)?
            };
            Ok((payload, delete_paths))
        },
    )
    .await
    .map_err(|e| FileSyncError::Task(e.to_string()))??;

    if payload.len() as u64 > inner.options.max_payload_bytes {
        send_error_meta(
            inner,
            &request_id,
            source,
            &format!("payload too large ({} bytes)", payload.len()),
        )
        .await;
        return Ok(());
    }

    let chunk_size = inner.options.max_chunk_bytes;
    let chunk_count = payload.len().div_ceil(chunk_size);
    let meta = FileSyncResponseMeta {
        request_id: request_id.clone(),
        group_id: inner.group_id.clone(),
        ok: true,
        error: None,
        delete_paths,
        chunk_count: chunk_count as u32,
        payload_size: payload.len() as u64,
        payload_sha256: Some(sha256_hex(&payload)),
    };
    debug!(
        group = %inner.group_id,
        source = %source,
        chunks = chunk_count,
        bytes = payload.len(),
        "answering file sync request"
    );
    inner
        .bus
        .send_to_server(RESPONSE_META_CHANNEL, source, &meta)
        .await;

    for (index, slice) in payload.chunks(chunk_size).enumerate() {
        let chunk = FileSyncResponseChunk {
            request_id: request_id.clone(),
            group_id: inner.group_id.clone(),
            index: index as u32,
            data_base64: BASE64.encode(slice),
        };
        inner
            .bus
            .send_to_server(RESPONSE_CHUNK_CHANNEL, source, &chunk)
            .await;
    }
    Ok(())
}

async fn send_error_meta(inner: &EndpointInner, request_id: &str, target: &str, message: &str) {
    let meta = FileSyncResponseMeta {
        request_id: request_id.to_string(),
        group_id: inner.group_id.clone(),
        ok: false,
        error: Some(message.to_string()),
        delete_paths: Vec::new(),
        chunk_count: 0,
        payload_size: 0,
        payload_sha256: None,
    };
    inner
        .bus
        .send_to_server(RESPONSE_META_CHANNEL, target, &meta)
        .await;
}

fn from_authority(inner: &EndpointInner, source: &str) -> bool {
    match &inner.authority_server_name {
        Some(authority) => authority.eq_ignore_ascii_case(source),
        None => true,
    }
}

fn handle_response_meta(inner: &Arc<EndpointInner>, meta: FileSyncResponseMeta, source: &str) {
    if inner.role != FileSyncRole::Follower {
        return;
    }
    if meta.group_id != inner.group_id || !from_authority(inner, source) {
        return;
    }
    let request_id = meta.request_id.clone();

    let mut pending = inner.pending.lock().expect("pending syncs poisoned");
    if !pending.contains_key(&request_id) {
        return;
    }

    if !meta.ok {
        let entry = pending.remove(&request_id);
        drop(pending);
        if let Some(entry) = entry {
            let message = meta
                .error
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "authority returned an error".to_string());
            let _ = entry.tx.send(Err(FileSyncError::Authority { message }));
        }
        return;
    }

    if meta.payload_size > inner.options.max_payload_bytes {
        let entry = pending.remove(&request_id);
        drop(pending);
        if let Some(entry) = entry {
            let _ = entry.tx.send(Err(FileSyncError::PayloadTooLarge {
                size: meta.payload_size,
            }));
        }
        return;
    }

    if meta.chunk_count == 0 {
        let entry = pending.remove(&request_id);
        drop(pending);
        if let Some(entry) = entry {
            let inner = inner.clone();
            tokio::spawn(async move {
                let outcome = apply_payload(&inner, Vec::new(), meta).await;
                settle(&inner, entry, outcome);
            });
        }
        return;
    }

    if let Some(entry) = pending.get_mut(&request_id) {
        entry.transfer = Some(InFlightTransfer {
            chunks: vec![None; meta.chunk_count as usize],
            received: 0,
            meta,
        });
    }
    drop(pending);

    // The request deadline stands down once a transfer starts; this one
    // covers the chunk stream.
    let watchdog_inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(watchdog_inner.options.transfer_timeout).await;
        expire_transfer(&watchdog_inner, &request_id);
    });
}

fn handle_response_chunk(inner: &Arc<EndpointInner>, chunk: FileSyncResponseChunk, source: &str) {
    if inner.role != FileSyncRole::Follower {
        return;
    }
    if chunk.group_id != inner.group_id || !from_authority(inner, source) {
        return;
    }

    let completed = {
        let mut pending = inner.pending.lock().expect("pending syncs poisoned");
        let Some(entry) = pending.get_mut(&chunk.request_id) else {
            return;
        };
        let Some(transfer) = entry.transfer.as_mut() else {
            return;
        };
        let index = chunk.index as usize;
        if index >= transfer.chunks.len() {
            return;
        }
        if transfer.chunks[index].is_none() {
            transfer.chunks[index] = Some(chunk.data_base64);
            transfer.received += 1;
        }
        let is_complete = transfer.is_complete();
        if is_complete {
            pending.remove(&chunk.request_id)
        } else {
            None
        }
    };

    let Some(mut entry) = completed else {
        return;
    };
    let Some(transfer) = entry.transfer.take() else {
        return;
    };

    let inner = inner.clone();
    tokio::spawn(async move {
        let outcome = match transfer.assemble() {
            Ok(payload) => {
                let verified = match &transfer.meta.payload_sha256 {
                    Some(expected) if !expected.eq_ignore_ascii_case(&sha256_hex(&payload)) => {
                        Err(FileSyncError::ChecksumMismatch)
                    }
                    _ => Ok(payload),
                };
                match verified {
                    Ok(payload) => apply_payload(&inner, payload, transfer.meta).await,
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };
        settle(&inner, entry, outcome);
    });
}

async fn apply_payload(
    inner: &Arc<EndpointInner>,
    payload: Vec<u8>,
    meta: FileSyncResponseMeta,
) -> SyncOutcome {
    let spec = inner.spec.clone();
    let group_id = inner.group_id.clone();
    tokio::task::spawn_blocking(move || {
        let applied = spec.apply_bundle(&payload, &meta.delete_paths)?;
        Ok(FileSyncResult {
            group_id,
            written_paths: applied.written_paths,
            deleted_paths: applied.deleted_paths,
        })
    })
    .await
    .map_err(|e| FileSyncError::Task(e.to_string()))?
}

fn settle(inner: &EndpointInner, entry: PendingSync, outcome: SyncOutcome) {
    match &outcome {
        Ok(result) => debug!(
            group = %inner.group_id,
            written = result.files_written(),
            deleted = result.files_deleted(),
            "file sync applied"
        ),
        Err(error) => warn!(group = %inner.group_id, error = %error, "file sync failed"),
    }
    let _ = entry.tx.send(outcome);
}

fn handle_invalidate(inner: &Arc<EndpointInner>, invalidate: FileSyncInvalidate, source: &str) {
    if invalidate.group_id != inner.group_id {
        return;
    }
    debug!(
        group = %inner.group_id,
        source = %source,
        invalidate_id = %invalidate.invalidate_id,
        "file sync invalidate received"
    );

    if inner.role != FileSyncRole::Follower || !inner.options.auto_request_on_invalidate {
        return;
    }
    if !from_authority(inner, source) {
        return;
    }
    if !inner.bus.messenger().is_connected() {
        return;
    }
    if !inner.pending.lock().expect("pending syncs poisoned").is_empty() {
        return;
    }

    let inner = inner.clone();
    tokio::spawn(async move {
        if let Err(error) = run_sync(inner.clone()).await {
            warn!(group = %inner.group_id, error = %error, "auto sync after invalidate failed");
        }
    });
}
