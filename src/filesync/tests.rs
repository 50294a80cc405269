use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::messenger::{InMemoryMessenger, Messenger};

/// Loopback setup: both endpoints share one in-memory messenger named after
/// the authority, so follower requests addressed to "auth" and authority
/// replies addressed back to the request's source both deliver in-process.
fn loopback_messenger() -> Arc<dyn Messenger> {
    Arc::new(InMemoryMessenger::new("auth", "velocity"))
}

fn open_spec(root: &Path) -> FileSyncSpec {
    FileSyncSpec::builder(root).include_glob("**").build().unwrap()
}

fn authority(messenger: &Arc<dyn Messenger>, spec: FileSyncSpec) -> FileSyncEndpoint {
    FileSyncEndpoint::new(messenger.clone(), "group", spec, FileSyncRole::Authority, None).unwrap()
}

fn authority_with(
    messenger: &Arc<dyn Messenger>,
    spec: FileSyncSpec,
    options: FileSyncOptions,
) -> FileSyncEndpoint {
    FileSyncEndpoint::with_options(
        messenger.clone(),
        "group",
        spec,
        FileSyncRole::Authority,
        None,
        options,
    )
    .unwrap()
}

fn follower(messenger: &Arc<dyn Messenger>, spec: FileSyncSpec) -> FileSyncEndpoint {
    FileSyncEndpoint::new(
        messenger.clone(),
        "group",
        spec,
        FileSyncRole::Follower,
        Some("auth"),
    )
    .unwrap()
}

fn follower_with(
    messenger: &Arc<dyn Messenger>,
    spec: FileSyncSpec,
    options: FileSyncOptions,
) -> FileSyncEndpoint {
    FileSyncEndpoint::with_options(
        messenger.clone(),
        "group",
        spec,
        FileSyncRole::Follower,
        Some("auth"),
        options,
    )
    .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn follower_receives_and_applies_files() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), b"hello").unwrap();

    let messenger = loopback_messenger();
    let _authority = authority(&messenger, open_spec(&authority_dir));
    let follower = follower(&messenger, open_spec(&follower_dir));

    let result = follower.request_sync().await.unwrap();

    assert_eq!(result.written_paths, vec!["a.txt"]);
    assert_eq!(result.files_written(), 1);
    assert_eq!(result.files_deleted(), 0);
    assert_eq!(fs::read(follower_dir.join("a.txt")).unwrap(), b"hello");
    assert_eq!(follower.pending_syncs(), 0);
}

#[tokio::test]
async fn nested_files_transfer_in_multiple_chunks() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(authority_dir.join("maps")).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();

    let body: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    fs::write(authority_dir.join("maps/arena.dat"), &body).unwrap();

    let messenger = loopback_messenger();
    // A tiny chunk limit forces the payload through the multi-chunk path.
    let _authority = authority_with(
        &messenger,
        open_spec(&authority_dir),
        FileSyncOptions { max_chunk_bytes: 64, ..FileSyncOptions::default() },
    );
    let follower = follower(&messenger, open_spec(&follower_dir));

    let result = follower.request_sync().await.unwrap();

    assert_eq!(result.written_paths, vec!["maps/arena.dat"]);
    assert_eq!(fs::read(follower_dir.join("maps/arena.dat")).unwrap(), body);
}

#[tokio::test]
async fn unchanged_files_are_not_rewritten() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), b"same").unwrap();
    fs::write(follower_dir.join("a.txt"), b"same").unwrap();

    let messenger = loopback_messenger();
    let _authority = authority(&messenger, open_spec(&authority_dir));
    let follower = follower(&messenger, open_spec(&follower_dir));

    let result = follower.request_sync().await.unwrap();

    assert_eq!(result.files_written(), 0);
    assert_eq!(result.files_deleted(), 0);
    assert_eq!(fs::read(follower_dir.join("a.txt")).unwrap(), b"same");
}

#[tokio::test]
async fn extraneous_follower_files_are_deleted_when_enabled() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), b"keep").unwrap();
    fs::write(follower_dir.join("a.txt"), b"keep").unwrap();
    fs::write(follower_dir.join("stale.txt"), b"drop").unwrap();

    let messenger = loopback_messenger();
    let authority_spec = FileSyncSpec::builder(&authority_dir)
        .include_glob("**")
        .delete_extraneous(true)
        .build()
        .unwrap();
    let _authority = authority(&messenger, authority_spec);
    let follower = follower(&messenger, open_spec(&follower_dir));

    let result = follower.request_sync().await.unwrap();

    assert_eq!(result.deleted_paths, vec!["stale.txt"]);
    assert!(!follower_dir.join("stale.txt").exists());
    assert!(follower_dir.join("a.txt").exists());
}

#[tokio::test]
async fn follower_rejects_oversized_payload() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    let large: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
    fs::write(authority_dir.join("big.bin"), &large).unwrap();

    let messenger = loopback_messenger();
    let _authority = authority(&messenger, open_spec(&authority_dir));
    let follower = follower_with(
        &messenger,
        open_spec(&follower_dir),
        FileSyncOptions { max_payload_bytes: 32, ..FileSyncOptions::default() },
    );

    let result = follower.request_sync().await;

    assert!(matches!(result, Err(FileSyncError::PayloadTooLarge { .. })));
    assert!(!follower_dir.join("big.bin").exists());
    assert_eq!(follower.pending_syncs(), 0);
}

#[tokio::test]
async fn request_times_out_without_an_authority() {
    let temp = tempfile::tempdir().unwrap();
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&follower_dir).unwrap();

    // The local name does not match the authority, so the request goes
    // nowhere in-process.
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("fol", "velocity"));
    let follower = follower_with(
        &messenger,
        open_spec(&follower_dir),
        FileSyncOptions { request_timeout: Duration::from_millis(50), ..FileSyncOptions::default() },
    );

    let result = follower.request_sync().await;

    assert!(matches!(result, Err(FileSyncError::RequestTimeout { .. })));
    assert_eq!(follower.pending_syncs(), 0);
}

#[tokio::test]
async fn invalidate_broadcast_triggers_auto_sync() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), b"pushed").unwrap();

    let messenger = loopback_messenger();
    let authority = authority(&messenger, open_spec(&authority_dir));
    let _follower = follower_with(
        &messenger,
        open_spec(&follower_dir),
        FileSyncOptions { auto_request_on_invalidate: true, ..FileSyncOptions::default() },
    );

    authority.broadcast_invalidate().await.unwrap();

    let applied = follower_dir.join("a.txt");
    wait_until(|| applied.is_file(), "auto sync to apply the file").await;
    assert_eq!(fs::read(&applied).unwrap(), b"pushed");
}

#[tokio::test]
async fn role_misuse_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let messenger = loopback_messenger();
    let authority = authority(&messenger, open_spec(temp.path()));

    assert!(matches!(
        authority.request_sync().await,
        Err(FileSyncError::NotFollower)
    ));

    let follower = follower(&messenger, open_spec(temp.path()));
    assert!(matches!(
        follower.broadcast_invalidate().await,
        Err(FileSyncError::NotAuthority)
    ));
}

#[tokio::test]
async fn close_fails_in_flight_syncs_and_rejects_new_ones() {
    let temp = tempfile::tempdir().unwrap();
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&follower_dir).unwrap();

    // No authority answers, so the request stays pending until close.
    let messenger: Arc<dyn Messenger> = Arc::new(InMemoryMessenger::new("fol", "velocity"));
    let follower = Arc::new(follower(&messenger, open_spec(&follower_dir)));

    let in_flight = {
        let follower = follower.clone();
        tokio::spawn(async move { follower.request_sync().await })
    };
    wait_until(|| follower.pending_syncs() == 1, "the sync to become pending").await;

    follower.close();
    follower.close();

    assert!(matches!(in_flight.await.unwrap(), Err(FileSyncError::Closed)));
    assert_eq!(follower.pending_syncs(), 0);

    let late = follower.request_sync().await;
    assert!(matches!(late, Err(FileSyncError::Closed)));
}

#[tokio::test]
async fn endpoints_ignore_other_groups() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), b"other").unwrap();

    let messenger = loopback_messenger();
    let _authority = FileSyncEndpoint::new(
        messenger.clone(),
        "other-group",
        open_spec(&authority_dir),
        FileSyncRole::Authority,
        None,
    )
    .unwrap();
    let follower = follower_with(
        &messenger,
        open_spec(&follower_dir),
        FileSyncOptions { request_timeout: Duration::from_millis(50), ..FileSyncOptions::default() },
    );

    let result = follower.request_sync().await;
    assert!(matches!(result, Err(FileSyncError::RequestTimeout { .. })));
}

#[test]
fn blank_configuration_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let messenger = loopback_messenger();

    assert!(matches!(
        FileSyncEndpoint::new(
            messenger.clone(),
            "  ",
            open_spec(temp.path()),
            FileSyncRole::Authority,
            None,
        ),
        Err(FileSyncError::Config(_))
    ));
    assert!(matches!(
        FileSyncEndpoint::new(
            messenger,
            "group",
            open_spec(temp.path()),
            FileSyncRole::Follower,
            None,
        ),
        Err(FileSyncError::Config(_))
    ));
}

#[test]
fn wire_format_uses_camel_case() {
    let meta = FileSyncResponseMeta {
        request_id: "rid".into(),
        group_id: "group".into(),
        ok: true,
        error: None,
        delete_paths: vec!["old.txt".into()],
        chunk_count: 2,
        payload_size: 9000,
        payload_sha256: Some("abc".into()),
    };
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();

    assert_eq!(json["requestId"], "rid");
    assert_eq!(json["groupId"], "group");
    assert_eq!(json["deletePaths"][0], "old.txt");
    assert_eq!(json["chunkCount"], 2);
    assert_eq!(json["payloadSize"], 9000);
    assert_eq!(json["payloadSha256"], "abc");

    let chunk: FileSyncResponseChunk = serde_json::from_str(
        r#"{"requestId":"rid","groupId":"group","index":1,"dataBase64":"aGk="}"#,
    )
    .unwrap();
    assert_eq!(chunk.index, 1);
    assert_eq!(chunk.data_base64, "aGk=");
}
