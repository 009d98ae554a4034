#![cfg(not(target_arch = "wasm32"))]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use firestore_sync::core::{FirestoreClient, ListenOptions, Query, SnapshotStream, ViewSnapshot};
use firestore_sync::error::FirestoreErrorCode;
use firestore_sync::local::{MemoryKvStore, MemorySharedChannel};
use firestore_sync::model::{
    DatabaseId, Document, DocumentKey, Mutation, MutationResult, ResourcePath, SnapshotVersion, Timestamp,
};
use firestore_sync::remote::{
    DocumentChange, InMemoryConnection, InMemoryServer, ListenRequest, TargetChangeState, WatchChange,
    WatchTargetChange, WriteRequest, WriteResponse,
};
use firestore_sync::settings::SyncSettings;
use firestore_sync::value::{FirestoreValue, MapValue};
use futures::StreamExt;

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn client() -> (FirestoreClient, InMemoryServer) {
    let (connection, server) = InMemoryConnection::new();
    let client = FirestoreClient::builder(DatabaseId::default("sync-tests"), Arc::new(connection))
        .build()
        .await
        .expect("build client");
    (client, server)
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn rooms() -> Query {
    Query::at_path(ResourcePath::from_string("rooms").unwrap())
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn room(name: &str) -> MapValue {
    let mut data = MapValue::empty();
    data.set(
        &firestore_sync::model::FieldPath::from_dot_separated("name").unwrap(),
        FirestoreValue::from_string(name),
    );
    data
}

async fn next_matching(stream: &mut SnapshotStream, matches: impl Fn(&ViewSnapshot) -> bool) -> ViewSnapshot {
    loop {
        let snapshot = within(stream.next()).await.expect("stream ended").expect("listen failed");
        if matches(&snapshot) {
            return snapshot;
        }
    }
}

/// Answers the handshake and acknowledges the next write at `commit`.
async fn acknowledge_next_write(server: &InMemoryServer, commit: i64) {
    let backend = within(server.next_write_stream()).await.expect("write stream");
    assert_eq!(within(backend.recv()).await, Some(WriteRequest::Handshake));
    backend.send(WriteResponse::handshake(b"s1".to_vec())).await;
    let mutations = match within(backend.recv()).await {
        Some(WriteRequest::Write { mutations, .. }) => mutations,
        other => panic!("unexpected request {other:?}"),
    };
    let commit_version = version(commit);
    backend
        .send(WriteResponse {
            stream_token: b"s2".to_vec(),
            commit_version,
            mutation_results: mutations.iter().map(|_| MutationResult::new(commit_version, Vec::new())).collect(),
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn write_is_visible_locally_and_confirmed_by_watch() {
    let (client, server) = client().await;
    let options = ListenOptions {
        include_metadata_changes: true,
    };
    let mut snapshots = client.listen(rooms(), options).await.unwrap();
    let watch = within(server.next_listen_stream()).await.expect("listen stream");
    let target_id = match within(watch.recv()).await {
        Some(ListenRequest::AddTarget { target_id, .. }) => target_id,
        other => panic!("unexpected request {other:?}"),
    };

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/eros"), room("Eros"))]).await });

    let pending = next_matching(&mut snapshots, |snapshot| snapshot.documents.has(&key("rooms/eros"))).await;
    assert!(pending.has_pending_writes());
    assert!(pending.from_cache);

    acknowledge_next_write(&server, 10).await;
    within(write).await.unwrap().expect("write acknowledged");
    within(client.wait_for_pending_writes()).await.unwrap();

    // The acknowledged document stays pending until watch catches up with the commit.
    let changes = vec![
        WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![target_id])),
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            document: Document::found(key("rooms/eros"), version(10), room("Eros")),
        }),
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(b"r1".to_vec()),
        ),
        WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(version(10))),
    ];
    for change in changes {
        assert!(watch.send(change).await);
    }

    let synced = next_matching(&mut snapshots, |snapshot| !snapshot.has_pending_writes() && !snapshot.from_cache).await;
    assert!(synced.documents.has(&key("rooms/eros")));

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_client_raises_cached_results() {
    let (client, _server) = client().await;
    let mut snapshots = client.listen(rooms(), ListenOptions::default()).await.unwrap();

    client.disable_network().await.unwrap();
    let snapshot = next_matching(&mut snapshots, |_| true).await;
    assert!(snapshot.from_cache);
    assert!(snapshot.documents.is_empty());

    // Writes made while offline are applied locally right away.
    let writer = client.clone();
    tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/eros"), room("Eros"))]).await });
    let snapshot = next_matching(&mut snapshots, |snapshot| !snapshot.documents.is_empty()).await;
    assert!(snapshot.has_pending_writes());
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_reads_distinguish_unknown_documents() {
    let (client, _server) = client().await;
    let unknown = client.get_document_from_cache(key("rooms/eros")).await.unwrap_err();
    assert_eq!(unknown.code, FirestoreErrorCode::Unavailable);

    client.disable_network().await.unwrap();
    let writer = client.clone();
    tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/eros"), room("Eros"))]).await });
    let mut snapshots = client.listen(rooms(), ListenOptions::default()).await.unwrap();
    next_matching(&mut snapshots, |snapshot| !snapshot.documents.is_empty()).await;

    let document = client.get_document_from_cache(key("rooms/eros")).await.unwrap().unwrap();
    assert!(document.has_local_mutations());
    let cached = client.get_from_cache(rooms()).await.unwrap();
    assert_eq!(cached.documents.len(), 1);
    assert!(cached.from_cache);
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminated_client_rejects_operations() {
    let (client, _server) = client().await;
    client.terminate().await.unwrap();
    assert!(client.is_terminated());
    let error = client.get_from_cache(rooms()).await.unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_write_is_sent_by_the_primary() {
    let store = MemoryKvStore::new();
    let channel = MemorySharedChannel::new();
    let settings = SyncSettings {
        synchronize_tabs: true,
        ..SyncSettings::default()
    };

    let (primary_connection, primary_server) = InMemoryConnection::new();
    let primary = FirestoreClient::builder(DatabaseId::default("sync-tests"), Arc::new(primary_connection))
        .with_store(Arc::new(store.clone()))
        .with_shared_channel(Arc::new(channel.connect()))
        .with_settings(settings.clone())
        .with_client_id("primary")
        .build()
        .await
        .unwrap();
    let (secondary_connection, _secondary_server) = InMemoryConnection::new();
    let secondary = FirestoreClient::builder(DatabaseId::default("sync-tests"), Arc::new(secondary_connection))
        .with_store(Arc::new(store))
        .with_shared_channel(Arc::new(channel.connect()))
        .with_settings(settings)
        .with_client_id("secondary")
        .build()
        .await
        .unwrap();
    assert!(primary.is_primary());
    assert!(!secondary.is_primary());

    let writer = secondary.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/eros"), room("Eros"))]).await });
    acknowledge_next_write(&primary_server, 7).await;
    within(write).await.unwrap().expect("secondary write acknowledged");

    secondary.terminate().await.unwrap();
    primary.terminate().await.unwrap();
}
