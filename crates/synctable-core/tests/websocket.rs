mod common;

use std::time::Duration;

use common::{fast_options, query, record, wait_state};
use serde_json::json;
use synctable_core::{
    serve_websocket, Client, MemoryBackend, MuxClient, Schema, SyncState, SyncTable, Table,
    WebsocketConfig,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_sync_over_websocket() {
    let backend = MemoryBackend::default();
    backend
        .upsert("tasks", record(json!({"id": "t1", "title": "over the wire"})))
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_websocket(
        backend.clone(),
        listener,
        64,
        shutdown.clone(),
    ));

    let (client, link) = MuxClient::websocket(WebsocketConfig {
        url: format!("ws://{}", addr),
        initial_reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(50),
        ..WebsocketConfig::default()
    });
    let client: std::sync::Arc<dyn Client> = client;

    let table = SyncTable::new(
        query(r#"{"tasks": [{"id": null, "title": null}]}"#),
        vec![],
        &Schema::new(),
        client,
        fast_options(),
    )
    .unwrap();
    wait_state(&table, SyncState::Synced).await;
    assert_eq!(
        table.get_one(&record(json!({"id": "t1"}))).unwrap()["title"],
        json!("over the wire")
    );

    table
        .set(record(json!({"id": "t2", "title": "from the client"})))
        .unwrap();
    table.save().await.unwrap();
    assert_eq!(backend.rows("tasks").len(), 2);

    table.close().await;
    link.shutdown().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_outlives_broken_connections() {
    let backend = MemoryBackend::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_websocket(
        backend.clone(),
        listener,
        64,
        shutdown.clone(),
    ));

    // Connections that die before or during the handshake
    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(b"not a websocket\r\n\r\n").await;
        drop(stream);
        drop(TcpStream::connect(addr).await.unwrap());
    }

    let (client, link) = MuxClient::websocket(WebsocketConfig {
        url: format!("ws://{}", addr),
        initial_reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(50),
        ..WebsocketConfig::default()
    });
    let table = SyncTable::new(
        query(r#"{"notes": [{"id": null, "body": null}]}"#),
        vec![],
        &Schema::new(),
        client,
        fast_options(),
    )
    .unwrap();
    wait_state(&table, SyncState::Synced).await;
    assert!(!server.is_finished());

    table.close().await;
    link.shutdown().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}
