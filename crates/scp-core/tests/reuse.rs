mod common;

use std::time::Duration;

use scp_core::{Phase, Registry, ScpError};
use scp_transport::Transport;

use common::{connect_fresh, read_exact, reconnect, registry, spawn_echo};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_write_then_reuse_delivers_every_byte_once() {
    let registry = registry(16);
    let (client, server, transport_a) = connect_fresh(&registry).await;
    let echo = spawn_echo(server.clone());

    let payload: Vec<u8> = (0..100u32).map(|i| (i * 7 % 256) as u8).collect();
    client.write_all(&payload[..50]).await.expect("first half");
    client.write_all(&payload[50..]).await.expect("second half");

    let (reused, _transport_b) = reconnect(&registry, &client).await;
    assert_eq!(reused.id(), server.id());
    transport_a.close().await.expect("closing the old transport is harmless");

    let echoed = read_exact(&client, 100).await;
    assert_eq!(echoed, payload);
    assert_eq!(client.handshakes(), 2);
    assert_eq!(server.handshakes(), 2);

    client.close().await.expect("client close");
    server.close().await.expect("server close");
    tokio::time::timeout(Duration::from_secs(1), echo)
        .await
        .expect("echo stops on close")
        .expect("echo task");
    assert!(registry.query_by_id(server.id().expect("id")).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bytes_written_while_detached_are_replayed() {
    let registry = registry(16);
    let (client, server, transport_a) = connect_fresh(&registry).await;

    transport_a.close().await.expect("drop transport a");
    let mut one = [0u8; 1];
    assert!(server.read(&mut one).await.is_err(), "server sees the failure");
    assert_eq!(server.phase(), Phase::Established);

    client.write_all(b"queued while offline").await.expect("buffered");
    server.write_all(b"reply while offline").await.expect("buffered");

    let (_, _transport_b) = reconnect(&registry, &client).await;
    assert_eq!(read_exact(&server, 20).await, b"queued while offline");
    assert_eq!(read_exact(&client, 19).await, b"reply while offline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_reuse_increments_counter_each_time() {
    let registry = registry(16);
    let (client, server, _transport) = connect_fresh(&registry).await;
    let _echo = spawn_echo(server.clone());

    for round in 0..5u32 {
        let message = format!("round-{round}");
        client.write_all(message.as_bytes()).await.expect("write");
        let (_, _transport) = reconnect(&registry, &client).await;
        assert_eq!(client.handshakes(), round + 2);
        assert_eq!(read_exact(&client, message.len()).await, message.as_bytes());
    }
    assert_eq!(client.sent(), client.received());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn swap_releases_read_parked_on_old_transport() {
    let registry = registry(16);
    let (client, server, _transport_a) = connect_fresh(&registry).await;
    let parked = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            server.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!parked.is_finished(), "read waits on transport a");

    let (_, _transport_b) = reconnect(&registry, &client).await;
    let result = tokio::time::timeout(Duration::from_secs(1), parked)
        .await
        .expect("parked read returns after the swap")
        .expect("reader task");
    assert!(matches!(result, Err(ScpError::Transport(_))), "{result:?}");
    assert_eq!(server.phase(), Phase::Established);
    assert!(server.is_attached());

    client.write_all(b"after swap").await.expect("write");
    assert_eq!(read_exact(&server, 10).await, b"after swap");
}
