//! 消息型传输（WebSocket）上的逻辑连接仍是连续字节流。

mod common;

use std::sync::Arc;

use scp_core::{Accepted, Config, Conn, IdRegistry};
use scp_transport::SharedTransport;
use scp_transport_ws::WsTransport;
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};

async fn ws_pipe() -> (SharedTransport, SharedTransport) {
    let (left, right) = tokio::io::duplex(common::PIPE_CAPACITY);
    let client = WebSocketStream::from_raw_socket(left, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(right, Role::Server, None).await;
    (
        Arc::new(WsTransport::new(client, None, None)),
        Arc::new(WsTransport::new(server, None, None)),
    )
}

async fn connect_over_ws() -> (Arc<IdRegistry>, Conn, Conn) {
    let registry = common::registry(16);
    let config = common::server_config(&registry);
    let (client_side, server_side) = ws_pipe().await;
    let server = tokio::spawn(async move { Conn::server(server_side, &config).await });
    let client = Conn::client(client_side, &Config::client())
        .await
        .expect("client handshake over ws");
    let server = match server.await.expect("server task").expect("server handshake") {
        Accepted::Fresh(conn) => conn,
        Accepted::Reused(_) => panic!("fresh handshake reported as reuse"),
    };
    (registry, client, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_larger_than_read_buffer_is_split_across_reads() {
    let (_registry, client, server) = connect_over_ws().await;
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).await.expect("write");

    let mut first = [0u8; 4096];
    let n = server.read(&mut first).await.expect("first slice");
    assert_eq!(n, first.len());
    assert_eq!(&first[..], &payload[..n]);
    assert!(server.is_attached(), "short buffer does not detach the transport");

    let rest = common::read_exact(&server, payload.len() - n).await;
    assert_eq!(rest.as_slice(), &payload[n..]);
    assert_eq!(server.received(), payload.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_reads_keep_message_order() {
    let (_registry, client, server) = connect_over_ws().await;
    client.write_all(b"first message").await.expect("first");
    client.write_all(b"second").await.expect("second");

    let received = common::read_exact(&server, 19).await;
    assert_eq!(received.as_slice(), b"first messagesecond");

    let mut tiny = [0u8; 3];
    server.write_all(b"reply").await.expect("reply");
    let n = client.read(&mut tiny).await.expect("tiny read");
    assert_eq!(&tiny[..n], b"rep");
    let n = client.read(&mut tiny).await.expect("remainder");
    assert_eq!(&tiny[..n], b"ly");
}
