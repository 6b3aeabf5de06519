mod common;

use std::{sync::Arc, time::Duration};

use scp_core::{Config, Conn, Phase, Registry, Rejection, ScpError};
use scp_transport::Transport;

use common::{connect_fresh, handshake, pipe, registry, server_config};

#[tokio::test]
async fn server_handshake_without_registry_is_a_config_error() {
    let (_client_side, server_side) = pipe();
    let err = Conn::server(server_side, &Config::client())
        .await
        .expect_err("registry is mandatory");
    assert!(matches!(err, ScpError::Config(_)));
    assert_eq!(err.code(), "scp.config.invalid");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_connection_starts_at_counter_one() {
    let registry = registry(8);
    let (client, server, _transport) = connect_fresh(&registry).await;
    assert_eq!(client.id(), server.id());
    assert_eq!(client.handshakes(), 1);
    assert_eq!(server.handshakes(), 1);
    assert_eq!(server.phase(), Phase::Established);
    assert_eq!(registry.len(), 1);
    assert!(registry.query_by_id(server.id().expect("id")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_server_travels_with_fresh_request() {
    let registry = registry(8);
    let client_config = Config::client().with_target_server("game1");
    let (client, accepted, _transport) = handshake(&server_config(&registry), &client_config).await;
    let server = accepted.expect("accepted").into_conn();
    assert_eq!(server.target_server().as_deref(), Some("game1"));
    assert_eq!(client.expect("client").target_server().as_deref(), Some("game1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_registry_rejects_without_consuming_ids() {
    let registry = registry(1);
    let (_client, _server, _transport) = connect_fresh(&registry).await;

    let (client, accepted, _transport) = handshake(&server_config(&registry), &Config::client()).await;
    assert!(matches!(client, Err(ScpError::Exhausted)));
    assert!(matches!(accepted, Err(ScpError::Exhausted)));
    assert_eq!(registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_releases_the_id() {
    let registry = registry(1);
    let (client, server, _transport) = connect_fresh(&registry).await;
    let id = server.id().expect("id");

    server.close().await.expect("close");
    server.close().await.expect("second close");
    assert!(server.is_closed());
    assert!(registry.query_by_id(id).is_none());
    assert!(registry.is_empty());

    let mut buf = [0u8; 4];
    assert!(matches!(server.read(&mut buf).await, Err(ScpError::Closed)));
    assert!(matches!(server.write(b"x").await, Err(ScpError::Closed)));

    let (_, next, _transport) = connect_fresh(&registry).await;
    assert_eq!(next.id(), Some(id), "released id is handed out again");
    client.close().await.expect("client close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reuse_of_unknown_id_keeps_client_connection() {
    let registry = registry(4);
    let (client, server, _transport) = connect_fresh(&registry).await;
    let id = server.id().expect("id");
    server.close().await.expect("server gone");

    let client_config = Config::client().with_conn_for_reused(client.clone());
    let (reused, accepted, fresh_transport) = handshake(&server_config(&registry), &client_config).await;
    assert_eq!(
        reused.expect_err("unknown").rejection(),
        Some(Rejection::UnknownId { id })
    );
    assert!(matches!(
        accepted,
        Err(ScpError::NotAcceptable(Rejection::UnknownId { .. }))
    ));
    assert_eq!(client.phase(), Phase::Established, "client survives the rejection");
    assert!(!client.is_attached());
    assert_eq!(client.handshakes(), 1);

    let mut buf = [0u8; 1];
    assert!(fresh_transport.read(&mut buf).await.is_err(), "failed transport is closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_handshake_times_out_when_server_is_silent() {
    let (client_side, _server_side) = pipe();
    let config = Config::client().with_handshake_timeout(Duration::from_millis(50));
    let err = Conn::client(Arc::clone(&client_side), &config)
        .await
        .expect_err("no answer");
    assert!(matches!(err, ScpError::Timeout));
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reuse_of_closed_client_connection_is_refused_locally() {
    let registry = registry(4);
    let (client, _server, _transport) = connect_fresh(&registry).await;
    client.close().await.expect("close");

    let (client_side, _server_side) = pipe();
    let config = Config::client().with_conn_for_reused(client.clone());
    let err = Conn::client(client_side, &config).await.expect_err("closed");
    assert!(matches!(err, ScpError::Closed));
}
