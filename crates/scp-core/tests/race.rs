mod common;

use std::{sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use scp_core::{
    Conn, Rejection, ScpError,
    handshake::{MessageReader, Request, Response, ResponseCode},
};
use scp_transport::Transport;

use common::{connect_fresh, pipe, registry, server_config};

async fn send_reuse(transport: &dyn Transport, request: &Request) {
    let body = request.encode().expect("encode");
    let mut frame = BytesMut::new();
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    transport.write(&frame).await.expect("send request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reuse_with_same_counter_has_one_winner() {
    let registry = registry(16);
    let (client, server, _transport) = connect_fresh(&registry).await;
    let id = server.id().expect("id");
    let request = Request::reuse(id, client.handshakes(), 0);

    let mut attempts = Vec::new();
    for _ in 0..2 {
        let (client_side, server_side) = pipe();
        let config = server_config(&registry);
        let request = request.clone();
        attempts.push(tokio::spawn(async move {
            send_reuse(client_side.as_ref(), &request).await;
            let outcome = Conn::server(server_side, &config).await;
            let mut reader = MessageReader::new();
            let response = reader
                .read_message(client_side.as_ref())
                .await
                .map(|body| Response::decode(&body).expect("decode"));
            (outcome.map(|accepted| accepted.is_reused()), response)
        }));
    }

    let mut winners = 0;
    for attempt in attempts {
        let (outcome, response) = attempt.await.expect("attempt task");
        match outcome {
            Ok(reused) => {
                assert!(reused);
                winners += 1;
                let response = response.expect("winner gets a response");
                assert_eq!(response.code, ResponseCode::Ok);
                assert_eq!(response.handshakes, 2);
            }
            Err(ScpError::NotAcceptable(rejection)) => {
                assert!(matches!(
                    rejection,
                    Rejection::Busy | Rejection::StaleHandshake { expected: 2, presented: 1 }
                ));
                let response = response.expect("loser gets a rejection");
                assert_ne!(response.code, ResponseCode::Ok);
            }
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(server.handshakes(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_retry_after_success_is_rejected() {
    let registry = registry(16);
    let (client, server, _transport) = connect_fresh(&registry).await;
    let stale = Request::reuse(server.id().expect("id"), 1, 0);

    let (_, _transport_b) = common::reconnect(&registry, &client).await;
    assert_eq!(server.handshakes(), 2);

    let (client_side, server_side) = pipe();
    send_reuse(client_side.as_ref(), &stale).await;
    let config = server_config(&registry);
    let err = Conn::server(Arc::clone(&server_side), &config)
        .await
        .expect_err("stale counter");
    assert_eq!(
        err.rejection(),
        Some(Rejection::StaleHandshake {
            expected: 2,
            presented: 1
        })
    );

    let mut reader = MessageReader::new();
    let body = tokio::time::timeout(Duration::from_secs(1), reader.read_message(client_side.as_ref()))
        .await
        .expect("response in time")
        .expect("response");
    let response = Response::decode(&body).expect("decode");
    assert_eq!(response.code, ResponseCode::StaleHandshake);
    assert_eq!(response.handshakes, 2);
    assert!(server.is_attached(), "the winning transport is untouched");
}
