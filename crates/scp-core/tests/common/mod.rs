#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use scp_core::{Accepted, Config, Conn, IdRegistry, Registry, ScpError};
use scp_transport::{SharedTransport, duplex_pair};

pub const PIPE_CAPACITY: usize = 256 * 1024;

pub fn registry(max_conns: u32) -> Arc<IdRegistry> {
    Arc::new(IdRegistry::new(max_conns))
}

pub fn server_config(registry: &Arc<IdRegistry>) -> Config {
    let registry: Arc<dyn Registry> = registry.clone();
    Config::server(registry).with_handshake_timeout(Duration::from_secs(2))
}

pub fn pipe() -> (SharedTransport, SharedTransport) {
    let (client, server) = duplex_pair(PIPE_CAPACITY);
    (Arc::new(client), Arc::new(server))
}

/// 在一条新管道上完成服务端与客户端握手。
pub async fn handshake(
    server_config: &Config,
    client_config: &Config,
) -> (Result<Conn, ScpError>, Result<Accepted, ScpError>, SharedTransport) {
    let (client_side, server_side) = pipe();
    let server = {
        let config = server_config.clone();
        tokio::spawn(async move { Conn::server(server_side, &config).await })
    };
    let client = Conn::client(Arc::clone(&client_side), client_config).await;
    let accepted = server.await.expect("server handshake task");
    (client, accepted, client_side)
}

/// 新建一对已连接的逻辑连接，返回（客户端，服务端，客户端侧传输）。
pub async fn connect_fresh(registry: &Arc<IdRegistry>) -> (Conn, Conn, SharedTransport) {
    let (client, accepted, transport) = handshake(&server_config(registry), &Config::client()).await;
    let accepted = accepted.expect("server accepts fresh handshake");
    assert!(!accepted.is_reused());
    (client.expect("client fresh handshake"), accepted.into_conn(), transport)
}

/// 把客户端连接换挂到一条新管道上。
pub async fn reconnect(registry: &Arc<IdRegistry>, client: &Conn) -> (Conn, SharedTransport) {
    let client_config = Config::client().with_conn_for_reused(client.clone());
    let (reused, accepted, transport) = handshake(&server_config(registry), &client_config).await;
    reused.expect("client reuse handshake");
    let accepted = accepted.expect("server accepts reuse");
    assert!(accepted.is_reused());
    (accepted.into_conn(), transport)
}

pub async fn read_exact(conn: &Conn, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match conn.read(&mut out[filled..]).await {
            Ok(n) => filled += n,
            Err(ScpError::Transport(_)) => conn.wait_attached().await.expect("reattached"),
            Err(err) => panic!("read failed after {filled} bytes: {err}"),
        }
    }
    out
}

/// 把服务端连接收到的字节原样写回，直到连接关闭。
pub fn spawn_echo(conn: Conn) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match conn.read(&mut buf).await {
                Ok(n) => {
                    if conn.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
                Err(ScpError::Transport(_)) => {
                    if conn.wait_attached().await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}
