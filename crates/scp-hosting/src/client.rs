//! 客户端拨号与换挂。
//!
//! 传输层断开后，调用方只需拨一条新传输并调用 [`reuse`] 系列函数，原有的 [`Conn`]
//! 即可继续读写；换挂失败时连接保持无传输状态，可以再次尝试。

use std::{sync::Arc, time::Duration};

use scp_core::{Config, Conn};
use scp_transport::SharedTransport;
use scp_transport_tcp::TcpTransport;
use tokio::net::ToSocketAddrs;

use crate::error::HostingError;

/// 客户端握手参数。
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub target_server: Option<String>,
    pub handshake_timeout: Duration,
    pub send_buffer_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let config = Config::client();
        Self {
            target_server: None,
            handshake_timeout: config.handshake_timeout,
            send_buffer_capacity: config.send_buffer_capacity,
        }
    }
}

impl ClientOptions {
    pub fn with_target_server(mut self, target: impl Into<String>) -> Self {
        self.target_server = Some(target.into());
        self
    }

    fn config(&self) -> Config {
        Config {
            target_server: self.target_server.clone(),
            handshake_timeout: self.handshake_timeout,
            send_buffer_capacity: self.send_buffer_capacity,
            ..Config::client()
        }
    }
}

/// 在已建立的传输上新建逻辑连接。
pub async fn dial(transport: SharedTransport, options: &ClientOptions) -> Result<Conn, HostingError> {
    Ok(Conn::client(transport, &options.config()).await?)
}

/// 把 `conn` 换挂到 `transport`。
pub async fn reuse(
    conn: &Conn,
    transport: SharedTransport,
    options: &ClientOptions,
) -> Result<Conn, HostingError> {
    let config = options.config().with_conn_for_reused(conn.clone());
    Ok(Conn::client(transport, &config).await?)
}

pub async fn dial_tcp<A: ToSocketAddrs>(addr: A, options: &ClientOptions) -> Result<Conn, HostingError> {
    let transport = TcpTransport::connect(addr).await?;
    dial(Arc::new(transport), options).await
}

pub async fn reuse_tcp<A: ToSocketAddrs>(
    conn: &Conn,
    addr: A,
    options: &ClientOptions,
) -> Result<Conn, HostingError> {
    let transport = TcpTransport::connect(addr).await?;
    reuse(conn, Arc::new(transport), options).await
}

pub async fn dial_ws(url: &str, options: &ClientOptions) -> Result<Conn, HostingError> {
    let transport = scp_transport_ws::connect(url).await?;
    dial(Arc::new(transport), options).await
}

pub async fn reuse_ws(conn: &Conn, url: &str, options: &ClientOptions) -> Result<Conn, HostingError> {
    let transport = scp_transport_ws::connect(url).await?;
    reuse(conn, Arc::new(transport), options).await
}
