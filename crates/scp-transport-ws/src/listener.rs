use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use scp_transport::{
    AcceptQueue, AcceptSender, Acceptor, SharedTransport, TransportError, accept_queue,
};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ACCEPT, BIND, UPGRADE, map_ws_error},
    transport::WsTransport,
};

/// WebSocket 监听器配置。
#[derive(Clone, Debug)]
pub struct WsListenerConfig {
    /// HTTP 升级握手的最长等待时间。
    pub upgrade_timeout: Duration,
    /// 已完成升级、等待会话握手的传输上限；超过后升级任务挂起。
    pub backlog: usize,
}

impl Default for WsListenerConfig {
    fn default() -> Self {
        Self {
            upgrade_timeout: Duration::from_secs(10),
            backlog: 256,
        }
    }
}

/// WebSocket 监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 升级握手涉及 HTTP 往返，不能放在会话驱动的 `accept` 路径上串行执行，
///   否则一个慢客户端就会拖住所有新连接；
///
/// ## 逻辑（How）
/// - 后台任务循环接受 TCP 连接，每条连接派生独立任务完成升级；
/// - 升级成功的传输推入有界 [`AcceptQueue`]，会话驱动从队列取出；
/// - 队列满时升级任务在推送处挂起，形成背压。
///
/// ## 契约说明（What）
/// - `close` 终止后台接受循环并关闭队列，队列中尚未被取走的传输一并关闭。
#[derive(Debug)]
pub struct WsListener {
    local_addr: SocketAddr,
    queue: AcceptQueue,
    accept_loop: JoinHandle<()>,
}

impl WsListener {
    /// 以默认配置绑定。
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, WsListenerConfig::default()).await
    }

    /// 绑定并启动后台接受循环。
    pub async fn bind_with_config<A: ToSocketAddrs>(
        addr: A,
        config: WsListenerConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io(BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::io(BIND, err))?;
        let (sender, queue) = accept_queue(format!("ws://{local_addr}"), config.backlog);
        let accept_loop = tokio::spawn(accept_loop(listener, sender, config));
        info!(%local_addr, "ws listener bound");
        Ok(Self {
            local_addr,
            queue,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(listener: TcpListener, sender: AcceptSender, config: WsListenerConfig) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                let err = TransportError::io(ACCEPT, err);
                warn!(error = %err, code = err.code(), "ws accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if sender.is_closed() {
            return;
        }
        let sender = sender.clone();
        let timeout = config.upgrade_timeout;
        tokio::spawn(async move {
            match upgrade(stream, timeout).await {
                Ok(transport) => {
                    debug!(%peer, "accept new ws connection");
                    if let Err(transport) = sender.send(transport).await {
                        let _ = transport.close().await;
                    }
                }
                Err(err) => debug!(%peer, error = %err, "ws upgrade failed"),
            }
        });
    }
}

async fn upgrade(stream: TcpStream, timeout: Duration) -> Result<SharedTransport, TransportError> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    let ws = tokio::time::timeout(timeout, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| TransportError::timeout(UPGRADE))?
        .map_err(|err| map_ws_error(UPGRADE, err))?;
    Ok(Arc::new(WsTransport::new(ws, local, peer)))
}

#[async_trait]
impl Acceptor for WsListener {
    async fn accept(&self) -> Result<SharedTransport, TransportError> {
        self.queue.accept().await
    }

    fn addr(&self) -> String {
        self.queue.addr()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.accept_loop.abort();
        self.queue.close().await
    }
}
