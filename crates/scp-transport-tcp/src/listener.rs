use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use scp_transport::{Acceptor, CloseSignal, SharedTransport, TransportError, run_with_deadline};
use tokio::net::{TcpListener as TokioTcpListener, ToSocketAddrs};
use tracing::{debug, warn};

use crate::{
    error::{ACCEPT, BIND},
    stream::{TcpSocketConfig, TcpTransport},
};

/// TCP 监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 Tokio 的监听套接字适配为 [`Acceptor`]，会话驱动无需区分 TCP 与 WebSocket；
/// - 新连接在交付前即应用 [`TcpSocketConfig`]，服务端所有传输的关闭策略保持一致。
///
/// ## 契约说明（What）
/// - `accept`：返回已配置好的 [`TcpTransport`]；`close` 之后返回 `Closed`；
/// - 单条连接的套接字配置失败只记录日志并继续等待下一条，不会终止监听。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    config: TcpSocketConfig,
    closed: CloseSignal,
}

impl TcpListener {
    /// 绑定到指定地址。
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, TcpSocketConfig::default()).await
    }

    /// 绑定并指定新连接的默认套接字配置。
    pub async fn bind_with_config<A: ToSocketAddrs>(
        addr: A,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io(BIND, err))?;
        let local_addr = inner
            .local_addr()
            .map_err(|err| TransportError::io(BIND, err))?;
        debug!(%local_addr, "tcp listener bound");
        Ok(Self {
            inner,
            local_addr,
            config,
            closed: CloseSignal::new(),
        })
    }

    /// 实际绑定的地址（端口为 0 时由内核分配）。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.config
    }

    /// 接受一条连接并返回具体类型，供需要 `TcpTransport` 本身的调用方使用。
    pub async fn accept_tcp(&self) -> Result<TcpTransport, TransportError> {
        loop {
            let (stream, peer) = run_with_deadline(ACCEPT, None, &self.closed, async {
                self.inner
                    .accept()
                    .await
                    .map_err(|err| TransportError::io(ACCEPT, err))
            })
            .await?;
            match TcpTransport::from_stream(stream, &self.config) {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    warn!(%peer, error = %err, code = err.code(), "dropping tcp connection");
                }
            }
        }
    }
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> Result<SharedTransport, TransportError> {
        let transport = self.accept_tcp().await?;
        Ok(Arc::new(transport))
    }

    fn addr(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.close() {
            debug!(local_addr = %self.local_addr, "tcp listener closed");
        }
        Ok(())
    }
}
