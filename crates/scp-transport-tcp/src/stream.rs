use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use scp_transport::{StreamTransport, Transport, TransportError};
use socket2::SockRef;
use tokio::net::{
    TcpStream, ToSocketAddrs,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tracing::trace;

use crate::error::{CONFIGURE, CONNECT, STREAM};

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 逻辑连接频繁替换传输，旧传输关闭时若仍有数据滞留在内核发送缓冲区，
///   `SO_LINGER` 决定了它是被优雅送达还是以 RST 丢弃；
/// - 握手报文很小，启用 `TCP_NODELAY` 可避免 Nagle 算法带来的额外往返延迟。
///
/// ## 契约说明（What）
/// - `linger = None` 遵循内核默认策略；`Some(dur)` 在关闭超过 `dur` 后发送 RST；
/// - `nodelay` 默认开启；
/// - **后置条件**：`apply` 返回 `Ok(())` 时两项选项均已落地。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，测试中应使用 `Duration::ZERO` 或整秒值。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 默认配置：`linger = None`，`nodelay = true`。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)
    }
}

/// 基于 TCP 的传输。
///
/// 读写半部拆分后分别加锁，读挂起不会阻塞写；关闭时对写半部执行 `shutdown`，
/// 对端读到 EOF。
#[derive(Debug)]
pub struct TcpTransport {
    inner: StreamTransport<OwnedReadHalf, OwnedWriteHalf>,
}

impl TcpTransport {
    /// 使用默认套接字配置拨号。
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Self::connect_with_config(addr, &TcpSocketConfig::default()).await
    }

    /// 拨号并应用给定的套接字配置。
    pub async fn connect_with_config<A: ToSocketAddrs>(
        addr: A,
        config: &TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TransportError::io(CONNECT, err))?;
        Self::from_stream(stream, config)
    }

    /// 将已建立的 `TcpStream` 包装为传输。
    pub fn from_stream(stream: TcpStream, config: &TcpSocketConfig) -> Result<Self, TransportError> {
        config
            .apply(&stream)
            .map_err(|err| TransportError::io(CONFIGURE, err))?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        trace!(?local, ?peer, "tcp transport ready");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            inner: StreamTransport::from_halves(reader, writer, STREAM, local, peer),
        })
    }

    /// 传输是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        self.inner.scheme()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.inner.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.inner.write(buf).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_write_deadline(deadline);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
