use std::{fmt, net::SocketAddr, time::Duration, time::Instant};

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use scp_transport::{CloseSignal, Deadlines, Transport, TransportError, run_with_deadline};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::Mutex as AsyncMutex,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, trace};

use crate::error::{CLOSE, CONNECT, READ, WRITE, map_ws_error};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Inbound<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Option<Vec<u8>>,
}

/// 基于 WebSocket 的消息型传输。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 浏览器与部分移动端只能发起 WebSocket，逻辑连接仍需把它当作字节流使用；
/// - 写入的每个缓冲区编码为一条二进制消息，读取时一次交付一整条消息。
///
/// ## 逻辑 (How)
/// - `WebSocketStream` 拆分为写半部与读半部，分别加锁实现全双工；
/// - 读半部旁挂一个 `pending` 槽：消息超过调用方缓冲区时留在槽中，
///   返回 [`TransportError::FrameTooLarge`]，下一次读取优先消费该槽；
/// - Ping/Pong 由 tungstenite 自动应答，读路径直接跳过；
/// - 收到 Close 帧或流结束时返回 [`TransportError::Eof`]。
///
/// ## 契约 (What)
/// - `FrameTooLarge` 非致命，逻辑连接不会因此摘除传输；
/// - `close` 发送 Close 帧，最多等待一秒完成挥手。
pub struct WsTransport<S> {
    sink: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    inbound: AsyncMutex<Inbound<S>>,
    deadlines: Deadlines,
    closed: CloseSignal,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// 包装已完成握手的 WebSocket 流。
    pub fn new(
        ws: WebSocketStream<S>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: AsyncMutex::new(sink),
            inbound: AsyncMutex::new(Inbound {
                stream,
                pending: None,
            }),
            deadlines: Deadlines::new(),
            closed: CloseSignal::new(),
            local_addr,
            peer_addr,
        }
    }
}

impl<S> fmt::Debug for WsTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

/// 以客户端身份拨号 `ws://` 地址。
pub async fn connect(url: &str) -> Result<WsTransport<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| map_ws_error(CONNECT, err))?;
    let (local, peer) = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_nodelay(true);
            (tcp.local_addr().ok(), tcp.peer_addr().ok())
        }
        _ => (None, None),
    };
    debug!(url, status = %response.status(), "ws transport connected");
    Ok(WsTransport::new(ws, local, peer))
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn scheme(&self) -> &'static str {
        "ws"
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        run_with_deadline(READ, self.deadlines.read(), &self.closed, async {
            let mut inbound = self.inbound.lock().await;
            loop {
                if let Some(message) = inbound.pending.take() {
                    if message.len() > buf.len() {
                        let len = message.len();
                        inbound.pending = Some(message);
                        return Err(TransportError::FrameTooLarge {
                            buffer: buf.len(),
                            message: len,
                        });
                    }
                    buf[..message.len()].copy_from_slice(&message);
                    return Ok(message.len());
                }
                match inbound.stream.next().await {
                    None => return Err(TransportError::eof(READ)),
                    Some(Err(err)) => return Err(map_ws_error(READ, err)),
                    Some(Ok(Message::Binary(data))) if !data.is_empty() => {
                        inbound.pending = Some(data);
                    }
                    Some(Ok(Message::Text(text))) if !text.is_empty() => {
                        inbound.pending = Some(text.into_bytes());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        trace!(?frame, "ws peer sent close");
                        return Err(TransportError::eof(READ));
                    }
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        run_with_deadline(WRITE, self.deadlines.write(), &self.closed, async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(buf.to_vec()))
                .await
                .map_err(|err| map_ws_error(WRITE, err))?;
            Ok(buf.len())
        })
        .await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.set_write(deadline);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.close() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(err)) => match map_ws_error(CLOSE, err) {
                TransportError::Eof { .. } | TransportError::Closed { .. } => Ok(()),
                TransportError::Io { source, .. }
                    if matches!(
                        source.kind(),
                        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected
                    ) =>
                {
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WsTransport<DuplexStream>, WsTransport<DuplexStream>) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(left, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(right, Role::Server, None).await;
        (
            WsTransport::new(client, None, None),
            WsTransport::new(server, None, None),
        )
    }

    #[tokio::test]
    async fn oversized_message_is_kept_for_a_larger_buffer() {
        let (client, server) = pair().await;
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        client.write(&payload).await.expect("write");

        let mut small = [0u8; 256];
        let err = server.read(&mut small).await.expect_err("too small");
        assert!(matches!(
            err,
            TransportError::FrameTooLarge {
                buffer: 256,
                message: 300
            }
        ));
        assert!(!err.is_fatal());

        let mut large = [0u8; 512];
        let n = server.read(&mut large).await.expect("retry");
        assert_eq!(&large[..n], payload.as_slice());
    }

    #[tokio::test]
    async fn each_write_is_one_message() {
        let (client, server) = pair().await;
        client.write(b"first").await.expect("write");
        client.write(b"second").await.expect("write");
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"first");
        let n = server.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"second");
        assert_eq!(server.scheme(), "ws");
    }

    #[tokio::test]
    async fn close_is_seen_as_eof() {
        let (client, server) = pair().await;
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            server.read(&mut buf).await
        });
        client.close().await.expect("close");
        client.close().await.expect("idempotent close");
        let result = reader.await.expect("join");
        assert!(matches!(result, Err(TransportError::Eof { .. })));
    }
}
