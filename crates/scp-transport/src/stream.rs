use std::{fmt, io, net::SocketAddr, time::Instant};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};

use crate::{
    error::{OperationKind, TransportError},
    transport::{CloseSignal, Deadlines, Transport, run_with_deadline},
};

/// 字节流介质使用的操作码表。
#[derive(Clone, Copy, Debug)]
pub struct StreamOperations {
    pub scheme: &'static str,
    pub read: OperationKind,
    pub write: OperationKind,
    pub close: OperationKind,
}

const MEMORY_OPERATIONS: StreamOperations = StreamOperations {
    scheme: "memory",
    read: OperationKind::new("scp.transport.memory.read_failed", "memory read"),
    write: OperationKind::new("scp.transport.memory.write_failed", "memory write"),
    close: OperationKind::new("scp.transport.memory.close_failed", "memory close"),
};

/// 将任意读/写半部包装为 [`Transport`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - TCP 与内存管道都是“天然的字节流”，无需任何分帧；把读写半部分别放入独立的
///   异步互斥锁后即可获得真正的全双工，读挂起时写仍可推进。
///
/// ## 逻辑 (How)
/// - 读写都经过 [`run_with_deadline`]，从而同时响应关闭信号与各自的截止时间；
/// - `close` 先触发关闭信号让挂起的 IO 释放锁，再拿到写半部执行 `shutdown`，
///   对端因此读到 EOF。
///
/// ## 契约 (What)
/// - 读到 0 字节时返回 [`TransportError::Eof`]；
/// - `close` 幂等，第二次调用直接返回 `Ok(())`。
pub struct StreamTransport<R, W> {
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    deadlines: Deadlines,
    closed: CloseSignal,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    ops: StreamOperations,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// 由读写半部与地址元数据构造传输。
    pub fn from_halves(
        reader: R,
        writer: W,
        ops: StreamOperations,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            deadlines: Deadlines::new(),
            closed: CloseSignal::new(),
            local_addr,
            peer_addr,
            ops,
        }
    }

    /// 传输是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl<R, W> fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("scheme", &self.ops.scheme)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn scheme(&self) -> &'static str {
        self.ops.scheme
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let kind = self.ops.read;
        run_with_deadline(kind, self.deadlines.read(), &self.closed, async {
            let mut reader = self.reader.lock().await;
            match reader.read(buf).await {
                Ok(0) => Err(TransportError::eof(kind)),
                Ok(n) => Ok(n),
                Err(err) => Err(TransportError::io(kind, err)),
            }
        })
        .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let kind = self.ops.write;
        run_with_deadline(kind, self.deadlines.write(), &self.closed, async {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(buf)
                .await
                .map_err(|err| TransportError::io(kind, err))?;
            writer
                .flush()
                .await
                .map_err(|err| TransportError::io(kind, err))?;
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
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(TransportError::io(self.ops.close, err)),
        }
    }
}

/// 内存管道传输，测试与进程内桥接使用。
pub type DuplexTransport = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// 创建一对首尾相连的内存传输。
///
/// `max_buf_size` 为单方向的管道容量，写满后写方挂起直到对端读取。
pub fn duplex_pair(max_buf_size: usize) -> (DuplexTransport, DuplexTransport) {
    let (left, right) = tokio::io::duplex(max_buf_size);
    let (left_reader, left_writer) = tokio::io::split(left);
    let (right_reader, right_writer) = tokio::io::split(right);
    (
        StreamTransport::from_halves(left_reader, left_writer, MEMORY_OPERATIONS, None, None),
        StreamTransport::from_halves(right_reader, right_writer, MEMORY_OPERATIONS, None, None),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn pair_carries_bytes_both_ways() {
        let (left, right) = duplex_pair(1024);
        left.write(b"hello").await.expect("write");
        let mut buf = [0u8; 16];
        let n = right.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"hello");

        right.write(b"world").await.expect("write back");
        let n = left.read(&mut buf).await.expect("read back");
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn close_unblocks_pending_read_and_signals_eof() {
        let (left, right) = duplex_pair(1024);
        let left = Arc::new(left);
        let reader = {
            let left = Arc::clone(&left);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                left.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        left.close().await.expect("close");
        left.close().await.expect("close is idempotent");

        let result = reader.await.expect("join");
        assert!(matches!(result, Err(TransportError::Closed { .. })));

        let mut buf = [0u8; 8];
        let result = right.read(&mut buf).await;
        assert!(matches!(result, Err(TransportError::Eof { .. })));
    }

    #[tokio::test]
    async fn read_deadline_times_out_without_closing() {
        let (left, right) = duplex_pair(1024);
        left.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 8];
        let result = left.read(&mut buf).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));

        left.set_read_deadline(None);
        right.write(b"late").await.expect("write");
        let n = left.read(&mut buf).await.expect("read after timeout");
        assert_eq!(&buf[..n], b"late");
    }
}
