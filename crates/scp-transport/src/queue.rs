//! 有界的待握手传输队列。
//!
//! 监听器（例如 WebSocket 的 HTTP 升级回调）作为生产者把新传输推入队列，
//! 会话驱动作为消费者从 [`Acceptor::accept`] 取出。队列容量固定，握手处理速率
//! 落后于接入速率时生产者在 [`AcceptSender::send`] 上挂起，内存占用因此有上界。

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use crate::{
    error::{OperationKind, TransportError},
    listener::Acceptor,
    transport::{CloseSignal, SharedTransport, run_with_deadline},
};

const ACCEPT: OperationKind = OperationKind::new("scp.transport.queue.accept_failed", "queue accept");

/// 创建容量为 `capacity` 的队列，`addr` 作为监听地址的文本表示。
pub fn accept_queue(addr: impl Into<String>, capacity: usize) -> (AcceptSender, AcceptQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        AcceptSender { tx },
        AcceptQueue {
            rx: AsyncMutex::new(rx),
            addr: addr.into(),
            closed: CloseSignal::new(),
        },
    )
}

/// 队列生产端，可克隆给多个接入任务。
#[derive(Clone, Debug)]
pub struct AcceptSender {
    tx: mpsc::Sender<SharedTransport>,
}

impl AcceptSender {
    /// 推入一条传输；队列满时挂起。
    ///
    /// 消费端已关闭时把传输原样交还，由调用方负责关闭。
    pub async fn send(&self, transport: SharedTransport) -> Result<(), SharedTransport> {
        self.tx.send(transport).await.map_err(|err| err.0)
    }

    /// 消费端是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 队列消费端，实现 [`Acceptor`]。
#[derive(Debug)]
pub struct AcceptQueue {
    rx: AsyncMutex<mpsc::Receiver<SharedTransport>>,
    addr: String,
    closed: CloseSignal,
}

#[async_trait]
impl Acceptor for AcceptQueue {
    async fn accept(&self) -> Result<SharedTransport, TransportError> {
        run_with_deadline(ACCEPT, None, &self.closed, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or_else(|| TransportError::closed(ACCEPT))
        })
        .await
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.close() {
            return Ok(());
        }
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0usize;
        while let Ok(transport) = rx.try_recv() {
            dropped += 1;
            let _ = transport.close().await;
        }
        debug!(addr = %self.addr, dropped, "accept queue closed");
        Ok(())
    }
}
