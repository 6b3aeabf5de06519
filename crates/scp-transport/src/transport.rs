use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{OperationKind, TransportError};

/// 逻辑连接可挂载的传输对象。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 逻辑连接在生命周期内会多次更换底层传输，因此只能依赖一个与介质无关的字节流契约；
/// - 所有方法均以 `&self` 暴露，便于逻辑连接在锁外持有 `Arc` 引用并发执行读与写。
///
/// ## 契约 (What)
/// - `read`：读取至少 1 字节并返回读取数量；对端关闭时返回 [`TransportError::Eof`]，
///   而不是 `Ok(0)`（空缓冲区除外）；
/// - `write`：写出整个缓冲区，成功时返回缓冲区长度；
/// - `set_*_deadline`：独立设置读、写截止时间，`None` 表示不限时；
/// - `close`：幂等；关闭后所有挂起与后续的读写都返回 [`TransportError::Closed`]。
///
/// ## 注意事项 (Trade-offs)
/// - `read` 必须是取消安全的：调用方可能因为逻辑连接的截止时间而丢弃该 Future，
///   此时不得丢失已从套接字取出的数据。
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// 介质标识，例如 `"tcp"`、`"ws"`、`"memory"`。
    fn scheme(&self) -> &'static str;

    /// 读取数据到缓冲区。
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// 写出整个缓冲区。
    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// 本地地址；内存管道等无地址介质返回 `None`。
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 对端地址。
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 同时设置读与写的截止时间。
    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// 设置读截止时间。
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// 设置写截止时间。
    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// 关闭传输，幂等。
    async fn close(&self) -> Result<(), TransportError>;
}

/// 逻辑连接、监听器与握手流程之间共享传输对象的统一形态。
pub type SharedTransport = Arc<dyn Transport>;

/// 广播式关闭信号。
///
/// `close` 只有第一次调用返回 `true`；`wait` 在信号触发后立即完成，
/// 先登记 `Notify` 再检查标志位，避免错过唤醒。
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// 创建未触发的信号。
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭，返回本次调用是否为首次触发。
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// 是否已经触发。
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待关闭信号。
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// 读/写截止时间的存储。
#[derive(Debug, Default)]
pub struct Deadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> Option<Instant> {
        *self.read.lock()
    }

    pub fn write(&self) -> Option<Instant> {
        *self.write.lock()
    }

    pub fn set_read(&self, deadline: Option<Instant>) {
        *self.read.lock() = deadline;
    }

    pub fn set_write(&self, deadline: Option<Instant>) {
        *self.write.lock() = deadline;
    }
}

/// 在保留关闭与截止语义的前提下执行一次传输 IO。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 先检查关闭标志与已过期的截止时间，避免发起注定失败的 IO；
/// - 使用 `tokio::select!`（`biased`）组合关闭信号、截止计时器与 IO Future，
///   关闭优先于超时，超时优先于 IO 结果。
///
/// ## 契约 (What)
/// - 关闭：返回 [`TransportError::Closed`]；
/// - 截止：返回 [`TransportError::Timeout`]；
/// - 其余情况原样返回 `future` 的结果。
pub async fn run_with_deadline<F, T>(
    kind: OperationKind,
    deadline: Option<Instant>,
    closed: &CloseSignal,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if closed.is_closed() {
        return Err(TransportError::closed(kind));
    }
    if let Some(deadline) = deadline
        && deadline <= Instant::now()
    {
        return Err(TransportError::timeout(kind));
    }

    let cancel = closed.wait();
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = deadline {
        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(TransportError::closed(kind)),
            _ = &mut sleep => Err(TransportError::timeout(kind)),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(TransportError::closed(kind)),
            result = &mut future => result,
        }
    }
}
