#![deny(unsafe_code)]
#![doc = r#"
# scp-transport

## 设计动机（Why）
- **定位**：为可重连逻辑连接（`scp-core::Conn`）提供统一的传输层字节流契约，
  让 TCP、WebSocket 等不同介质在逻辑连接眼中只是“一段可读可写、可被替换的字节管道”。
- **架构角色**：位于最底层，`scp-transport-tcp`、`scp-transport-ws` 实现本 crate 的
  [`Transport`]/[`Acceptor`] 契约，`scp-core` 与 `scp-hosting` 只面向 trait 对象编程。

## 核心契约（What）
- [`Transport`]：阻塞语义的 `read`/`write`、独立的读/写/整体截止时间、地址元数据、
  幂等 `close`（关闭会唤醒所有挂起的读写）；
- [`Acceptor`]：监听器契约，`accept`/`addr`/`close`；
- [`AcceptQueue`]：有界的待握手连接队列，队列满时生产者阻塞，形成背压；
- [`StreamTransport`]：把任意 `AsyncRead + AsyncWrite` 包装为 [`Transport`]，
  TCP 适配器与内存管道测试均复用它。

## 风险与考量（Trade-offs）
- 截止时间使用 `std::time::Instant`，在调用时转换为 Tokio 时间点；
- 关闭信号通过 `Notify` 广播，已挂起的 IO 在下一次调度时观察到关闭。
"#]

mod error;
mod listener;
mod queue;
mod stream;
mod transport;

pub use error::{OperationKind, TransportError};
pub use listener::{Acceptor, SharedAcceptor};
pub use queue::{AcceptQueue, AcceptSender, accept_queue};
pub use stream::{DuplexTransport, StreamOperations, StreamTransport, duplex_pair};
pub use transport::{CloseSignal, Deadlines, SharedTransport, Transport, run_with_deadline};
