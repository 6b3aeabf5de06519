use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::TransportError, transport::SharedTransport};

/// 统一的传输监听器接口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话驱动（`scp-hosting::Server::serve`）只关心“下一条待握手的传输”，
///   不关心它来自 TCP 直连还是 WebSocket 升级；
///
/// ## 契约说明（What）
/// - `accept`：挂起直到产出下一条传输；监听器关闭后返回 [`TransportError::Closed`]；
/// - `addr`：监听地址的文本表示，用于日志；
/// - `close`：停止接受新连接，幂等。
///
/// ## 风险提示（Trade-offs）
/// - 实现应保证 `accept` 在关闭后迅速返回，避免阻塞进程退出。
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// 接受一条入站传输。
    async fn accept(&self) -> Result<SharedTransport, TransportError>;

    /// 监听地址。
    fn addr(&self) -> String;

    /// 关闭监听器。
    async fn close(&self) -> Result<(), TransportError>;
}

/// 会话驱动持有监听器的统一形态。
pub type SharedAcceptor = Arc<dyn Acceptor>;
