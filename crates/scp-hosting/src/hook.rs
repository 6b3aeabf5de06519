use std::io;

use async_trait::async_trait;
use scp_core::Conn;
use tokio::net::TcpStream;

/// 上游连通后的回调。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 部分上游需要在业务数据之前收到额外信息（例如客户端真实地址），
///   网关在桥接开始前给予一次写入上游的机会；
///
/// ## 契约说明（What）
/// - 每条新建的逻辑连接调用一次，换挂不会再次触发；
/// - 返回错误时本次桥接终止，逻辑连接被关闭。
#[async_trait]
pub trait ConnectHook: Send + Sync + 'static {
    async fn after_connected(&self, conn: &Conn, upstream: &TcpStream) -> io::Result<()>;
}

/// 不做任何事的回调。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHook;

#[async_trait]
impl ConnectHook for NoopHook {
    async fn after_connected(&self, _conn: &Conn, _upstream: &TcpStream) -> io::Result<()> {
        Ok(())
    }
}
