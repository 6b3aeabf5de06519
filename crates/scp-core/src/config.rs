use std::{fmt, sync::Arc, time::Duration};

use crate::{buffer::DEFAULT_SEND_BUFFER_CAPACITY, conn::Conn, registry::Registry};

/// 默认握手超时。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// 握手配置。
///
/// # 教案级注释
///
/// ## 契约说明（What）
/// - `target_server`：客户端提示服务端应桥接到哪个上游，随 NEW 请求发送；
/// - `conn_for_reused`：客户端要迁移的既有连接；存在时发起 REUSE 而不是 NEW；
/// - `scp_server`：服务端注册表，服务端握手必填，缺失时握手返回
///   [`ScpError::Config`](crate::ScpError::Config)；
/// - `handshake_timeout`：单次握手（含重放）的最长耗时；
/// - `send_buffer_capacity`：新连接重放缓冲区的容量。
#[derive(Clone)]
pub struct Config {
    pub target_server: Option<String>,
    pub conn_for_reused: Option<Conn>,
    pub scp_server: Option<Arc<dyn Registry>>,
    pub handshake_timeout: Duration,
    pub send_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_server: None,
            conn_for_reused: None,
            scp_server: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_buffer_capacity: DEFAULT_SEND_BUFFER_CAPACITY,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("target_server", &self.target_server)
            .field("conn_for_reused", &self.conn_for_reused.as_ref().map(Conn::id))
            .field("scp_server", &self.scp_server.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("send_buffer_capacity", &self.send_buffer_capacity)
            .finish()
    }
}

impl Config {
    /// 客户端默认配置。
    pub fn client() -> Self {
        Self::default()
    }

    /// 携带注册表的服务端配置。
    pub fn server(registry: Arc<dyn Registry>) -> Self {
        Self {
            scp_server: Some(registry),
            ..Self::default()
        }
    }

    pub fn with_target_server(mut self, target: impl Into<String>) -> Self {
        self.target_server = Some(target.into());
        self
    }

    pub fn with_conn_for_reused(mut self, conn: Conn) -> Self {
        self.conn_for_reused = Some(conn);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_send_buffer_capacity(mut self, capacity: usize) -> Self {
        self.send_buffer_capacity = capacity;
        self
    }
}
