use std::io;

use scp_core::ScpError;
use scp_transport::TransportError;
use thiserror::Error;

use crate::settings::SettingsError;

/// 宿主层错误。
///
/// # 教案式说明
/// - **意图 (Why)**：网关启动与会话桥接涉及配置、握手、上游三类失败，
///   统一后便于在日志中以稳定错误码聚合；
/// - **契约 (What)**：[`HostingError::code`] 对下层错误透传其错误码。
#[derive(Debug, Error)]
pub enum HostingError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Scp(#[from] ScpError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 没有可用的上游。
    #[error("no upstream available for target {target:?}")]
    NoUpstream { target: Option<String> },
    /// 连接上游失败。
    #[error("connect upstream `{name}` ({addr}) failed: {source}")]
    Upstream {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },
    /// 连通回调拒绝了本次桥接。
    #[error("connect hook rejected the session: {0}")]
    Hook(#[source] io::Error),
}

impl HostingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Settings(_) => "scp.hosting.settings",
            Self::Scp(err) => err.code(),
            Self::Transport(err) => err.code(),
            Self::NoUpstream { .. } => "scp.hosting.no_upstream",
            Self::Upstream { .. } => "scp.hosting.upstream_connect_failed",
            Self::Hook(_) => "scp.hosting.hook_rejected",
        }
    }
}
