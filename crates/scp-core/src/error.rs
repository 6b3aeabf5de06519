//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 将握手失败、传输失败、使用错误归入同一个枚举，调用方用一个 `match` 即可决定
//!   “重拨”“放弃”还是“修正配置”；
//! - 每个变体都有稳定的点分错误码，适合作为日志字段与告警维度。

use scp_transport::TransportError;
use thiserror::Error;

use crate::registry::ConnId;

/// 服务端拒绝一次换挂的原因。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    /// 请求的连接 ID 没有对应的存活连接。
    #[error("unknown connection id {id}")]
    UnknownId { id: ConnId },
    /// 握手计数器与连接当前值不符，通常是过期的重试。
    #[error("stale handshake counter: expected {expected}, presented {presented}")]
    StaleHandshake { expected: u32, presented: u32 },
    /// 另一次换挂正在进行。
    #[error("another transport swap is in progress")]
    Busy,
    /// 对端确认的偏移已经不在重放缓冲区内。
    #[error("replay offset {offset} is outside the retained send buffer")]
    ReplayGap { offset: u64 },
    /// 目标连接已关闭。
    #[error("connection is closed")]
    Closed,
}

/// 逻辑连接与握手的统一错误。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“本次挂载失败、连接仍可换挂”（`Transport`、`Timeout`）与
///   “连接不可继续”（`Closed`、部分 `NotAcceptable`）；
/// - **契约 (What)**：`write` 返回除 [`ScpError::WriteTimeout`] 之外的错误都意味着
///   没有任何字节被接收；`WriteTimeout` 携带本次调用已接收的字节数；
///   [`ScpError::code`] 返回稳定错误码；
/// - **风险 (Trade-offs)**：`Protocol` 以字符串携带细节，牺牲了可匹配性换取排障信息。
#[derive(Debug, Error)]
pub enum ScpError {
    /// 逻辑连接已关闭。
    #[error("connection is closed")]
    Closed,
    /// 读写截止时间或握手超时到期。
    #[error("operation timed out")]
    Timeout,
    /// 写往传输时截止到期，传输已被摘除。
    ///
    /// 前 `accepted` 个字节已进入重放缓冲，会在换挂后送达，调用方不应重写。
    #[error("write timed out after accepting {accepted} bytes")]
    WriteTimeout { accepted: usize },
    /// 重放缓冲区已满且没有可淘汰的已写出数据。
    #[error("send buffer is full (capacity {capacity} bytes)")]
    BufferFull { capacity: usize },
    /// 对端拒绝了握手或换挂。
    #[error("handshake not acceptable: {0}")]
    NotAcceptable(Rejection),
    /// ID 注册表无法再分配新的连接。
    #[error("connection id space exhausted")]
    Exhausted,
    /// 握手报文格式错误。
    #[error("handshake protocol violation: {0}")]
    Protocol(String),
    /// 使用错误，例如服务端握手缺少注册表。
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    /// 当前挂载的传输失败。
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ScpError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    /// 握手阶段的传输错误：超时折算为 [`ScpError::Timeout`]。
    pub(crate) fn handshake_io(err: TransportError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err)
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed => "scp.conn.closed",
            Self::Timeout => "scp.conn.timeout",
            Self::WriteTimeout { .. } => "scp.conn.write_timeout",
            Self::BufferFull { .. } => "scp.conn.buffer_full",
            Self::NotAcceptable(_) => "scp.handshake.not_acceptable",
            Self::Exhausted => "scp.registry.exhausted",
            Self::Protocol(_) => "scp.handshake.protocol",
            Self::Config(_) => "scp.config.invalid",
            Self::Transport(err) => err.code(),
        }
    }

    /// 换一条新传输后重试是否有意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::WriteTimeout { .. } | Self::Transport(_) => true,
            Self::NotAcceptable(Rejection::Busy) => true,
            Self::NotAcceptable(_)
            | Self::Closed
            | Self::BufferFull { .. }
            | Self::Exhausted
            | Self::Protocol(_)
            | Self::Config(_) => false,
        }
    }

    /// 是否为读写或握手截止到期。
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::WriteTimeout { .. })
    }

    /// 若为拒绝，返回拒绝原因。
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::NotAcceptable(rejection) => Some(*rejection),
            _ => None,
        }
    }
}
