use std::io;

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
///
/// 各传输实现以常量表的形式声明自己的操作（如 `scp.transport.tcp.read_failed`），
/// 错误在跨层传播时仍能保留“哪种介质、哪个动作”失败的信息。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    /// 构造操作描述，供各实现 crate 声明常量表。
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

/// 传输层错误。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将“套接字故障”“截止时间到期”“已关闭”“帧超出缓冲区”等传输层失败统一成一个
///   枚举，上层逻辑连接据此判断是否需要摘除当前传输；
///
/// ## 契约 (What)
/// - [`TransportError::is_fatal`]：`true` 表示本次挂载已不可继续使用（IO 错误、EOF、关闭），
///   `false` 表示仅影响本次调用（超时、帧过大）；
/// - [`TransportError::code`]：返回稳定错误码，适合作为日志字段与告警维度。
///
/// ## 注意事项 (Trade-offs)
/// - `FrameTooLarge` 不携带 [`OperationKind`]，它只可能来自消息型传输的读路径。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 底层 IO 失败。
    #[error("{}: {source}", kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    /// 截止时间到期。
    #[error("{} timed out", kind.message)]
    Timeout { kind: OperationKind },
    /// 传输已关闭或已被替换。
    #[error("{} on closed transport", kind.message)]
    Closed { kind: OperationKind },
    /// 对端关闭了字节流。
    #[error("{}: peer closed the stream", kind.message)]
    Eof { kind: OperationKind },
    /// 消息型传输收到的单帧超过调用方缓冲区。
    #[error("read buffer too small: buffer={buffer} message={message}")]
    FrameTooLarge { buffer: usize, message: usize },
    /// 介质层协议错误（例如 WebSocket 握手或帧格式异常）。
    #[error("{}: {detail}", kind.message)]
    Protocol { kind: OperationKind, detail: String },
}

const FRAME_TOO_LARGE_CODE: &str = "scp.transport.frame_too_large";

impl TransportError {
    /// 将 IO 错误映射为传输层错误。
    pub fn io(kind: OperationKind, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::TimedOut {
            return Self::Timeout { kind };
        }
        Self::Io { kind, source }
    }

    /// 构造超时错误。
    pub fn timeout(kind: OperationKind) -> Self {
        Self::Timeout { kind }
    }

    /// 构造关闭错误。
    pub fn closed(kind: OperationKind) -> Self {
        Self::Closed { kind }
    }

    /// 构造 EOF 错误。
    pub fn eof(kind: OperationKind) -> Self {
        Self::Eof { kind }
    }

    /// 构造介质协议错误。
    pub fn protocol(kind: OperationKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            detail: detail.into(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { kind, .. }
            | Self::Timeout { kind }
            | Self::Closed { kind }
            | Self::Eof { kind }
            | Self::Protocol { kind, .. } => kind.code,
            Self::FrameTooLarge { .. } => FRAME_TOO_LARGE_CODE,
        }
    }

    /// 错误发生后当前传输是否已不可继续使用。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout { .. } | Self::FrameTooLarge { .. })
    }

    /// 是否为截止时间到期。
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 是否为关闭信号。
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// 结合 IO 错误种类判断换一条传输后是否值得重试。
    pub fn is_retryable(&self) -> bool {
        use io::ErrorKind;
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::WouldBlock
                    | ErrorKind::Interrupted
                    | ErrorKind::WriteZero
            ),
            Self::Timeout { .. } | Self::Closed { .. } | Self::Eof { .. } => true,
            Self::FrameTooLarge { .. } | Self::Protocol { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ: OperationKind = OperationKind::new("scp.transport.test.read_failed", "test read");

    #[test]
    fn timed_out_io_maps_to_timeout() {
        let err = TransportError::io(READ, io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), "scp.transport.test.read_failed");
    }

    #[test]
    fn frame_too_large_is_not_fatal() {
        let err = TransportError::FrameTooLarge {
            buffer: 256,
            message: 300,
        };
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "read buffer too small: buffer=256 message=300");
    }

    #[test]
    fn reset_is_fatal_but_retryable() {
        let err = TransportError::io(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_fatal());
        assert!(err.is_retryable());
    }
}
