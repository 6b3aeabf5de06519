//! TCP 传输实现。
//!
//! 提供 [`TcpTransport`]（拨号侧与接入侧共用的字节流传输）与 [`TcpListener`]
//! （实现 [`scp_transport::Acceptor`] 的监听器），并通过 [`TcpSocketConfig`]
//! 把 `SO_LINGER`、`TCP_NODELAY` 等套接字选项集中在一处配置。
#![deny(unsafe_code)]

mod error;
mod listener;
mod stream;

pub use listener::TcpListener;
pub use stream::{TcpSocketConfig, TcpTransport};
