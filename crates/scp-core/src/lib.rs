//! 稳定连接协议（SCP）核心。
//!
//! # 教案式导读
//!
//! ## 意图 (Why)
//! - 移动网络下 TCP/WebSocket 随时可能断开，而业务侧希望看到的是一条“不会断”的字节流；
//! - 本 crate 提供逻辑连接 [`Conn`]：底层传输可以被任意次替换，应用读写到的字节
//!   既不丢失也不重复，顺序保持不变。
//!
//! ## 结构 (How)
//! - [`registry`]：服务端的连接 ID 分配与查询；
//! - [`buffer`]：已写出字节的重放缓冲；
//! - [`handshake`]：NEW/REUSE 握手报文与服务端、客户端握手流程；
//! - [`conn`]：逻辑连接本体以及原子换挂（spawn）算法；
//! - [`config`]：握手所需的配置；
//! - [`error`]：统一错误枚举 [`ScpError`] 与拒绝原因 [`Rejection`]。
//!
//! ## 契约 (What)
//! - 传输故障只影响当前挂载，逻辑连接只会因为显式 [`Conn::close`] 而终止；
//! - 握手计数器是并发重连竞争的唯一裁决依据，在连接自身的锁内比较与递增。
#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod handshake;
pub mod registry;

pub use config::Config;
pub use conn::{Conn, Phase, Role};
pub use error::{Rejection, ScpError};
pub use handshake::Accepted;
pub use registry::{ConnId, IdRegistry, Registry};
