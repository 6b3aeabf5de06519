//! scp-hosting：稳定连接网关的宿主装配。
//!
//! # 教案式导读
//!
//! ## 意图 (Why)
//! - `scp-core` 只负责“一条逻辑连接如何跨传输存活”，真正的网关还需要：
//!   监听循环、握手并发上限、把新连接桥接到上游服务、断线后的等待与回收；
//!
//! ## 结构 (How)
//! - [`settings`]：TOML 配置文件的结构与校验；
//! - [`server`]：会话驱动，从监听器取传输、执行服务端握手、把新连接交给处理器；
//! - [`relay`]：默认处理器，将逻辑连接与上游 TCP 双向泵送；
//! - [`upstream`]：上游选择与拨号；
//! - [`hook`]：上游连通后的回调；
//! - [`client`]：客户端拨号与换挂的便捷入口。
#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod hook;
pub mod relay;
pub mod server;
pub mod settings;
pub mod upstream;

pub use error::HostingError;
pub use hook::{ConnectHook, NoopHook};
pub use relay::UpstreamRelay;
pub use server::{ConnHandler, Server};
pub use settings::{Settings, SettingsError};
pub use upstream::{Upstream, Upstreams};
