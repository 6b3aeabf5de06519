//! WebSocket 传输实现。
//!
//! 每条二进制（或文本）消息被视为一段字节，[`WsTransport::read`] 一次交付一整条消息；
//! 调用方缓冲区小于消息长度时返回非致命的
//! [`TransportError::FrameTooLarge`](scp_transport::TransportError::FrameTooLarge)，
//! 消息保留到下一次读取，换用更大的缓冲区即可取出。
#![deny(unsafe_code)]

mod error;
mod listener;
mod transport;

pub use listener::{WsListener, WsListenerConfig};
pub use transport::{WsTransport, connect};
