//! NEW/REUSE 握手。
//!
//! # 教案式导读
//!
//! ## 报文布局 (What)
//! 所有整数为大端序，每条报文以 `u16` 体长度开头：
//!
//! ```text
//! request  = version:u8 | kind:u8 | id:u32 | handshakes:u32 | received:u64
//!            | target_len:u16 | target
//! response = version:u8 | code:u8 | id:u32 | handshakes:u32 | received:u64
//! ```
//!
//! ## 流程 (How)
//! - 新建：客户端发送 NEW，服务端预留 ID、登记连接后回复 `Ok` 与 ID，计数器为 1；
//! - 复用：客户端在新传输上发送 REUSE（ID、计数器、已收字节数），服务端找到连接后
//!   执行换挂，回复 `Ok` 与新计数器、服务端已收字节数，随后双方各自重放对端缺失的字节；
//! - 报文之后紧跟的字节（对端的重放）不会丢失，作为连接的首批入站数据交付给应用。

use std::{sync::Arc, time::Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use scp_transport::{SharedTransport, Transport, TransportError};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    conn::{Conn, Role},
    error::{Rejection, ScpError},
    registry::{ConnId, Registry},
};

/// 协议版本。
pub const VERSION: u8 = 1;
/// 报文体长度上限。
pub const MAX_BODY: usize = 1024;
/// `target_server` 长度上限。
pub const MAX_TARGET: usize = 1000;

const REQUEST_FIXED: usize = 1 + 1 + 4 + 4 + 8 + 2;
const RESPONSE_LEN: usize = 1 + 1 + 4 + 4 + 8;
const INITIAL_SCRATCH: usize = 2048;

/// 请求类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    New,
    Reuse,
}

/// 握手请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub id: u32,
    pub handshakes: u32,
    pub received: u64,
    pub target: Option<String>,
}

impl Request {
    /// 新建连接请求。
    pub fn fresh(target: Option<&str>) -> Self {
        Self {
            kind: RequestKind::New,
            id: 0,
            handshakes: 0,
            received: 0,
            target: target.map(str::to_owned),
        }
    }

    /// 复用连接请求。
    pub fn reuse(id: ConnId, handshakes: u32, received: u64) -> Self {
        Self {
            kind: RequestKind::Reuse,
            id: id.get(),
            handshakes,
            received,
            target: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ScpError> {
        let target = self.target.as_deref().unwrap_or("").as_bytes();
        if target.len() > MAX_TARGET {
            return Err(ScpError::protocol(format!(
                "target server name too long: {} bytes",
                target.len()
            )));
        }
        let mut body = BytesMut::with_capacity(REQUEST_FIXED + target.len());
        body.put_u8(VERSION);
        body.put_u8(match self.kind {
            RequestKind::New => 0,
            RequestKind::Reuse => 1,
        });
        body.put_u32(self.id);
        body.put_u32(self.handshakes);
        body.put_u64(self.received);
        body.put_u16(target.len() as u16);
        body.put_slice(target);
        Ok(body.freeze())
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, ScpError> {
        if body.len() < REQUEST_FIXED {
            return Err(ScpError::protocol(format!(
                "request too short: {} bytes",
                body.len()
            )));
        }
        check_version(body.get_u8())?;
        let kind = match body.get_u8() {
            0 => RequestKind::New,
            1 => RequestKind::Reuse,
            other => return Err(ScpError::protocol(format!("unknown request kind {other}"))),
        };
        let id = body.get_u32();
        let handshakes = body.get_u32();
        let received = body.get_u64();
        let target_len = body.get_u16() as usize;
        if target_len > MAX_TARGET || body.remaining() != target_len {
            return Err(ScpError::protocol(format!(
                "bad target length {target_len} with {} bytes remaining",
                body.remaining()
            )));
        }
        let target = if target_len == 0 {
            None
        } else {
            let name = std::str::from_utf8(&body[..target_len])
                .map_err(|_| ScpError::protocol("target server name is not utf-8"))?;
            Some(name.to_owned())
        };
        Ok(Self {
            kind,
            id,
            handshakes,
            received,
            target,
        })
    }
}

/// 响应码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    UnknownId = 1,
    StaleHandshake = 2,
    Busy = 3,
    ReplayGap = 4,
    Exhausted = 5,
    Closed = 6,
}

impl ResponseCode {
    fn from_u8(value: u8) -> Result<Self, ScpError> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::UnknownId,
            2 => Self::StaleHandshake,
            3 => Self::Busy,
            4 => Self::ReplayGap,
            5 => Self::Exhausted,
            6 => Self::Closed,
            other => return Err(ScpError::protocol(format!("unknown response code {other}"))),
        })
    }
}

/// 握手响应。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub id: u32,
    pub handshakes: u32,
    pub received: u64,
}

impl Response {
    pub fn accepted(id: ConnId, handshakes: u32, received: u64) -> Self {
        Self {
            code: ResponseCode::Ok,
            id: id.get(),
            handshakes,
            received,
        }
    }

    /// 把拒绝原因编码为响应，附带对端诊断所需的字段。
    pub fn rejected(id: u32, rejection: Rejection) -> Self {
        let (code, handshakes, received) = match rejection {
            Rejection::UnknownId { .. } => (ResponseCode::UnknownId, 0, 0),
            Rejection::StaleHandshake { expected, .. } => (ResponseCode::StaleHandshake, expected, 0),
            Rejection::Busy => (ResponseCode::Busy, 0, 0),
            Rejection::ReplayGap { offset } => (ResponseCode::ReplayGap, 0, offset),
            Rejection::Closed => (ResponseCode::Closed, 0, 0),
        };
        Self {
            code,
            id,
            handshakes,
            received,
        }
    }

    pub fn exhausted() -> Self {
        Self {
            code: ResponseCode::Exhausted,
            id: 0,
            handshakes: 0,
            received: 0,
        }
    }

    /// 将非 `Ok` 响应还原为错误；`presented` 为本端发送的计数器。
    pub fn into_error(self, presented: u32) -> Option<ScpError> {
        let rejection = match self.code {
            ResponseCode::Ok => return None,
            ResponseCode::Exhausted => return Some(ScpError::Exhausted),
            ResponseCode::UnknownId => Rejection::UnknownId {
                id: ConnId(self.id),
            },
            ResponseCode::StaleHandshake => Rejection::StaleHandshake {
                expected: self.handshakes,
                presented,
            },
            ResponseCode::Busy => Rejection::Busy,
            ResponseCode::ReplayGap => Rejection::ReplayGap {
                offset: self.received,
            },
            ResponseCode::Closed => Rejection::Closed,
        };
        Some(ScpError::NotAcceptable(rejection))
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(RESPONSE_LEN);
        body.put_u8(VERSION);
        body.put_u8(self.code as u8);
        body.put_u32(self.id);
        body.put_u32(self.handshakes);
        body.put_u64(self.received);
        body.freeze()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, ScpError> {
        if body.len() != RESPONSE_LEN {
            return Err(ScpError::protocol(format!(
                "response must be {RESPONSE_LEN} bytes, got {}",
                body.len()
            )));
        }
        check_version(body.get_u8())?;
        let code = ResponseCode::from_u8(body.get_u8())?;
        Ok(Self {
            code,
            id: body.get_u32(),
            handshakes: body.get_u32(),
            received: body.get_u64(),
        })
    }
}

fn check_version(version: u8) -> Result<(), ScpError> {
    if version == VERSION {
        Ok(())
    } else {
        Err(ScpError::protocol(format!("unsupported version {version}")))
    }
}

/// 以单次写出发送一条带长度前缀的报文。
pub async fn write_message(transport: &dyn Transport, body: &[u8]) -> Result<(), ScpError> {
    if body.len() > MAX_BODY {
        return Err(ScpError::protocol(format!("message body too large: {}", body.len())));
    }
    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u16(body.len() as u16);
    frame.put_slice(body);
    transport
        .write(&frame)
        .await
        .map_err(ScpError::handshake_io)?;
    Ok(())
}

/// 握手报文读取器。
///
/// 流式传输可能在一次读取中带出报文之后的字节，消息型传输的一条消息也可能同时包含
/// 报文与重放数据；读取器保留这些多余字节，握手结束后由 [`MessageReader::into_leftover`]
/// 取出交给连接。
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: BytesMut,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read_message(&mut self, transport: &dyn Transport) -> Result<Bytes, ScpError> {
        let mut scratch = vec![0u8; INITIAL_SCRATCH];
        loop {
            if self.buf.len() >= 2 {
                let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                if len > MAX_BODY {
                    return Err(ScpError::protocol(format!("message body too large: {len}")));
                }
                if self.buf.len() >= 2 + len {
                    self.buf.advance(2);
                    return Ok(self.buf.split_to(len).freeze());
                }
            }
            match transport.read(&mut scratch).await {
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(TransportError::FrameTooLarge { message, .. }) => {
                    scratch.resize(message, 0);
                }
                Err(err) => return Err(ScpError::handshake_io(err)),
            }
        }
    }

    /// 报文之后已读取但尚未消费的字节。
    pub fn into_leftover(self) -> Bytes {
        self.buf.freeze()
    }
}

/// 服务端握手结果。
#[derive(Clone, Debug)]
pub enum Accepted {
    /// 新建的逻辑连接。
    Fresh(Conn),
    /// 既有连接换挂到了新传输上。
    Reused(Conn),
}

impl Accepted {
    pub fn conn(&self) -> &Conn {
        match self {
            Self::Fresh(conn) | Self::Reused(conn) => conn,
        }
    }

    pub fn into_conn(self) -> Conn {
        match self {
            Self::Fresh(conn) | Self::Reused(conn) => conn,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, Self::Reused(_))
    }
}

impl Conn {
    /// 以客户端身份在 `transport` 上握手。
    ///
    /// # 教案式注释
    ///
    /// ## 契约 (What)
    /// - `config.conn_for_reused` 为空：发送 NEW，成功后返回新连接（计数器为 1）；
    /// - 否则发送 REUSE，成功后返回同一个连接（计数器 +1），其底层传输已替换为 `transport`；
    /// - 失败时 `transport` 被关闭；复用失败不会关闭被迁移的连接，它保持无传输状态，
    ///   调用方可以换一条传输再试。
    pub async fn client(transport: SharedTransport, config: &Config) -> Result<Conn, ScpError> {
        let result = match &config.conn_for_reused {
            Some(conn) => conn
                .spawn_client(Arc::clone(&transport), config.handshake_timeout)
                .await
                .map(|()| conn.clone()),
            None => fresh_client(Arc::clone(&transport), config).await,
        };
        if let Err(err) = &result {
            debug!(error = %err, code = err.code(), "client handshake failed");
            let _ = transport.close().await;
        }
        result
    }

    /// 以服务端身份在 `transport` 上握手。
    ///
    /// # 教案式注释
    ///
    /// ## 契约 (What)
    /// - `config.scp_server` 缺失时立即返回 [`ScpError::Config`]，不触碰传输；
    /// - NEW：预留 ID、登记连接并回复；注册表耗尽时回复 `Exhausted` 并返回
    ///   [`ScpError::Exhausted`]；
    /// - REUSE：查询连接并换挂；未知 ID、计数器不符、并发换挂等情况回复拒绝码并返回
    ///   [`ScpError::NotAcceptable`]；
    /// - 除配置错误外，任何失败都会关闭 `transport`。
    pub async fn server(transport: SharedTransport, config: &Config) -> Result<Accepted, ScpError> {
        let Some(registry) = config.scp_server.clone() else {
            return Err(ScpError::Config("scp_server is required for server handshakes"));
        };
        let result = server_handshake(&transport, registry, config).await;
        match &result {
            Ok(accepted) => {
                let conn = accepted.conn();
                info!(
                    conn_id = ?conn.id(),
                    handshakes = conn.handshakes(),
                    reused = accepted.is_reused(),
                    peer = ?transport.peer_addr(),
                    "handshake accepted"
                );
            }
            Err(err) => {
                warn!(
                    peer = ?transport.peer_addr(),
                    error = %err,
                    code = err.code(),
                    "handshake rejected"
                );
                let _ = transport.close().await;
            }
        }
        result
    }
}

async fn fresh_client(transport: SharedTransport, config: &Config) -> Result<Conn, ScpError> {
    let conn = Conn::detached(Role::Client, config.send_buffer_capacity);
    conn.set_target_server(config.target_server.clone());

    transport.set_deadline(Some(Instant::now() + config.handshake_timeout));
    let request = Request::fresh(config.target_server.as_deref()).encode()?;
    write_message(transport.as_ref(), &request).await?;

    let mut reader = MessageReader::new();
    let response = Response::decode(&reader.read_message(transport.as_ref()).await?)?;
    if let Some(err) = response.into_error(0) {
        return Err(err);
    }
    if response.handshakes != 1 || response.received != 0 {
        return Err(ScpError::protocol(format!(
            "fresh response carries handshakes={} received={}",
            response.handshakes, response.received
        )));
    }
    conn.establish(transport, ConnId(response.id), reader.into_leftover())?;
    debug!(conn_id = response.id, "client connection established");
    Ok(conn)
}

async fn server_handshake(
    transport: &SharedTransport,
    registry: Arc<dyn Registry>,
    config: &Config,
) -> Result<Accepted, ScpError> {
    transport.set_deadline(Some(Instant::now() + config.handshake_timeout));
    let mut reader = MessageReader::new();
    let request = Request::decode(&reader.read_message(transport.as_ref()).await?)?;

    match request.kind {
        RequestKind::New => {
            let Some(id) = registry.acquire_id() else {
                let _ = write_message(transport.as_ref(), &Response::exhausted().encode()).await;
                return Err(ScpError::Exhausted);
            };
            let conn = Conn::registered(
                Role::Server,
                config.send_buffer_capacity,
                Arc::downgrade(&registry),
                id,
            );
            conn.set_target_server(request.target.clone());
            if !registry.insert(id, conn.clone()) {
                registry.release_id(id);
                return Err(ScpError::protocol(format!("connection id {id} was not reserved")));
            }
            let response = Response::accepted(id, 1, 0).encode();
            if let Err(err) = write_message(transport.as_ref(), &response).await {
                let _ = conn.close().await;
                return Err(err);
            }
            if let Err(err) = conn.establish(Arc::clone(transport), id, reader.into_leftover()) {
                let _ = conn.close().await;
                return Err(err);
            }
            Ok(Accepted::Fresh(conn))
        }
        RequestKind::Reuse => {
            let id = ConnId(request.id);
            let Some(conn) = registry.query_by_id(id) else {
                let rejection = Rejection::UnknownId { id };
                let response = Response::rejected(request.id, rejection).encode();
                let _ = write_message(transport.as_ref(), &response).await;
                return Err(ScpError::NotAcceptable(rejection));
            };
            let spawned = conn
                .spawn_server(
                    Arc::clone(transport),
                    request.handshakes,
                    request.received,
                    reader.into_leftover(),
                )
                .await;
            match spawned {
                Ok(()) => Ok(Accepted::Reused(conn)),
                Err(ScpError::NotAcceptable(rejection)) => {
                    let response = Response::rejected(request.id, rejection).encode();
                    let _ = write_message(transport.as_ref(), &response).await;
                    Err(ScpError::NotAcceptable(rejection))
                }
                Err(err) => Err(err),
            }
        }
    }
}
