//! 逻辑连接与原子换挂。
//!
//! # 教案式导读
//!
//! ## 意图 (Why)
//! - 应用持有的是 [`Conn`]，底层传输只是它某一时刻的“挂载”；传输失效后连接进入
//!   无传输状态，读挂起、写进入重放缓冲，直到下一次换挂。
//!
//! ## 并发模型 (How)
//! - 传输指针、重放缓冲、计数器与状态由一把 `parking_lot::Mutex` 保护，
//!   任何 socket IO 都在锁外进行；
//! - 每次挂载或摘除传输时 `generation` 加一，锁外 IO 完成后比较代次，
//!   代次不同说明期间发生了换挂，结果作废；
//! - 异步写闸门保证“写入缓冲的顺序 = 写入传输的顺序”，换挂在关闭旧传输之后
//!   获取同一把闸门，重放因此不会与应用写交错；
//! - `watch` 通道在挂载与关闭时递增，等待传输的读者据此唤醒。

use std::{
    cmp, fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use scp_transport::{SharedTransport, Transport, TransportError};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, trace};

use crate::{
    buffer::{BufferFull, SendBuffer},
    error::{Rejection, ScpError},
    handshake::{MessageReader, Request, Response, write_message},
    registry::{ConnId, Registry},
};

const REPLAY_CHUNK: usize = 16 * 1024;

/// 连接在握手中扮演的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 连接生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// 尚未完成首次握手。
    Handshaking,
    /// 已建立；可能挂有传输，也可能在等待换挂。
    Established,
    /// 换挂进行中。
    Migrating,
    /// 终态。
    Closed,
}

struct ConnState {
    phase: Phase,
    id: Option<ConnId>,
    handshakes: u32,
    transport: Option<SharedTransport>,
    generation: u64,
    send: SendBuffer,
    received: u64,
    inbound: Bytes,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    target_server: Option<String>,
}

impl ConnState {
    /// 摘除当前传输并推进代次。
    fn detach(&mut self) -> Option<SharedTransport> {
        let transport = self.transport.take();
        if transport.is_some() {
            self.generation += 1;
        }
        transport
    }

    fn bind(&mut self, transport: SharedTransport, leftover: Bytes) {
        transport.set_read_deadline(None);
        transport.set_write_deadline(self.write_deadline);
        self.transport = Some(transport);
        self.generation += 1;
        self.inbound = leftover;
        self.send.mark_all_flushed();
        self.phase = Phase::Established;
    }
}

struct ConnInner {
    role: Role,
    state: Mutex<ConnState>,
    attached: watch::Sender<u64>,
    write_gate: AsyncMutex<()>,
    read_gate: AsyncMutex<()>,
    registry: Option<Weak<dyn Registry>>,
}

/// 可跨传输存活的逻辑连接。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `read`：按序交付下一段字节；无传输时挂起直到换挂完成、连接关闭或读截止到期；
///   传输失败只返回给本次调用，连接保持 `Established`；
/// - `write`：先写入重放缓冲，再写往当前传输；传输失败不影响返回值，字节会在换挂后重放；
///   写截止到期时返回 [`ScpError::WriteTimeout`] 并报告已接收的字节数，其余错误意味着
///   没有任何字节被接收；
/// - `close`：幂等，归还 ID、丢弃缓冲并唤醒所有等待者；
/// - `Conn` 可廉价克隆，所有克隆指向同一条逻辑连接。
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Conn")
            .field("role", &self.inner.role)
            .field("id", &state.id)
            .field("phase", &state.phase)
            .field("handshakes", &state.handshakes)
            .field("attached", &state.transport.is_some())
            .field("received", &state.received)
            .field("sent", &state.send.end())
            .finish()
    }
}

impl Conn {
    fn with_parts(role: Role, capacity: usize, registry: Option<Weak<dyn Registry>>, id: Option<ConnId>) -> Self {
        let (attached, _) = watch::channel(0);
        Self {
            inner: Arc::new(ConnInner {
                role,
                state: Mutex::new(ConnState {
                    phase: Phase::Handshaking,
                    id,
                    handshakes: 0,
                    transport: None,
                    generation: 0,
                    send: SendBuffer::new(capacity),
                    received: 0,
                    inbound: Bytes::new(),
                    read_deadline: None,
                    write_deadline: None,
                    target_server: None,
                }),
                attached,
                write_gate: AsyncMutex::new(()),
                read_gate: AsyncMutex::new(()),
                registry,
            }),
        }
    }

    /// 尚未握手、不属于任何注册表的连接。
    pub(crate) fn detached(role: Role, capacity: usize) -> Self {
        Self::with_parts(role, capacity, None, None)
    }

    /// 已在注册表中预留 `id` 的连接，关闭时归还该 ID。
    pub(crate) fn registered(role: Role, capacity: usize, registry: Weak<dyn Registry>, id: ConnId) -> Self {
        Self::with_parts(role, capacity, Some(registry), Some(id))
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn id(&self) -> Option<ConnId> {
        self.inner.state.lock().id
    }

    /// 成功挂载的次数。
    pub fn handshakes(&self) -> u32 {
        self.inner.state.lock().handshakes
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    /// 当前是否挂有传输。
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().transport.is_some()
    }

    /// 已交付给应用的字节总数。
    pub fn received(&self) -> u64 {
        self.inner.state.lock().received
    }

    /// 应用写入的字节总数。
    pub fn sent(&self) -> u64 {
        self.inner.state.lock().send.end()
    }

    pub fn target_server(&self) -> Option<String> {
        self.inner.state.lock().target_server.clone()
    }

    pub(crate) fn set_target_server(&self, target: Option<String>) {
        self.inner.state.lock().target_server = target;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_transport()?.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current_transport()?.peer_addr()
    }

    fn current_transport(&self) -> Option<SharedTransport> {
        self.inner.state.lock().transport.clone()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.state.lock().read_deadline = deadline;
    }

    /// 写截止同时约束等待写闸门与写往当前传输。
    ///
    /// 等待闸门超时返回 [`ScpError::Timeout`]，没有字节被接收；写往传输超时会摘除该传输
    /// 并返回 [`ScpError::WriteTimeout`]，其中的字节数已进入重放缓冲。
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut state = self.inner.state.lock();
        state.write_deadline = deadline;
        if let Some(transport) = &state.transport {
            transport.set_write_deadline(deadline);
        }
    }

    fn notify_attached(&self) {
        self.inner.attached.send_modify(|version| *version += 1);
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ScpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.inner.state.lock().read_deadline;
        match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), self.read_inner(buf))
                    .await
                    .map_err(|_| ScpError::Timeout)?
            }
            None => self.read_inner(buf).await,
        }
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<usize, ScpError> {
        let _gate = self.inner.read_gate.lock().await;
        let mut attached = self.inner.attached.subscribe();
        loop {
            let bound = {
                let mut state = self.inner.state.lock();
                if state.phase == Phase::Closed {
                    return Err(ScpError::Closed);
                }
                if !state.inbound.is_empty() {
                    let n = cmp::min(buf.len(), state.inbound.len());
                    buf[..n].copy_from_slice(&state.inbound[..n]);
                    state.inbound.advance(n);
                    state.received += n as u64;
                    return Ok(n);
                }
                match (&state.transport, state.phase) {
                    (Some(transport), Phase::Established) => Some((Arc::clone(transport), state.generation)),
                    _ => None,
                }
            };

            let Some((transport, generation)) = bound else {
                attached.changed().await.map_err(|_| ScpError::Closed)?;
                continue;
            };

            let result = read_transport(transport.as_ref(), buf).await;
            let (err, detached) = {
                let mut state = self.inner.state.lock();
                if state.phase == Phase::Closed {
                    return Err(ScpError::Closed);
                }
                if state.generation != generation {
                    // 换挂期间读到的字节未计入 received，对端会重放。
                    match result {
                        Ok(_) => continue,
                        Err(err) => return Err(ScpError::Transport(err)),
                    }
                }
                match result {
                    Ok(Inbound::Direct(n)) => {
                        state.received += n as u64;
                        return Ok(n);
                    }
                    Ok(Inbound::Spilled(message)) => {
                        let n = cmp::min(buf.len(), message.len());
                        buf[..n].copy_from_slice(&message[..n]);
                        state.inbound = message.slice(n..);
                        state.received += n as u64;
                        return Ok(n);
                    }
                    Err(err) => {
                        let detached = if err.is_fatal() { state.detach() } else { None };
                        (err, detached)
                    }
                }
            };
            if let Some(transport) = detached {
                debug!(conn_id = ?self.id(), error = %err, "transport detached on read");
                let _ = transport.close().await;
            }
            return Err(ScpError::Transport(err));
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, ScpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.inner.state.lock().write_deadline;
        let _gate = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(
                    tokio::time::Instant::from_std(deadline),
                    self.inner.write_gate.lock(),
                )
                .await
                .map_err(|_| ScpError::Timeout)?
            }
            None => self.inner.write_gate.lock().await,
        };

        let mut written = 0;
        while written < buf.len() {
            let (chunk, target) = {
                let mut state = self.inner.state.lock();
                if state.phase == Phase::Closed {
                    return if written > 0 { Ok(written) } else { Err(ScpError::Closed) };
                }
                let capacity = state.send.capacity();
                let chunk = &buf[written..cmp::min(buf.len(), written + capacity)];
                if let Err(BufferFull) = state.send.append(chunk) {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(ScpError::BufferFull { capacity })
                    };
                }
                let target = match (&state.transport, state.phase) {
                    (Some(transport), Phase::Established) => {
                        Some((Arc::clone(transport), state.generation, state.send.end()))
                    }
                    _ => None,
                };
                (chunk, target)
            };
            written += chunk.len();

            let Some((transport, generation, chunk_end)) = target else {
                continue;
            };
            let result = transport.write(chunk).await;
            let detached = {
                let mut state = self.inner.state.lock();
                if state.generation != generation {
                    None
                } else if result.is_ok() {
                    state.send.mark_flushed(chunk_end);
                    None
                } else {
                    state.detach()
                }
            };
            if let (Err(err), Some(transport)) = (result, detached) {
                // 超时的写可能只送出了半个块，传输不能再用；已接收的字节留在缓冲里等待重放。
                debug!(conn_id = ?self.id(), error = %err, "transport detached on write");
                let _ = transport.close().await;
                if err.is_timeout() {
                    return Err(ScpError::WriteTimeout { accepted: written });
                }
            }
        }
        Ok(written)
    }

    /// 写出全部字节；缓冲区满时返回已接收部分之外的错误。
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), ScpError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// 等待连接挂上传输。
    pub async fn wait_attached(&self) -> Result<(), ScpError> {
        let mut attached = self.inner.attached.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                match (&state.transport, state.phase) {
                    (_, Phase::Closed) => return Err(ScpError::Closed),
                    (Some(_), Phase::Established) => return Ok(()),
                    _ => {}
                }
            }
            attached.changed().await.map_err(|_| ScpError::Closed)?;
        }
    }

    /// 关闭连接，幂等。
    pub async fn close(&self) -> Result<(), ScpError> {
        let (transport, id) = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return Ok(());
            }
            state.phase = Phase::Closed;
            state.send.clear();
            state.inbound = Bytes::new();
            (state.detach(), state.id)
        };
        self.notify_attached();
        if let Some(id) = id
            && let Some(registry) = self.inner.registry.as_ref().and_then(Weak::upgrade)
        {
            registry.release_id(id);
        }
        debug!(conn_id = ?id, role = ?self.inner.role, "connection closed");
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    /// 首次握手成功后挂载传输，计数器置为 1。
    pub(crate) fn establish(&self, transport: SharedTransport, id: ConnId, leftover: Bytes) -> Result<(), ScpError> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Handshaking {
                return Err(ScpError::Closed);
            }
            state.id = Some(id);
            state.handshakes = 1;
            state.bind(transport, leftover);
        }
        self.notify_attached();
        Ok(())
    }

    /// 进入 `Migrating`：校验计数器与对端偏移、摘除旧传输并记录换挂所需的快照。
    ///
    /// 任何拒绝都发生在摘除之前，当前传输保持原样。
    fn begin_migration(&self, presented: Option<u32>, peer_received: Option<u64>) -> Result<Migration, ScpError> {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Closed => return Err(ScpError::NotAcceptable(Rejection::Closed)),
            Phase::Migrating | Phase::Handshaking => return Err(ScpError::NotAcceptable(Rejection::Busy)),
            Phase::Established => {}
        }
        let id = state
            .id
            .ok_or(ScpError::Config("connection has no identity to migrate"))?;
        if let Some(presented) = presented
            && presented != state.handshakes
        {
            return Err(ScpError::NotAcceptable(Rejection::StaleHandshake {
                expected: state.handshakes,
                presented,
            }));
        }
        if let Some(offset) = peer_received
            && (offset < state.send.start() || offset > state.send.end())
        {
            return Err(ScpError::NotAcceptable(Rejection::ReplayGap { offset }));
        }
        state.phase = Phase::Migrating;
        state.inbound = Bytes::new();
        let old = state.detach();
        Ok(Migration {
            id,
            handshakes: state.handshakes,
            received: state.received,
            old,
        })
    }

    fn abort_migration(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Migrating {
            state.phase = Phase::Established;
        }
    }

    fn replay_from(&self, offset: u64) -> Result<Vec<u8>, ScpError> {
        let state = self.inner.state.lock();
        if state.phase == Phase::Closed {
            return Err(ScpError::NotAcceptable(Rejection::Closed));
        }
        state
            .send
            .replay_from(offset)
            .ok_or(ScpError::NotAcceptable(Rejection::ReplayGap { offset }))
    }

    fn finish_migration(&self, transport: SharedTransport, handshakes: u32, leftover: Bytes) -> Result<(), ScpError> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Migrating {
                return Err(ScpError::Closed);
            }
            state.handshakes = handshakes;
            state.bind(transport, leftover);
        }
        self.notify_attached();
        Ok(())
    }

    /// 服务端换挂：把 `transport` 换入本连接。
    ///
    /// # 教案式注释
    ///
    /// ## 逻辑 (How)
    /// 1. 锁内校验状态、计数器与 `peer_received`，进入 `Migrating` 并摘除旧传输；
    /// 2. 锁外关闭旧传输，阻塞在其上的读写因此返回；
    /// 3. 获取写闸门，计算从 `peer_received` 开始的重放；
    /// 4. 回复 `Ok`（新计数器、本端已收字节数），随后写出重放；
    /// 5. 锁内挂载新传输，计数器 +1，回到 `Established`。
    ///
    /// ## 契约 (What)
    /// - 拒绝以 [`ScpError::NotAcceptable`] 返回，此时尚未向 `transport` 写出任何字节；
    /// - 任意失败后连接处于无传输的 `Established`，`transport` 由调用方关闭。
    pub(crate) async fn spawn_server(
        &self,
        transport: SharedTransport,
        presented: u32,
        peer_received: u64,
        leftover: Bytes,
    ) -> Result<(), ScpError> {
        let migration = self.begin_migration(Some(presented), Some(peer_received))?;
        let guard = MigrationGuard::new(self);
        if let Some(old) = &migration.old {
            let _ = old.close().await;
        }
        let _gate = self.inner.write_gate.lock().await;
        let replay = self.replay_from(peer_received)?;

        let next = migration.handshakes + 1;
        let response = Response::accepted(migration.id, next, migration.received).encode();
        write_message(transport.as_ref(), &response).await?;
        write_replay(&transport, &replay).await?;

        self.finish_migration(transport, next, leftover)?;
        guard.disarm();
        debug!(
            conn_id = %migration.id,
            handshakes = next,
            replayed = replay.len(),
            "server transport swapped"
        );
        Ok(())
    }

    /// 客户端换挂：在 `transport` 上发送 REUSE 并在服务端接受后换入。
    pub(crate) async fn spawn_client(&self, transport: SharedTransport, timeout: Duration) -> Result<(), ScpError> {
        let migration = match self.begin_migration(None, None) {
            Err(ScpError::NotAcceptable(Rejection::Closed)) => return Err(ScpError::Closed),
            other => other?,
        };
        let guard = MigrationGuard::new(self);
        if let Some(old) = &migration.old {
            let _ = old.close().await;
        }
        let _gate = self.inner.write_gate.lock().await;

        transport.set_deadline(Some(Instant::now() + timeout));
        let request = Request::reuse(migration.id, migration.handshakes, migration.received).encode()?;
        write_message(transport.as_ref(), &request).await?;
        let mut reader = MessageReader::new();
        let response = Response::decode(&reader.read_message(transport.as_ref()).await?)?;
        if let Some(err) = response.into_error(migration.handshakes) {
            return Err(err);
        }
        let next = migration.handshakes + 1;
        if response.id != migration.id.get() || response.handshakes != next {
            return Err(ScpError::protocol(format!(
                "reuse response for id={} handshakes={}, expected id={} handshakes={next}",
                response.id, response.handshakes, migration.id
            )));
        }

        let replay = self.replay_from(response.received)?;
        write_replay(&transport, &replay).await?;
        self.finish_migration(transport, next, reader.into_leftover())?;
        guard.disarm();
        debug!(
            conn_id = %migration.id,
            handshakes = next,
            replayed = replay.len(),
            "client transport swapped"
        );
        Ok(())
    }
}

struct Migration {
    id: ConnId,
    handshakes: u32,
    received: u64,
    old: Option<SharedTransport>,
}

/// 换挂未完成（出错或 Future 被丢弃）时把连接退回 `Established`。
struct MigrationGuard<'a> {
    conn: &'a Conn,
    armed: bool,
}

impl<'a> MigrationGuard<'a> {
    fn new(conn: &'a Conn) -> Self {
        Self { conn, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!(conn_id = ?self.conn.id(), "transport swap aborted");
            self.conn.abort_migration();
        }
    }
}

async fn write_replay(transport: &SharedTransport, replay: &[u8]) -> Result<(), ScpError> {
    for chunk in replay.chunks(REPLAY_CHUNK) {
        transport
            .write(chunk)
            .await
            .map_err(ScpError::handshake_io)?;
    }
    Ok(())
}

/// 一次传输读的结果：直接落入调用方缓冲，或整条消息落入暂存区。
enum Inbound {
    Direct(usize),
    Spilled(Bytes),
}

/// 读取传输；消息型传输拒绝过小的缓冲时，按消息长度改用暂存区读出整条消息。
async fn read_transport(transport: &dyn Transport, buf: &mut [u8]) -> Result<Inbound, TransportError> {
    match transport.read(buf).await {
        Ok(n) => Ok(Inbound::Direct(n)),
        Err(TransportError::FrameTooLarge { message, .. }) => {
            let mut scratch = vec![0u8; message];
            let n = transport.read(&mut scratch).await?;
            scratch.truncate(n);
            Ok(Inbound::Spilled(Bytes::from(scratch)))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_transport::duplex_pair;

    fn attached(capacity: usize) -> (Conn, scp_transport::DuplexTransport) {
        let (local, remote) = duplex_pair(64 * 1024);
        let conn = Conn::detached(Role::Client, capacity);
        conn.establish(Arc::new(local), ConnId(1), Bytes::new())
            .expect("establish");
        (conn, remote)
    }

    #[tokio::test]
    async fn leftover_bytes_are_read_first() {
        let (local, remote) = duplex_pair(1024);
        let conn = Conn::detached(Role::Client, 1024);
        conn.establish(Arc::new(local), ConnId(9), Bytes::from_static(b"early"))
            .expect("establish");
        remote.write(b"late").await.expect("write");

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.expect("leftover");
        assert_eq!(&buf[..n], b"early");
        let n = conn.read(&mut buf).await.expect("transport");
        assert_eq!(&buf[..n], b"late");
        assert_eq!(conn.received(), 9);
    }

    #[tokio::test]
    async fn write_survives_transport_failure() {
        let (conn, remote) = attached(1024);
        remote.close().await.expect("close peer");
        drop(remote);

        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(ScpError::Transport(_))
        ));
        assert!(!conn.is_attached());
        assert_eq!(conn.phase(), Phase::Established);

        assert_eq!(conn.write(b"buffered").await.expect("buffered"), 8);
        assert_eq!(conn.sent(), 8);
    }

    #[tokio::test]
    async fn detached_writes_fill_buffer_then_fail() {
        let conn = Conn::detached(Role::Client, 8);
        assert_eq!(conn.write(b"0123456789").await.expect("partial"), 8);
        assert!(matches!(
            conn.write(b"x").await,
            Err(ScpError::BufferFull { capacity: 8 })
        ));
        assert!(matches!(
            conn.write_all(b"y").await,
            Err(ScpError::BufferFull { .. })
        ));
    }

    #[tokio::test]
    async fn read_deadline_reports_timeout() {
        let (conn, _remote) = attached(1024);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        assert!(matches!(conn.read(&mut buf).await, Err(ScpError::Timeout)));
        assert!(conn.is_attached(), "deadline does not detach the transport");
    }

    #[tokio::test]
    async fn close_wakes_reader_waiting_for_transport() {
        let conn = Conn::detached(Role::Server, 1024);
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                conn.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        conn.close().await.expect("close");
        conn.close().await.expect("idempotent");
        assert!(matches!(reader.await.expect("join"), Err(ScpError::Closed)));
        assert!(matches!(conn.write(b"x").await, Err(ScpError::Closed)));
        assert!(matches!(conn.wait_attached().await, Err(ScpError::Closed)));
    }

    #[tokio::test]
    async fn migration_requires_matching_counter() {
        let (conn, _remote) = attached(1024);
        let (fresh, _peer) = duplex_pair(1024);
        let err = conn
            .spawn_server(Arc::new(fresh), 5, 0, Bytes::new())
            .await
            .expect_err("stale");
        assert_eq!(
            err.rejection(),
            Some(Rejection::StaleHandshake {
                expected: 1,
                presented: 5
            })
        );
        assert!(conn.is_attached(), "rejection leaves the current transport alone");
        assert_eq!(conn.phase(), Phase::Established);
    }

    #[tokio::test]
    async fn write_deadline_reports_accepted_bytes() {
        let (local, _remote) = duplex_pair(16 * 1024);
        let conn = Conn::detached(Role::Client, 1024 * 1024);
        conn.establish(Arc::new(local), ConnId(1), Bytes::new())
            .expect("establish");
        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(100)));

        let chunk = vec![7u8; 32 * 1024];
        match conn.write(&chunk).await {
            Err(ScpError::WriteTimeout { accepted }) => assert_eq!(accepted, chunk.len()),
            other => panic!("expected a write timeout, got {other:?}"),
        }
        assert!(!conn.is_attached(), "a half-written chunk retires the transport");
        assert_eq!(conn.phase(), Phase::Established);
        assert_eq!(conn.sent(), chunk.len() as u64);

        conn.set_write_deadline(None);
        assert_eq!(conn.write(b"more").await.expect("buffered while detached"), 4);
    }

    #[tokio::test]
    async fn out_of_range_replay_offset_keeps_current_transport() {
        let (conn, remote) = attached(1024);
        conn.write_all(b"abc").await.expect("write");
        let (fresh, _peer) = duplex_pair(1024);
        let err = conn
            .spawn_server(Arc::new(fresh), 1, 1_000, Bytes::new())
            .await
            .expect_err("offset beyond what was sent");
        assert_eq!(err.rejection(), Some(Rejection::ReplayGap { offset: 1_000 }));
        assert!(conn.is_attached());
        assert_eq!(conn.handshakes(), 1);
        assert_eq!(conn.phase(), Phase::Established);

        let mut buf = [0u8; 8];
        let n = remote.read(&mut buf).await.expect("old transport still delivers");
        assert_eq!(&buf[..n], b"abc");
    }
}
