use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use scp_core::{Conn, ScpError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tracing::{debug, info, warn};

use crate::{
    error::HostingError,
    hook::ConnectHook,
    server::ConnHandler,
    upstream::{Upstream, Upstreams, upstream_error},
};

const RELAY_BUFFER: usize = 16 * 1024;

/// 将逻辑连接桥接到上游 TCP 服务。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 按连接的 `target_server` 选择上游并拨号，随后调用 [`ConnectHook`]；
/// - 两个方向各自泵送，任一方向结束即关闭逻辑连接与上游连接；
/// - 客户端方向读到传输错误时，等待换挂最多 `reuse_timeout`，超时视为会话结束。
///
/// ## 契约 (What)
/// - 逻辑连接在 `handle` 返回前一定已关闭，ID 随之归还。
pub struct UpstreamRelay {
    upstreams: Upstreams,
    hook: Arc<dyn ConnectHook>,
    connect_timeout: Duration,
    reuse_timeout: Duration,
}

impl UpstreamRelay {
    pub fn new(
        upstreams: Upstreams,
        hook: Arc<dyn ConnectHook>,
        connect_timeout: Duration,
        reuse_timeout: Duration,
    ) -> Self {
        Self {
            upstreams,
            hook,
            connect_timeout,
            reuse_timeout,
        }
    }

    async fn relay(&self, conn: &Conn) -> Result<(), HostingError> {
        let target = conn.target_server();
        let (upstream, stream) = self
            .upstreams
            .connect(target.as_deref(), self.connect_timeout)
            .await?;
        self.hook
            .after_connected(conn, &stream)
            .await
            .map_err(HostingError::Hook)?;
        info!(conn_id = ?conn.id(), upstream = %upstream.name, "relay started");

        let (reader, writer) = stream.into_split();
        tokio::select! {
            result = self.client_to_upstream(conn, writer, &upstream) => result,
            result = upstream_to_client(reader, conn, &upstream) => result,
        }
    }

    async fn client_to_upstream(
        &self,
        conn: &Conn,
        mut writer: OwnedWriteHalf,
        upstream: &Upstream,
    ) -> Result<(), HostingError> {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            match conn.read(&mut buf).await {
                Ok(n) => writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(|source| upstream_error(upstream, source))?,
                Err(ScpError::Transport(err)) if !err.is_fatal() => {
                    debug!(conn_id = ?conn.id(), error = %err, "transient client read error");
                }
                Err(ScpError::Transport(err)) => {
                    debug!(conn_id = ?conn.id(), error = %err, "client transport lost, waiting for reuse");
                    match tokio::time::timeout(self.reuse_timeout, conn.wait_attached()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Ok(()),
                        Err(_) => {
                            info!(conn_id = ?conn.id(), timeout = ?self.reuse_timeout, "reuse timed out");
                            return Err(ScpError::Timeout.into());
                        }
                    }
                }
                Err(ScpError::Closed) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn upstream_to_client(
    mut reader: OwnedReadHalf,
    conn: &Conn,
    upstream: &Upstream,
) -> Result<(), HostingError> {
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(source) => return Err(upstream_error(upstream, source)),
        };
        conn.write_all(&buf[..n]).await?;
    }
}

#[async_trait]
impl ConnHandler for UpstreamRelay {
    async fn handle(&self, conn: Conn) {
        let result = self.relay(&conn).await;
        match &result {
            Ok(()) => debug!(conn_id = ?conn.id(), "relay finished"),
            Err(err) => warn!(conn_id = ?conn.id(), error = %err, code = err.code(), "relay stopped"),
        }
        let _ = conn.close().await;
    }
}
