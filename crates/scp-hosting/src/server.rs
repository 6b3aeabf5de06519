use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use scp_core::{Accepted, Config, Conn, IdRegistry, Registry};
use scp_transport::{SharedAcceptor, TransportError};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    error::HostingError, hook::ConnectHook, relay::UpstreamRelay, settings::Settings,
    upstream::Upstreams,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 新建逻辑连接的处理器。
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// 接管一条刚建立的逻辑连接，返回时连接应已关闭。
    async fn handle(&self, conn: Conn);
}

/// 会话驱动。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每条入站传输都要先握手才能知道它是新连接还是某条旧连接的新挂载，
///   握手在独立任务里进行，慢客户端不会拖住监听循环；
///
/// ## 逻辑 (How)
/// - `serve` 循环从监听器取传输，受信号量约束地派生握手任务；
/// - 新建连接交给 [`ConnHandler`]（默认为 [`UpstreamRelay`]），换挂成功的传输
///   已被并入既有连接，原有处理任务无感知地继续；
///
/// ## 契约 (What)
/// - 监听器关闭后 `serve` 返回 `Ok(())`；
/// - 多个监听器可以共用同一个 `Server`（同一注册表），TCP 上建立的连接可以从
///   WebSocket 换挂回来，反之亦然。
pub struct Server {
    registry: Arc<IdRegistry>,
    config: Config,
    handler: Arc<dyn ConnHandler>,
    handshakes: Arc<Semaphore>,
}

impl Server {
    pub fn new(
        registry: Arc<IdRegistry>,
        config: Config,
        handler: Arc<dyn ConnHandler>,
        max_handshakes: usize,
    ) -> Self {
        let shared: Arc<dyn Registry> = registry.clone();
        let config = Config {
            scp_server: Some(shared),
            ..config
        };
        Self {
            registry,
            config,
            handler,
            handshakes: Arc::new(Semaphore::new(max_handshakes.max(1))),
        }
    }

    /// 按配置文件装配：注册表、握手参数与上游桥接。
    pub fn from_settings(
        settings: &Settings,
        hook: Arc<dyn ConnectHook>,
    ) -> Result<Self, HostingError> {
        settings.validate()?;
        let session = &settings.session;
        let registry = Arc::new(IdRegistry::new(session.max_conns));
        let config = Config::default()
            .with_handshake_timeout(session.handshake_timeout())
            .with_send_buffer_capacity(session.send_buffer_capacity);
        let relay = UpstreamRelay::new(
            Upstreams::from_settings(&settings.upstream),
            hook,
            session.upstream_connect_timeout(),
            session.reuse_timeout(),
        );
        Ok(Self::new(registry, config, Arc::new(relay), settings.listen.accept_backlog))
    }

    pub fn registry(&self) -> &Arc<IdRegistry> {
        &self.registry
    }

    /// 当前存活的逻辑连接数量。
    pub fn live_connections(&self) -> usize {
        self.registry.live()
    }

    /// 持续接受并握手，直到监听器关闭。
    pub async fn serve(&self, acceptor: SharedAcceptor) -> Result<(), HostingError> {
        let addr = acceptor.addr();
        info!(%addr, "serving");
        loop {
            let transport = match acceptor.accept().await {
                Ok(transport) => transport,
                Err(err @ TransportError::Closed { .. }) => {
                    info!(%addr, reason = %err, "listener stopped");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%addr, error = %err, code = err.code(), "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let permit = match Arc::clone(&self.handshakes).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let config = self.config.clone();
            let handler = Arc::clone(&self.handler);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                let accepted = Conn::server(transport, &config).await;
                drop(permit);
                match accepted {
                    Ok(Accepted::Fresh(conn)) => {
                        debug!(conn_id = ?conn.id(), live = registry.live(), "new session");
                        handler.handle(conn).await;
                    }
                    Ok(Accepted::Reused(conn)) => {
                        debug!(conn_id = ?conn.id(), handshakes = conn.handshakes(), "session resumed");
                    }
                    Err(_) => {}
                }
            });
        }
    }
}
