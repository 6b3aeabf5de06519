//! scon：稳定连接网关。
//!
//! 读取 TOML 配置，在 TCP 与/或 WebSocket 上监听，握手后把每条逻辑连接桥接到上游；
//! 收到 Ctrl-C 后关闭监听器并退出。

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use scp_hosting::{NoopHook, Server, Settings};
use scp_transport::SharedAcceptor;
use scp_transport_tcp::TcpListener;
use scp_transport_ws::{WsListener, WsListenerConfig};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "scon", version, about = "Stable connection gateway")]
struct Cli {
    /// 配置文件路径。
    #[arg(long, default_value = "./scon.toml")]
    config: PathBuf,

    /// 只检查配置语法后退出。
    #[arg(short = 't')]
    test: bool,

    /// 检查配置并打印生效值后退出。
    #[arg(short = 'T')]
    dump: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.test || cli.dump {
        println!("{}: syntax is ok", cli.config.display());
        if cli.dump {
            print!("{}", settings.to_toml()?);
        }
        return Ok(());
    }

    init_tracing(&settings.log.level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(settings))
}

/// `RUST_LOG` 优先，否则使用配置中的级别。
fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    let server = Arc::new(Server::from_settings(&settings, Arc::new(NoopHook))?);

    let mut acceptors: Vec<SharedAcceptor> = Vec::new();
    if let Some(addr) = settings.listen.tcp.as_deref() {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding tcp {addr}"))?;
        acceptors.push(Arc::new(listener));
    }
    if let Some(addr) = settings.listen.ws.as_deref() {
        let config = WsListenerConfig {
            backlog: settings.listen.accept_backlog,
            ..WsListenerConfig::default()
        };
        let listener = WsListener::bind_with_config(addr, config)
            .await
            .with_context(|| format!("binding ws {addr}"))?;
        acceptors.push(Arc::new(listener));
    }

    let mut serving = JoinSet::new();
    for acceptor in &acceptors {
        let server = Arc::clone(&server);
        let acceptor = Arc::clone(acceptor);
        serving.spawn(async move { server.serve(acceptor).await });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!(live = server.live_connections(), "shutting down");
        }
        Some(joined) = serving.join_next() => {
            if let Ok(Err(err)) = joined {
                error!(error = %err, code = err.code(), "listener failed");
            }
        }
    }

    for acceptor in &acceptors {
        if let Err(err) = acceptor.close().await {
            error!(addr = %acceptor.addr(), error = %err, "close listener");
        }
    }
    while serving.join_next().await.is_some() {}
    info!(live = server.live_connections(), "stopped");
    Ok(())
}
