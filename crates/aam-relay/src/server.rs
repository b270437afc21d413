use crate::config::RelayConfig;
use crate::routes::router;
use crate::session::RelaySession;
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Binds the listener, then starts the upstream session and serves until
/// `shutdown` resolves. The upstream connection is only opened once the
/// port is ours, and it is stopped on every exit path after that.
pub async fn serve<F>(config: RelayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid relay address {:?}", config.addr))?;
    let session = RelaySession::new(config.clone()).context("create relay session")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    session.start();
    info!(event = "relay_listen", addr = %addr, gateway = %config.gateway.url);
    let served = axum::serve(listener, router(session.clone()))
        .with_graceful_shutdown(shutdown)
        .await;
    session.stop().await;
    served.context("serve relay")
}
