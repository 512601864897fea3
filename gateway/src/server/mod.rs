mod admin;
pub mod bootstrap;
pub mod state;

pub use admin::handle_admin;
pub use state::Gateway;

use crate::proxy::{self, BoxBody};
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind `listen` and serve client traffic until `shutdown` is notified.
pub async fn run_proxy_server(listen: &str, gw: Gateway, shutdown: Arc<Notify>) -> Result<()> {
    serve_proxy(bind(listen, "proxy").await?, gw, shutdown).await
}

/// Client traffic over an already-bound listener. Tests bind port 0 and hand
/// the listener in.
pub async fn serve_proxy(listener: TcpListener, gw: Gateway, shutdown: Arc<Notify>) -> Result<()> {
    serve(listener, "proxy", shutdown, move |req, peer| {
        let gw = gw.clone();
        async move { proxy::handle(req, &gw, peer).await }
    })
    .await
}

/// Bind `listen` and serve the admin API until `shutdown` is notified.
pub async fn run_admin_server(listen: &str, gw: Gateway, shutdown: Arc<Notify>) -> Result<()> {
    serve_admin(bind(listen, "admin").await?, gw, shutdown).await
}

pub async fn serve_admin(listener: TcpListener, gw: Gateway, shutdown: Arc<Notify>) -> Result<()> {
    serve(listener, "admin", shutdown, move |req, _| {
        let gw = gw.clone();
        async move { admin::handle_admin(req, gw).await }
    })
    .await
}

async fn bind(listen: &str, name: &'static str) -> Result<TcpListener> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: {} listening, addr={}", name, addr);
    Ok(listener)
}

/// Accept loop shared by both listeners. Every connection runs as a task in
/// one `JoinSet`: finished tasks are reaped while accepting, and on shutdown
/// the set is drained for up to `DRAIN_TIMEOUT` before the rest are aborted.
async fn serve<H, Fut>(
    listener: TcpListener,
    name: &'static str,
    shutdown: Arc<Notify>,
    handler: H,
) -> Result<()>
where
    H: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Response<BoxBody>> + Send + 'static,
{
    // Created before the loop so a notification between iterations is not lost.
    let stop = shutdown.notified();
    tokio::pin!(stop);
    let mut conns = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut stop => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("server: {}: accept failed, error={}", name, e);
                    metrics::counter!("gateway_connections_total", "listener" => name, "status" => "error")
                        .increment(1);
                    continue;
                }
            },
        };
        metrics::counter!("gateway_connections_total", "listener" => name, "status" => "accepted")
            .increment(1);

        let handler = handler.clone();
        conns.spawn(async move {
            let gauge = metrics::gauge!("gateway_connections_active", "listener" => name);
            gauge.increment(1.0);
            let svc = service_fn(move |req| {
                let response = handler(req, peer);
                async move { Ok::<_, Infallible>(response.await) }
            });
            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().keep_alive(true);
            builder
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)));
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                if !e.to_string().contains("connection closed") {
                    warn!("server: {}: connection error, peer={}, error={}", name, peer, e);
                }
            }
            gauge.decrement(1.0);
        });
    }

    if conns.is_empty() {
        return Ok(());
    }
    info!(
        "server: {}: stopped accepting, draining connections={}",
        name,
        conns.len()
    );
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    match drained {
        Ok(()) => info!("server: {}: all connections drained", name),
        Err(_) => {
            warn!(
                "server: {}: drain timed out after {}s, aborting connections={}",
                name,
                DRAIN_TIMEOUT.as_secs(),
                conns.len()
            );
            conns.shutdown().await;
        }
    }
    Ok(())
}
