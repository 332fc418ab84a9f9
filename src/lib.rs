use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;

use auth::JwtValidator;
use config::Config;
use connection::Connection;
use context::AppContext;
use envelope::ServerFrame;
use error::{ErrorFrame, RateLimitError};
use handlers::{memory_deps, register_handlers, MemoryStore};
use rate_limit::{resolve_client_key, LoginRateLimiter};
use registry::Registry;
use relay::RelayProducer;
use router::Router;

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = status;
    res.headers_mut()
        .insert("Content-Type", "application/json".parse().unwrap());
    res
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

async fn http_handler(
    req: Request<IncomingBody>,
    remote: SocketAddr,
    ctx: AppContext,
) -> HttpResult {
    let response = match req.uri().path() {
        "/health" => Response::new(Full::new(Bytes::from("OK"))),
        "/metrics" => match metrics::gather_metrics() {
            Ok(metrics_data) => {
                let mut res = Response::new(Full::new(Bytes::from(metrics_data)));
                res.headers_mut()
                    .insert("Content-Type", "text/plain; version=0.0.4".parse().unwrap());
                res
            }
            Err(e) => {
                tracing::error!("Failed to gather metrics: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Internal Server Error")));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        },
        "/poll" => handle_poll(&req, remote, &ctx).await,
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from("Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

/// Long-polling fallback transport for clients that cannot hold a socket.
///
/// `GET /poll?destinations=/topic/a,/user/queue/b` authenticates exactly like
/// the WebSocket handshake, binds an ephemeral connection, and parks until a
/// frame arrives or the poll window elapses. Subscription failures come back
/// in the frame list as error envelopes, same as over a socket.
async fn handle_poll(
    req: &Request<IncomingBody>,
    remote: SocketAddr,
    ctx: &AppContext,
) -> Response<Full<Bytes>> {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());

    if authorization.is_some() {
        let key = resolve_client_key(forwarded_for, remote);
        if let Err(RateLimitError::WindowExceeded {
            retry_after_seconds,
        }) = ctx.rate_limiter.admit(&key)
        {
            let frame = ErrorFrame::rate_limited(retry_after_seconds);
            let body = serde_json::to_string(&frame).unwrap_or_default();
            let mut res = json_response(StatusCode::TOO_MANY_REQUESTS, body);
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                res.headers_mut().insert("Retry-After", value);
            }
            return res;
        }
    }

    let (principal, auth_failure) = server::bind_principal(authorization.as_deref(), ctx);

    let destinations: Vec<String> = req
        .uri()
        .query()
        .and_then(|q| query_param(q, "destinations"))
        .map(|v| {
            v.split(',')
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let conn = Connection::new(principal, ctx.config.outbound_buffer_capacity);
    ctx.registry.register(conn.clone());
    if let Some(frame) = auth_failure {
        if let Ok(data) = serde_json::to_value(&frame) {
            conn.enqueue(router::ERROR_QUEUE, envelope::Envelope::error(data), true);
        }
    }
    for destination in &destinations {
        let _ = ctx.router.subscribe(&conn, destination);
    }

    let mut frames: Vec<ServerFrame> = Vec::new();
    let wait = Duration::from_secs(ctx.config.poll_wait_secs);
    if let Ok(Some(first)) = tokio::time::timeout(wait, conn.buffer().pop()).await {
        frames.push(first.frame);
        // Drain whatever arrived in the same burst.
        while let Ok(Some(next)) =
            tokio::time::timeout(Duration::from_millis(25), conn.buffer().pop()).await
        {
            frames.push(next.frame);
        }
    }
    ctx.registry.unregister(&conn);

    match serde_json::to_string(&frames) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize poll response");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, "[]".to_string())
        }
    }
}

pub async fn run_http_server(ctx: AppContext) -> Result<()> {
    let http_addr = format!("0.0.0.0:{}", ctx.config.health_port);
    let listener = TcpListener::bind(&http_addr).await?;
    tracing::info!("HTTP server listening on http://{}", http_addr);

    loop {
        let (stream, remote) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = ctx.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| http_handler(req, remote, ctx.clone()));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }
}

pub async fn run_websocket_server(ctx: AppContext, listener: TcpListener) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to accept socket: {}", e);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            server::handle_connection(socket, addr, ctx).await;
        });
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    let registry = Arc::new(Registry::new());
    let relay = Arc::new(RelayProducer::new(&config.relay)?);
    let rate_limiter = Arc::new(LoginRateLimiter::new(&config.rate_limit));
    let validator = Arc::new(JwtValidator::new(&config.jwt));

    // Data collaborators live behind traits; the in-memory store backs
    // standalone runs until a persistence service is wired in.
    let store = Arc::new(MemoryStore::new());
    let builder = Router::builder(registry.clone())
        .public_destinations(config.public_destinations.iter().cloned());
    let router = Arc::new(
        register_handlers(builder, memory_deps(store, relay.clone(), registry.clone())).build(),
    );

    let consumer_handles = relay::spawn_consumers(&config.relay, router.clone())?;
    tracing::info!(consumers = consumer_handles.len(), "relay consumers running");

    let bind_address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Streamhub listening on {} (WebSocket)", bind_address);

    let ctx = AppContext::new(
        config,
        registry,
        router,
        relay,
        rate_limiter,
        validator,
    );

    let websocket_server = run_websocket_server(ctx.clone(), listener);
    let http_server = run_http_server(ctx);

    tokio::select! {
        _ = websocket_server => {
            tracing::info!("WebSocket server shut down.");
        },
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
        }
    }

    Ok(())
}
