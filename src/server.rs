use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::auth::{self, Principal};
use crate::connection::{run_writer, Connection};
use crate::context::AppContext;
use crate::envelope::{ClientFrame, Envelope};
use crate::error::{AuthError, ErrorFrame, RateLimitError};
use crate::rate_limit::resolve_client_key;
use crate::router::ERROR_QUEUE;

/// Accept one WebSocket connection: handshake, principal binding, reader
/// loop. The writer half runs as its own task draining the connection's
/// outbound buffer.
pub async fn handle_connection(socket: TcpStream, addr: SocketAddr, ctx: AppContext) {
    let mut authorization: Option<String> = None;
    let rate_limiter = ctx.rate_limiter.clone();

    let callback = |req: &Request, response: Response| {
        authorization = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());

        // A token-bearing handshake is a login attempt and counts against
        // the client's window.
        if authorization.is_some() {
            let key = resolve_client_key(forwarded_for, addr);
            if let Err(RateLimitError::WindowExceeded {
                retry_after_seconds,
            }) = rate_limiter.admit(&key)
            {
                let frame = ErrorFrame::rate_limited(retry_after_seconds);
                let body = serde_json::to_string(&frame).ok();
                let mut response = ErrorResponse::new(body);
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from(retry_after_seconds));
                return Err(response);
            }
        }
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(socket, callback).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(addr = %addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (principal, auth_failure) = bind_principal(authorization.as_deref(), &ctx);

    let conn = Connection::new(principal, ctx.config.outbound_buffer_capacity);
    ctx.registry.register(conn.clone());
    tracing::info!(
        addr = %addr,
        connection = %conn.id,
        user = conn.principal_name().unwrap_or("anonymous"),
        "websocket connection established"
    );

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let writer = tokio::spawn(run_writer(
        conn.clone(),
        ws_sender,
        Duration::from_secs(ctx.config.send_timeout_secs),
        ctx.registry.clone(),
    ));

    // A rejected token still yields a usable anonymous connection; the
    // client learns why over its own error channel.
    if let Some(frame) = auth_failure {
        if let Ok(data) = serde_json::to_value(&frame) {
            conn.enqueue(ERROR_QUEUE, Envelope::error(data), true);
        }
    }

    while let Some(message) = ws_receiver.next().await {
        if conn.buffer().is_closed() {
            break;
        }
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { destination }) => {
                    let _ = ctx.router.subscribe(&conn, &destination);
                }
                Ok(ClientFrame::Unsubscribe { destination }) => {
                    ctx.router.unsubscribe(&conn, &destination);
                }
                Ok(ClientFrame::Send {
                    destination,
                    payload,
                }) => {
                    let _ = ctx.router.route(&conn, &destination, payload).await;
                }
                Err(e) => {
                    tracing::debug!(connection = %conn.id, error = %e, "unparseable client frame");
                    let frame = ErrorFrame::protocol("Frame is not a valid command");
                    if let Ok(data) = serde_json::to_value(&frame) {
                        conn.enqueue(ERROR_QUEUE, Envelope::error(data), true);
                    }
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::debug!(connection = %conn.id, "connection closed by client");
                break;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = %conn.id, error = %e, "websocket read error");
                break;
            }
        }
    }

    // Unregister closes the buffer, which stops the writer if it is still
    // draining.
    ctx.registry.unregister(&conn);
    let _ = writer.await;
    tracing::info!(connection = %conn.id, addr = %addr, "connection closed");
}

/// Resolve the connection's principal from the connect-time header.
///
/// A missing token is the normal anonymous path. A rejected token also
/// falls back to anonymous, but the failure is reported back as a
/// structured frame once the connection is up.
pub fn bind_principal(
    authorization: Option<&str>,
    ctx: &AppContext,
) -> (Option<Principal>, Option<ErrorFrame>) {
    match auth::authenticate(authorization, ctx.validator.as_ref()) {
        Ok(principal) => (Some(principal), None),
        Err(AuthError::Missing) => {
            tracing::warn!("no bearer token, connection is anonymous");
            (None, None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "token rejected, proceeding anonymously");
            (None, Some(ErrorFrame::authentication()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::auth::JwtValidator;
    use crate::config::Config;
    use crate::rate_limit::LoginRateLimiter;
    use crate::registry::Registry;
    use crate::relay::RelayProducer;
    use crate::router::Router;

    fn test_ctx() -> AppContext {
        let config = Arc::new(Config::for_tests());
        let registry = Arc::new(Registry::new());
        let router = Arc::new(
            Router::builder(registry.clone())
                .public_destinations(config.public_destinations.iter().cloned())
                .build(),
        );
        let relay = Arc::new(RelayProducer::new(&config.relay).unwrap());
        let rate_limiter = Arc::new(LoginRateLimiter::new(&config.rate_limit));
        let validator = Arc::new(JwtValidator::new(&config.jwt));
        AppContext::new(config, registry, router, relay, rate_limiter, validator)
    }

    #[test]
    fn missing_token_binds_anonymous_without_error() {
        let ctx = test_ctx();
        let (principal, failure) = bind_principal(None, &ctx);
        assert!(principal.is_none());
        assert!(failure.is_none());
    }

    #[test]
    fn garbage_token_binds_anonymous_with_error_frame() {
        let ctx = test_ctx();
        let (principal, failure) = bind_principal(Some("Bearer not-a-jwt"), &ctx);
        assert!(principal.is_none());
        let frame = failure.expect("rejected token must produce an error frame");
        assert_eq!(frame.kind, "AUTHENTICATION_ERROR");
    }
}
