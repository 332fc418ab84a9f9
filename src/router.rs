use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::{ErrorFrame, RouteError};
use crate::registry::Registry;

/// Queue on which structured error envelopes are delivered back to the
/// originating connection. Error frames are critical: they are never evicted
/// from a saturated buffer.
pub const ERROR_QUEUE: &str = "/user/queue/errors";

/// Classified delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `/topic/<feature>`: fan-out to every subscriber.
    Broadcast(String),
    /// `/user/queue/<feature>`: one principal's private queue, resolved
    /// server-side to the caller.
    Direct(String),
    /// `/app/<feature>/<action>`: inbound command mapped to a handler.
    App(String),
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let valid = |rest: &str| !rest.is_empty() && !rest.starts_with('/');
        if let Some(rest) = raw.strip_prefix("/topic/") {
            if valid(rest) {
                return Ok(Destination::Broadcast(raw.to_string()));
            }
        } else if let Some(rest) = raw.strip_prefix("/user/queue/") {
            if valid(rest) {
                return Ok(Destination::Direct(raw.to_string()));
            }
        } else if let Some(rest) = raw.strip_prefix("/app/") {
            if valid(rest) {
                return Ok(Destination::App(raw.to_string()));
            }
        }
        Err(RouteError::UnknownDestination(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Broadcast(s) | Destination::Direct(s) | Destination::App(s) => s,
        }
    }
}

/// What a handler sees: the caller's identity (if bound) and the raw
/// payload. Payload decoding is the handler's business.
pub struct HandlerRequest {
    pub principal: Option<crate::auth::Principal>,
    pub payload: Value,
}

/// Zero-or-one result envelope, sent to the destination the handler
/// declares.
pub struct Reply {
    pub destination: Destination,
    pub envelope: Envelope,
}

type HandlerFn =
    Arc<dyn Fn(HandlerRequest) -> BoxFuture<'static, anyhow::Result<Option<Reply>>> + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
pub enum RouteResult {
    Broadcast { delivered: usize },
    Direct { delivered: usize },
    Handled { replied: bool },
}

/// Destination router: classifies every inbound frame, binds authorization
/// to non-public destinations, and dispatches through an explicit
/// destination -> handler table built once at startup.
pub struct Router {
    registry: Arc<Registry>,
    handlers: HashMap<String, HandlerFn>,
    public_destinations: HashSet<String>,
}

pub struct RouterBuilder {
    registry: Arc<Registry>,
    handlers: HashMap<String, HandlerFn>,
    public_destinations: HashSet<String>,
}

impl RouterBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            public_destinations: HashSet::new(),
        }
    }

    /// Destinations anonymous connections may use.
    pub fn public_destinations<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_destinations
            .extend(destinations.into_iter().map(Into::into));
        self
    }

    /// Register a handler for an `/app/...` destination.
    pub fn handler<F>(mut self, destination: &str, f: F) -> Self
    where
        F: Fn(HandlerRequest) -> BoxFuture<'static, anyhow::Result<Option<Reply>>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(destination.to_string(), Arc::new(f));
        self
    }

    pub fn build(self) -> Router {
        Router {
            registry: self.registry,
            handlers: self.handlers,
            public_destinations: self.public_destinations,
        }
    }
}

impl Router {
    pub fn builder(registry: Arc<Registry>) -> RouterBuilder {
        RouterBuilder::new(registry)
    }

    pub fn is_public(&self, destination: &str) -> bool {
        self.public_destinations.contains(destination)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Route one inbound frame from a connection.
    ///
    /// Failures never reach the transport layer: each error is delivered
    /// back as a structured envelope on the caller's own error channel and
    /// also returned for the caller's bookkeeping.
    pub async fn route(
        &self,
        conn: &Arc<Connection>,
        destination: &str,
        payload: Value,
    ) -> Result<RouteResult, RouteError> {
        let dest = match Destination::parse(destination) {
            Ok(d) => d,
            Err(e) => {
                self.send_error(conn, ErrorFrame::from_route_error(&e));
                return Err(e);
            }
        };

        if let Err(e) = self.authorize(conn, destination) {
            self.send_error(conn, ErrorFrame::authentication());
            return Err(e);
        }

        match dest {
            Destination::App(path) => self.invoke_handler(conn, &path, payload).await,
            Destination::Broadcast(topic) => {
                let envelope = self.parse_envelope(conn, payload)?;
                let delivered = self.registry.broadcast(&topic, &envelope);
                Ok(RouteResult::Broadcast { delivered })
            }
            Destination::Direct(queue) => {
                let envelope = self.parse_envelope(conn, payload)?;
                // /user/queue sends resolve to the caller's own principal.
                let delivered = match conn.principal_name() {
                    Some(name) => self.registry.send_to_user(name, &queue, &envelope, false),
                    None => usize::from(conn.enqueue(&queue, envelope, false)),
                };
                Ok(RouteResult::Direct { delivered })
            }
        }
    }

    /// Bind a subscription, enforcing the public allow-list for anonymous
    /// connections. Keeps the invariant that a connection's subscriptions
    /// only ever contain destinations its principal may use.
    pub fn subscribe(
        &self,
        conn: &Arc<Connection>,
        destination: &str,
    ) -> Result<(), RouteError> {
        let dest = match Destination::parse(destination) {
            Ok(d) => d,
            Err(e) => {
                self.send_error(conn, ErrorFrame::from_route_error(&e));
                return Err(e);
            }
        };

        if let Err(e) = self.authorize(conn, destination) {
            tracing::warn!(
                connection = %conn.id,
                destination = %destination,
                "anonymous connection attempted to subscribe to a private destination"
            );
            self.send_error(conn, ErrorFrame::authentication());
            return Err(e);
        }

        match dest {
            Destination::Broadcast(_) => self.registry.subscribe(conn, destination),
            // Direct queues deliver by principal; the subscription is only
            // recorded so disconnect cleanup stays uniform.
            Destination::Direct(_) => {
                conn.subscriptions
                    .lock()
                    .unwrap()
                    .insert(destination.to_string());
            }
            Destination::App(_) => {
                let e = RouteError::UnknownDestination(destination.to_string());
                self.send_error(conn, ErrorFrame::from_route_error(&e));
                return Err(e);
            }
        }

        tracing::info!(
            connection = %conn.id,
            user = conn.principal_name().unwrap_or("anonymous"),
            destination = %destination,
            "subscribed"
        );
        Ok(())
    }

    pub fn unsubscribe(&self, conn: &Arc<Connection>, destination: &str) {
        self.registry.unsubscribe(conn, destination);
    }

    /// Fan an envelope out on a broadcast destination (relay and handler
    /// dispatch path).
    pub fn dispatch_broadcast(&self, destination: &str, envelope: &Envelope) -> usize {
        self.registry.broadcast(destination, envelope)
    }

    /// Deliver an envelope to one principal's queue across all their open
    /// connections.
    pub fn dispatch_to_user(&self, principal: &str, queue: &str, envelope: &Envelope) -> usize {
        self.registry.send_to_user(principal, queue, envelope, false)
    }

    fn authorize(&self, conn: &Arc<Connection>, destination: &str) -> Result<(), RouteError> {
        if self.is_public(destination) || conn.principal.is_some() {
            Ok(())
        } else {
            Err(RouteError::Unauthorized)
        }
    }

    async fn invoke_handler(
        &self,
        conn: &Arc<Connection>,
        path: &str,
        payload: Value,
    ) -> Result<RouteResult, RouteError> {
        let handler = match self.handlers.get(path) {
            Some(h) => h.clone(),
            None => {
                let e = RouteError::UnknownDestination(path.to_string());
                self.send_error(conn, ErrorFrame::from_route_error(&e));
                return Err(e);
            }
        };

        let request = HandlerRequest {
            principal: conn.principal.clone(),
            payload,
        };

        let reply = match handler(request).await {
            Ok(reply) => reply,
            Err(e) => {
                let err = RouteError::HandlerFailure(e);
                let frame = ErrorFrame::from_route_error(&err);
                tracing::warn!(
                    trace_id = %frame.trace_id,
                    destination = %path,
                    error = %err,
                    "handler failed"
                );
                self.send_error(conn, frame);
                return Err(err);
            }
        };

        let Some(reply) = reply else {
            return Ok(RouteResult::Handled { replied: false });
        };

        match reply.destination {
            Destination::Broadcast(topic) => {
                self.registry.broadcast(&topic, &reply.envelope);
            }
            Destination::Direct(queue) => match conn.principal_name() {
                Some(name) => {
                    self.registry
                        .send_to_user(name, &queue, &reply.envelope, false);
                }
                // Anonymous caller of a public handler still gets the reply
                // on its own channel.
                None => {
                    conn.enqueue(&queue, reply.envelope, false);
                }
            },
            Destination::App(path) => {
                tracing::warn!(destination = %path, "handler declared an /app reply destination, dropping");
            }
        }

        Ok(RouteResult::Handled { replied: true })
    }

    fn parse_envelope(
        &self,
        conn: &Arc<Connection>,
        payload: Value,
    ) -> Result<Envelope, RouteError> {
        serde_json::from_value(payload).map_err(|e| {
            self.send_error(conn, ErrorFrame::protocol("Payload is not a valid envelope"));
            RouteError::HandlerFailure(anyhow::anyhow!("malformed envelope payload: {}", e))
        })
    }

    fn send_error(&self, conn: &Arc<Connection>, frame: ErrorFrame) {
        let envelope = match serde_json::to_value(&frame) {
            Ok(data) => Envelope::error(data),
            Err(_) => return,
        };
        conn.enqueue(ERROR_QUEUE, envelope, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::envelope::EventType;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn principal(name: &str) -> Option<Principal> {
        Some(Principal {
            name: name.to_string(),
            scopes: vec![],
        })
    }

    fn router_with_flag() -> (Arc<Registry>, Router, Arc<AtomicBool>) {
        let registry = Arc::new(Registry::new());
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let router = Router::builder(registry.clone())
            .public_destinations(["/topic/exchange-rates", "/app/exchange-rates/subscribe"])
            .handler("/app/chat/send", move |_req| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(None)
                }
                .boxed()
            })
            .build();
        (registry, router, invoked)
    }

    #[test]
    fn destination_classification() {
        assert!(matches!(
            Destination::parse("/topic/exchange-rates"),
            Ok(Destination::Broadcast(_))
        ));
        assert!(matches!(
            Destination::parse("/user/queue/chat"),
            Ok(Destination::Direct(_))
        ));
        assert!(matches!(
            Destination::parse("/app/chat/send"),
            Ok(Destination::App(_))
        ));
        assert!(Destination::parse("/queue/other").is_err());
        assert!(Destination::parse("/topic/").is_err());
    }

    #[tokio::test]
    async fn anonymous_route_to_private_destination_is_unauthorized() {
        let (registry, router, invoked) = router_with_flag();
        let conn = Connection::new(None, 8);
        registry.register(conn.clone());

        let result = router.route(&conn, "/app/chat/send", json!({})).await;
        assert!(matches!(result, Err(RouteError::Unauthorized)));
        assert!(!invoked.load(Ordering::SeqCst), "handler must not run");

        // The rejection arrives as an error envelope on the caller's own
        // channel, not as a transport failure.
        let frame = conn.buffer().pop().await.unwrap();
        assert!(frame.critical);
        assert_eq!(frame.frame.destination, ERROR_QUEUE);
        assert_eq!(frame.frame.envelope.kind, "ERROR");
        assert_eq!(frame.frame.envelope.data["type"], "AUTHENTICATION_ERROR");
    }

    #[tokio::test]
    async fn anonymous_subscribe_to_public_topic_is_allowed() {
        let (registry, router, _) = router_with_flag();
        let conn = Connection::new(None, 8);
        registry.register(conn.clone());

        router.subscribe(&conn, "/topic/exchange-rates").unwrap();
        let envelope = Envelope::new(EventType::ExchangeRateUpdate, json!({"rate": 1.0}));
        assert_eq!(router.dispatch_broadcast("/topic/exchange-rates", &envelope), 1);
    }

    #[tokio::test]
    async fn anonymous_subscribe_to_private_queue_is_rejected() {
        let (registry, router, _) = router_with_flag();
        let conn = Connection::new(None, 8);
        registry.register(conn.clone());

        let result = router.subscribe(&conn, "/user/queue/notifications");
        assert!(matches!(result, Err(RouteError::Unauthorized)));
    }

    #[tokio::test]
    async fn unknown_destination_is_reported() {
        let (registry, router, _) = router_with_flag();
        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());

        let result = router.route(&conn, "/elsewhere", json!({})).await;
        assert!(matches!(result, Err(RouteError::UnknownDestination(_))));

        let frame = conn.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.envelope.data["type"], "UNKNOWN_DESTINATION");
    }

    #[tokio::test]
    async fn handler_error_becomes_error_envelope_on_caller_channel() {
        let registry = Arc::new(Registry::new());
        let router = Router::builder(registry.clone())
            .handler("/app/chat/send", |_req| {
                async { Err(anyhow::anyhow!("store unavailable")) }.boxed()
            })
            .build();
        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());

        let result = router.route(&conn, "/app/chat/send", json!({})).await;
        assert!(matches!(result, Err(RouteError::HandlerFailure(_))));

        let frame = conn.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.envelope.data["type"], "HANDLER_FAILURE");
        assert!(frame.frame.envelope.data["trace_id"].is_string());
    }

    #[tokio::test]
    async fn handler_reply_is_dispatched_to_declared_destination() {
        let registry = Arc::new(Registry::new());
        let router = Router::builder(registry.clone())
            .handler("/app/echo/ping", |req| {
                async move {
                    Ok(Some(Reply {
                        destination: Destination::Direct("/user/queue/echo".to_string()),
                        envelope: Envelope::new(EventType::NotificationUpdate, req.payload),
                    }))
                }
                .boxed()
            })
            .build();

        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());

        let result = router
            .route(&conn, "/app/echo/ping", json!({"n": 7}))
            .await
            .unwrap();
        assert_eq!(result, RouteResult::Handled { replied: true });

        let frame = conn.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.destination, "/user/queue/echo");
        assert_eq!(frame.frame.envelope.data["n"], 7);
    }
}
