use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Deserialize;
use std::sync::Mutex;
use uuid::Uuid;

use crate::envelope::{ChatMessage, Envelope, EventType, ExchangeRate, Notification, Promotion};
use crate::registry::Registry;
use crate::relay::types::{target_for_topic, RelayTarget, TOPIC_CHAT_MESSAGES};
use crate::relay::RelayProducer;
use crate::router::{Destination, Reply, RouterBuilder};

// ============================================================================
// Collaborator interfaces
// ============================================================================
//
// CRUD persistence lives in another service; these traits are the boundary
// the handlers consume. The in-memory implementations below back tests and
// single-process runs.

#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn all_rates(&self) -> anyhow::Result<Vec<ExchangeRate>>;
    async fn rate(&self, base: &str, target: &str) -> anyhow::Result<Option<ExchangeRate>>;
}

#[async_trait]
pub trait PromotionStore: Send + Sync {
    async fn promotions_for(&self, username: &str) -> anyhow::Result<Vec<Promotion>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn notifications_for(&self, username: &str) -> anyhow::Result<Vec<Notification>>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn conversations_for(&self, username: &str) -> anyhow::Result<Vec<ChatMessage>>;
    async fn conversation_between(
        &self,
        username: &str,
        other: &str,
    ) -> anyhow::Result<Vec<ChatMessage>>;
    async fn record(&self, message: &ChatMessage) -> anyhow::Result<()>;
}

/// Everything the request-reply handlers need, wired once at startup.
pub struct HandlerDeps {
    pub registry: Arc<Registry>,
    pub relay: Arc<RelayProducer>,
    pub rates: Arc<dyn RateProvider>,
    pub promotions: Arc<dyn PromotionStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub chat: Arc<dyn ChatStore>,
}

#[derive(Debug, Deserialize)]
struct ChatSendRequest {
    receiver_username: String,
    message: String,
}

/// Register every `/app/...` handler on the router builder.
///
/// The table is explicit and built once: destination string -> closure over
/// its dependencies. Handlers return zero-or-one reply envelope; the router
/// dispatches it to the declared destination.
pub fn register_handlers(builder: RouterBuilder, deps: HandlerDeps) -> RouterBuilder {
    let rates = deps.rates.clone();
    let builder = builder.handler("/app/exchange-rates/subscribe", move |_req| {
        let rates = rates.clone();
        async move {
            let all = rates.all_rates().await?;
            Ok(Some(Reply {
                destination: Destination::Broadcast("/topic/exchange-rates".to_string()),
                envelope: Envelope::new(EventType::ExchangeRatesInitial, serde_json::to_value(all)?),
            }))
        }
        .boxed()
    });

    let rates = deps.rates.clone();
    let builder = builder.handler("/app/exchange-rates/request", move |req| {
        let rates = rates.clone();
        async move {
            let pair = req
                .payload
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("expected a currency pair string"))?
                .to_string();
            let (base, target) = pair
                .split_once('-')
                .ok_or_else(|| anyhow::anyhow!("currency pair must look like USD-EUR"))?;

            let rate = rates
                .rate(base, target)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no rate for pair {}", pair))?;

            Ok(Some(Reply {
                destination: Destination::Broadcast("/topic/exchange-rates".to_string()),
                envelope: Envelope::new(EventType::ExchangeRateRequest, serde_json::to_value(rate)?),
            }))
        }
        .boxed()
    });

    let promotions = deps.promotions.clone();
    let builder = builder.handler("/app/promotions/subscribe", move |req| {
        let promotions = promotions.clone();
        async move {
            let user = required_principal(&req)?;
            let list = promotions.promotions_for(&user).await?;
            tracing::info!(user = %user, count = list.len(), "promotion subscription served");
            Ok(Some(Reply {
                destination: Destination::Direct("/user/queue/promotions".to_string()),
                envelope: Envelope::new(EventType::PromotionsInitial, serde_json::to_value(list)?),
            }))
        }
        .boxed()
    });

    let notifications = deps.notifications.clone();
    let builder = builder.handler("/app/notifications/subscribe", move |req| {
        let notifications = notifications.clone();
        async move {
            let user = required_principal(&req)?;
            let list = notifications.notifications_for(&user).await?;
            Ok(Some(Reply {
                destination: Destination::Direct("/user/queue/notifications".to_string()),
                envelope: Envelope::new(
                    EventType::NotificationsInitial,
                    serde_json::to_value(list)?,
                ),
            }))
        }
        .boxed()
    });

    let chat = deps.chat.clone();
    let builder = builder.handler("/app/chat/subscribe", move |req| {
        let chat = chat.clone();
        async move {
            let user = required_principal(&req)?;
            let conversations = chat.conversations_for(&user).await?;
            Ok(Some(Reply {
                destination: Destination::Direct("/user/queue/chat".to_string()),
                envelope: Envelope::new(
                    EventType::ChatConversationsInitial,
                    serde_json::to_value(conversations)?,
                ),
            }))
        }
        .boxed()
    });

    let chat = deps.chat.clone();
    let builder = builder.handler("/app/chat/conversation", move |req| {
        let chat = chat.clone();
        async move {
            let user = required_principal(&req)?;
            let other = req
                .payload
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("expected the other participant's username"))?;
            let conversation = chat.conversation_between(&user, other).await?;
            Ok(Some(Reply {
                destination: Destination::Direct("/user/queue/chat".to_string()),
                envelope: Envelope::new(
                    EventType::ChatConversationLoaded,
                    serde_json::to_value(conversation)?,
                ),
            }))
        }
        .boxed()
    });

    let chat = deps.chat.clone();
    let relay = deps.relay.clone();
    let registry = deps.registry.clone();
    builder.handler("/app/chat/send", move |req| {
        let chat = chat.clone();
        let relay = relay.clone();
        let registry = registry.clone();
        async move {
            let sender = required_principal(&req)?;
            let request: ChatSendRequest = serde_json::from_value(req.payload)
                .map_err(|e| anyhow::anyhow!("invalid chat message: {}", e))?;

            let message = ChatMessage {
                id: Uuid::new_v4().to_string(),
                sender_username: sender.clone(),
                receiver_username: request.receiver_username.clone(),
                message: request.message,
                sent_at: Utc::now(),
            };
            chat.record(&message).await?;

            // The recipient may be connected to any replica: the message
            // travels through the log, keyed by recipient so their messages
            // stay ordered.
            let envelope =
                Envelope::new(EventType::ChatMessage, serde_json::to_value(&message)?);
            relay
                .publish(TOPIC_CHAT_MESSAGES, &message.receiver_username, &envelope)
                .await?;

            // Single-replica mode has no consumer to bring the record back,
            // so a locally connected recipient gets it here instead.
            if !relay.is_enabled() {
                if let Some(RelayTarget::Direct { queue }) = target_for_topic(TOPIC_CHAT_MESSAGES)
                {
                    registry.send_to_user(&message.receiver_username, queue, &envelope, false);
                }
            }

            tracing::info!(
                from = %sender,
                to = %message.receiver_username,
                message_id = %message.id,
                "chat message relayed"
            );

            Ok(Some(Reply {
                destination: Destination::Direct("/user/queue/chat".to_string()),
                envelope: Envelope::new(
                    EventType::ChatMessageSent,
                    serde_json::to_value(&message)?,
                ),
            }))
        }
        .boxed()
    })
}

fn required_principal(req: &crate::router::HandlerRequest) -> anyhow::Result<String> {
    req.principal
        .as_ref()
        .map(|p| p.name.clone())
        .ok_or_else(|| anyhow::anyhow!("destination requires an authenticated principal"))
}

// ============================================================================
// In-memory collaborator implementations
// ============================================================================

/// In-memory store backing all collaborator traits. The real deployments
/// point these traits at the persistence service; this one serves tests and
/// standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    rates: Mutex<Vec<ExchangeRate>>,
    promotions: Mutex<HashMap<String, Vec<Promotion>>>,
    notifications: Mutex<HashMap<String, Vec<Notification>>>,
    chats: Mutex<Vec<ChatMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_rate(&self, rate: ExchangeRate) {
        self.rates.lock().unwrap().push(rate);
    }

    pub fn put_promotion(&self, username: &str, promotion: Promotion) {
        self.promotions
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .push(promotion);
    }

    pub fn put_notification(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap()
            .entry(notification.username.clone())
            .or_default()
            .push(notification);
    }
}

#[async_trait]
impl RateProvider for MemoryStore {
    async fn all_rates(&self) -> anyhow::Result<Vec<ExchangeRate>> {
        Ok(self.rates.lock().unwrap().clone())
    }

    async fn rate(&self, base: &str, target: &str) -> anyhow::Result<Option<ExchangeRate>> {
        Ok(self
            .rates
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.base_currency == base && r.target_currency == target)
            .cloned())
    }
}

#[async_trait]
impl PromotionStore for MemoryStore {
    async fn promotions_for(&self, username: &str) -> anyhow::Result<Vec<Promotion>> {
        Ok(self
            .promotions
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn notifications_for(&self, username: &str) -> anyhow::Result<Vec<Notification>> {
        Ok(self
            .notifications
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn conversations_for(&self, username: &str) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.sender_username == username || m.receiver_username == username)
            .cloned()
            .collect())
    }

    async fn conversation_between(
        &self,
        username: &str,
        other: &str,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .filter(|m| {
                (m.sender_username == username && m.receiver_username == other)
                    || (m.sender_username == other && m.receiver_username == username)
            })
            .cloned()
            .collect())
    }

    async fn record(&self, message: &ChatMessage) -> anyhow::Result<()> {
        self.chats.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Handler dependencies over a shared in-memory store and a disabled relay,
/// for tests and standalone runs.
pub fn memory_deps(
    store: Arc<MemoryStore>,
    relay: Arc<RelayProducer>,
    registry: Arc<Registry>,
) -> HandlerDeps {
    HandlerDeps {
        registry,
        relay,
        rates: store.clone(),
        promotions: store.clone(),
        notifications: store.clone(),
        chat: store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::config::RelayConfig;
    use crate::connection::Connection;
    use crate::registry::Registry;
    use crate::router::{RouteResult, Router};
    use serde_json::json;

    fn test_router(store: Arc<MemoryStore>) -> (Arc<Registry>, Arc<Router>) {
        let registry = Arc::new(Registry::new());
        let relay = Arc::new(
            RelayProducer::new(&RelayConfig {
                enabled: false,
                brokers: String::new(),
                group_prefix: "test".to_string(),
                publish_timeout_ms: 1000,
            })
            .unwrap(),
        );
        let builder = Router::builder(registry.clone())
            .public_destinations(["/app/exchange-rates/subscribe", "/app/exchange-rates/request"]);
        let router =
            register_handlers(builder, memory_deps(store, relay, registry.clone())).build();
        (registry, Arc::new(router))
    }

    fn connected(registry: &Arc<Registry>, name: &str) -> Arc<Connection> {
        let conn = Connection::new(
            Some(Principal {
                name: name.to_string(),
                scopes: vec![],
            }),
            16,
        );
        registry.register(conn.clone());
        conn
    }

    #[tokio::test]
    async fn exchange_rate_request_replies_on_topic() {
        let store = Arc::new(MemoryStore::new());
        store.put_rate(ExchangeRate {
            base_currency: "USD".into(),
            target_currency: "EUR".into(),
            rate: 0.92,
            updated_at: Utc::now(),
        });
        let (registry, router) = test_router(store);

        let conn = connected(&registry, "alice");
        registry.subscribe(&conn, "/topic/exchange-rates");

        let result = router
            .route(&conn, "/app/exchange-rates/request", json!("USD-EUR"))
            .await
            .unwrap();
        assert_eq!(result, RouteResult::Handled { replied: true });

        let frame = conn.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.envelope.kind, "EXCHANGE_RATE_REQUEST");
        assert_eq!(frame.frame.envelope.data["rate"], 0.92);
    }

    #[tokio::test]
    async fn chat_send_replies_sent_receipt_to_sender() {
        let store = Arc::new(MemoryStore::new());
        let (registry, router) = test_router(store.clone());

        let alice = connected(&registry, "alice");
        let result = router
            .route(
                &alice,
                "/app/chat/send",
                json!({"receiver_username": "bob", "message": "hello"}),
            )
            .await
            .unwrap();
        assert_eq!(result, RouteResult::Handled { replied: true });

        let frame = alice.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.destination, "/user/queue/chat");
        assert_eq!(frame.frame.envelope.kind, "CHAT_MESSAGE_SENT");
        assert_eq!(frame.frame.envelope.data["receiver_username"], "bob");

        // Recorded at the store boundary as well.
        let convo = store.conversations_for("bob").await.unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].message, "hello");
    }

    #[tokio::test]
    async fn chat_send_delivers_locally_when_relay_is_disabled() {
        let store = Arc::new(MemoryStore::new());
        let (registry, router) = test_router(store);

        let alice = connected(&registry, "alice");
        let bob = connected(&registry, "bob");

        router
            .route(
                &alice,
                "/app/chat/send",
                json!({"receiver_username": "bob", "message": "hello"}),
            )
            .await
            .unwrap();

        // No consumer exists in single-replica mode; the recipient still
        // gets the message on their queue.
        let frame = bob.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.destination, "/user/queue/chat");
        assert_eq!(frame.frame.envelope.kind, "CHAT_MESSAGE");
        assert_eq!(frame.frame.envelope.data["message"], "hello");
    }

    #[tokio::test]
    async fn chat_conversation_loads_both_directions() {
        let store = Arc::new(MemoryStore::new());
        let (registry, router) = test_router(store.clone());

        for (from, to, text) in [
            ("alice", "bob", "hi bob"),
            ("bob", "alice", "hi alice"),
            ("alice", "carol", "hi carol"),
        ] {
            store
                .record(&ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    sender_username: from.into(),
                    receiver_username: to.into(),
                    message: text.into(),
                    sent_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let alice = connected(&registry, "alice");
        let result = router
            .route(&alice, "/app/chat/conversation", json!("bob"))
            .await
            .unwrap();
        assert_eq!(result, RouteResult::Handled { replied: true });

        let frame = alice.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.destination, "/user/queue/chat");
        assert_eq!(frame.frame.envelope.kind, "CHAT_CONVERSATION_LOADED");
        let list = frame.frame.envelope.data.as_array().unwrap();
        assert_eq!(list.len(), 2, "only the alice<->bob exchange is loaded");
    }

    #[tokio::test]
    async fn chat_send_with_bad_payload_fails_handler() {
        let store = Arc::new(MemoryStore::new());
        let (registry, router) = test_router(store);
        let alice = connected(&registry, "alice");

        let result = router
            .route(&alice, "/app/chat/send", json!({"nope": true}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn promotions_subscribe_serves_initial_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.put_promotion(
            "alice",
            Promotion {
                id: 1,
                title: "Welcome".into(),
                description: "10% off".into(),
                valid_until: Utc::now(),
            },
        );
        let (registry, router) = test_router(store);
        let alice = connected(&registry, "alice");

        router
            .route(&alice, "/app/promotions/subscribe", json!({}))
            .await
            .unwrap();

        let frame = alice.buffer().pop().await.unwrap();
        assert_eq!(frame.frame.destination, "/user/queue/promotions");
        assert_eq!(frame.frame.envelope.kind, "PROMOTIONS_INITIAL");
        assert_eq!(frame.frame.envelope.data[0]["title"], "Welcome");
    }
}
