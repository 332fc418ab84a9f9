use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire envelope exchanged between producers, the relay and connections.
///
/// The `data` field stays opaque at the transport layer; typed access goes
/// through the [`decode_payload`] table keyed on the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EventType, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(data: Value) -> Self {
        Self {
            kind: EventType::Error.as_str().to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Stable list of envelope type tags so clients have a fixed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExchangeRatesInitial,
    ExchangeRateUpdate,
    ExchangeRateRequest,
    PromotionsInitial,
    PromotionUpdate,
    NotificationsInitial,
    NotificationUpdate,
    ChatConversationsInitial,
    ChatConversationLoaded,
    ChatMessage,
    ChatMessageSent,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExchangeRatesInitial => "EXCHANGE_RATES_INITIAL",
            EventType::ExchangeRateUpdate => "EXCHANGE_RATE_UPDATE",
            EventType::ExchangeRateRequest => "EXCHANGE_RATE_REQUEST",
            EventType::PromotionsInitial => "PROMOTIONS_INITIAL",
            EventType::PromotionUpdate => "PROMOTION_UPDATE",
            EventType::NotificationsInitial => "NOTIFICATIONS_INITIAL",
            EventType::NotificationUpdate => "NOTIFICATION_UPDATE",
            EventType::ChatConversationsInitial => "CHAT_CONVERSATIONS_INITIAL",
            EventType::ChatConversationLoaded => "CHAT_CONVERSATION_LOADED",
            EventType::ChatMessage => "CHAT_MESSAGE",
            EventType::ChatMessageSent => "CHAT_MESSAGE_SENT",
            EventType::Error => "ERROR",
        }
    }
}

// ============================================================================
// Typed payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeRate {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promotion {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: i64,
    pub username: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_username: String,
    pub receiver_username: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Decoded view of an envelope's `data` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ExchangeRate(ExchangeRate),
    ExchangeRates(Vec<ExchangeRate>),
    Promotions(Vec<Promotion>),
    Notification(Notification),
    Notifications(Vec<Notification>),
    ChatMessage(ChatMessage),
    ChatMessages(Vec<ChatMessage>),
}

/// Explicit type-tag -> decoder table. Unknown tags are not an error at this
/// layer; callers that need typed access decide how to treat `None`.
pub fn decode_payload(envelope: &Envelope) -> Option<Result<Payload, serde_json::Error>> {
    let data = envelope.data.clone();
    let decoded = match envelope.kind.as_str() {
        "EXCHANGE_RATE_UPDATE" | "EXCHANGE_RATE_REQUEST" => {
            serde_json::from_value(data).map(Payload::ExchangeRate)
        }
        "EXCHANGE_RATES_INITIAL" => serde_json::from_value(data).map(Payload::ExchangeRates),
        "PROMOTIONS_INITIAL" | "PROMOTION_UPDATE" => {
            serde_json::from_value(data).map(Payload::Promotions)
        }
        "NOTIFICATION_UPDATE" => serde_json::from_value(data).map(Payload::Notification),
        "NOTIFICATIONS_INITIAL" => serde_json::from_value(data).map(Payload::Notifications),
        "CHAT_MESSAGE" | "CHAT_MESSAGE_SENT" => {
            serde_json::from_value(data).map(Payload::ChatMessage)
        }
        "CHAT_CONVERSATIONS_INITIAL" | "CHAT_CONVERSATION_LOADED" => {
            serde_json::from_value(data).map(Payload::ChatMessages)
        }
        _ => return None,
    };
    Some(decoded)
}

// ============================================================================
// Client / server frames
// ============================================================================

/// Inbound frames from a client connection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    Subscribe { destination: String },
    Unsubscribe { destination: String },
    Send { destination: String, payload: Value },
}

/// Outbound frame: the envelope plus the destination it was delivered on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub destination: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}
