use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

pub const TOPIC_EXCHANGE_RATES: &str = "exchange-rates";
pub const TOPIC_PROMOTIONS: &str = "promotions";
pub const TOPIC_NOTIFICATIONS: &str = "notifications";
pub const TOPIC_CHAT_MESSAGES: &str = "chat-messages";

pub const RELAY_TOPICS: &[&str] = &[
    TOPIC_EXCHANGE_RATES,
    TOPIC_PROMOTIONS,
    TOPIC_NOTIFICATIONS,
    TOPIC_CHAT_MESSAGES,
];

/// A durable log record. `sequence` is the log offset: monotonically
/// increasing per partition key only; no ordering across keys or topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub topic: String,
    pub partition_key: String,
    pub envelope: Envelope,
    pub sequence: i64,
}

/// Where a consumed record goes in the local router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget {
    /// Fan out to every subscriber of a broadcast destination.
    Broadcast { destination: &'static str },
    /// Deliver to one principal's private queue; the principal name comes
    /// from the decoded payload (notification recipient, chat receiver).
    Direct { queue: &'static str },
}

/// Fixed topic -> destination mapping applied on consume.
pub fn target_for_topic(topic: &str) -> Option<RelayTarget> {
    match topic {
        TOPIC_EXCHANGE_RATES => Some(RelayTarget::Broadcast {
            destination: "/topic/exchange-rates",
        }),
        TOPIC_PROMOTIONS => Some(RelayTarget::Broadcast {
            destination: "/topic/promotions",
        }),
        TOPIC_NOTIFICATIONS => Some(RelayTarget::Direct {
            queue: "/user/queue/notifications",
        }),
        TOPIC_CHAT_MESSAGES => Some(RelayTarget::Direct {
            queue: "/user/queue/chat",
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_relay_topic_has_a_target() {
        for topic in RELAY_TOPICS {
            assert!(target_for_topic(topic).is_some(), "no target for {}", topic);
        }
    }

    #[test]
    fn notifications_map_to_the_user_queue() {
        assert_eq!(
            target_for_topic(TOPIC_NOTIFICATIONS),
            Some(RelayTarget::Direct {
                queue: "/user/queue/notifications",
            })
        );
    }

    #[test]
    fn unknown_topic_has_no_target() {
        assert!(target_for_topic("something-else").is_none());
    }
}
