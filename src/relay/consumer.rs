use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::envelope::{decode_payload, Envelope, Payload};
use crate::relay::types::{target_for_topic, RelayRecord, RelayTarget, RELAY_TOPICS};
use crate::router::Router;

/// Start one consumer task per relay topic.
///
/// Each process joins with a unique consumer group so every replica observes
/// the full stream, subscribed from the current tail: a restarted process
/// misses events published during its downtime by design (canonical state
/// lives in the persistent store, not in the log).
pub fn spawn_consumers(config: &RelayConfig, router: Arc<Router>) -> Result<Vec<JoinHandle<()>>> {
    if !config.enabled {
        info!("relay consumers disabled (KAFKA_ENABLED=false)");
        return Ok(Vec::new());
    }

    let instance_id = Uuid::new_v4();
    let mut handles = Vec::with_capacity(RELAY_TOPICS.len());

    for &topic in RELAY_TOPICS {
        let group_id = format!("{}-{}-{}", config.group_prefix, topic, instance_id);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            // Tail subscription: no historical replay on startup.
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            // Session management
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .with_context(|| format!("Failed to create relay consumer for '{}'", topic))?;

        consumer
            .subscribe(&[topic])
            .with_context(|| format!("Failed to subscribe to relay topic '{}'", topic))?;

        info!(topic = %topic, group = %group_id, "relay consumer subscribed at tail");

        let router = router.clone();
        handles.push(tokio::spawn(async move {
            run_consumer(consumer, topic, router).await;
        }));
    }

    Ok(handles)
}

/// Consume loop for one topic. Records are forwarded as-is: the log's
/// at-least-once delivery is passed through without deduplication, so a
/// consumer restart can re-emit an envelope to a still-connected client.
async fn run_consumer(consumer: StreamConsumer, topic: &'static str, router: Arc<Router>) {
    let target = match target_for_topic(topic) {
        Some(t) => t,
        None => {
            warn!(topic = %topic, "no destination mapping for relay topic, consumer exiting");
            return;
        }
    };

    loop {
        let message = match consumer.recv().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, topic = %topic, "relay consumer receive error");
                continue;
            }
        };

        let payload = match message.payload() {
            Some(p) => p,
            None => {
                warn!(topic = %topic, offset = message.offset(), "empty relay record skipped");
                continue;
            }
        };

        // One malformed record must never halt the consumer.
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    error = %e,
                    topic = %topic,
                    offset = message.offset(),
                    "undecodable relay record skipped"
                );
                continue;
            }
        };

        let record = RelayRecord {
            topic: topic.to_string(),
            partition_key: String::from_utf8_lossy(message.key().unwrap_or_default()).into_owned(),
            envelope,
            sequence: message.offset(),
        };
        dispatch(&router, target, &record);
    }
}

/// Forward one consumed record into the local router. Direct targets resolve
/// the recipient from the typed payload, so a record whose payload fails the
/// decoder table is skipped like any other malformed record.
pub(crate) fn dispatch(router: &Router, target: RelayTarget, record: &RelayRecord) {
    match target {
        RelayTarget::Broadcast { destination } => {
            let delivered = router.dispatch_broadcast(destination, &record.envelope);
            tracing::debug!(
                topic = %record.topic,
                destination = %destination,
                sequence = record.sequence,
                delivered = delivered,
                "relay record broadcast"
            );
        }
        RelayTarget::Direct { queue } => {
            let principal = match decode_payload(&record.envelope) {
                Some(Ok(Payload::Notification(n))) => n.username,
                Some(Ok(Payload::ChatMessage(m))) => m.receiver_username,
                Some(Err(e)) => {
                    warn!(
                        error = %e,
                        topic = %record.topic,
                        sequence = record.sequence,
                        "undecodable relay payload skipped"
                    );
                    return;
                }
                Some(Ok(_)) | None => {
                    warn!(
                        topic = %record.topic,
                        kind = %record.envelope.kind,
                        sequence = record.sequence,
                        "relay payload does not identify a recipient, skipped"
                    );
                    return;
                }
            };

            let delivered = router.dispatch_to_user(&principal, queue, &record.envelope);
            if delivered == 0 {
                // Principal has no open connection on this replica; the
                // persistent store, not the log, is the source of truth.
                tracing::debug!(
                    topic = %record.topic,
                    user = %principal,
                    sequence = record.sequence,
                    "no local connection for relayed record"
                );
            }
        }
    }
}
