use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::metrics;

/// Durable-log acknowledgment: partition plus committed offset. The offset
/// is the record's sequence within its partition key's ordering domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Relay producer with a full-ack commit policy.
///
/// `acks=all` plus idempotence: a state-changing event is never silently
/// lost between replicas. Publish blocks until the log acknowledges, bounded
/// by the configured publish timeout.
pub struct RelayProducer {
    producer: Option<Arc<FutureProducer>>,
    publish_timeout: Duration,
}

impl RelayProducer {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let publish_timeout = Duration::from_millis(config.publish_timeout_ms);

        if !config.enabled {
            info!("relay producer disabled (KAFKA_ENABLED=false)");
            return Ok(Self {
                producer: None,
                publish_timeout,
            });
        }

        info!(brokers = %config.brokers, "initializing relay producer");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            // Reliability settings
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            // Performance settings
            .set("linger.ms", "10")
            .set("batch.size", "16384")
            // Timeout settings
            .set("request.timeout.ms", "30000")
            .set(
                "delivery.timeout.ms",
                &config.publish_timeout_ms.to_string(),
            )
            .create()
            .context("Failed to create relay producer")?;

        Ok(Self {
            producer: Some(Arc::new(producer)),
            publish_timeout,
        })
    }

    /// Publish an envelope, blocking until the log acknowledges the commit.
    ///
    /// Timeout and rejection surface synchronously: the write is
    /// unacknowledged and the caller must retry or report it.
    pub async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &Envelope,
    ) -> Result<Ack, RelayError> {
        let producer = match &self.producer {
            Some(p) => p,
            // Single-replica mode: publishing is a no-op with a dummy ack.
            None => return Ok(Ack { partition: -1, offset: -1 }),
        };

        let payload = serde_json::to_vec(envelope)?;
        let record = FutureRecord::to(topic)
            .key(partition_key.as_bytes())
            .payload(&payload);

        let start = std::time::Instant::now();
        match producer
            .send(record, Timeout::After(self.publish_timeout))
            .await
        {
            Ok((partition, offset)) => {
                let latency = start.elapsed();
                metrics::RELAY_PUBLISH_SUCCESS.inc();
                metrics::RELAY_PUBLISH_LATENCY.observe(latency.as_secs_f64());

                tracing::debug!(
                    topic = %topic,
                    partition_key = %partition_key,
                    partition = partition,
                    offset = offset,
                    latency_ms = latency.as_millis() as u64,
                    "relay record committed"
                );
                Ok(Ack { partition, offset })
            }
            Err((kafka_err, _)) => {
                metrics::RELAY_PUBLISH_FAILURE.inc();
                error!(
                    error = %kafka_err,
                    topic = %topic,
                    partition_key = %partition_key,
                    "relay publish failed"
                );

                match kafka_err {
                    KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
                        Err(RelayError::PublishTimeout {
                            topic: topic.to_string(),
                            timeout_ms: self.publish_timeout.as_millis() as u64,
                        })
                    }
                    other => Err(RelayError::PublishRejected {
                        topic: topic.to_string(),
                        reason: other.to_string(),
                    }),
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.producer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use serde_json::json;

    fn disabled_config() -> RelayConfig {
        RelayConfig {
            enabled: false,
            brokers: "localhost:9092".to_string(),
            group_prefix: "test".to_string(),
            publish_timeout_ms: 1000,
        }
    }

    #[test]
    fn disabled_producer_creation() {
        let producer = RelayProducer::new(&disabled_config()).unwrap();
        assert!(!producer.is_enabled());
    }

    #[tokio::test]
    async fn disabled_producer_acks_with_dummy_offsets() {
        let producer = RelayProducer::new(&disabled_config()).unwrap();
        let envelope = Envelope::new(EventType::ExchangeRateUpdate, json!({"rate": 1.2}));

        let ack = producer
            .publish("exchange-rates", "USD-EUR", &envelope)
            .await
            .unwrap();
        assert_eq!(ack, Ack { partition: -1, offset: -1 });
    }
}
