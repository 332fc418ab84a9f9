// Cross-replica relay.
//
// Bridges N independent router instances into one logical broker over a
// durable, partitioned Kafka log. Producers block on full-ack commit;
// consumers join at the log tail and forward records into the local router.

pub mod consumer;
pub mod producer;
pub mod types;

pub use consumer::spawn_consumers;
pub use producer::{Ack, RelayProducer};
pub use types::{target_for_topic, RelayRecord, RelayTarget, RELAY_TOPICS};
