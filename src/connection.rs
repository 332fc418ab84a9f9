use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Principal;
use crate::envelope::{Envelope, ServerFrame};
use crate::metrics;
use crate::registry::Registry;

pub type WebSocketStreamType = WebSocketStream<TcpStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound frame with its eviction class. Error and auth frames are
/// critical and survive buffer overflow; data envelopes are evicted
/// oldest-first. Delivery is best-effort by design.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub frame: ServerFrame,
    pub critical: bool,
}

// Critical frames may exceed the configured capacity by this much before
// they too are dropped, so an all-critical queue stays bounded.
const CRITICAL_HEADROOM: usize = 16;

/// Bounded outbound buffer feeding one connection's writer task.
pub struct SendBuffer {
    queue: Mutex<VecDeque<OutboundFrame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, evicting the oldest non-critical frame on overflow.
    /// Returns false if the buffer is already closed.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            match queue.iter().position(|f| !f.critical) {
                Some(pos) => {
                    queue.remove(pos);
                    metrics::MESSAGES_DROPPED_TOTAL.inc();
                }
                None => {
                    // Buffer full of critical frames. Data frames are the
                    // ones dropped; critical frames get bounded headroom and
                    // past that are dropped too.
                    if !frame.critical || queue.len() >= self.capacity + CRITICAL_HEADROOM {
                        metrics::MESSAGES_DROPPED_TOTAL.inc();
                        return true;
                    }
                }
            }
        }
        queue.push_back(frame);
        drop(queue);

        self.notify.notify_one();
        true
    }

    /// Wait for the next frame. Returns `None` once the buffer is closed and
    /// drained-or-abandoned; pending frames are discarded on close.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Some(frame);
            }
            notified.await;
        }
    }

    /// Close the buffer, cancelling pending deliveries.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.lock().unwrap().clear();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One client connection. Exclusively owned by the registry: created on
/// handshake, destroyed on disconnect, idle timeout or forced close.
pub struct Connection {
    pub id: ConnectionId,
    /// Bound once at connect time; never rebound for the connection's life.
    pub principal: Option<Principal>,
    pub established_at: DateTime<Utc>,
    pub subscriptions: Mutex<HashSet<String>>,
    buffer: SendBuffer,
}

impl Connection {
    pub fn new(principal: Option<Principal>, buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            principal,
            established_at: Utc::now(),
            subscriptions: Mutex::new(HashSet::new()),
            buffer: SendBuffer::new(buffer_capacity),
        })
    }

    pub fn principal_name(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.name.as_str())
    }

    /// Queue an envelope for delivery on `destination`.
    pub fn enqueue(&self, destination: &str, envelope: Envelope, critical: bool) -> bool {
        self.buffer.push(OutboundFrame {
            frame: ServerFrame {
                destination: destination.to_string(),
                envelope,
            },
            critical,
        })
    }

    pub fn buffer(&self) -> &SendBuffer {
        &self.buffer
    }
}

/// Writer task: drains the buffer into the socket, enforcing the send
/// timeout. A send that exceeds the limit force-closes the connection
/// instead of blocking dispatchers.
pub async fn run_writer(
    conn: Arc<Connection>,
    mut ws_sender: SplitSink<WebSocketStreamType, WsMessage>,
    send_timeout: Duration,
    registry: Arc<Registry>,
) {
    while let Some(outbound) = conn.buffer.pop().await {
        let text = match serde_json::to_string(&outbound.frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, connection = %conn.id, "failed to serialize outbound frame");
                continue;
            }
        };

        match tokio::time::timeout(send_timeout, ws_sender.send(WsMessage::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, connection = %conn.id, "client gone, stopping writer");
                break;
            }
            Err(_) => {
                metrics::FORCED_DISCONNECTS_TOTAL.inc();
                tracing::warn!(
                    connection = %conn.id,
                    timeout_secs = send_timeout.as_secs(),
                    "send timeout exceeded, force-closing connection"
                );
                break;
            }
        }
    }

    registry.unregister(&conn);
    let _ = ws_sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use serde_json::json;

    fn data_frame(n: u64) -> OutboundFrame {
        OutboundFrame {
            frame: ServerFrame {
                destination: "/topic/test".into(),
                envelope: Envelope::new(EventType::ExchangeRateUpdate, json!({ "n": n })),
            },
            critical: false,
        }
    }

    fn critical_frame() -> OutboundFrame {
        OutboundFrame {
            frame: ServerFrame {
                destination: "/user/queue/errors".into(),
                envelope: Envelope::error(json!({})),
            },
            critical: true,
        }
    }

    #[test]
    fn overflow_evicts_oldest_non_critical() {
        let buffer = SendBuffer::new(2);
        assert!(buffer.push(data_frame(1)));
        assert!(buffer.push(data_frame(2)));
        assert!(buffer.push(data_frame(3)));
        assert_eq!(buffer.len(), 2);

        let first = futures::executor::block_on(buffer.pop()).unwrap();
        assert_eq!(first.frame.envelope.data["n"], 2);
    }

    #[test]
    fn overflow_never_evicts_critical() {
        let buffer = SendBuffer::new(2);
        assert!(buffer.push(critical_frame()));
        assert!(buffer.push(data_frame(1)));
        assert!(buffer.push(critical_frame()));
        assert_eq!(buffer.len(), 2);

        let first = futures::executor::block_on(buffer.pop()).unwrap();
        assert!(first.critical);
        let second = futures::executor::block_on(buffer.pop()).unwrap();
        assert!(second.critical);
    }

    #[test]
    fn critical_overflow_is_bounded() {
        let buffer = SendBuffer::new(2);
        for _ in 0..100 {
            assert!(buffer.push(critical_frame()));
        }
        assert_eq!(buffer.len(), 2 + CRITICAL_HEADROOM);

        // Data frames never displace critical ones at the cap.
        assert!(buffer.push(data_frame(1)));
        assert_eq!(buffer.len(), 2 + CRITICAL_HEADROOM);
    }

    #[tokio::test]
    async fn close_cancels_pending_pop() {
        let buffer = Arc::new(SendBuffer::new(4));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::task::yield_now().await;
        buffer.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn push_after_close_is_rejected() {
        let buffer = SendBuffer::new(4);
        buffer.close();
        assert!(!buffer.push(data_frame(1)));
    }
}
