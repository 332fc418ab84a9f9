use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{Connection, ConnectionId};
use crate::envelope::Envelope;
use crate::metrics;

/// Process-scoped connection and subscription registry.
///
/// Three indexes, all sharded maps so connect, disconnect and dispatch on
/// unrelated keys never serialize: connection id -> connection, broadcast
/// destination -> subscriber set, principal name -> that principal's open
/// connections (one user, many devices).
///
/// Single-process scope by design; cross-replica visibility comes from the
/// relay, not from sharing this structure.
pub struct Registry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    topics: DashMap<String, HashSet<ConnectionId>>,
    principals: DashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            topics: DashMap::new(),
            principals: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        if let Some(name) = conn.principal_name() {
            self.principals
                .entry(name.to_string())
                .or_default()
                .insert(conn.id);
        }
        self.connections.insert(conn.id, conn);
        metrics::CONNECTIONS_TOTAL.inc();
        metrics::CONNECTIONS_ACTIVE.inc();
    }

    /// Remove a connection from every index and cancel its pending
    /// deliveries. Safe to call more than once.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        if self.connections.remove(&conn.id).is_none() {
            return;
        }
        metrics::CONNECTIONS_ACTIVE.dec();
        conn.buffer().close();

        let subscriptions: Vec<String> =
            conn.subscriptions.lock().unwrap().iter().cloned().collect();
        for dest in subscriptions {
            if let Some(mut subscribers) = self.topics.get_mut(&dest) {
                subscribers.remove(&conn.id);
            }
            self.topics.remove_if(&dest, |_, s| s.is_empty());
        }

        if let Some(name) = conn.principal_name() {
            let now_empty = match self.principals.get_mut(name) {
                Some(mut conns) => {
                    conns.remove(&conn.id);
                    conns.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.principals.remove_if(name, |_, conns| conns.is_empty());
            }
        }
    }

    pub fn subscribe(&self, conn: &Arc<Connection>, destination: &str) {
        // Record on the connection first so a concurrent unregister sees
        // the binding and cleans the topic index.
        conn.subscriptions
            .lock()
            .unwrap()
            .insert(destination.to_string());
        self.topics
            .entry(destination.to_string())
            .or_default()
            .insert(conn.id);

        // Subscribe racing unregister: if the connection vanished while we
        // were indexing, undo the entry instead of leaking it.
        if !self.connections.contains_key(&conn.id) {
            self.unsubscribe(conn, destination);
        }
    }

    pub fn unsubscribe(&self, conn: &Arc<Connection>, destination: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(destination) {
            subscribers.remove(&conn.id);
        }
        self.topics.remove_if(destination, |_, s| s.is_empty());
        conn.subscriptions.lock().unwrap().remove(destination);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Fan an envelope out to every subscriber of a broadcast destination.
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, destination: &str, envelope: &Envelope) -> usize {
        let subscribers: Vec<ConnectionId> = match self.topics.get(destination) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in subscribers {
            if let Some(conn) = self.connection(id) {
                if conn.enqueue(destination, envelope.clone(), false) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver an envelope to every open connection of one principal. A user
    /// with two devices receives it on both. Returns connections reached;
    /// zero means no transport delivery was attempted (the principal has no
    /// open connection here).
    pub fn send_to_user(
        &self,
        principal: &str,
        destination: &str,
        envelope: &Envelope,
        critical: bool,
    ) -> usize {
        let ids: Vec<ConnectionId> = match self.principals.get(principal) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in ids {
            if let Some(conn) = self.connection(id) {
                if conn.enqueue(destination, envelope.clone(), critical) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    fn topic_entries(&self) -> usize {
        self.topics.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::envelope::EventType;
    use serde_json::json;

    fn principal(name: &str) -> Option<Principal> {
        Some(Principal {
            name: name.to_string(),
            scopes: vec![],
        })
    }

    fn envelope() -> Envelope {
        Envelope::new(EventType::NotificationUpdate, json!({"id": 1}))
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let registry = Registry::new();
        let a = Connection::new(principal("alice"), 8);
        let b = Connection::new(principal("bob"), 8);
        registry.register(a.clone());
        registry.register(b.clone());
        registry.subscribe(&a, "/topic/exchange-rates");

        let delivered = registry.broadcast("/topic/exchange-rates", &envelope());
        assert_eq!(delivered, 1);
        assert_eq!(a.buffer().len(), 1);
        assert_eq!(b.buffer().len(), 0);
    }

    #[test]
    fn direct_reaches_all_devices_of_one_principal() {
        let registry = Registry::new();
        let phone = Connection::new(principal("alice"), 8);
        let laptop = Connection::new(principal("alice"), 8);
        let other = Connection::new(principal("bob"), 8);
        registry.register(phone.clone());
        registry.register(laptop.clone());
        registry.register(other.clone());

        let delivered = registry.send_to_user("alice", "/user/queue/notifications", &envelope(), false);
        assert_eq!(delivered, 2);
        assert_eq!(phone.buffer().len(), 1);
        assert_eq!(laptop.buffer().len(), 1);
        assert_eq!(other.buffer().len(), 0);
    }

    #[test]
    fn send_to_offline_user_attempts_nothing() {
        let registry = Registry::new();
        assert_eq!(
            registry.send_to_user("nobody", "/user/queue/notifications", &envelope(), false),
            0
        );
    }

    #[test]
    fn empty_topic_sets_are_swept() {
        let registry = Registry::new();
        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());

        registry.subscribe(&conn, "/topic/exchange-rates");
        assert_eq!(registry.topic_entries(), 1);

        registry.unsubscribe(&conn, "/topic/exchange-rates");
        assert_eq!(registry.topic_entries(), 0);

        registry.subscribe(&conn, "/topic/promotions");
        registry.unregister(&conn);
        assert_eq!(registry.topic_entries(), 0);
    }

    #[test]
    fn subscribe_after_unregister_leaves_no_stale_entry() {
        let registry = Registry::new();
        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());
        registry.unregister(&conn);

        registry.subscribe(&conn, "/topic/exchange-rates");
        assert_eq!(registry.topic_entries(), 0);
        assert_eq!(registry.broadcast("/topic/exchange-rates", &envelope()), 0);
    }

    #[test]
    fn unregister_releases_subscriptions_and_cancels_deliveries() {
        let registry = Registry::new();
        let conn = Connection::new(principal("alice"), 8);
        registry.register(conn.clone());
        registry.subscribe(&conn, "/topic/promotions");

        registry.unregister(&conn);

        assert_eq!(registry.broadcast("/topic/promotions", &envelope()), 0);
        assert_eq!(
            registry.send_to_user("alice", "/user/queue/chat", &envelope(), false),
            0
        );
        assert!(conn.buffer().is_closed());
    }
}
