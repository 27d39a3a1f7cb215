//! Worker node registry
//!
//! Tracks `node`-role connections separately from interactive clients:
//! connection id to node id, plus the events each node subscribed to.
//! Unregistering always drops the node's subscriptions with it, so a lost
//! connection can never leave orphaned subscriptions behind.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Descriptive fields a node supplies in its `connect` request.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
}

/// A registered node as exposed through `node.list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub subscriptions: BTreeSet<String>,
    pub connected_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Default)]
struct NodeTable {
    nodes_by_id: HashMap<String, NodeSession>,
    nodes_by_conn: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    inner: Mutex<NodeTable>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` on `conn_id` with an initial subscription set.
    ///
    /// A node id re-registering from a new connection takes over the entry;
    /// the displaced connection id is returned so the caller can log it.
    pub fn register(
        &self,
        conn_id: &str,
        node_id: &str,
        info: NodeInfo,
        subscriptions: impl IntoIterator<Item = String>,
        now_ms: u64,
    ) -> Option<String> {
        let mut table = self.inner.lock();

        if let Some(previous) = table.nodes_by_conn.remove(conn_id) {
            table.nodes_by_id.remove(&previous);
        }
        let displaced = table
            .nodes_by_id
            .remove(node_id)
            .map(|session| session.conn_id);
        if let Some(ref old_conn) = displaced {
            table.nodes_by_conn.remove(old_conn);
        }

        table.nodes_by_id.insert(
            node_id.to_string(),
            NodeSession {
                node_id: node_id.to_string(),
                conn_id: conn_id.to_string(),
                display_name: info.display_name,
                platform: info.platform,
                version: info.version,
                subscriptions: normalize_events(subscriptions),
                connected_at_ms: now_ms,
                last_seen_ms: now_ms,
            },
        );
        table
            .nodes_by_conn
            .insert(conn_id.to_string(), node_id.to_string());

        displaced.filter(|old| old != conn_id)
    }

    /// Remove whatever node is bound to `conn_id`, cancelling all of its
    /// subscriptions. Returns the node id, or `None` if nothing was bound
    /// (already unregistered, or displaced by a newer connection).
    pub fn unregister(&self, conn_id: &str) -> Option<String> {
        let mut table = self.inner.lock();
        let node_id = table.nodes_by_conn.remove(conn_id)?;
        if let Some(session) = table.nodes_by_id.get_mut(&node_id) {
            session.subscriptions.clear();
        }
        table.nodes_by_id.remove(&node_id);
        Some(node_id)
    }

    /// Cancel every subscription held by `node_id`. Returns how many were
    /// cleared.
    pub fn unsubscribe_all(&self, node_id: &str) -> usize {
        let mut table = self.inner.lock();
        match table.nodes_by_id.get_mut(node_id) {
            Some(session) => {
                let cleared = session.subscriptions.len();
                session.subscriptions.clear();
                cleared
            }
            None => 0,
        }
    }

    /// Add subscriptions. Returns the resulting set, or `None` if the node is
    /// not registered.
    pub fn subscribe(
        &self,
        node_id: &str,
        events: impl IntoIterator<Item = String>,
    ) -> Option<Vec<String>> {
        let mut table = self.inner.lock();
        let session = table.nodes_by_id.get_mut(node_id)?;
        session.subscriptions.extend(normalize_events(events));
        Some(session.subscriptions.iter().cloned().collect())
    }

    /// Remove subscriptions. Returns the resulting set, or `None` if the node
    /// is not registered.
    pub fn unsubscribe(
        &self,
        node_id: &str,
        events: impl IntoIterator<Item = String>,
    ) -> Option<Vec<String>> {
        let mut table = self.inner.lock();
        let session = table.nodes_by_id.get_mut(node_id)?;
        for event in normalize_events(events) {
            session.subscriptions.remove(&event);
        }
        Some(session.subscriptions.iter().cloned().collect())
    }

    /// Whether the node currently bound to `conn_id` subscribed to `event`.
    pub fn conn_subscribed(&self, conn_id: &str, event: &str) -> bool {
        let table = self.inner.lock();
        table
            .nodes_by_conn
            .get(conn_id)
            .and_then(|node_id| table.nodes_by_id.get(node_id))
            .is_some_and(|session| session.subscriptions.contains(event))
    }

    pub fn subscriptions(&self, node_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .nodes_by_id
            .get(node_id)
            .map(|session| session.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record liveness for `node_id`.
    pub fn touch(&self, node_id: &str, now_ms: u64) -> bool {
        match self.inner.lock().nodes_by_id.get_mut(node_id) {
            Some(session) => {
                session.last_seen_ms = now_ms;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.inner.lock().nodes_by_id.get(node_id).cloned()
    }

    pub fn node_for_conn(&self, conn_id: &str) -> Option<String> {
        self.inner.lock().nodes_by_conn.get(conn_id).cloned()
    }

    /// All registered nodes, ordered by node id.
    pub fn list(&self) -> Vec<NodeSession> {
        let mut nodes: Vec<_> = self.inner.lock().nodes_by_id.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_events(events: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    events
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn subs(events: &[&str]) -> Vec<String> {
        events.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = NodeRegistry::new();
        let displaced = registry.register(
            "conn-1",
            "node-a",
            NodeInfo {
                display_name: Some("builder".to_string()),
                ..Default::default()
            },
            subs(&["tick", " presence ", ""]),
            1_000,
        );
        assert!(displaced.is_none());
        assert_eq!(registry.node_for_conn("conn-1").as_deref(), Some("node-a"));
        assert_eq!(registry.subscriptions("node-a"), subs(&["presence", "tick"]));
        assert!(registry.conn_subscribed("conn-1", "tick"));
        assert!(!registry.conn_subscribed("conn-1", "health"));
        assert_eq!(registry.get("node-a").unwrap().display_name.as_deref(), Some("builder"));
    }

    #[test]
    fn test_unregister_is_idempotent_and_cancels_subscriptions() {
        let registry = NodeRegistry::new();
        registry.register("conn-1", "node-a", NodeInfo::default(), subs(&["tick"]), 0);

        assert_eq!(registry.unregister("conn-1").as_deref(), Some("node-a"));
        assert!(registry.unregister("conn-1").is_none());
        assert!(registry.subscriptions("node-a").is_empty());
        assert!(!registry.conn_subscribed("conn-1", "tick"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_displaces_old_connection() {
        let registry = NodeRegistry::new();
        registry.register("conn-1", "node-a", NodeInfo::default(), subs(&["tick"]), 0);
        let displaced =
            registry.register("conn-2", "node-a", NodeInfo::default(), subs(&["health"]), 5);
        assert_eq!(displaced.as_deref(), Some("conn-1"));

        // Teardown of the displaced connection must not remove the new binding.
        assert!(registry.unregister("conn-1").is_none());
        assert_eq!(registry.node_for_conn("conn-2").as_deref(), Some("node-a"));
        assert_eq!(registry.subscriptions("node-a"), subs(&["health"]));
    }

    #[test]
    fn test_subscribe_unsubscribe_and_unsubscribe_all() {
        let registry = NodeRegistry::new();
        registry.register("conn-1", "node-a", NodeInfo::default(), Vec::new(), 0);

        assert_eq!(
            registry.subscribe("node-a", subs(&["a", "b", "c"])),
            Some(subs(&["a", "b", "c"]))
        );
        assert_eq!(
            registry.unsubscribe("node-a", subs(&["b"])),
            Some(subs(&["a", "c"]))
        );
        assert_eq!(registry.unsubscribe_all("node-a"), 2);
        assert_eq!(registry.unsubscribe_all("node-a"), 0);
        assert!(registry.subscribe("missing", subs(&["a"])).is_none());
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let registry = NodeRegistry::new();
        registry.register("conn-1", "node-a", NodeInfo::default(), Vec::new(), 10);
        assert!(registry.touch("node-a", 99));
        assert_eq!(registry.get("node-a").unwrap().last_seen_ms, 99);
        assert!(!registry.touch("node-b", 99));
    }

    #[test]
    fn test_concurrent_distinct_nodes_no_lost_updates() {
        let registry = Arc::new(NodeRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let conn = format!("conn-{i}");
                    let node = format!("node-{i}");
                    registry.register(&conn, &node, NodeInfo::default(), subs(&["tick"]), 0);
                    // Odd workers leave again.
                    if i % 2 == 1 {
                        assert_eq!(registry.unregister(&conn), Some(node));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let remaining: Vec<String> = registry.list().into_iter().map(|n| n.node_id).collect();
        let mut expected: Vec<String> = (0..16)
            .filter(|i| i % 2 == 0)
            .map(|i| format!("node-{i}"))
            .collect();
        expected.sort();
        assert_eq!(remaining, expected);
    }
}
