//! # Child Registry
//!
//! The concurrency-safe mapping from node descriptor to active connection.
//! The node runtime owns one registry and uses it to route `Child` sub-runs;
//! the launch path is serialized under the registry lock so concurrent
//! references to the same node produce exactly one process.

use crate::conn::Conn;
use crate::launcher;
use crate::node::{EventTx, NodeId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Registry of launched child nodes. Cloneable; clones share the map.
#[derive(Clone)]
pub struct Children {
    inner: Arc<Mutex<HashMap<NodeId, Conn>>>,
    events: EventTx,
}

impl Children {
    pub fn new(events: EventTx) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// The connection to `node`, launching the node first if it is not yet
    /// running.
    pub async fn launch(&self, node: &NodeId) -> Result<Conn> {
        let mut map = self.inner.lock().await;
        if let Some(conn) = map.get(node) {
            return Ok(conn.clone());
        }
        node.validate()?;
        debug!(node = %node, "launching");
        let (transport, closers) = launcher::launch(node).await?;
        let conn = Conn::start(transport, node.clone(), self.events.clone(), closers);
        map.insert(node.clone(), conn.clone());
        Ok(conn)
    }

    /// The connection to `node`, if it is running.
    pub async fn get(&self, node: &NodeId) -> Option<Conn> {
        self.inner.lock().await.get(node).cloned()
    }

    /// Remove `node` from the registry (its connection has terminated).
    pub async fn delete(&self, node: &NodeId) {
        self.inner.lock().await.remove(node);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Cancel every child connection: each child drains and emits its
    /// terminal `canceled`, after which `ConnDone` removes it.
    pub async fn cancel_all(&self) {
        let conns: Vec<Conn> = self.inner.lock().await.values().cloned().collect();
        for conn in conns {
            conn.cancel();
        }
    }

    /// Force-close every child connection, bypassing the drain. Used when
    /// the post-Cancel grace period expires.
    pub async fn close_all(&self) {
        let conns: Vec<Conn> = self.inner.lock().await.values().cloned().collect();
        for conn in conns {
            conn.close();
        }
    }
}
