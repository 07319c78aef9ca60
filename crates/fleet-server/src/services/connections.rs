//! Live agent control connections, keyed by host identity

use fleet_core::ControlMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Routes control messages to the agent connection(s) managing a host
#[derive(Clone, Default)]
pub struct ConnectionManager {
    /// Maps host_id to map of connection_id -> agent control connection
    host_connections:
        Arc<RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<ControlMessage>>>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent control connection for a host
    pub async fn register_host(
        &self,
        host_id: &str,
        connection_id: &str,
        tx: mpsc::UnboundedSender<ControlMessage>,
    ) {
        let mut conns = self.host_connections.write().await;
        conns
            .entry(host_id.to_string())
            .or_default()
            .insert(connection_id.to_string(), tx);
        info!(
            "Agent control connection registered: host={} (conn_id={})",
            host_id, connection_id
        );
    }

    /// Unregister an agent control connection
    pub async fn unregister_host(&self, host_id: &str, connection_id: &str) {
        let mut conns = self.host_connections.write().await;
        if let Some(host_conns) = conns.get_mut(host_id) {
            host_conns.remove(connection_id);
            if host_conns.is_empty() {
                conns.remove(host_id);
                info!("Host offline (all agent connections lost): {}", host_id);
            } else {
                info!(
                    "Agent connection removed: host={} (conn_id={}). Remaining connections: {}",
                    host_id,
                    connection_id,
                    host_conns.len()
                );
            }
        }
    }

    /// Check if a host has at least one live agent connection
    pub async fn has_host(&self, host_id: &str) -> bool {
        let conns = self.host_connections.read().await;
        conns
            .get(host_id)
            .map(|host_conns| host_conns.values().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Hand a message to any live connection of the host.
    ///
    /// Returns `false` when no connection accepted it.
    pub async fn send_to_host(&self, host_id: &str, msg: ControlMessage) -> bool {
        let conns = self.host_connections.read().await;
        let Some(host_conns) = conns.get(host_id) else {
            return false;
        };

        for (connection_id, tx) in host_conns {
            match tx.send(msg.clone()) {
                Ok(()) => return true,
                Err(_) => debug!(
                    "Agent connection {} for host {} is gone, trying next",
                    connection_id, host_id
                ),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_skips_dead_connections() {
        let manager = ConnectionManager::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();

        manager.register_host("host-1", "a", dead_tx).await;
        manager.register_host("host-1", "b", live_tx).await;

        assert!(manager.has_host("host-1").await);
        assert!(manager.send_to_host("host-1", ControlMessage::Pong).await);
        assert_eq!(live_rx.recv().await, Some(ControlMessage::Pong));

        manager.unregister_host("host-1", "b").await;
        assert!(!manager.has_host("host-1").await);
        assert!(!manager.send_to_host("host-1", ControlMessage::Pong).await);
        assert!(!manager.send_to_host("host-2", ControlMessage::Pong).await);
    }
}
