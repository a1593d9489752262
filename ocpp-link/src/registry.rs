//! Charge point connection registry
//!
//! Owns the `charge point id → Connection` map. All connections created here
//! publish on one event bus and draw transaction ids from one source.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::OcppConfig;
use crate::ocpp::{
    Connection, ConnectionEvent, EventBus, OcppError, RemoteStartTransactionResponse,
    RemoteStopTransactionResponse, TransactionIds,
};

/// Registry of charge point connections
pub struct ConnectionRegistry {
    config: OcppConfig,
    events: EventBus,
    transaction_ids: TransactionIds,
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new(config: OcppConfig) -> Self {
        let events = EventBus::new(config.event_capacity);

        Self {
            config,
            events,
            transaction_ids: TransactionIds::new(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to events from every connection in the registry
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Existing connection for the id, or a new one that is not yet connected
    pub async fn get_connection(&self, charge_point_id: &str) -> Connection {
        if let Some(conn) = self.connections.read().await.get(charge_point_id) {
            return conn.clone();
        }

        let mut connections = self.connections.write().await;
        connections
            .entry(charge_point_id.to_string())
            .or_insert_with(|| {
                debug!("Registering charge point {}", charge_point_id);
                Connection::with_shared(
                    charge_point_id,
                    self.config.clone(),
                    self.events.clone(),
                    self.transaction_ids.clone(),
                )
            })
            .clone()
    }

    /// Get the connection and open it unless it is already connected
    pub async fn connect(&self, charge_point_id: &str) -> Result<Connection, OcppError> {
        let conn = self.get_connection(charge_point_id).await;
        if !conn.is_connected() {
            conn.connect().await?;
        }
        Ok(conn)
    }

    /// Connect if needed, then send RemoteStartTransaction
    pub async fn remote_start_transaction(
        &self,
        charge_point_id: &str,
        connector_id: i32,
        id_tag: &str,
    ) -> Result<RemoteStartTransactionResponse, OcppError> {
        let conn = self.connect(charge_point_id).await?;
        conn.remote_start_transaction(connector_id, id_tag).await
    }

    /// Connect if needed, then send RemoteStopTransaction
    pub async fn remote_stop_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> Result<RemoteStopTransactionResponse, OcppError> {
        let conn = self.connect(charge_point_id).await?;
        conn.remote_stop_transaction(transaction_id).await
    }

    /// Disconnect and forget one charge point; no-op for unknown ids
    pub async fn disconnect(&self, charge_point_id: &str) {
        let removed = self.connections.write().await.remove(charge_point_id);
        if let Some(conn) = removed {
            conn.disconnect();
        }
    }

    /// Disconnect and forget every charge point
    pub async fn disconnect_all(&self) {
        let drained: Vec<Connection> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };

        if !drained.is_empty() {
            info!("Disconnecting {} charge points", drained.len());
        }
        for conn in drained {
            conn.disconnect();
        }
    }

    /// Ids of charge points currently connected
    pub async fn connected_ids(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut ids: Vec<String> = connections
            .iter()
            .filter(|(_, conn)| conn.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered charge points, connected or not
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
