//! # OCPP Link
//!
//! OCPP 1.6J link for a charging backend that talks to charge points over
//! WebSocket.
//!
//! The backend commands charge points (RemoteStartTransaction,
//! RemoteStopTransaction) and receives their notifications (StatusNotification,
//! MeterValues, StartTransaction, StopTransaction) as events.
//!
//! ## Architecture
//!
//! ```text
//!  Backend services
//!       │ remote_start / remote_stop        ▲ ConnectionEvent
//!       ▼                                   │ (broadcast)
//! ┌─────────────────────────────────────────┴──┐
//! │            ConnectionRegistry               │
//! │   "CP1" ─► Connection   "CP2" ─► Connection │
//! └──────────────┬──────────────────────────────┘
//!                │ WebSocket, subprotocol ocpp1.6
//!                ▼
//!          {ws_base_url}/{chargePointId}
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_link::{ConnectionRegistry, OcppConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ConnectionRegistry::new(OcppConfig::from_env());
//!     let mut events = registry.subscribe();
//!
//!     let response = registry.remote_start_transaction("CP1", 1, "TAG123").await?;
//!     println!("RemoteStartTransaction: {:?}", response.status);
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{} from {}", event.event_type(), event.charge_point_id());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ocpp;
pub mod registry;

pub use config::OcppConfig;
pub use registry::ConnectionRegistry;

// Re-export key types
pub use ocpp::{
    Action, Call, CallError, CallResult, Connection, ConnectionEvent, ConnectionState,
    ErrorCode, OcppError, OcppMessage, RemoteStartStopStatus, TransactionIds,
};
