//! OCPP 1.6J protocol implementation
//!
//! This module provides the protocol layer of the link:
//! - `types`: OCPP 1.6 payloads and enumerations
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `state`: Connection state machine
//! - `events`: Events published to collaborators
//! - `transaction`: Transaction id allocation
//! - `connection`: WebSocket link to one charge point

pub mod types;
pub mod messages;
pub mod state;
pub mod events;
pub mod transaction;
pub mod connection;

pub use types::*;
pub use messages::*;
pub use state::{ConnectionState, Transition};
pub use events::{ConnectionEvent, EventBus};
pub use transaction::TransactionIds;
pub use connection::{Connection, OCPP_SUBPROTOCOL};
