//! OCPP 1.6J connection to one charge point
//!
//! Implements the WebSocket link to a single charge point. Handles:
//! - WebSocket connection with the `ocpp1.6` subprotocol and bearer auth
//! - Request/response correlation with per-call deadlines
//! - Answering charge-point-initiated CALLs and publishing them as events
//! - Heartbeat maintenance
//! - Automatic reconnection with a fixed backoff and attempt budget
//!
//! All state of a connection (lifecycle state, pending calls, transport handle,
//! timer tasks) sits behind one connection-scoped lock that is never held across
//! an `.await`. Every transport gets a generation number; timers and transport
//! tasks check it before touching state, so nothing from an abandoned transport
//! can act after a disconnect or reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::events::{ConnectionEvent, EventBus};
use super::messages::*;
use super::state::{ConnectionState, Transition};
use super::transaction::TransactionIds;
use super::types::*;
use crate::config::OcppConfig;

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Upper bound for a single inbound message
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound CALL awaiting its CALLRESULT/CALLERROR
struct PendingCall {
    action: String,
    deadline: Instant,
    response_tx: oneshot::Sender<Result<Value, OcppError>>,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    pending: HashMap<String, PendingCall>,
    reconnect_attempts: u32,
    /// Reader, heartbeat and reconnect tasks; the writer drains on its own
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    charge_point_id: String,
    config: OcppConfig,
    events: EventBus,
    transaction_ids: TransactionIds,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Shared {
    /// Apply a state transition and publish it; caller holds the lock
    fn transition(&self, inner: &mut Inner, transition: Transition) -> bool {
        let Some(next) = inner.state.apply(transition) else {
            warn!(
                "Ignoring {:?} for {} in state {}",
                transition, self.charge_point_id, inner.state
            );
            return false;
        };

        if next != inner.state {
            debug!("{}: {} -> {}", self.charge_point_id, inner.state, next);
            inner.state = next;
            self.state_tx.send_replace(next);
            self.events.emit(ConnectionEvent::StateChanged {
                charge_point_id: self.charge_point_id.clone(),
                state: next,
            });
        }
        true
    }

    /// Fail every outstanding call with `ConnectionClosed`
    fn reject_all(&self, inner: &mut Inner) {
        let now = Instant::now();
        for (message_id, call) in inner.pending.drain() {
            debug!(
                "Rejecting {} {} on {} ({:?} before its deadline)",
                call.action,
                message_id,
                self.charge_point_id,
                call.deadline.saturating_duration_since(now)
            );
            let _ = call.response_tx.send(Err(OcppError::ConnectionClosed));
        }
    }

    fn emit_error(&self, message: String, fatal: bool) {
        self.events.emit(ConnectionEvent::Error {
            charge_point_id: self.charge_point_id.clone(),
            message,
            fatal,
        });
    }
}

fn abort_tasks(inner: &mut Inner) {
    for task in inner.tasks.drain(..) {
        task.abort();
    }
}

fn writer_open(inner: &Inner) -> bool {
    inner
        .outgoing
        .as_ref()
        .is_some_and(|outgoing| !outgoing.is_closed())
}

/// Unregisters a pending call whose caller stopped waiting before it resolved
struct PendingGuard<'a> {
    shared: &'a Shared,
    message_id: &'a str,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.inner.lock().pending.remove(self.message_id).is_some() {
            debug!("Caller for {} went away, call abandoned", self.message_id);
        }
    }
}

/// Handle to the link with one charge point
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection with its own event bus and transaction id source
    pub fn new(charge_point_id: impl Into<String>, config: OcppConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self::with_shared(charge_point_id, config, events, TransactionIds::new())
    }

    /// Create a connection that publishes on an existing bus and shares an id source
    pub fn with_shared(
        charge_point_id: impl Into<String>,
        config: OcppConfig,
        events: EventBus,
        transaction_ids: TransactionIds,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                charge_point_id: charge_point_id.into(),
                config,
                events,
                transaction_ids,
                state_tx,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    outgoing: None,
                    pending: HashMap::new(),
                    reconnect_attempts: 0,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn charge_point_id(&self) -> &str {
        &self.shared.charge_point_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Watch lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to this connection's events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Connected and the transport is still accepting frames
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.state == ConnectionState::Connected && writer_open(&inner)
    }

    /// Number of outbound calls still awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Automatic reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().reconnect_attempts
    }

    /// Open the transport
    ///
    /// If an open is already in flight this waits for its outcome instead of
    /// opening a second transport; if already connected it returns at once.
    pub async fn connect(&self) -> Result<(), OcppError> {
        let url = self.shared.config.connection_url(&self.shared.charge_point_id)?;

        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Connected && !writer_open(&inner) {
                // Writer is gone but the loss has not been processed yet
                warn!("Transport to {} no longer writable, replacing it", self.charge_point_id());
                inner.generation += 1;
                inner.outgoing = None;
                abort_tasks(&mut inner);
                self.shared.reject_all(&mut inner);
                self.shared.emit_error("transport writer closed".to_string(), false);
                self.shared.transition(&mut inner, Transition::Lost);
            }

            if inner.state.is_active() {
                None
            } else {
                // Supersedes a pending reconnect backoff, if any
                abort_tasks(&mut inner);
                inner.generation += 1;
                self.shared.transition(&mut inner, Transition::Connect);
                Some(inner.generation)
            }
        };

        let Some(generation) = generation else {
            return self.wait_for_open().await;
        };

        info!("Connecting to charge point {} at {}", self.charge_point_id(), url);

        match self.open_transport(&url).await {
            Ok(ws) => self.install(ws, generation),
            Err(e) => {
                error!("Connection to {} failed: {}", self.charge_point_id(), e);
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    self.shared.transition(&mut inner, Transition::OpenFailed);
                    self.shared.emit_error(e.to_string(), true);
                }
                Err(e)
            }
        }
    }

    /// Close the transport and stop all automatic activity
    ///
    /// Idempotent. Outstanding calls fail with `ConnectionClosed`, the heartbeat
    /// and any reconnect backoff are cancelled.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        inner.generation += 1;
        abort_tasks(&mut inner);

        if let Some(outgoing) = inner.outgoing.take() {
            // The writer sends the close frame, then shuts the sink
            let _ = outgoing.send(Message::Close(None));
        }

        shared.reject_all(&mut inner);
        inner.reconnect_attempts = 0;

        if inner.state != ConnectionState::Disconnected {
            shared.transition(&mut inner, Transition::Disconnect);
            shared.events.emit(ConnectionEvent::Disconnected {
                charge_point_id: shared.charge_point_id.clone(),
            });
            info!("Disconnected from {}", shared.charge_point_id);
        }
    }

    /// Ask the charge point to start a transaction
    pub async fn remote_start_transaction(
        &self,
        connector_id: i32,
        id_tag: &str,
    ) -> Result<RemoteStartTransactionResponse, OcppError> {
        let call = Call::remote_start_transaction(connector_id, id_tag)?;
        let payload = self.send_call(call).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Ask the charge point to stop a transaction
    pub async fn remote_stop_transaction(
        &self,
        transaction_id: i32,
    ) -> Result<RemoteStopTransactionResponse, OcppError> {
        let call = Call::remote_stop_transaction(transaction_id)?;
        let payload = self.send_call(call).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Send a CALL and wait for the correlated response payload
    ///
    /// Registration of the pending call and the hand-off to the transport
    /// happen under one lock acquisition; if the hand-off fails nothing stays
    /// registered. Dropping the returned future unregisters the call.
    pub async fn send_call(&self, call: Call) -> Result<Value, OcppError> {
        let text = call.to_text()?;
        let (response_tx, mut response_rx) = oneshot::channel();
        let deadline = Instant::now() + self.shared.config.request_timeout;

        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Connected {
                return Err(OcppError::NotConnected);
            }
            let Some(outgoing) = inner.outgoing.clone() else {
                return Err(OcppError::NotConnected);
            };

            inner.pending.insert(
                call.message_id.clone(),
                PendingCall {
                    action: call.action.clone(),
                    deadline,
                    response_tx,
                },
            );

            debug!("Sending to {}: {}", self.charge_point_id(), text);

            if outgoing.send(Message::Text(text.into())).is_err() {
                inner.pending.remove(&call.message_id);
                return Err(OcppError::SendFailed);
            }
        }

        let guard = PendingGuard {
            shared: &*self.shared,
            message_id: &call.message_id,
            armed: true,
        };

        let result = match tokio::time::timeout_at(deadline, &mut response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                let expired = self.shared.inner.lock().pending.remove(&call.message_id);
                if expired.is_some() {
                    warn!(
                        "{} {} to {} timed out",
                        call.action,
                        call.message_id,
                        self.charge_point_id()
                    );
                    Err(OcppError::Timeout)
                } else {
                    // Resolved in the same instant the deadline fired
                    response_rx
                        .try_recv()
                        .unwrap_or(Err(OcppError::ConnectionClosed))
                }
            }
        };

        guard.disarm();
        result
    }

    /// Process one inbound text frame, returning the reply to send, if any
    pub fn handle_frame(&self, text: &str) -> Option<OcppMessage> {
        let message = match OcppMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Discarding malformed frame from {}: {}",
                    self.charge_point_id(),
                    e
                );
                return None;
            }
        };

        match message {
            OcppMessage::CallResult(result) => {
                self.resolve(&result.message_id, Ok(result.payload));
                None
            }
            OcppMessage::CallError(error) => {
                let message_id = error.message_id.clone();
                self.resolve(&message_id, Err(error.into_error()));
                None
            }
            OcppMessage::Call(call) => Some(self.handle_call(call)),
        }
    }

    fn resolve(&self, message_id: &str, result: Result<Value, OcppError>) {
        let pending = self.shared.inner.lock().pending.remove(message_id);

        match pending {
            Some(call) => {
                debug!("Response to {} {} received", call.action, message_id);
                if call.response_tx.send(result).is_err() {
                    debug!("Caller for {} went away before the response", message_id);
                }
            }
            None => warn!(
                "Discarding response from {} for unknown or expired message {}",
                self.charge_point_id(),
                message_id
            ),
        }
    }

    fn handle_call(&self, call: Call) -> OcppMessage {
        let shared = &self.shared;
        let charge_point_id = shared.charge_point_id.clone();
        let message_id = call.message_id.clone();

        let reply = match call.known_action() {
            Some(Action::StatusNotification) => {
                shared.events.emit(ConnectionEvent::StatusNotification {
                    charge_point_id,
                    payload: call.payload,
                });
                Ok(CallResult::empty(message_id.clone()))
            }
            Some(Action::MeterValues) => {
                shared.events.emit(ConnectionEvent::MeterValues {
                    charge_point_id,
                    payload: call.payload,
                });
                Ok(CallResult::empty(message_id.clone()))
            }
            Some(Action::StartTransaction) => {
                let transaction_id = shared.transaction_ids.next();
                info!("Transaction {} started on {}", transaction_id, charge_point_id);
                shared.events.emit(ConnectionEvent::StartTransaction {
                    charge_point_id,
                    transaction_id,
                    payload: call.payload,
                });
                CallResult::start_transaction(message_id.clone(), transaction_id)
            }
            Some(Action::StopTransaction) => {
                shared.events.emit(ConnectionEvent::StopTransaction {
                    charge_point_id,
                    payload: call.payload,
                });
                CallResult::stop_transaction(message_id.clone())
            }
            Some(Action::Heartbeat) => CallResult::heartbeat(message_id.clone()),
            Some(Action::RemoteStartTransaction | Action::RemoteStopTransaction) | None => {
                warn!(
                    "Charge point {} sent unsupported action {}",
                    charge_point_id, call.action
                );
                return OcppMessage::CallError(CallError::not_implemented(
                    message_id,
                    &call.action,
                ));
            }
        };

        match reply {
            Ok(result) => OcppMessage::CallResult(result),
            Err(e) => {
                error!("Failed to build reply to {}: {}", call.action, e);
                OcppMessage::CallError(CallError::new(
                    message_id,
                    ErrorCode::InternalError,
                    e.to_string(),
                ))
            }
        }
    }

    /// Queue a reply frame on the current transport
    fn send_reply(&self, reply: &OcppMessage) {
        let text = match reply.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize reply {}: {}", reply.message_id(), e);
                return;
            }
        };

        debug!("Replying to {}: {}", self.charge_point_id(), text);

        let inner = self.shared.inner.lock();
        let sent = inner
            .outgoing
            .as_ref()
            .is_some_and(|outgoing| outgoing.send(Message::Text(text.into())).is_ok());
        if !sent {
            warn!(
                "No transport to {} for reply {}",
                self.charge_point_id(),
                reply.message_id()
            );
        }
    }

    async fn wait_for_open(&self) -> Result<(), OcppError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let state = *state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| OcppError::ConnectionClosed)?;

        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(OcppError::NotConnected)
        }
    }

    async fn open_transport(&self, url: &str) -> Result<WsStream, OcppError> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        if let Some(token) = &self.shared.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                OcppError::Config("auth token is not a valid header value".to_string())
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            max_frame_size: Some(MAX_MESSAGE_SIZE),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "Charge point {} did not accept the {} subprotocol, got: {:?}",
                self.charge_point_id(),
                OCPP_SUBPROTOCOL,
                accepted_protocol
            );
        }

        Ok(ws_stream)
    }

    /// Adopt a freshly opened transport if its attempt is still current
    fn install(&self, ws: WsStream, generation: u64) -> Result<(), OcppError> {
        let (sink, stream) = ws.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            debug!(
                "Dropping transport to {} opened for an abandoned attempt",
                self.charge_point_id()
            );
            return Err(OcppError::ConnectionClosed);
        }

        inner.outgoing = Some(outgoing_tx);
        inner.reconnect_attempts = 0;
        self.shared.transition(&mut inner, Transition::Opened);

        tokio::spawn(self.clone().write_loop(sink, outgoing_rx, generation));
        inner
            .tasks
            .push(tokio::spawn(self.clone().read_loop(stream, generation)));
        inner
            .tasks
            .push(tokio::spawn(self.clone().heartbeat_loop(generation)));

        self.shared.events.emit(ConnectionEvent::Connected {
            charge_point_id: self.shared.charge_point_id.clone(),
        });
        info!("WebSocket connected to {}", self.charge_point_id());

        Ok(())
    }

    async fn write_loop(
        self,
        mut sink: SplitSink<WsStream, Message>,
        mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
        generation: u64,
    ) {
        while let Some(message) = outgoing_rx.recv().await {
            let closing = matches!(message, Message::Close(_));

            if let Err(e) = sink.send(message).await {
                error!("Failed to send to {}: {}", self.charge_point_id(), e);
                self.transport_lost(generation, format!("send failed: {}", e));
                break;
            }
            if closing {
                break;
            }
        }

        let _ = sink.close().await;
    }

    async fn read_loop(self, mut stream: SplitStream<WsStream>, generation: u64) {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received from {}: {}", self.charge_point_id(), text);
                    if let Some(reply) = self.handle_frame(text.as_str()) {
                        self.send_reply(&reply);
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", self.charge_point_id());
                }
                Some(Ok(Message::Close(frame))) => {
                    break format!("closed by charge point ({:?})", frame);
                }
                // Ping/pong handled by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("WebSocket error: {}", e),
                None => break "stream ended".to_string(),
            }
        };

        self.transport_lost(generation, reason);
    }

    async fn heartbeat_loop(self, generation: u64) {
        let period = self.shared.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.shared.inner.lock().generation != generation {
                break;
            }

            let result = match Call::heartbeat() {
                Ok(call) => self.send_call(call).await,
                Err(e) => Err(e),
            };

            // Transport close, not a failed heartbeat, drives reconnection
            match result {
                Ok(payload) => debug!("Heartbeat acknowledged by {}: {}", self.charge_point_id(), payload),
                Err(e) => warn!("Heartbeat to {} failed: {}", self.charge_point_id(), e),
            }
        }
    }

    /// Tear down a transport that closed or failed without a disconnect request
    fn transport_lost(&self, generation: u64, reason: String) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            return;
        }

        warn!("Connection to {} lost: {}", shared.charge_point_id, reason);

        inner.generation += 1;
        inner.outgoing = None;
        abort_tasks(&mut inner);
        shared.reject_all(&mut inner);
        shared.emit_error(reason, false);

        self.schedule_reconnect(&mut inner);
    }

    /// Start the next backoff, or give up when the budget is spent
    fn schedule_reconnect(&self, inner: &mut Inner) {
        let shared = &self.shared;
        let max_attempts = shared.config.max_reconnect_attempts;
        inner.tasks.retain(|task| !task.is_finished());

        if inner.reconnect_attempts >= max_attempts {
            error!(
                "Giving up on {} after {} reconnect attempts",
                shared.charge_point_id, inner.reconnect_attempts
            );
            shared.transition(inner, Transition::RetriesExhausted);
            shared.emit_error(
                format!("reconnect failed after {} attempts", inner.reconnect_attempts),
                true,
            );
            return;
        }

        inner.reconnect_attempts += 1;
        shared.transition(inner, Transition::Lost);

        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            shared.charge_point_id, shared.config.reconnect_delay, inner.reconnect_attempts, max_attempts
        );

        let task = tokio::spawn(self.clone().reconnect(inner.generation));
        inner.tasks.push(task);
    }

    async fn reconnect(self, generation: u64) {
        tokio::time::sleep(self.shared.config.reconnect_delay).await;

        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            self.shared.transition(&mut inner, Transition::Connect);
        }

        let opened = match self.shared.config.connection_url(self.charge_point_id()) {
            Ok(url) => self.open_transport(&url).await,
            Err(e) => Err(e),
        };

        match opened {
            Ok(ws) => {
                if let Err(e) = self.install(ws, generation) {
                    debug!("Reconnect to {} superseded: {}", self.charge_point_id(), e);
                }
            }
            Err(e) => {
                let mut inner = self.shared.inner.lock();
                if inner.generation != generation {
                    return;
                }
                warn!("Reconnect to {} failed: {}", self.charge_point_id(), e);
                inner.generation += 1;
                self.schedule_reconnect(&mut inner);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("charge_point_id", &self.shared.charge_point_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
impl Connection {
    /// Mark connected with a channel standing in for the WebSocket writer
    fn attach_test_transport(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.shared.inner.lock();
        inner.outgoing = Some(tx);
        inner.state = ConnectionState::Connected;
        rx
    }
}
