//! The connection loop and the session object that owns all RPC state.
//!
//! A [`Session`] holds the exposure registry, the pending-call maps, the
//! functions the peer has announced, and the single open connection. It is
//! shared behind an `Arc`; [`Session::serve`] runs one connection until its
//! inbound stream ends.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::{PendingCall, PendingCalls};
use crate::errors::{EelError, HandlerError, Result};
use crate::executor;
use crate::ids::{CallId, ConnectionId};
use crate::message::{self, Command, Message, Response};
use crate::registry::{self, ExposedFunction, ExposureRegistry};

/// Tunables for outbound calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How many times a polling call checks for its Response.
    pub poll_attempts: u32,
    /// Longest wait between two checks, in milliseconds.
    pub poll_interval_ms: u64,
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10_000,
            poll_interval_ms: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Clone)]
struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection {
    fn send(&self, message: &Message) -> Result<()> {
        let text = message::encode(message)?;
        debug!(connection_id = %self.id, message = %text, "sending message");
        self.outbound
            .send(text)
            .map_err(|_| EelError::ConnectionClosed)
    }
}

/// RPC endpoint for one host process talking to one connected peer.
pub struct Session {
    config: SessionConfig,
    registry: ExposureRegistry,
    pending: Arc<PendingCalls>,
    peer_functions: RwLock<Vec<String>>,
    connection: RwLock<Option<Connection>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry: ExposureRegistry::new(),
            pending: Arc::new(PendingCalls::new()),
            peer_functions: RwLock::new(Vec::new()),
            connection: RwLock::new(None),
            state_tx,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExposureRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    // ── Exposure ────────────────────────────────────────────────────

    /// Make `handler` callable by the peer under `name`.
    ///
    /// When a peer is connected it is told about the new function right
    /// away; otherwise it learns about it on connect.
    pub fn expose(&self, name: &str, handler: Arc<dyn ExposedFunction>) -> Result<()> {
        // Held across register + announce so a concurrent connect either
        // sees the name in its snapshot or is already installed.
        let connection = self.connection.read();
        self.registry.register(name, handler)?;
        info!(function = name, "exposed function");

        if let Some(conn) = connection.as_ref() {
            if let Err(e) = conn.send(&Command::announce(name).into()) {
                warn!(function = name, error = %e, "could not announce function");
            }
        }
        Ok(())
    }

    /// [`expose`](Self::expose) for a synchronous closure.
    pub fn expose_fn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.expose(name, registry::from_fn(f))
    }

    /// Run an exposed function in-process, without going over the wire.
    pub async fn call_local(&self, name: &str, parameters: Vec<Value>) -> Result<Value> {
        let handler = self.registry.lookup(name)?;
        Ok(handler.call(parameters).await?)
    }

    /// Functions the peer announced on the current connection.
    pub fn peer_functions(&self) -> Vec<String> {
        self.peer_functions.read().clone()
    }

    // ── Outbound calls ──────────────────────────────────────────────

    /// Send a Command for `function` and return a handle to its result.
    pub fn call_remote(&self, function: &str, parameters: Vec<Value>) -> Result<PendingCall> {
        let id = self.pending.reserve(function);
        let command = Command {
            id: id.clone(),
            function: function.to_owned(),
            parameters,
        };
        if let Err(e) = self.send(&command.into()) {
            self.pending.release(&id);
            return Err(e);
        }
        Ok(PendingCall::new(
            id,
            function.to_owned(),
            Arc::clone(&self.pending),
            self.config.poll_attempts,
            self.config.poll_interval(),
        ))
    }

    /// Send a Command whose Response goes to `callback`. Never blocks.
    pub fn call_remote_with_callback<F>(
        &self,
        function: &str,
        parameters: Vec<Value>,
        callback: F,
    ) -> Result<CallId>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let id = self.pending.reserve(function);
        self.pending.register_callback(id.clone(), Box::new(callback));
        let command = Command {
            id: id.clone(),
            function: function.to_owned(),
            parameters,
        };
        if let Err(e) = self.send(&command.into()) {
            self.pending.release(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Call `function` on the peer and poll for its value.
    pub async fn call(&self, function: &str, parameters: Vec<Value>) -> Result<Value> {
        self.call_remote(function, parameters)?.wait().await
    }

    /// Encode and send one message on the open connection.
    pub fn send(&self, message: &Message) -> Result<()> {
        match self.connection.read().as_ref() {
            Some(conn) => conn.send(message),
            None => Err(EelError::NoOpenConnection),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe Connected/Disconnected transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Install `outbound` as the open connection and announce every
    /// exposed function on it.
    ///
    /// Only one connection is open at a time; a newer one replaces the
    /// older.
    pub fn connect(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionId {
        self.install(outbound).id
    }

    /// Install a new connection and hand back a clone of it, so its owner
    /// can keep answering on it after a newer connection takes over.
    fn install(&self, outbound: mpsc::UnboundedSender<String>) -> Connection {
        let conn = Connection {
            id: ConnectionId::new(),
            outbound,
        };
        let id = conn.id.clone();

        let mut slot = self.connection.write();
        if let Some(previous) = slot.as_ref() {
            warn!(previous = %previous.id, connection_id = %id, "replacing open connection");
        }
        let names = self.registry.names();
        for name in &names {
            if let Err(e) = conn.send(&Command::announce(name).into()) {
                warn!(function = %name, error = %e, "could not announce function");
            }
        }
        *slot = Some(conn.clone());
        // Published under the slot guard so state always matches the slot.
        self.peer_functions.write().clear();
        let _ = self.state_tx.send_replace(ConnectionState::Connected);
        drop(slot);

        info!(connection_id = %id, announced = names.len(), "peer connected");
        conn
    }

    /// Close connection `id` if it is still the open one.
    pub fn disconnect(&self, id: &ConnectionId) {
        let mut slot = self.connection.write();
        if slot.as_ref().is_some_and(|c| &c.id == id) {
            *slot = None;
            let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
            drop(slot);
            info!(connection_id = %id, "peer disconnected");
        } else {
            debug!(connection_id = %id, "stale connection ended");
        }
    }

    /// Run one connection: announce, then route every inbound message until
    /// the stream ends.
    ///
    /// Each decoded message is handled on its own task so a slow exposed
    /// function never holds up the next receive. Responses go back on this
    /// connection even after a newer one has replaced it.
    #[instrument(skip_all)]
    pub async fn serve<S>(self: &Arc<Self>, outbound: mpsc::UnboundedSender<String>, inbound: S)
    where
        S: Stream<Item = String> + Send,
    {
        let origin = self.install(outbound);
        tokio::pin!(inbound);
        while let Some(text) = inbound.next().await {
            self.route(&origin, &text);
        }
        self.disconnect(&origin.id);
    }

    /// Decode one message received on `origin` and hand it off.
    fn route(self: &Arc<Self>, origin: &Connection, text: &str) {
        debug!(connection_id = %origin.id, message = %text, "received message");
        match message::decode(text) {
            Ok(Message::Command(command)) => {
                let session = Arc::clone(self);
                let origin = origin.clone();
                let _ = tokio::spawn(async move { session.handle_command(&origin, command).await });
            }
            Ok(Message::Response(response)) => {
                let pending = Arc::clone(&self.pending);
                let _ = tokio::spawn(async move { pending.on_response(response) });
            }
            Err(e) => warn!(error = %e, kind = e.error_kind(), "dropping undecodable message"),
        }
    }

    async fn handle_command(&self, origin: &Connection, command: Command) {
        let response = if command.is_announcement() {
            self.record_peer_function(&origin.id, command)
        } else {
            executor::execute(&self.registry, command).await
        };
        if let Err(e) = origin.send(&response.into()) {
            warn!(connection_id = %origin.id, error = %e, kind = e.error_kind(), "could not send response");
        }
    }

    /// Acknowledge an announcement. Only the open connection's peer adds
    /// to the peer function list.
    fn record_peer_function(&self, origin: &ConnectionId, command: Command) -> Response {
        match command.parameters.first().and_then(Value::as_str) {
            Some(name) => {
                let slot = self.connection.read();
                if !slot.as_ref().is_some_and(|c| &c.id == origin) {
                    debug!(connection_id = %origin, function = name, "ignoring announcement from replaced connection");
                    return Response::success(command.id, Value::Null);
                }
                debug!(function = name, "peer announced function");
                let mut known = self.peer_functions.write();
                if !known.iter().any(|n| n == name) {
                    known.push(name.to_owned());
                }
                Response::success(command.id, Value::Null)
            }
            None => Response::failure(command.id, "expected a function name"),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
