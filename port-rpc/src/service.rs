// PortMessageService: the client-side multiplexer
// Three call shapes over one lazily-created port, correlated by random ids.
// The pending table and the port handle are owned by one instance; nothing
// here is process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::PortError;
use crate::transport::{Port, PortConnector, PortEvent, PORT_EXTENSION};
use crate::wire::{
    new_request_id, DecodeError, PortRequest, PortResponse, RequestId, ResponsePayload,
    MESSAGE_UNSUBSCRIBE,
};

/// What to do with pending entries when the port disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Keep entries. A late response arriving after a reconnect with the
    /// same id still resolves its caller; entries with no such luck stay
    /// orphaned until the process ends. This is the historical extension
    /// behavior.
    #[default]
    PreserveAcrossReconnect,
    /// Reject pending calls with [`PortError::Disconnected`] and drop
    /// subscriptions.
    RejectPending,
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Channel name the host routes to the background endpoint.
    pub port_name: String,
    /// Origin tag stamped on every outbound envelope.
    pub origin: String,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_name: PORT_EXTENSION.to_string(),
            origin: "wallet-extension".to_string(),
            disconnect_policy: DisconnectPolicy::default(),
        }
    }
}

/// One in-flight or open-ended interaction.
enum PendingCall {
    /// Request/response. Sending on the oneshot consumes it, so a second
    /// resolution is unrepresentable.
    Call {
        tx: oneshot::Sender<Result<Value, PortError>>,
    },
    /// Subscription. Events are forwarded any number of times until the
    /// entry is removed by an explicit unsubscribe. The message name is kept
    /// for diagnostics when establishment fails.
    Subscription {
        on_event: Arc<dyn Fn(Value) + Send + Sync>,
        message: String,
    },
}

struct Inner {
    handlers: HashMap<RequestId, PendingCall>,
    /// Current port, if connected. Its inbound half lives in the reader
    /// task.
    port: Option<Port>,
    /// Bumped on every connect so a stale reader cannot tear down a newer
    /// port.
    generation: u64,
}

/// Client multiplexer for the extension port.
///
/// Cheap to clone; clones share the same pending table and port.
#[derive(Clone)]
pub struct PortMessageService {
    config: PortConfig,
    connector: Arc<dyn PortConnector>,
    inner: Arc<Mutex<Inner>>,
}

impl PortMessageService {
    pub fn new(connector: Arc<dyn PortConnector>) -> Self {
        Self::with_config(connector, PortConfig::default())
    }

    pub fn with_config(connector: Arc<dyn PortConnector>, config: PortConfig) -> Self {
        Self {
            config,
            connector,
            inner: Arc::new(Mutex::new(Inner {
                handlers: HashMap::new(),
                port: None,
                generation: 0,
            })),
        }
    }

    /// Request/response call. Resolves when the matching inbound envelope
    /// arrives; no timeout is enforced here, callers that need bounded
    /// latency wrap the future themselves.
    pub async fn call(&self, message: &str, request: Option<Value>) -> Result<Value, PortError> {
        let (tx, rx) = oneshot::channel();
        let id = new_request_id();
        self.send_with_handler(id, message, request, PendingCall::Call { tx })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PortError::Abandoned),
        }
    }

    /// Call shape for messages that take no arguments.
    pub async fn call_no_request(&self, message: &str) -> Result<Value, PortError> {
        self.call(message, None).await
    }

    /// Subscription call. Returns synchronously after enqueueing the
    /// request; establishment failures are logged, not surfaced, since only
    /// the event stream matters for this shape. Should be used for
    /// internal/private messages only.
    pub fn subscribe<F>(&self, message: &str, request: Option<Value>, on_event: F) -> Unsubscribe
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = new_request_id();
        let handler = PendingCall::Subscription {
            on_event: Arc::new(on_event),
            message: message.to_string(),
        };
        if let Err(err) = self.send_with_handler(id.clone(), message, request, handler) {
            error!(%message, error = %err, "failed to send subscription request");
        }
        Unsubscribe {
            id,
            service: self.clone(),
        }
    }

    /// Number of in-flight calls and open subscriptions. Diagnostic only.
    pub fn pending_calls(&self) -> usize {
        self.lock_inner().handlers.len()
    }

    /// Whether the table still holds an entry for this id. Diagnostic only.
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock_inner().handlers.contains_key(id)
    }

    fn remove_pending(&self, id: &str) {
        self.lock_inner().handlers.remove(id);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("port state lock poisoned")
    }

    /// Register the handler, then serialize and send the envelope, creating
    /// the port inline if none exists. The entry is rolled back when the
    /// send fails so nothing waits for a request that never left.
    fn send_with_handler(
        &self,
        id: RequestId,
        message: &str,
        request: Option<Value>,
        handler: PendingCall,
    ) -> Result<(), PortError> {
        let envelope = PortRequest::new(id.clone(), message, &self.config.origin, request);

        let mut inner = self.lock_inner();
        inner.handlers.insert(id.clone(), handler);

        if inner.port.is_none() {
            if let Err(err) = self.open_port(&mut inner) {
                inner.handlers.remove(&id);
                return Err(err);
            }
        }
        let Some(port) = inner.port.as_ref() else {
            inner.handlers.remove(&id);
            return Err(PortError::Send("port unavailable".into()));
        };
        if let Err(err) = port.post_message(envelope) {
            inner.handlers.remove(&id);
            inner.port = None;
            return Err(err);
        }
        Ok(())
    }

    fn open_port(&self, inner: &mut Inner) -> Result<(), PortError> {
        let mut port = self.connector.connect(&self.config.port_name)?;
        let inbound = port.take_inbound().ok_or_else(|| PortError::Connect {
            name: port.name().to_string(),
            reason: "connector returned a port without an inbound stream".into(),
        })?;
        inner.generation += 1;
        let generation = inner.generation;
        debug!(port = port.name(), generation, "port connected");
        inner.port = Some(port);

        tokio::spawn(run_port_reader(
            Arc::clone(&self.inner),
            inbound,
            generation,
            self.config.disconnect_policy,
        ));
        Ok(())
    }
}

/// Handle returned by [`PortMessageService::subscribe`]. Cancelling is an
/// asynchronous round-trip: it sends `pri(unsubscribe)` carrying the
/// original id and removes the local entry once the acknowledgement
/// resolves. Safe to invoke after the entry is already gone.
pub struct Unsubscribe {
    id: RequestId,
    service: PortMessageService,
}

impl Unsubscribe {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn unsubscribe(self) -> Result<(), PortError> {
        // nothing to cancel locally, skip the round-trip
        if !self.service.is_pending(&self.id) {
            return Ok(());
        }
        self.service
            .call(MESSAGE_UNSUBSCRIBE, Some(json!({ "id": self.id })))
            .await?;
        self.service.remove_pending(&self.id);
        Ok(())
    }
}

/// Pump inbound events into the pending table until the port disconnects or
/// its sender side is dropped.
async fn run_port_reader(
    state: Arc<Mutex<Inner>>,
    mut inbound: mpsc::UnboundedReceiver<PortEvent>,
    generation: u64,
    policy: DisconnectPolicy,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            PortEvent::Message(envelope) => dispatch_response(&state, envelope),
            PortEvent::Disconnected => break,
        }
    }
    handle_disconnect(&state, generation, policy);
}

/// Dispatch one inbound envelope to the pending call it correlates with.
/// Never panics out of the reader task: malformed or unroutable envelopes
/// are logged and dropped.
fn dispatch_response(state: &Arc<Mutex<Inner>>, envelope: PortResponse) {
    let payload = match envelope.decode_payload() {
        Ok(payload) => payload,
        Err(DecodeError::BooleanSubscription { id }) => {
            // a falsy event would vanish inside truthy dispatch, so boolean
            // markers are refused instead of forwarded
            warn!(%id, "subscription payload must not be a boolean, envelope ignored");
            return;
        }
    };

    let mut inner = state.lock().expect("port state lock poisoned");
    let is_subscription = match inner.handlers.get(&envelope.id) {
        Some(PendingCall::Subscription { .. }) => true,
        Some(PendingCall::Call { .. }) => false,
        None => {
            // late or duplicate delivery; don't log the whole envelope, the
            // payload could hold sensitive data
            warn!(id = %envelope.id, error = envelope.error.as_deref(), "no pending call for inbound id, dropping");
            return;
        }
    };

    if !is_subscription {
        // removed before completion so a duplicate envelope with the same
        // id can never resolve twice
        let Some(PendingCall::Call { tx }) = inner.handlers.remove(&envelope.id) else {
            return;
        };
        drop(inner);
        let result = match payload {
            ResponsePayload::Response(value) => Ok(value),
            ResponsePayload::Error(err) => Err(err.into()),
            // a push aimed at a plain call carries nothing to forward;
            // resolve like an empty response
            ResponsePayload::SubscriptionEvent(_) => Ok(Value::Null),
        };
        if tx.send(result).is_err() {
            debug!(id = %envelope.id, "caller no longer awaiting response");
        }
        return;
    }

    match payload {
        ResponsePayload::SubscriptionEvent(event) => {
            let on_event = match inner.handlers.get(&envelope.id) {
                Some(PendingCall::Subscription { on_event, .. }) => Arc::clone(on_event),
                _ => return,
            };
            // run the callback outside the lock, it may issue calls of its
            // own
            drop(inner);
            on_event(event);
        }
        ResponsePayload::Error(err) => {
            let removed = inner.handlers.remove(&envelope.id);
            drop(inner);
            if let Some(PendingCall::Subscription { message, .. }) = removed {
                error!(id = %envelope.id, %message, error = %PortError::from(err), "subscription failed");
            }
        }
        ResponsePayload::Response(_) => {
            // establishment acknowledgement; the entry stays until an
            // explicit unsubscribe
            debug!(id = %envelope.id, "subscription established");
        }
    }
}

fn handle_disconnect(state: &Arc<Mutex<Inner>>, generation: u64, policy: DisconnectPolicy) {
    let mut inner = state.lock().expect("port state lock poisoned");
    // a newer port may already be live; only tear down our own
    if inner.generation != generation {
        return;
    }
    inner.port = None;
    match policy {
        DisconnectPolicy::PreserveAcrossReconnect => {
            warn!(
                pending = inner.handlers.len(),
                "port disconnected, pending calls preserved"
            );
        }
        DisconnectPolicy::RejectPending => {
            let drained: Vec<(RequestId, PendingCall)> = inner.handlers.drain().collect();
            drop(inner);
            warn!(
                rejected = drained.len(),
                "port disconnected, rejecting pending calls"
            );
            for (id, call) in drained {
                match call {
                    PendingCall::Call { tx } => {
                        let _ = tx.send(Err(PortError::Disconnected));
                    }
                    PendingCall::Subscription { message, .. } => {
                        warn!(%id, %message, "subscription dropped on disconnect");
                    }
                }
            }
        }
    }
}
