// Background-side dispatcher for the extension port protocol
// Routes correlated requests to named handlers and pushes subscription
// events back down the same port, honoring the wire contract the client
// multiplexer expects.

pub mod host;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use wallet_port_rpc::wire::{
    PortRequest, PortResponse, RequestId, UnsubscribeRequest, MESSAGE_UNSUBSCRIBE,
};

pub use host::InProcessHost;

/// Failure returned by a handler, shaped for the wire.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Plain failure; becomes a bare `error` string on the wire.
    #[error("{0}")]
    Message(String),
    /// Provider-originated failure; becomes an `isEthProviderRpcError`
    /// envelope with code and detail passed through untouched.
    #[error("{message} (code {code})")]
    EthProviderRpc {
        message: String,
        code: i64,
        rpc_data: Option<Value>,
    },
}

impl HandlerError {
    pub fn message(msg: impl Into<String>) -> Self {
        HandlerError::Message(msg.into())
    }
}

/// Request/response handler for one message name.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, HandlerError>;
}

/// Subscription handler: called once per subscribe request. Push events
/// through the sink for as long as it stays live; the returned value is the
/// establishment acknowledgement.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    async fn subscribe(&self, request: Value, sink: EventSink) -> Result<Value, HandlerError>;
}

/// Push side of one active subscription, bound to the subscribing request
/// id. Revoked when the client unsubscribes.
#[derive(Clone)]
pub struct EventSink {
    id: RequestId,
    outbound: mpsc::UnboundedSender<PortResponse>,
    live: Arc<AtomicBool>,
}

impl EventSink {
    /// Correlation id of the subscription this sink feeds.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Push one event. Returns false once the subscription is revoked or
    /// the port is gone.
    pub fn send(&self, event: Value) -> bool {
        if !self.is_live() {
            return false;
        }
        self.outbound
            .send(PortResponse::subscription(self.id.clone(), event))
            .is_ok()
    }
}

/// One live subscription: its id, the flag its sink checks, and the port it
/// was established over.
struct ActiveSubscription {
    id: RequestId,
    live: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<PortResponse>,
}

/// Routing table of the background process: message name to handler, plus
/// the registry of live subscriptions.
#[derive(Default)]
pub struct BackgroundRouter {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    subscriptions: HashMap<String, Arc<dyn SubscriptionHandler>>,
    active: Mutex<Vec<ActiveSubscription>>,
}

impl BackgroundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(message.to_string(), handler);
    }

    pub fn register_subscription(&mut self, message: &str, handler: Arc<dyn SubscriptionHandler>) {
        self.subscriptions.insert(message.to_string(), handler);
    }

    /// Number of live subscriptions across all ports. Diagnostic only.
    pub fn active_subscriptions(&self) -> usize {
        self.active
            .lock()
            .expect("subscription registry lock poisoned")
            .len()
    }

    /// Route one request envelope. Every outbound envelope, including
    /// subscription pushes emitted later through sinks, goes through
    /// `outbound` so responses stay FIFO per port.
    pub async fn route(&self, request: PortRequest, outbound: &mpsc::UnboundedSender<PortResponse>) {
        let PortRequest {
            id,
            message,
            origin,
            request,
        } = request;
        debug!(%id, %message, %origin, "routing request");

        if message == MESSAGE_UNSUBSCRIBE {
            self.unsubscribe(id, request, outbound);
            return;
        }

        if let Some(handler) = self.subscriptions.get(&message) {
            let live = Arc::new(AtomicBool::new(true));
            self.active
                .lock()
                .expect("subscription registry lock poisoned")
                .push(ActiveSubscription {
                    id: id.clone(),
                    live: live.clone(),
                    outbound: outbound.clone(),
                });
            let sink = EventSink {
                id: id.clone(),
                outbound: outbound.clone(),
                live,
            };
            match handler.subscribe(request, sink).await {
                Ok(ack) => {
                    let _ = outbound.send(PortResponse::response(id, ack));
                }
                Err(err) => {
                    self.revoke(&id);
                    let _ = outbound.send(error_envelope(id, err));
                }
            }
            return;
        }

        match self.handlers.get(&message) {
            Some(handler) => {
                let envelope = match handler.handle(request).await {
                    Ok(value) => PortResponse::response(id, value),
                    Err(err) => error_envelope(id, err),
                };
                let _ = outbound.send(envelope);
            }
            None => {
                warn!(%id, %message, "no handler registered for message");
                let _ = outbound.send(PortResponse::error(
                    id,
                    format!("unknown message: {message}"),
                ));
            }
        }
    }

    /// Built-in `pri(unsubscribe)`: revoke the named subscription and ack.
    /// Unknown ids ack anyway, cancellation is idempotent.
    fn unsubscribe(
        &self,
        id: RequestId,
        request: Value,
        outbound: &mpsc::UnboundedSender<PortResponse>,
    ) {
        match serde_json::from_value::<UnsubscribeRequest>(request) {
            Ok(req) => {
                if !self.revoke(&req.id) {
                    debug!(id = %req.id, "unsubscribe for unknown subscription id");
                }
                let _ = outbound.send(PortResponse::response(id, Value::Null));
            }
            Err(err) => {
                let _ = outbound.send(PortResponse::error(
                    id,
                    format!("malformed unsubscribe request: {err}"),
                ));
            }
        }
    }

    fn revoke(&self, subscription_id: &str) -> bool {
        let mut active = self
            .active
            .lock()
            .expect("subscription registry lock poisoned");
        match active.iter().position(|sub| sub.id == subscription_id) {
            Some(pos) => {
                let sub = active.swap_remove(pos);
                sub.live.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Revoke every subscription established over the given port. Covers the
    /// teardown where the port dies without explicit unsubscribes.
    pub fn revoke_port(&self, outbound: &mpsc::UnboundedSender<PortResponse>) -> usize {
        let mut active = self
            .active
            .lock()
            .expect("subscription registry lock poisoned");
        let mut revoked = 0;
        active.retain(|sub| {
            if sub.outbound.same_channel(outbound) {
                sub.live.store(false, Ordering::Release);
                revoked += 1;
                false
            } else {
                true
            }
        });
        revoked
    }
}

fn error_envelope(id: RequestId, err: HandlerError) -> PortResponse {
    match err {
        HandlerError::Message(message) => PortResponse::error(id, message),
        HandlerError::EthProviderRpc {
            message,
            code,
            rpc_data,
        } => PortResponse::eth_rpc_error(id, message, Some(code), rpc_data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, request: Value) -> Result<Value, HandlerError> {
            Ok(request)
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _request: Value) -> Result<Value, HandlerError> {
            Err(HandlerError::EthProviderRpc {
                message: "boom".into(),
                code: 42,
                rpc_data: Some(json!({"x": 1})),
            })
        }
    }

    fn request(id: &str, message: &str, payload: Value) -> PortRequest {
        PortRequest::new(id.into(), message, "wallet-extension", Some(payload))
    }

    #[tokio::test]
    async fn routes_to_the_named_handler() {
        let mut router = BackgroundRouter::new();
        router.register("pri(echo)", Arc::new(Echo));

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.route(request("1", "pri(echo)", json!({"a": 1})), &tx).await;

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.id, "1");
        assert_eq!(resp.response, Some(json!({"a": 1})));
        assert_eq!(resp.error, None);
    }

    #[tokio::test]
    async fn unknown_message_becomes_an_error_envelope() {
        let router = BackgroundRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.route(request("1", "pri(nope)", Value::Null), &tx).await;

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.error.as_deref(), Some("unknown message: pri(nope)"));
        assert_eq!(resp.is_eth_provider_rpc_error, None);
    }

    #[tokio::test]
    async fn provider_errors_pass_code_and_data_through() {
        let mut router = BackgroundRouter::new();
        router.register("pri(fail)", Arc::new(Failing));

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.route(request("1", "pri(fail)", Value::Null), &tx).await;

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert_eq!(resp.is_eth_provider_rpc_error, Some(true));
        assert_eq!(resp.code, Some(42));
        assert_eq!(resp.rpc_data, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn unsubscribe_acknowledges_even_for_unknown_ids() {
        let router = BackgroundRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .route(
                request("1", MESSAGE_UNSUBSCRIBE, json!({"id": "never-issued"})),
                &tx,
            )
            .await;

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.id, "1");
        assert_eq!(resp.response, Some(Value::Null));
        assert_eq!(resp.error, None);
    }

    #[tokio::test]
    async fn revoked_sink_refuses_further_events() {
        struct OneShotSub;

        #[async_trait]
        impl SubscriptionHandler for OneShotSub {
            async fn subscribe(&self, _request: Value, sink: EventSink) -> Result<Value, HandlerError> {
                assert!(sink.send(json!({"n": 1})));
                Ok(Value::Bool(true))
            }
        }

        let mut router = BackgroundRouter::new();
        router.register_subscription("pri(sub)", Arc::new(OneShotSub));

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.route(request("s1", "pri(sub)", Value::Null), &tx).await;
        assert_eq!(router.active_subscriptions(), 1);

        // first the pushed event, then the establishment ack
        let push = rx.recv().await.unwrap();
        assert_eq!(push.subscription, Some(json!({"n": 1})));
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.response, Some(Value::Bool(true)));

        router
            .route(request("2", MESSAGE_UNSUBSCRIBE, json!({"id": "s1"})), &tx)
            .await;
        let _ack = rx.recv().await.unwrap();
        assert_eq!(router.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn dead_port_revocation_only_touches_that_ports_subscriptions() {
        struct ParkedSub(Mutex<Vec<EventSink>>);

        #[async_trait]
        impl SubscriptionHandler for ParkedSub {
            async fn subscribe(&self, _request: Value, sink: EventSink) -> Result<Value, HandlerError> {
                self.0.lock().unwrap().push(sink);
                Ok(Value::Bool(true))
            }
        }

        let parked = Arc::new(ParkedSub(Mutex::new(Vec::new())));
        let mut router = BackgroundRouter::new();
        router.register_subscription("pri(sub)", parked.clone());

        let (dead_tx, mut dead_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        router.route(request("d1", "pri(sub)", Value::Null), &dead_tx).await;
        router.route(request("l1", "pri(sub)", Value::Null), &live_tx).await;
        let _ = dead_rx.recv().await.unwrap();
        let _ = live_rx.recv().await.unwrap();
        assert_eq!(router.active_subscriptions(), 2);

        // the dead port's subscription goes, the other port's survives
        assert_eq!(router.revoke_port(&dead_tx), 1);
        assert_eq!(router.active_subscriptions(), 1);
        let sinks = parked.0.lock().unwrap();
        assert!(!sinks[0].send(json!({"n": 1})));
        assert!(sinks[1].send(json!({"n": 1})));

        // revocation is idempotent per port
        assert_eq!(router.revoke_port(&dead_tx), 0);
    }
}
