// Port transport abstraction
// The host environment owns the real duplex channel; the multiplexer only
// sees a named sender plus an inbound event stream. In-process pairs back
// the background host and the tests.

use tokio::sync::mpsc;

use crate::error::PortError;
use crate::wire::{PortRequest, PortResponse};

/// Name of the channel the host routes to the privileged background
/// endpoint.
pub const PORT_EXTENSION: &str = "wallet-extension";

/// One inbound occurrence on a port. Disconnects are signalled out-of-band,
/// never as an envelope.
#[derive(Debug)]
pub enum PortEvent {
    Message(PortResponse),
    Disconnected,
}

/// Client half of a connected port. Exclusively owned by one multiplexer.
pub struct Port {
    name: String,
    outbound: mpsc::UnboundedSender<PortRequest>,
    inbound: Option<mpsc::UnboundedReceiver<PortEvent>>,
}

impl Port {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue one request envelope towards the background.
    pub fn post_message(&self, request: PortRequest) -> Result<(), PortError> {
        self.outbound
            .send(request)
            .map_err(|_| PortError::Send(format!("port {} is closed", self.name)))
    }

    /// Take the inbound stream. The multiplexer's reader task consumes it;
    /// taking twice yields None.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<PortEvent>> {
        self.inbound.take()
    }
}

/// Background half of a connected port: the request stream coming from the
/// client plus a sender for response envelopes and disconnect signals.
pub struct PortPeer {
    pub requests: mpsc::UnboundedReceiver<PortRequest>,
    pub events: mpsc::UnboundedSender<PortEvent>,
}

impl PortPeer {
    /// Deliver one response envelope. Returns false once the client side is
    /// gone.
    pub fn send(&self, response: PortResponse) -> bool {
        self.events.send(PortEvent::Message(response)).is_ok()
    }

    /// Signal an out-of-band disconnect to the client.
    pub fn disconnect(&self) {
        let _ = self.events.send(PortEvent::Disconnected);
    }
}

/// Build a connected in-process port pair.
pub fn port_pair(name: &str) -> (Port, PortPeer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let port = Port {
        name: name.to_string(),
        outbound: request_tx,
        inbound: Some(event_rx),
    };
    let peer = PortPeer {
        requests: request_rx,
        events: event_tx,
    };
    (port, peer)
}

/// Opens ports on demand. The multiplexer calls this lazily on the first
/// outbound message and again after every disconnect.
pub trait PortConnector: Send + Sync {
    fn connect(&self, name: &str) -> Result<Port, PortError>;
}
