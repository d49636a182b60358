// In-process host: serves PortConnector connections through a
// BackgroundRouter. Stands in for the browser runtime that would normally
// route a named port to the background service worker.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use wallet_port_rpc::error::PortError;
use wallet_port_rpc::transport::{port_pair, Port, PortConnector, PortEvent, PortPeer};
use wallet_port_rpc::wire::PortResponse;

use crate::BackgroundRouter;

/// Hosts one router and serves every port opened against it.
pub struct InProcessHost {
    router: Arc<BackgroundRouter>,
    /// Event senders of live ports, kept so disconnects can be simulated.
    ports: Mutex<Vec<mpsc::UnboundedSender<PortEvent>>>,
}

impl InProcessHost {
    pub fn new(router: BackgroundRouter) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::new(router),
            ports: Mutex::new(Vec::new()),
        })
    }

    /// The hosted router, for registry inspection.
    pub fn router(&self) -> &BackgroundRouter {
        &self.router
    }

    /// Signal an out-of-band disconnect on every live port, as the browser
    /// does when the background worker is torn down.
    pub fn disconnect_all(&self) {
        let ports = std::mem::take(&mut *self.ports.lock().expect("port list lock poisoned"));
        for events in ports {
            let _ = events.send(PortEvent::Disconnected);
        }
    }
}

impl PortConnector for InProcessHost {
    fn connect(&self, name: &str) -> Result<Port, PortError> {
        let (port, peer) = port_pair(name);
        self.ports
            .lock()
            .expect("port list lock poisoned")
            .push(peer.events.clone());
        debug!(port = name, "serving in-process port");
        tokio::spawn(serve_peer(Arc::clone(&self.router), peer));
        Ok(port)
    }
}

/// Pump one port: requests into the router, responses and subscription
/// pushes back to the client, until the client drops its half. Subscriptions
/// still registered when the port dies are revoked on the way out.
async fn serve_peer(router: Arc<BackgroundRouter>, mut peer: PortPeer) {
    let (outbound, mut responses) = mpsc::unbounded_channel::<PortResponse>();
    loop {
        tokio::select! {
            request = peer.requests.recv() => match request {
                Some(request) => router.route(request, &outbound).await,
                None => break,
            },
            response = responses.recv() => {
                if let Some(envelope) = response {
                    if !peer.send(envelope) {
                        break;
                    }
                }
            }
        }
    }
    let revoked = router.revoke_port(&outbound);
    if revoked > 0 {
        debug!(revoked, "revoked subscriptions of a dead port");
    }
}
