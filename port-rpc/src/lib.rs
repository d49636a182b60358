// Cross-context RPC for the wallet extension
// One long-lived port between a UI context and the background process,
// multiplexing request/response calls and server-push subscriptions.

pub mod error;
pub mod service;
pub mod transport;
pub mod wire;

pub use error::PortError;
pub use service::{DisconnectPolicy, PortConfig, PortMessageService, Unsubscribe};
pub use transport::{port_pair, Port, PortConnector, PortEvent, PortPeer, PORT_EXTENSION};
pub use wire::{PortRequest, PortResponse, RequestId, ResponsePayload};
