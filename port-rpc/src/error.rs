// Error taxonomy for the port RPC layer
// Upstream failures are delivered to the caller whose correlation id
// matches; routing and usage errors are logged, never surfaced.

use serde_json::Value;
use thiserror::Error;

use crate::wire::{ErrorPayload, ETH_ERROR_EIP1474_INTERNAL_ERROR};

#[derive(Debug, Error)]
pub enum PortError {
    /// Error from a blockchain-node-facing provider. Carries a numeric code
    /// so callers can branch without string-matching, plus opaque detail.
    #[error("{message} (provider rpc error, code {code})")]
    EthProviderRpc {
        message: String,
        code: i64,
        rpc_data: Option<Value>,
    },

    /// Plain upstream failure description.
    #[error("{0}")]
    Upstream(String),

    /// The port disconnected while the call was pending. Only produced under
    /// [`crate::DisconnectPolicy::RejectPending`].
    #[error("port disconnected before a response arrived")]
    Disconnected,

    /// The request could not be handed to the transport.
    #[error("failed to send over port: {0}")]
    Send(String),

    /// The connector refused to open a port.
    #[error("failed to connect port {name}: {reason}")]
    Connect { name: String, reason: String },

    /// The pending entry was dropped without ever being resolved (the
    /// multiplexer went away).
    #[error("call abandoned without a response")]
    Abandoned,
}

impl PortError {
    /// Provider error code, if this is a provider error.
    pub fn eth_code(&self) -> Option<i64> {
        match self {
            PortError::EthProviderRpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ErrorPayload> for PortError {
    fn from(payload: ErrorPayload) -> Self {
        if payload.is_eth_provider_rpc_error {
            PortError::EthProviderRpc {
                message: payload.message,
                code: payload.code.unwrap_or(ETH_ERROR_EIP1474_INTERNAL_ERROR),
                rpc_data: payload.rpc_data,
            }
        } else {
            PortError::Upstream(payload.message)
        }
    }
}
