// Wire envelopes for the extension port protocol
// Outbound requests carry a correlation id; inbound envelopes are decoded
// into an unambiguous payload kind at the serialization boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// EIP-1474 "internal error" code, used when an upstream provider error
/// arrives without an explicit code.
pub const ETH_ERROR_EIP1474_INTERNAL_ERROR: i64 = -32603;

/// Message name for cancelling an active subscription.
pub const MESSAGE_UNSUBSCRIBE: &str = "pri(unsubscribe)";

/// Correlation token linking one outbound request to its inbound envelopes.
/// Unique per outstanding call within a process lifetime.
pub type RequestId = String;

/// Generate a fresh correlation id: a random 128-bit value, hex-encoded.
pub fn new_request_id() -> RequestId {
    format!("{:032x}", rand::random::<u128>())
}

/// Client -> background request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRequest {
    pub id: RequestId,
    /// Namespaced message identifier, e.g. `pri(accounts.subscribe)`.
    pub message: String,
    /// Fixed tag identifying the sending context.
    pub origin: String,
    /// Message-specific payload, JSON null when the message takes no
    /// arguments.
    pub request: Value,
}

/// Background -> client envelope as it appears on the wire. Fields are
/// optional and shaped by message kind; [`PortResponse::decode_payload`]
/// turns this into a [`ResponsePayload`] before any dispatch happens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortResponse {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_eth_provider_rpc_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_data: Option<Value>,
}

/// Request payload for [`MESSAGE_UNSUBSCRIBE`]: names the subscription id to
/// cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub id: RequestId,
}

/// Inbound envelope payload, decided once when the envelope is decoded.
/// Exactly one kind per envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Success payload for a request/response call. Null when the message
    /// returns nothing of interest.
    Response(Value),
    /// Pushed event for an active subscription.
    SubscriptionEvent(Value),
    /// Failure description for the matching call.
    Error(ErrorPayload),
}

/// Error description carried by an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    pub is_eth_provider_rpc_error: bool,
    pub code: Option<i64>,
    pub rpc_data: Option<Value>,
}

/// Envelopes that must not be dispatched at all.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// `subscription` carried a literal boolean. A falsy event is
    /// indistinguishable from "no event" under truthy dispatch, so booleans
    /// are refused outright instead of being forwarded.
    BooleanSubscription { id: RequestId },
}

impl PortRequest {
    pub fn new(id: RequestId, message: &str, origin: &str, request: Option<Value>) -> Self {
        Self {
            id,
            message: message.to_string(),
            origin: origin.to_string(),
            request: request.unwrap_or(Value::Null),
        }
    }
}

impl PortResponse {
    pub fn response(id: RequestId, value: Value) -> Self {
        Self {
            id,
            response: Some(value),
            ..Default::default()
        }
    }

    pub fn subscription(id: RequestId, event: Value) -> Self {
        Self {
            id,
            subscription: Some(event),
            ..Default::default()
        }
    }

    pub fn error(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn eth_rpc_error(
        id: RequestId,
        message: impl Into<String>,
        code: Option<i64>,
        rpc_data: Option<Value>,
    ) -> Self {
        Self {
            id,
            error: Some(message.into()),
            is_eth_provider_rpc_error: Some(true),
            code,
            rpc_data,
            ..Default::default()
        }
    }

    /// Classify this envelope. Precedence on over-populated envelopes is
    /// subscription, then error, then response, matching the background's
    /// dispatch order.
    pub fn decode_payload(&self) -> Result<ResponsePayload, DecodeError> {
        if let Some(sub) = &self.subscription {
            if sub.is_boolean() {
                return Err(DecodeError::BooleanSubscription {
                    id: self.id.clone(),
                });
            }
            return Ok(ResponsePayload::SubscriptionEvent(sub.clone()));
        }
        if let Some(error) = &self.error {
            return Ok(ResponsePayload::Error(ErrorPayload {
                message: error.clone(),
                is_eth_provider_rpc_error: self.is_eth_provider_rpc_error.unwrap_or(false),
                code: self.code,
                rpc_data: self.rpc_data.clone(),
            }));
        }
        Ok(ResponsePayload::Response(
            self.response.clone().unwrap_or(Value::Null),
        ))
    }
}
