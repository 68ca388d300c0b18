//! Broker error taxonomy
//!
//! Every failure surfaced by the broker carries a numeric code compatible
//! with the cluster wire protocol, so errors raised on one node can be
//! reconstructed on the caller's side. Codes follow HTTP conventions:
//! 4xx errors are caller mistakes and never retried, 5xx errors are
//! transient and eligible for retry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

fn node_suffix(node_id: &Option<String>) -> String {
    match node_id {
        Some(node) => format!(" on node '{}'", node),
        None => String::new(),
    }
}

/// Structured error for every failure path in the broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// No endpoint has ever been registered for the action.
    #[error("Action '{action}' is not registered!")]
    ServiceNotFound { action: String },

    /// The action is known but no endpoint can take the call right now.
    #[error("Action '{action}' is not available{}!", node_suffix(.node_id))]
    ServiceNotAvailable {
        action: String,
        node_id: Option<String>,
    },

    /// The call did not settle within its timeout.
    #[error("Request '{action}' timed out{}!", node_suffix(.node_id))]
    RequestTimeout {
        action: String,
        node_id: Option<String>,
    },

    /// The call was dropped without dispatch because the broker was not
    /// running, or its transit shut down while the request was pending.
    #[error("Request '{action}' was skipped!")]
    RequestSkipped { action: String },

    /// Parameter validation rejected the call.
    #[error("Parameter validation failed: {message}")]
    Validation {
        message: String,
        data: Option<Value>,
    },

    /// The context chain grew past `max_call_level`.
    #[error("Request level has reached the limit ({level}) on action '{action}'!")]
    MaxCallLevel { action: String, level: u32 },

    /// A frame could not be encoded or decoded.
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    /// The underlying transport refused an operation.
    #[error("Transport failure: {message}")]
    Transport { message: String },

    /// Application-defined error, possibly raised on a remote node.
    #[error("{message}")]
    Custom {
        message: String,
        code: u16,
        data: Option<Value>,
        node_id: Option<String>,
    },
}

impl BrokerError {
    pub fn service_not_found(action: impl Into<String>) -> Self {
        BrokerError::ServiceNotFound {
            action: action.into(),
        }
    }

    pub fn service_not_available(action: impl Into<String>, node_id: Option<String>) -> Self {
        BrokerError::ServiceNotAvailable {
            action: action.into(),
            node_id,
        }
    }

    pub fn request_timeout(action: impl Into<String>, node_id: Option<String>) -> Self {
        BrokerError::RequestTimeout {
            action: action.into(),
            node_id,
        }
    }

    pub fn request_skipped(action: impl Into<String>) -> Self {
        BrokerError::RequestSkipped {
            action: action.into(),
        }
    }

    pub fn validation(message: impl Into<String>, data: Option<Value>) -> Self {
        BrokerError::Validation {
            message: message.into(),
            data,
        }
    }

    pub fn max_call_level(action: impl Into<String>, level: u32) -> Self {
        BrokerError::MaxCallLevel {
            action: action.into(),
            level,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        BrokerError::Serialization {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        BrokerError::Transport {
            message: message.into(),
        }
    }

    pub fn custom(message: impl Into<String>, code: u16) -> Self {
        BrokerError::Custom {
            message: message.into(),
            code,
            data: None,
            node_id: None,
        }
    }

    /// Numeric wire code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            BrokerError::ServiceNotFound { .. } => 404,
            BrokerError::ServiceNotAvailable { .. } => 404,
            BrokerError::RequestTimeout { .. } => 504,
            BrokerError::RequestSkipped { .. } => 514,
            BrokerError::Validation { .. } => 422,
            BrokerError::MaxCallLevel { .. } => 500,
            BrokerError::Serialization { .. } => 500,
            BrokerError::Transport { .. } => 500,
            BrokerError::Custom { code, .. } => *code,
        }
    }

    /// Wire name, stable across language implementations of the protocol.
    pub fn name(&self) -> &'static str {
        match self {
            BrokerError::ServiceNotFound { .. } => "ServiceNotFoundError",
            BrokerError::ServiceNotAvailable { .. } => "ServiceNotAvailableError",
            BrokerError::RequestTimeout { .. } => "RequestTimeoutError",
            BrokerError::RequestSkipped { .. } => "RequestSkippedError",
            BrokerError::Validation { .. } => "ValidationError",
            BrokerError::MaxCallLevel { .. } => "MaxCallLevelError",
            BrokerError::Serialization { .. } => "SerializationError",
            BrokerError::Transport { .. } => "TransportError",
            BrokerError::Custom { .. } => "CustomError",
        }
    }

    /// Whether the call pipeline may transparently retry after this error.
    ///
    /// Timeouts are always retryable; generic errors are retryable when
    /// their code is in the 5xx range. `MaxCallLevel` and `RequestSkipped`
    /// are deterministic and excluded despite their codes.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::RequestTimeout { .. } => true,
            BrokerError::Transport { .. } => true,
            BrokerError::Custom { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Whether this error increments the endpoint's circuit-breaker
    /// failure counter under the given policy flags.
    pub fn counts_as_failure(&self, failure_on_timeout: bool, failure_on_reject: bool) -> bool {
        match self {
            BrokerError::RequestTimeout { .. } => failure_on_timeout,
            BrokerError::Transport { .. } => failure_on_reject,
            BrokerError::Custom { code, .. } => failure_on_reject && *code >= 500,
            _ => false,
        }
    }

    /// Node the error originated on, when known.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            BrokerError::ServiceNotAvailable { node_id, .. }
            | BrokerError::RequestTimeout { node_id, .. }
            | BrokerError::Custom { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }

    /// Structured detail payload attached to the error.
    pub fn data(&self) -> Option<Value> {
        match self {
            BrokerError::ServiceNotFound { action } => Some(json!({ "action": action })),
            BrokerError::ServiceNotAvailable { action, node_id } => {
                Some(json!({ "action": action, "nodeID": node_id }))
            }
            BrokerError::RequestTimeout { action, node_id } => {
                Some(json!({ "action": action, "nodeID": node_id }))
            }
            BrokerError::RequestSkipped { action } => Some(json!({ "action": action })),
            BrokerError::Validation { data, .. } => data.clone(),
            BrokerError::MaxCallLevel { action, level } => {
                Some(json!({ "action": action, "level": level }))
            }
            BrokerError::Serialization { .. } | BrokerError::Transport { .. } => None,
            BrokerError::Custom { data, .. } => data.clone(),
        }
    }

    /// Wire representation carried in RESPONSE frames.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            name: self.name().to_string(),
            message: self.to_string(),
            code: self.code(),
            data: self.data(),
            node_id: self.node_id().map(|n| n.to_string()),
        }
    }

    /// Reconstruct an error received from `sender`. Known wire names map
    /// back onto their own kinds so retry and breaker policy keep working
    /// across the cluster; everything else lands in `Custom`.
    pub fn from_payload(payload: ErrorPayload, sender: &str) -> Self {
        let node_id = Some(
            payload
                .node_id
                .unwrap_or_else(|| sender.to_string()),
        );
        let action = payload
            .data
            .as_ref()
            .and_then(|d| d.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string();

        match payload.name.as_str() {
            "ServiceNotFoundError" => BrokerError::ServiceNotFound { action },
            "ServiceNotAvailableError" => BrokerError::ServiceNotAvailable { action, node_id },
            "RequestTimeoutError" => BrokerError::RequestTimeout { action, node_id },
            "RequestSkippedError" => BrokerError::RequestSkipped { action },
            "ValidationError" => BrokerError::Validation {
                message: payload.message,
                data: payload.data,
            },
            "MaxCallLevelError" => {
                let level = payload
                    .data
                    .as_ref()
                    .and_then(|d| d.get("level"))
                    .and_then(|l| l.as_u64())
                    .unwrap_or_default() as u32;
                BrokerError::MaxCallLevel { action, level }
            }
            _ => BrokerError::Custom {
                message: payload.message,
                code: payload.code,
                data: payload.data,
                node_id,
            },
        }
    }
}

// Handlers may bubble up plain strings; they become generic 500s.
impl From<String> for BrokerError {
    fn from(message: String) -> Self {
        BrokerError::custom(message, 500)
    }
}

impl From<&str> for BrokerError {
    fn from(message: &str) -> Self {
        BrokerError::custom(message.to_string(), 500)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::serialization(err.to_string())
    }
}

/// Serialized error shape inside RESPONSE frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "nodeID", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}
