//! Shared value types for the Flock service broker
//!
//! Everything that crosses a node boundary lives here: the error taxonomy
//! with its wire codes, the transit frame envelope, and the catalog
//! descriptors nodes exchange during discovery. The broker runtime crate
//! builds on these; transports and serializers only ever see these shapes.

pub mod catalog;
pub mod error;
pub mod frames;

pub use catalog::{ActionInfo, ClientInfo, EventInfo, NodeInfo, ServiceInfo};
pub use error::{BrokerError, ErrorPayload};
pub use frames::{
    Envelope, EventPayload, FramePayload, RequestPayload, ResponsePayload, PROTOCOL_VERSION,
};
