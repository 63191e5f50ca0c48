//! # treesync protocol
//!
//! Wire types for the treesync client.
//!
//! This crate provides:
//! - `OutboundRequest` (listen, unlisten, put, merge, auth, keepalive)
//! - `InboundMessage` (handshake, data update, response, connection closed)
//! - JSON framing for both directions
//! - `PushIdGenerator` for time-ordered child keys
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod push_id;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Action, InboundMessage, OutboundRequest, RequestId, ResponseStatus, UpdateKind,
};
pub use push_id::{push_id_millis, PushIdGenerator, PUSH_CHARS, PUSH_ID_LEN};
