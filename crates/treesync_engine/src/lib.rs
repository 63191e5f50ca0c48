//! # Treesync Engine
//!
//! Client-side synchronization engine for treesync.
//!
//! This crate provides:
//! - Listen registry with ancestor masking and per-path reference counts
//! - Change dispatch for value and child subscriptions
//! - Connection state machine with exponential backoff and keepalive
//! - Offline write queue, replayed in order after every handshake
//! - Transport abstraction with a recording mock
//! - An async driver that owns a session on a tokio task
//!
//! ## Architecture
//!
//! A [`Session`] is a single-threaded state machine. It never performs I/O
//! on its own: outbound requests go through a [`Transport`], inbound
//! messages are handed to [`Session::handle_message`], and timers are
//! driven by calling [`Session::tick`] at [`Session::next_deadline`].
//! [`Driver`] does all three on a tokio task.
//!
//! ## Key Invariants
//!
//! - At most one listen is on the wire for any path and its descendants
//! - Callbacks fire only when the hash of their data changes
//! - Writes are applied to the cache only when the server echoes them
//! - Queued writes are sent in submission order, after auth and listens

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connection;
mod driver;
mod error;
mod listen;
mod on;
mod session;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SessionConfig};
pub use connection::{Connection, ConnectionState};
pub use driver::{Driver, DriverHandle, PendingWrite};
pub use error::{SyncError, SyncResult};
pub use listen::{ListenItem, ListenRegistry, ListenSink, ListenStatus};
pub use on::{Event, EventHandler, EventKind, OnRegistry, SubscriptionHandle};
pub use session::{CompletionCallback, Session, SessionStats};
pub use transport::{MockTransport, Transport};
