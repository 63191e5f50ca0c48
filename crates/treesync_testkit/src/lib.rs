//! # Treesync Testkit
//!
//! Test utilities for treesync.
//!
//! This crate provides:
//! - An in-memory fake server that answers client requests
//! - Property-based test generators using proptest
//! - Fuzz testing harnesses and cache invariant checks
//! - Cross-implementation hash vectors
//!
//! ## Usage
//!
//! ```rust
//! use treesync_core::Path;
//! use treesync_protocol::{OutboundRequest, RequestId};
//! use treesync_testkit::prelude::*;
//!
//! let mut server = FakeServer::new();
//! let path = Path::parse("/rooms").unwrap();
//! let replies = server.process(&OutboundRequest::listen(RequestId(1), path.clone()));
//! assert_eq!(replies.len(), 2);
//! assert!(server.is_listening(&path));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_server;
pub mod fuzz;
pub mod generators;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake_server::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::vectors::*;
}

pub use fake_server::{FakeServer, INVALID_TOKEN, PERMISSION_DENIED};
pub use fuzz::check_cache;
pub use generators::{CacheOp, PropTestConfig};
pub use vectors::{hash_vectors, HashVector};
