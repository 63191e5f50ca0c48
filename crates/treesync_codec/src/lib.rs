//! # treesync codec
//!
//! The neutral value tree exchanged between the application, the wire
//! protocol and the local cache, with its two encodings:
//!
//! - JSON text (wire frames, application snapshots)
//! - CBOR bytes (local cache snapshots)
//!
//! ## Usage
//!
//! ```
//! use treesync_codec::{from_json_str, to_json_string, Value};
//!
//! let value = from_json_str(r#"{"b":42}"#).unwrap();
//! assert_eq!(value.get("b"), Some(&Value::Number(42.0)));
//! assert_eq!(to_json_string(&value), r#"{"b":42}"#);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod json;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use json::{from_json_str, to_json_string};
pub use value::Value;
