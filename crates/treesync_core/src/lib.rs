//! # treesync core
//!
//! The local data model of a treesync client.
//!
//! This crate provides:
//! - [`Path`] with its segment order (integers first, numerically)
//! - [`OrderedMap`], a comparator-driven AVL map with range iteration
//! - [`TreeNode`] and [`NodeHash`], the hashed value tree
//! - [`Cache`], the mirrored server state with path-addressed writes
//!
//! ```
//! use treesync_codec::Value;
//! use treesync_core::{Cache, Path};
//!
//! let mut cache = Cache::new();
//! let path: Path = "/a/b".parse().unwrap();
//! cache.put(&path, &Value::from(42));
//! assert_eq!(cache.value_at(&path), Value::Number(42.0));
//! assert!(cache.hash_of(&"/a".parse().unwrap()).is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod error;
mod hash;
mod node;
mod ordered;
mod path;

pub use cache::Cache;
pub use error::{CoreError, CoreResult};
pub use hash::NodeHash;
pub use node::{Children, HashCache, TreeNode};
pub use ordered::{Comparator, Iter, NaturalOrder, OrderedMap, Traversal};
pub use path::{compare_segments, Path, SegmentOrder, MAX_PATH_DEPTH};
