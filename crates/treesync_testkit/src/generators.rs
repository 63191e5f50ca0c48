//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random paths, values and cache
//! operations that respect the path and value rules.

use proptest::prelude::*;
use treesync_codec::Value;
use treesync_core::{Cache, Path};

/// Strategy for generating segments, mixing integer-like and text keys.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        2 => prop::string::string_regex("[a-z][a-z0-9_-]{0,7}").expect("Invalid regex"),
        1 => any::<i32>().prop_map(|n| n.to_string()),
        1 => (0u8..20).prop_map(|n| n.to_string()),
    ]
}

/// Strategy for generating small segment alphabets, so generated paths
/// collide and nest often.
pub fn narrow_segment_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "0", "1", "10"]).prop_map(str::to_string)
}

/// Strategy for generating paths of up to `max_depth` segments.
pub fn path_strategy(max_depth: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(segment_strategy(), 0..=max_depth)
        .prop_map(|segments| Path::from_segments(segments).expect("generated path is valid"))
}

/// Like [`path_strategy`], drawing from [`narrow_segment_strategy`].
pub fn narrow_path_strategy(max_depth: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(narrow_segment_strategy(), 0..=max_depth)
        .prop_map(|segments| Path::from_segments(segments).expect("generated path is valid"))
}

/// Strategy for generating leaf values (null included).
pub fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        2 => any::<bool>().prop_map(Value::Bool),
        2 => (-1_000_000i64..1_000_000).prop_map(Value::from),
        1 => (-1.0e6f64..1.0e6).prop_map(Value::Number),
        2 => prop::string::string_regex("[ -~]{0,12}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating nested values with objects and arrays.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Value::Array),
            prop::collection::btree_map(narrow_segment_strategy(), inner, 0..5)
                .prop_map(|fields| Value::object(fields)),
        ]
    })
}

/// One mutation of a cache.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// Replace the value at a path.
    Put {
        /// Target path.
        path: Path,
        /// New value.
        value: Value,
    },
    /// Merge an object into the value at a path.
    Merge {
        /// Target path.
        path: Path,
        /// Partial object.
        value: Value,
    },
}

impl CacheOp {
    /// Path the operation targets.
    pub fn path(&self) -> &Path {
        match self {
            CacheOp::Put { path, .. } | CacheOp::Merge { path, .. } => path,
        }
    }

    /// Applies the operation.
    pub fn apply(&self, cache: &mut Cache) {
        match self {
            CacheOp::Put { path, value } => cache.put(path, value),
            CacheOp::Merge { path, value } => cache.merge(path, value),
        }
    }
}

/// Strategy for generating cache operations.
pub fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (narrow_path_strategy(3), value_strategy())
            .prop_map(|(path, value)| CacheOp::Put { path, value }),
        2 => (
            narrow_path_strategy(3),
            prop::collection::btree_map(narrow_segment_strategy(), value_strategy(), 0..4),
        )
            .prop_map(|(path, fields)| CacheOp::Merge {
                path,
                value: Value::object(fields),
            }),
    ]
}

/// Strategy for generating a sequence of cache operations.
pub fn cache_op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(cache_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
