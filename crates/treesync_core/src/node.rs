//! Cache tree nodes.

use crate::hash::NodeHash;
use crate::ordered::OrderedMap;
use crate::path::{Path, SegmentOrder};
use std::cell::OnceCell;
use std::fmt;
use treesync_codec::Value;

/// Children of an internal node, in segment order.
pub type Children = OrderedMap<String, TreeNode, SegmentOrder>;

/// Lazily computed hash slot.
///
/// Filled on first [`TreeNode::hash`] call and emptied whenever the owning
/// node (or anything beneath it) is mutated through the cache.
#[derive(Clone, Default)]
pub struct HashCache(OnceCell<Option<NodeHash>>);

impl HashCache {
    fn get_or_compute(&self, f: impl FnOnce() -> Option<NodeHash>) -> Option<NodeHash> {
        *self.0.get_or_init(f)
    }

    fn invalidate(&mut self) {
        self.0.take();
    }

    fn is_filled(&self) -> bool {
        self.0.get().is_some()
    }
}

/// A node of the mirrored tree.
///
/// `Null` models absence: null children are never stored, and an internal
/// node that loses its last child collapses to `Null`.
#[derive(Clone, Default)]
pub enum TreeNode {
    /// No value.
    #[default]
    Null,
    /// Boolean leaf. Its hash is one of two constants.
    Bool(bool),
    /// Number leaf.
    Number(f64, HashCache),
    /// String leaf.
    String(String, HashCache),
    /// Internal node with named children.
    Internal(Children, HashCache),
}

impl TreeNode {
    /// Creates a number leaf.
    pub fn number(n: f64) -> Self {
        TreeNode::Number(n, HashCache::default())
    }

    /// Creates a string leaf.
    pub fn string(s: impl Into<String>) -> Self {
        TreeNode::String(s.into(), HashCache::default())
    }

    /// Creates an internal node from `(key, child)` pairs.
    ///
    /// Null children and empty keys are dropped; if nothing remains the
    /// result is `Null`.
    pub fn internal<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, TreeNode)>,
        K: Into<String>,
    {
        let mut map = Children::with_comparator(SegmentOrder);
        for (key, child) in children {
            let key = key.into();
            if key.is_empty() || child.is_null() {
                continue;
            }
            map.remove(key.as_str());
            map.insert(key, child);
        }
        if map.is_empty() {
            TreeNode::Null
        } else {
            TreeNode::Internal(map, HashCache::default())
        }
    }

    /// Converts a neutral value into a node tree.
    ///
    /// Arrays become internal nodes keyed `"0"`, `"1"`, ...
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => TreeNode::Null,
            Value::Bool(b) => TreeNode::Bool(*b),
            Value::Number(n) => TreeNode::number(*n),
            Value::String(s) => TreeNode::string(s.as_str()),
            Value::Array(_) | Value::Object(_) => TreeNode::internal(
                value
                    .entries()
                    .into_iter()
                    .map(|(k, v)| (k, TreeNode::from_value(v))),
            ),
        }
    }

    /// Converts back to the neutral value form.
    ///
    /// An internal node whose keys are exactly `0..n` renders as an array.
    pub fn to_value(&self) -> Value {
        match self {
            TreeNode::Null => Value::Null,
            TreeNode::Bool(b) => Value::Bool(*b),
            TreeNode::Number(n, _) => Value::Number(*n),
            TreeNode::String(s, _) => Value::String(s.clone()),
            TreeNode::Internal(children, _) => {
                let is_array = children
                    .keys()
                    .enumerate()
                    .all(|(i, k)| *k == i.to_string());
                if is_array {
                    Value::Array(children.values().map(TreeNode::to_value).collect())
                } else {
                    Value::Object(
                        children
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_value()))
                            .collect(),
                    )
                }
            }
        }
    }

    /// Returns true for `Null` and for an internal node with no children.
    pub fn is_null(&self) -> bool {
        match self {
            TreeNode::Null => true,
            TreeNode::Internal(children, _) => children.is_empty(),
            _ => false,
        }
    }

    /// Returns true for internal nodes.
    pub fn is_internal(&self) -> bool {
        matches!(self, TreeNode::Internal(..))
    }

    /// The boolean, if this is a bool leaf.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TreeNode::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is a number leaf.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            TreeNode::Number(n, _) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is a string leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TreeNode::String(s, _) => Some(s),
            _ => None,
        }
    }

    /// The children, if this is an internal node.
    pub fn children(&self) -> Option<&Children> {
        match self {
            TreeNode::Internal(children, _) => Some(children),
            _ => None,
        }
    }

    /// Looks up a direct child.
    pub fn child(&self, key: &str) -> Option<&TreeNode> {
        self.children().and_then(|c| c.get(key))
    }

    /// Number of direct children (0 for leaves).
    pub fn child_count(&self) -> usize {
        self.children().map_or(0, OrderedMap::len)
    }

    /// Walks `path` down from this node.
    pub fn get(&self, path: &Path) -> Option<&TreeNode> {
        let mut node = self;
        for segment in path.segments() {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Content hash, computed on first use and cached.
    ///
    /// `None` for null. Leaves hash a type tag plus their canonical bytes;
    /// internal nodes hash `:key:childhash` for every non-null child in
    /// segment order.
    pub fn hash(&self) -> Option<NodeHash> {
        match self {
            TreeNode::Null => None,
            TreeNode::Bool(b) => Some(NodeHash::of_bool(*b)),
            TreeNode::Number(n, cache) => cache.get_or_compute(|| {
                let hex = format!("{:016x}", n.to_bits());
                Some(NodeHash::digest(&[b"number:", hex.as_bytes()]))
            }),
            TreeNode::String(s, cache) => {
                cache.get_or_compute(|| Some(NodeHash::digest(&[b"string:", s.as_bytes()])))
            }
            TreeNode::Internal(children, cache) => cache.get_or_compute(|| {
                let mut preimage = Vec::new();
                for (key, child) in children {
                    if let Some(hash) = child.hash() {
                        preimage.push(b':');
                        preimage.extend_from_slice(key.as_bytes());
                        preimage.push(b':');
                        preimage.extend_from_slice(hash.to_base64().as_bytes());
                    }
                }
                if preimage.is_empty() {
                    None
                } else {
                    Some(NodeHash::digest(&[&preimage]))
                }
            }),
        }
    }

    /// Returns true if this node's hash is currently cached.
    pub fn hash_is_cached(&self) -> bool {
        match self {
            TreeNode::Null | TreeNode::Bool(_) => true,
            TreeNode::Number(_, cache)
            | TreeNode::String(_, cache)
            | TreeNode::Internal(_, cache) => cache.is_filled(),
        }
    }

    /// Returns the children for mutation, replacing a non-internal node with
    /// an empty internal one first. Marks this node's hash stale.
    pub(crate) fn children_mut_or_coerce(&mut self) -> &mut Children {
        if !self.is_internal() {
            *self = TreeNode::Internal(
                Children::with_comparator(SegmentOrder),
                HashCache::default(),
            );
        }
        let TreeNode::Internal(children, cache) = self else {
            unreachable!("node was just made internal");
        };
        cache.invalidate();
        children
    }

    /// Collapses an internal node without children to `Null`.
    pub(crate) fn normalized(self) -> Self {
        if self.is_null() {
            TreeNode::Null
        } else {
            self
        }
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_null() && b.is_null() => true,
            (TreeNode::Bool(a), TreeNode::Bool(b)) => a == b,
            (TreeNode::Number(a, _), TreeNode::Number(b, _)) => a.to_bits() == b.to_bits(),
            (TreeNode::String(a, _), TreeNode::String(b, _)) => a == b,
            (TreeNode::Internal(a, _), TreeNode::Internal(b, _)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeNode::Null => f.write_str("Null"),
            TreeNode::Bool(b) => write!(f, "Bool({b})"),
            TreeNode::Number(n, _) => write!(f, "Number({n})"),
            TreeNode::String(s, _) => write!(f, "String({s:?})"),
            TreeNode::Internal(children, _) => f.debug_map().entries(children.iter()).finish(),
        }
    }
}
