//! The local mirror of server state.
//!
//! The cache owns one root node. Writes are path-addressed:
//!
//! - `put` replaces whatever lives at the path.
//! - `merge` applies an object key by key, recursing into nested objects.
//!
//! Both materialize missing intermediate nodes. An intermediate node that is
//! not internal is replaced outright, so writing `/a/b` when `/a` holds a
//! string destroys that string. Every node on the written path has its
//! cached hash cleared; nothing is rehashed until someone asks.

use crate::error::CoreResult;
use crate::hash::NodeHash;
use crate::node::TreeNode;
use crate::path::Path;
use tracing::trace;
use treesync_codec::{from_cbor, to_cbor, Value};

/// The mirrored tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cache {
    root: TreeNode,
}

impl Cache {
    /// Creates an empty cache (root is `Null`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a cache from a snapshot produced by [`Cache::save_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot bytes cannot be decoded.
    pub fn from_snapshot(bytes: &[u8]) -> CoreResult<Self> {
        let mut cache = Self::new();
        cache.load_snapshot(bytes)?;
        Ok(cache)
    }

    /// The root node.
    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// Returns the node at `path`.
    ///
    /// `None` if any segment along the way is missing or not internal.
    pub fn get(&self, path: &Path) -> Option<&TreeNode> {
        self.root.get(path)
    }

    /// Returns the value at `path` in external form (`Null` when absent).
    pub fn value_at(&self, path: &Path) -> Value {
        self.get(path).map_or(Value::Null, TreeNode::to_value)
    }

    /// Returns the content hash at `path`, or `None` if null or absent.
    pub fn hash_of(&self, path: &Path) -> Option<NodeHash> {
        self.get(path).and_then(TreeNode::hash)
    }

    /// Returns the base64 hash at `path`, or an empty string if null or absent.
    pub fn hash_string_of(&self, path: &Path) -> String {
        self.hash_of(path)
            .map(|h| h.to_base64())
            .unwrap_or_default()
    }

    /// Replaces the value at `path`.
    pub fn put(&mut self, path: &Path, value: &Value) {
        self.put_node(path, TreeNode::from_value(value));
    }

    /// Replaces the node at `path`.
    pub fn put_node(&mut self, path: &Path, node: TreeNode) {
        trace!(path = %path, "cache put");
        put_at(&mut self.root, path.segments(), node.normalized());
    }

    /// Merges `value` into the node at `path`.
    ///
    /// Objects and arrays are applied key by key: null removes the child,
    /// nested containers merge recursively, scalars replace. A non-container
    /// `value` behaves like [`Cache::put`].
    pub fn merge(&mut self, path: &Path, value: &Value) {
        trace!(path = %path, "cache merge");
        merge_at(&mut self.root, path.segments(), value);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.root = TreeNode::Null;
    }

    /// Encodes the whole tree as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn save_snapshot(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(&self.root.to_value())?)
    }

    /// Replaces the whole tree with a decoded snapshot.
    ///
    /// On error the cache is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot bytes cannot be decoded.
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let value = from_cbor(bytes)?;
        self.root = TreeNode::from_value(&value);
        Ok(())
    }
}

fn put_at(node: &mut TreeNode, segments: &[String], value: TreeNode) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    let children = node.children_mut_or_coerce();
    if rest.is_empty() {
        children.remove(first.as_str());
        if !value.is_null() {
            children.insert(first.clone(), value);
        }
    } else {
        let child = children.get_or_insert_with(first.clone(), TreeNode::default);
        put_at(child, rest, value);
        if child.is_null() {
            children.remove(first.as_str());
        }
    }
    if children.is_empty() {
        *node = TreeNode::Null;
    }
}

fn merge_at(node: &mut TreeNode, segments: &[String], value: &Value) {
    let Some((first, rest)) = segments.split_first() else {
        merge_here(node, value);
        return;
    };
    let children = node.children_mut_or_coerce();
    let child = children.get_or_insert_with(first.clone(), TreeNode::default);
    merge_at(child, rest, value);
    if child.is_null() {
        children.remove(first.as_str());
    }
    if children.is_empty() {
        *node = TreeNode::Null;
    }
}

fn merge_here(node: &mut TreeNode, value: &Value) {
    if !value.is_container() {
        *node = TreeNode::from_value(value);
        return;
    }
    let entries = value.entries();
    if entries.is_empty() {
        return;
    }
    let children = node.children_mut_or_coerce();
    for (key, child_value) in entries {
        if key.is_empty() {
            continue;
        }
        if child_value.is_container() {
            let child = children.get_or_insert_with(key.clone(), TreeNode::default);
            merge_here(child, child_value);
            if child.is_null() {
                children.remove(key.as_str());
            }
        } else {
            children.remove(key.as_str());
            if !child_value.is_null() {
                children.insert(key, TreeNode::from_value(child_value));
            }
        }
    }
    if children.is_empty() {
        *node = TreeNode::Null;
    }
}
