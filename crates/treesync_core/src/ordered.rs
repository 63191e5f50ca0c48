//! Comparator-ordered AVL map.
//!
//! [`OrderedMap`] is the container everything else is built on: the children
//! of an internal cache node, the listen registry and the callback registry.
//! Besides point lookups it supports ordered iteration starting at an
//! arbitrary key, which is what turns "all descendants of a path" into a
//! range scan.
//!
//! Entries own their keys and values; copying a map is an ordinary
//! [`Clone`].

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;

/// A total order over keys of type `K`.
pub trait Comparator<K: ?Sized> {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

impl<K: ?Sized, F> Comparator<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// Comparator that uses the key's [`Ord`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord + ?Sized> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Depth-first visiting order for [`OrderedMap::for_each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Node, then left subtree, then right subtree.
    PreOrder,
    /// Left subtree, node, right subtree (ascending key order).
    InOrder,
    /// Left subtree, right subtree, then node.
    PostOrder,
}

type Link<K, V> = Option<Box<Node<K, V>>>;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    height: u8,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V> Node<K, V> {
    fn leaf(key: K, value: V) -> Self {
        Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        }
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance_factor(&self) -> i16 {
        i16::from(height(&self.left)) - i16::from(height(&self.right))
    }
}

fn height<K, V>(link: &Link<K, V>) -> u8 {
    link.as_ref().map_or(0, |n| n.height)
}

/// An AVL tree map ordered by a caller-supplied comparator.
///
/// Inserting an existing key is rejected rather than overwriting; callers
/// that need to update use [`OrderedMap::get_mut`] or remove first.
#[derive(Clone)]
pub struct OrderedMap<K, V, C = NaturalOrder> {
    root: Link<K, V>,
    len: usize,
    cmp: C,
}

impl<K: Ord, V> OrderedMap<K, V, NaturalOrder> {
    /// Creates an empty map ordered by `K: Ord`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }
}

impl<K, V, C: Default> Default for OrderedMap<K, V, C> {
    fn default() -> Self {
        Self::with_comparator(C::default())
    }
}

impl<K, V, C> OrderedMap<K, V, C> {
    /// Creates an empty map with the given comparator.
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            root: None,
            len: 0,
            cmp,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the tree (0 when empty).
    pub fn height(&self) -> usize {
        usize::from(height(&self.root))
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    /// Looks up a key.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparator<Q>,
    {
        let mut link = self.root.as_deref();
        while let Some(node) = link {
            match self.cmp.compare(key, node.key.borrow()) {
                Ordering::Less => link = node.left.as_deref(),
                Ordering::Greater => link = node.right.as_deref(),
                Ordering::Equal => return Some(&node.value),
            }
        }
        None
    }

    /// Looks up a key for in-place mutation.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparator<Q>,
    {
        let cmp = &self.cmp;
        let mut link = self.root.as_deref_mut();
        while let Some(node) = link {
            match cmp.compare(key, node.key.borrow()) {
                Ordering::Less => link = node.left.as_deref_mut(),
                Ordering::Greater => link = node.right.as_deref_mut(),
                Ordering::Equal => return Some(&mut node.value),
            }
        }
        None
    }

    /// Returns true if the key is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparator<Q>,
    {
        self.get(key).is_some()
    }

    /// Inserts a new entry.
    ///
    /// Returns `false`, leaving the map unchanged, if the key already exists.
    pub fn insert(&mut self, key: K, value: V) -> bool
    where
        C: Comparator<K>,
    {
        let (root, inserted) = insert_node(self.root.take(), key, value, &self.cmp);
        self.root = Some(root);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// Returns the value for `key`, inserting `default()` first if absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, default: F) -> &mut V
    where
        K: Clone,
        C: Comparator<K>,
        F: FnOnce() -> V,
    {
        if !self.contains_key(&key) {
            self.insert(key.clone(), default());
        }
        match self.get_mut(&key) {
            Some(value) => value,
            None => unreachable!("entry was just inserted"),
        }
    }

    /// Removes an entry, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparator<Q>,
    {
        let (root, removed) = remove_node(self.root.take(), key, &self.cmp);
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Iterates over all entries in ascending order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// Iterates over entries whose key is `>= key`, in ascending order.
    pub fn iter_from<Q>(&self, key: &Q) -> Iter<'_, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        C: Comparator<Q>,
    {
        let mut stack = Vec::new();
        let mut link = self.root.as_deref();
        while let Some(node) = link {
            match self.cmp.compare(key, node.key.borrow()) {
                Ordering::Less => {
                    stack.push(node);
                    link = node.left.as_deref();
                }
                Ordering::Equal => {
                    stack.push(node);
                    break;
                }
                Ordering::Greater => link = node.right.as_deref(),
            }
        }
        Iter { stack }
    }

    /// Iterates over keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterates over values in ascending key order.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// The smallest entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        self.iter().next()
    }

    /// Visits every entry in the given depth-first order.
    pub fn for_each<F>(&self, order: Traversal, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        visit(self.root.as_deref(), order, &mut f);
    }

    /// Visits every entry in ascending order with mutable access to values.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, &mut V),
    {
        visit_mut(self.root.as_deref_mut(), &mut f);
    }

    /// Checks ordering, AVL balance, cached heights and the entry count.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn assert_valid(&self) -> Result<(), String>
    where
        C: Comparator<K>,
    {
        let mut count = 0;
        check_node(self.root.as_deref(), &mut count)?;
        if count != self.len {
            return Err(format!("len is {} but tree holds {count} nodes", self.len));
        }
        let mut prev: Option<&K> = None;
        for (key, _) in self.iter() {
            if let Some(prev) = prev {
                if self.cmp.compare(prev, key) != Ordering::Less {
                    return Err("in-order traversal is not strictly ascending".into());
                }
            }
            prev = Some(key);
        }
        Ok(())
    }
}

fn rotate_right<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    node.update_height();
    pivot.right = Some(node);
    pivot.update_height();
    pivot
}

fn rotate_left<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    node.update_height();
    pivot.left = Some(node);
    pivot.update_height();
    pivot
}

fn rebalance<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    node.update_height();
    let bf = node.balance_factor();
    if bf > 1 {
        if let Some(left) = node.left.take() {
            node.left = Some(if left.balance_factor() < 0 {
                rotate_left(left)
            } else {
                left
            });
        }
        return rotate_right(node);
    }
    if bf < -1 {
        if let Some(right) = node.right.take() {
            node.right = Some(if right.balance_factor() > 0 {
                rotate_right(right)
            } else {
                right
            });
        }
        return rotate_left(node);
    }
    debug_assert!(bf.abs() <= 1);
    node
}

fn insert_node<K, V, C>(link: Link<K, V>, key: K, value: V, cmp: &C) -> (Box<Node<K, V>>, bool)
where
    C: Comparator<K>,
{
    let Some(mut node) = link else {
        return (Box::new(Node::leaf(key, value)), true);
    };
    match cmp.compare(&key, &node.key) {
        Ordering::Equal => (node, false),
        Ordering::Less => {
            let (child, inserted) = insert_node(node.left.take(), key, value, cmp);
            node.left = Some(child);
            if inserted {
                (rebalance(node), true)
            } else {
                (node, false)
            }
        }
        Ordering::Greater => {
            let (child, inserted) = insert_node(node.right.take(), key, value, cmp);
            node.right = Some(child);
            if inserted {
                (rebalance(node), true)
            } else {
                (node, false)
            }
        }
    }
}

fn remove_node<K, V, C, Q>(link: Link<K, V>, key: &Q, cmp: &C) -> (Link<K, V>, Option<V>)
where
    K: Borrow<Q>,
    Q: ?Sized,
    C: Comparator<Q>,
{
    let Some(mut node) = link else {
        return (None, None);
    };
    match cmp.compare(key, node.key.borrow()) {
        Ordering::Less => {
            let (left, removed) = remove_node(node.left.take(), key, cmp);
            node.left = left;
            (Some(rebalance(node)), removed)
        }
        Ordering::Greater => {
            let (right, removed) = remove_node(node.right.take(), key, cmp);
            node.right = right;
            (Some(rebalance(node)), removed)
        }
        Ordering::Equal => {
            let Node {
                value, left, right, ..
            } = *node;
            let replacement = match (left, right) {
                (None, None) => None,
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (Some(l), Some(r)) => {
                    let (rest, mut successor) = take_min(r);
                    successor.left = Some(l);
                    successor.right = rest;
                    Some(rebalance(successor))
                }
            };
            (replacement, Some(value))
        }
    }
}

/// Detaches the minimum node of a subtree.
fn take_min<K, V>(mut node: Box<Node<K, V>>) -> (Link<K, V>, Box<Node<K, V>>) {
    match node.left.take() {
        None => {
            let rest = node.right.take();
            (rest, node)
        }
        Some(left) => {
            let (rest, min) = take_min(left);
            node.left = rest;
            (Some(rebalance(node)), min)
        }
    }
}

fn visit<K, V, F>(link: Option<&Node<K, V>>, order: Traversal, f: &mut F)
where
    F: FnMut(&K, &V),
{
    let Some(node) = link else {
        return;
    };
    if order == Traversal::PreOrder {
        f(&node.key, &node.value);
    }
    visit(node.left.as_deref(), order, f);
    if order == Traversal::InOrder {
        f(&node.key, &node.value);
    }
    visit(node.right.as_deref(), order, f);
    if order == Traversal::PostOrder {
        f(&node.key, &node.value);
    }
}

fn visit_mut<K, V, F>(link: Option<&mut Node<K, V>>, f: &mut F)
where
    F: FnMut(&K, &mut V),
{
    let Some(node) = link else {
        return;
    };
    visit_mut(node.left.as_deref_mut(), f);
    f(&node.key, &mut node.value);
    visit_mut(node.right.as_deref_mut(), f);
}

fn check_node<K, V>(link: Option<&Node<K, V>>, count: &mut usize) -> Result<u8, String> {
    let Some(node) = link else {
        return Ok(0);
    };
    *count += 1;
    let lh = check_node(node.left.as_deref(), count)?;
    let rh = check_node(node.right.as_deref(), count)?;
    if (i16::from(lh) - i16::from(rh)).abs() > 1 {
        return Err(format!("unbalanced node: left height {lh}, right height {rh}"));
    }
    let expected = 1 + lh.max(rh);
    if node.height != expected {
        return Err(format!(
            "stale height: cached {}, actual {expected}",
            node.height
        ));
    }
    Ok(expected)
}

/// In-order iterator over an [`OrderedMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left(&mut self, mut link: Option<&'a Node<K, V>>) {
        while let Some(node) = link {
            self.stack.push(node);
            link = node.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}

impl<'a, K, V, C> IntoIterator for &'a OrderedMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, C> fmt::Debug for OrderedMap<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
