//! Application callbacks and change detection.
//!
//! A subscription remembers what it last reported: the node hash for value
//! subscriptions, the `(key, hash)` list of children for child
//! subscriptions. After a cache mutation only subscriptions on the changed
//! path, its ancestors and its descendants are re-examined, and a callback
//! fires only if its baseline actually differs.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use tracing::trace;
use treesync_codec::Value;
use treesync_core::{compare_segments, Cache, NodeHash, OrderedMap, Path};

/// Kind of change a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The value at the path changed.
    Value,
    /// A child appeared.
    ChildAdded,
    /// An existing child's value changed.
    ChildChanged,
    /// A child disappeared.
    ChildRemoved,
}

impl EventKind {
    fn watches_children(self) -> bool {
        !matches!(self, EventKind::Value)
    }
}

/// A change delivered to a callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The subscribed path.
    pub path: Path,
    /// Child key for child events.
    pub key: Option<String>,
    /// New value at the path (value events) or of the child (child events).
    /// `Null` for removals.
    pub snapshot: Value,
}

/// Receives events for one subscription.
pub trait EventHandler: Send {
    /// Called once per change.
    fn on_event(&mut self, event: &Event);
}

impl<F> EventHandler for F
where
    F: FnMut(&Event) + Send,
{
    fn on_event(&mut self, event: &Event) {
        self(event)
    }
}

/// Identifies a subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Raw handle value.
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Baseline {
    Hash(Option<NodeHash>),
    Children(Vec<(String, NodeHash)>),
}

impl Baseline {
    fn capture(kind: EventKind, path: &Path, cache: &Cache) -> Self {
        if kind.watches_children() {
            Baseline::Children(child_hashes(path, cache))
        } else {
            Baseline::Hash(cache.hash_of(path))
        }
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    kind: EventKind,
    handler: Box<dyn EventHandler>,
    baseline: Baseline,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

/// Callback registry keyed by path.
#[derive(Debug, Default)]
pub struct OnRegistry {
    by_path: OrderedMap<Path, Vec<Subscription>>,
    handles: HashMap<SubscriptionHandle, Path>,
    next_handle: u64,
}

impl OnRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Path a handle is subscribed to.
    pub fn path_of(&self, handle: SubscriptionHandle) -> Option<&Path> {
        self.handles.get(&handle)
    }

    /// Registers a callback. The current cache state becomes its baseline,
    /// so nothing fires until the data changes.
    pub fn subscribe(
        &mut self,
        path: Path,
        kind: EventKind,
        handler: Box<dyn EventHandler>,
        cache: &Cache,
    ) -> SubscriptionHandle {
        self.next_handle += 1;
        let handle = SubscriptionHandle(self.next_handle);
        let subscription = Subscription {
            handle,
            kind,
            handler,
            baseline: Baseline::capture(kind, &path, cache),
        };
        self.by_path
            .get_or_insert_with(path.clone(), Vec::new)
            .push(subscription);
        trace!(path = %path, handle = handle.0, ?kind, "subscribed");
        self.handles.insert(handle, path);
        handle
    }

    /// Removes a subscription, returning the path it was on.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Option<Path> {
        let path = self.handles.remove(&handle)?;
        if let Some(subscriptions) = self.by_path.get_mut(&path) {
            subscriptions.retain(|s| s.handle != handle);
            if subscriptions.is_empty() {
                self.by_path.remove(&path);
            }
        }
        trace!(path = %path, handle = handle.0, "unsubscribed");
        Some(path)
    }

    /// Drops every subscription.
    pub fn clear(&mut self) {
        self.by_path.clear();
        self.handles.clear();
    }

    /// Re-examines subscriptions affected by a mutation at `changed` and
    /// fires those whose data differs from their baseline.
    ///
    /// Returns the number of callback invocations.
    pub fn on_cache_changed(&mut self, changed: &Path, cache: &Cache) -> usize {
        let mut affected: Vec<Path> = changed
            .ancestors()
            .filter(|ancestor| self.by_path.contains_key(ancestor))
            .collect();
        affected.extend(
            self.by_path
                .iter_from(changed)
                .map(|(path, _)| path)
                .take_while(|path| changed.is_prefix_of(path))
                .cloned(),
        );

        let mut fired = 0;
        for path in affected {
            let Some(subscriptions) = self.by_path.get_mut(&path) else {
                continue;
            };
            for subscription in subscriptions.iter_mut() {
                fired += dispatch(subscription, &path, cache);
            }
        }
        if fired > 0 {
            trace!(path = %changed, fired, "callbacks dispatched");
        }
        fired
    }
}

fn dispatch(subscription: &mut Subscription, path: &Path, cache: &Cache) -> usize {
    let current = Baseline::capture(subscription.kind, path, cache);
    if current == subscription.baseline {
        return 0;
    }
    let previous = std::mem::replace(&mut subscription.baseline, current);

    match (&previous, &subscription.baseline) {
        (Baseline::Hash(_), Baseline::Hash(_)) => {
            let event = Event {
                kind: EventKind::Value,
                path: path.clone(),
                key: None,
                snapshot: cache.value_at(path),
            };
            subscription.handler.on_event(&event);
            1
        }
        (Baseline::Children(old), Baseline::Children(new)) => {
            let mut fired = 0;
            for (kind, key) in diff_children(old, new) {
                if kind != subscription.kind {
                    continue;
                }
                let snapshot = match kind {
                    EventKind::ChildRemoved => Value::Null,
                    _ => cache
                        .get(path)
                        .and_then(|node| node.child(key))
                        .map_or(Value::Null, |child| child.to_value()),
                };
                let event = Event {
                    kind,
                    path: path.clone(),
                    key: Some(key.to_string()),
                    snapshot,
                };
                subscription.handler.on_event(&event);
                fired += 1;
            }
            fired
        }
        _ => 0,
    }
}

fn child_hashes(path: &Path, cache: &Cache) -> Vec<(String, NodeHash)> {
    cache
        .get(path)
        .and_then(|node| node.children())
        .map(|children| {
            children
                .iter()
                .filter_map(|(key, child)| child.hash().map(|hash| (key.clone(), hash)))
                .collect()
        })
        .unwrap_or_default()
}

/// Ordered merge of two child lists sorted in segment order.
fn diff_children<'a>(
    old: &'a [(String, NodeHash)],
    new: &'a [(String, NodeHash)],
) -> Vec<(EventKind, &'a str)> {
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        let order = match (old.get(i), new.get(j)) {
            (Some((a, _)), Some((b, _))) => compare_segments(a, b),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Less => {
                changes.push((EventKind::ChildRemoved, old[i].0.as_str()));
                i += 1;
            }
            Ordering::Greater => {
                changes.push((EventKind::ChildAdded, new[j].0.as_str()));
                j += 1;
            }
            Ordering::Equal => {
                if old[i].1 != new[j].1 {
                    changes.push((EventKind::ChildChanged, new[j].0.as_str()));
                }
                i += 1;
                j += 1;
            }
        }
    }
    changes
}
