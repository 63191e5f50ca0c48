//! Wire-level listen bookkeeping.
//!
//! Every watched path has one [`ListenItem`], ref-counted across
//! subscriptions. An item only needs its own server-side listen when no
//! ancestor item already covers it; covered items sit in
//! [`ListenStatus::Masked`] until the covering ancestor goes away.
//!
//! Items are kept in an [`OrderedMap`] keyed by [`Path`]. Since a path's
//! descendants sort directly after it, "everything under `p`" is a range
//! scan from `p` that stops at the first key `p` is not a prefix of.
//!
//! Status transitions:
//!
//! | From | Event | To |
//! |---|---|---|
//! | (new) | acquire, no covering ancestor | Required, or Pending if online |
//! | (new) | acquire, covered | Masked |
//! | Required | resume / promote while online | Pending (listen sent) |
//! | Pending | ack | Active, descendants masked |
//! | Pending | rejection | Failed, descendants unmasked |
//! | Active, Pending | suspend | Required |
//! | Active, Pending, Required | covering ancestor appears | Masked |
//! | Masked | covering ancestor released or failed | Required / Pending |

use std::collections::HashMap;
use tracing::{debug, trace, warn};
use treesync_core::{OrderedMap, Path};
use treesync_protocol::RequestId;

/// Wire status of a listened path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenStatus {
    /// Needs a listen; none sent yet.
    Required,
    /// Listen sent, awaiting acknowledgement.
    Pending,
    /// Server acknowledged the listen.
    Active,
    /// Server rejected the listen.
    Failed,
    /// Covered by an ancestor's listen.
    Masked,
}

impl ListenStatus {
    /// Returns true if an item in this status covers its descendants.
    pub fn covers_descendants(self) -> bool {
        matches!(
            self,
            ListenStatus::Required | ListenStatus::Pending | ListenStatus::Active
        )
    }
}

/// One listened path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenItem {
    path: Path,
    status: ListenStatus,
    ref_count: usize,
    request: Option<RequestId>,
}

impl ListenItem {
    /// The listened path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current status.
    pub fn status(&self) -> ListenStatus {
        self.status
    }

    /// Number of subscriptions holding this item.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }
}

/// Where the registry sends its wire requests.
pub trait ListenSink {
    /// Sends a listen and returns the request id it was sent under.
    fn listen(&mut self, path: &Path) -> RequestId;

    /// Sends an unlisten.
    fn unlisten(&mut self, path: &Path);
}

/// Ordered registry of listened paths.
#[derive(Debug, Default)]
pub struct ListenRegistry {
    items: OrderedMap<Path, ListenItem>,
    pending: HashMap<RequestId, Path>,
    online: bool,
}

impl ListenRegistry {
    /// Creates an empty, offline registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listened paths.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no path is listened.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true between `resume_all` and `suspend_all`.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Looks up an item.
    pub fn get(&self, path: &Path) -> Option<&ListenItem> {
        self.items.get(path)
    }

    /// Status of the item at `path`.
    pub fn status(&self, path: &Path) -> Option<ListenStatus> {
        self.get(path).map(ListenItem::status)
    }

    /// All items in path order.
    pub fn iter(&self) -> impl Iterator<Item = &ListenItem> + '_ {
        self.items.values()
    }

    /// Adds one reference to `path`, creating its item if needed.
    pub fn acquire(&mut self, path: &Path, sink: &mut dyn ListenSink) -> &ListenItem {
        if let Some(item) = self.items.get_mut(path) {
            item.ref_count += 1;
            trace!(path = %path, ref_count = item.ref_count, "listen ref added");
        } else {
            let status = if self.is_covered(path) {
                debug!(path = %path, "new listen masked by ancestor");
                ListenStatus::Masked
            } else {
                ListenStatus::Required
            };
            self.items.insert(
                path.clone(),
                ListenItem {
                    path: path.clone(),
                    status,
                    ref_count: 1,
                    request: None,
                },
            );
            if status == ListenStatus::Required && self.online {
                self.send_listen(path, sink);
            }
        }
        match self.items.get(path) {
            Some(item) => item,
            None => unreachable!("item was just inserted"),
        }
    }

    /// Drops one reference to `path`.
    ///
    /// At zero the item is removed; an unlisten goes out if it had a listen
    /// on the wire, and masked descendants it was covering are promoted.
    /// Returns false if `path` has no item.
    pub fn release(&mut self, path: &Path, sink: &mut dyn ListenSink) -> bool {
        let Some(item) = self.items.get_mut(path) else {
            return false;
        };
        debug_assert!(item.ref_count > 0, "listen item with zero references");
        item.ref_count -= 1;
        if item.ref_count > 0 {
            trace!(path = %path, ref_count = item.ref_count, "listen ref dropped");
            return true;
        }

        let status = item.status;
        self.items.remove(path);
        self.pending.retain(|_, p| *p != *path);
        if self.online && matches!(status, ListenStatus::Active | ListenStatus::Pending) {
            debug!(path = %path, "sending unlisten");
            sink.unlisten(path);
        }
        if status.covers_descendants() {
            self.unmask_descendants(path, sink);
        }
        true
    }

    /// Applies the server's answer to a listen request.
    ///
    /// Only the latest listen sent for a path changes its status; answers to
    /// listens it superseded are consumed and ignored. Returns false if `id`
    /// is not a listen this registry is waiting on.
    pub fn handle_response(
        &mut self,
        id: RequestId,
        ok: bool,
        sink: &mut dyn ListenSink,
    ) -> bool {
        let Some(path) = self.pending.remove(&id) else {
            return false;
        };
        let Some(item) = self.items.get_mut(&path) else {
            return true;
        };
        if item.request != Some(id) {
            trace!(path = %path, request_id = id.0, "ignoring superseded listen response");
            return true;
        }
        item.request = None;

        match (item.status, ok) {
            (ListenStatus::Pending, true) => {
                item.status = ListenStatus::Active;
                debug!(path = %path, request_id = id.0, "listen active");
                self.mask_descendants(&path, sink);
            }
            (ListenStatus::Pending, false) => {
                item.status = ListenStatus::Failed;
                warn!(path = %path, request_id = id.0, "listen rejected");
                self.unmask_descendants(&path, sink);
            }
            (ListenStatus::Masked, true) => {
                // Masked while the listen was in flight.
                debug!(path = %path, "late listen ack for masked path, unlistening");
                sink.unlisten(&path);
            }
            (status, _) => {
                trace!(path = %path, ?status, "ignoring listen response");
            }
        }
        true
    }

    /// Masks every strict descendant of `path` that has its own listen or
    /// is about to get one.
    pub fn mask_descendants(&mut self, path: &Path, sink: &mut dyn ListenSink) {
        for descendant in self.descendants(path) {
            let Some(item) = self.items.get_mut(&descendant) else {
                continue;
            };
            match item.status {
                ListenStatus::Active => {
                    item.status = ListenStatus::Masked;
                    debug!(path = %descendant, ancestor = %path, "masking active listen");
                    sink.unlisten(&descendant);
                }
                ListenStatus::Pending | ListenStatus::Required => {
                    item.status = ListenStatus::Masked;
                    debug!(path = %descendant, ancestor = %path, "masking listen");
                }
                ListenStatus::Failed | ListenStatus::Masked => {}
            }
        }
    }

    /// Marks everything as needing a fresh listen. Called when the
    /// connection drops.
    pub fn suspend_all(&mut self) {
        self.online = false;
        self.pending.clear();
        self.items.for_each_mut(|_, item| {
            item.request = None;
            if matches!(item.status, ListenStatus::Active | ListenStatus::Pending) {
                item.status = ListenStatus::Required;
            }
        });
        debug!(items = self.items.len(), "listens suspended");
    }

    /// Sends a listen for every uncovered Required item. Called after a
    /// handshake.
    pub fn resume_all(&mut self, sink: &mut dyn ListenSink) {
        self.online = true;
        let paths: Vec<Path> = self.items.keys().cloned().collect();
        let mut sent = 0usize;
        for path in paths {
            let covered = self.is_covered(&path);
            let Some(item) = self.items.get_mut(&path) else {
                continue;
            };
            if !matches!(item.status, ListenStatus::Required | ListenStatus::Pending) {
                continue;
            }
            if covered {
                item.status = ListenStatus::Masked;
            } else {
                self.send_listen(&path, sink);
                sent += 1;
            }
        }
        debug!(sent, "listens resumed");
    }

    /// Drops every item without sending anything.
    pub fn clear(&mut self) {
        self.items.clear();
        self.pending.clear();
    }

    /// Returns true if a strict ancestor of `path` covers it.
    pub fn is_covered(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| {
            self.items
                .get(&ancestor)
                .is_some_and(|item| item.status.covers_descendants())
        })
    }

    fn descendants(&self, path: &Path) -> Vec<Path> {
        self.items
            .iter_from(path)
            .map(|(key, _)| key)
            .take_while(|key| path.is_prefix_of(key))
            .filter(|key| *key != path)
            .cloned()
            .collect()
    }

    fn unmask_descendants(&mut self, path: &Path, sink: &mut dyn ListenSink) {
        for descendant in self.descendants(path) {
            if self.status(&descendant) != Some(ListenStatus::Masked)
                || self.is_covered(&descendant)
            {
                continue;
            }
            debug!(path = %descendant, "unmasking listen");
            if self.online {
                self.send_listen(&descendant, sink);
            } else if let Some(item) = self.items.get_mut(&descendant) {
                item.status = ListenStatus::Required;
            }
        }
    }

    fn send_listen(&mut self, path: &Path, sink: &mut dyn ListenSink) {
        let id = sink.listen(path);
        self.pending.insert(id, path.clone());
        if let Some(item) = self.items.get_mut(path) {
            item.status = ListenStatus::Pending;
            item.request = Some(id);
        }
        debug!(path = %path, request_id = id.0, "listen sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        next: u64,
        listens: Vec<(RequestId, Path)>,
        unlistens: Vec<Path>,
    }

    impl RecordingSink {
        fn last_listen_id(&self, path: &Path) -> RequestId {
            self.listens
                .iter()
                .rev()
                .find(|(_, p)| p == path)
                .map(|(id, _)| *id)
                .unwrap()
        }

        fn listened(&self) -> Vec<String> {
            self.listens.iter().map(|(_, p)| p.to_string()).collect()
        }
    }

    impl ListenSink for RecordingSink {
        fn listen(&mut self, path: &Path) -> RequestId {
            self.next += 1;
            self.listens.push((RequestId(self.next), path.clone()));
            RequestId(self.next)
        }

        fn unlisten(&mut self, path: &Path) {
            self.unlistens.push(path.clone());
        }
    }

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn online() -> (ListenRegistry, RecordingSink) {
        let mut registry = ListenRegistry::new();
        let mut sink = RecordingSink::default();
        registry.resume_all(&mut sink);
        (registry, sink)
    }

    fn ack(registry: &mut ListenRegistry, sink: &mut RecordingSink, path: &str) {
        let id = sink.last_listen_id(&p(path));
        assert!(registry.handle_response(id, true, sink));
    }

    #[test]
    fn ancestor_masks_new_descendant() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a"), &mut sink);
        let item = registry.acquire(&p("/a/b"), &mut sink);
        assert_eq!(item.status(), ListenStatus::Masked);
        assert_eq!(sink.listened(), ["/a"]);

        registry.release(&p("/a"), &mut sink);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));
        assert_eq!(sink.listened(), ["/a", "/a/b"]);
        assert_eq!(sink.unlistens, vec![p("/a")]);
    }

    #[test]
    fn offline_acquire_stays_required() {
        let mut registry = ListenRegistry::new();
        let mut sink = RecordingSink::default();
        registry.acquire(&p("/x"), &mut sink);
        assert_eq!(registry.status(&p("/x")), Some(ListenStatus::Required));
        assert!(sink.listens.is_empty());
    }

    #[test]
    fn ref_counting() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/x"), &mut sink);
        assert_eq!(registry.acquire(&p("/x"), &mut sink).ref_count(), 2);
        assert_eq!(sink.listens.len(), 1);

        assert!(registry.release(&p("/x"), &mut sink));
        assert_eq!(registry.get(&p("/x")).unwrap().ref_count(), 1);
        assert!(sink.unlistens.is_empty());

        assert!(registry.release(&p("/x"), &mut sink));
        assert!(registry.is_empty());
        assert_eq!(sink.unlistens, vec![p("/x")]);
        assert!(!registry.release(&p("/x"), &mut sink));
    }

    #[test]
    fn activation_masks_active_descendants() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a/b"), &mut sink);
        ack(&mut registry, &mut sink, "/a/b");
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Active));

        registry.acquire(&p("/a"), &mut sink);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Active));

        ack(&mut registry, &mut sink, "/a");
        assert_eq!(registry.status(&p("/a")), Some(ListenStatus::Active));
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Masked));
        assert_eq!(sink.unlistens, vec![p("/a/b")]);
    }

    #[test]
    fn late_ack_for_masked_item_unlistens() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a/b"), &mut sink);
        registry.acquire(&p("/a"), &mut sink);
        ack(&mut registry, &mut sink, "/a");
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Masked));
        assert!(sink.unlistens.is_empty());

        ack(&mut registry, &mut sink, "/a/b");
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Masked));
        assert_eq!(sink.unlistens, vec![p("/a/b")]);
    }

    #[test]
    fn superseded_listen_response_is_ignored() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a/b"), &mut sink);
        let first = sink.last_listen_id(&p("/a/b"));
        registry.acquire(&p("/a"), &mut sink);
        ack(&mut registry, &mut sink, "/a");
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Masked));

        registry.release(&p("/a"), &mut sink);
        let second = sink.last_listen_id(&p("/a/b"));
        assert_ne!(first, second);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));

        assert!(registry.handle_response(first, false, &mut sink));
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));
        assert!(registry.handle_response(second, true, &mut sink));
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Active));
        assert_eq!(sink.unlistens, vec![p("/a")]);
    }

    #[test]
    fn rejection_unmasks_descendants() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a"), &mut sink);
        registry.acquire(&p("/a/b"), &mut sink);
        let id = sink.last_listen_id(&p("/a"));
        registry.handle_response(id, false, &mut sink);

        assert_eq!(registry.status(&p("/a")), Some(ListenStatus::Failed));
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));
        assert!(!registry.is_covered(&p("/a/b")));
    }

    #[test]
    fn unmasking_promotes_only_outermost() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a"), &mut sink);
        registry.acquire(&p("/a/b"), &mut sink);
        registry.acquire(&p("/a/b/c"), &mut sink);
        registry.acquire(&p("/a/d"), &mut sink);

        registry.release(&p("/a"), &mut sink);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));
        assert_eq!(registry.status(&p("/a/b/c")), Some(ListenStatus::Masked));
        assert_eq!(registry.status(&p("/a/d")), Some(ListenStatus::Pending));
        assert_eq!(sink.listened(), ["/a", "/a/b", "/a/d"]);
    }

    #[test]
    fn suspend_and_resume() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a"), &mut sink);
        registry.acquire(&p("/b"), &mut sink);
        ack(&mut registry, &mut sink, "/a");
        registry.acquire(&p("/a/x"), &mut sink);

        registry.suspend_all();
        assert!(!registry.is_online());
        assert_eq!(registry.status(&p("/a")), Some(ListenStatus::Required));
        assert_eq!(registry.status(&p("/b")), Some(ListenStatus::Required));
        assert_eq!(registry.status(&p("/a/x")), Some(ListenStatus::Masked));

        let stale = sink.last_listen_id(&p("/b"));
        assert!(!registry.handle_response(stale, true, &mut sink));

        sink.listens.clear();
        registry.resume_all(&mut sink);
        assert_eq!(sink.listened(), ["/a", "/b"]);
        assert_eq!(registry.status(&p("/a")), Some(ListenStatus::Pending));
    }

    #[test]
    fn resume_masks_items_covered_by_resumed_ancestor() {
        let mut registry = ListenRegistry::new();
        let mut sink = RecordingSink::default();
        registry.acquire(&p("/a/b"), &mut sink);
        registry.acquire(&p("/a"), &mut sink);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Required));

        registry.resume_all(&mut sink);
        assert_eq!(sink.listened(), ["/a"]);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Masked));
    }

    #[test]
    fn failed_items_do_not_cover_and_are_not_retried() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/a"), &mut sink);
        let id = sink.last_listen_id(&p("/a"));
        registry.handle_response(id, false, &mut sink);

        registry.acquire(&p("/a/b"), &mut sink);
        assert_eq!(registry.status(&p("/a/b")), Some(ListenStatus::Pending));

        registry.suspend_all();
        sink.listens.clear();
        registry.resume_all(&mut sink);
        assert_eq!(sink.listened(), ["/a/b"]);
        assert_eq!(registry.status(&p("/a")), Some(ListenStatus::Failed));
    }

    #[test]
    fn release_while_pending_unlistens_and_ignores_ack() {
        let (mut registry, mut sink) = online();
        registry.acquire(&p("/q"), &mut sink);
        let id = sink.last_listen_id(&p("/q"));
        registry.release(&p("/q"), &mut sink);
        assert_eq!(sink.unlistens, vec![p("/q")]);
        assert!(!registry.handle_response(id, true, &mut sink));
    }

    #[test]
    fn root_listen_covers_everything() {
        let (mut registry, mut sink) = online();
        registry.acquire(&Path::root(), &mut sink);
        registry.acquire(&p("/deep/path"), &mut sink);
        assert_eq!(registry.status(&p("/deep/path")), Some(ListenStatus::Masked));
    }
}
