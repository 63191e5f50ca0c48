//! In-memory server for end-to-end tests.
//!
//! [`FakeServer`] answers decoded client requests with the messages a real
//! server would send back. Tests pump requests out of a mock transport,
//! feed them to [`FakeServer::process`] and hand the replies to the client.

use std::collections::BTreeSet;
use tracing::{debug, trace};
use treesync_codec::Value;
use treesync_core::{Cache, Path};
use treesync_protocol::{Action, InboundMessage, OutboundRequest};

/// Status sent for requests on a rejected path.
pub const PERMISSION_DENIED: &str = "permission_denied";

/// Status sent for an unknown credential.
pub const INVALID_TOKEN: &str = "invalid_token";

/// A single-client server holding its own copy of the tree.
#[derive(Debug, Default)]
pub struct FakeServer {
    data: Cache,
    listens: BTreeSet<Path>,
    accepted_tokens: BTreeSet<String>,
    rejected_paths: Vec<Path>,
    authenticated: bool,
    time_millis: u64,
    received: Vec<OutboundRequest>,
}

impl FakeServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the wall clock reported in handshakes.
    #[must_use]
    pub fn with_time(mut self, millis: u64) -> Self {
        self.time_millis = millis;
        self
    }

    /// Accepts `token` in auth requests.
    pub fn accept_token(&mut self, token: impl Into<String>) {
        self.accepted_tokens.insert(token.into());
    }

    /// Rejects listens and writes at or below `path`.
    pub fn reject_path(&mut self, path: Path) {
        self.rejected_paths.push(path);
    }

    /// The handshake a fresh connection starts with.
    pub fn handshake(&self) -> InboundMessage {
        InboundMessage::handshake(self.time_millis)
    }

    /// Drops per-connection state and returns the close notification.
    pub fn disconnect(&mut self, recoverable: bool) -> InboundMessage {
        self.listens.clear();
        self.authenticated = false;
        debug!(recoverable, "fake server dropped connection");
        InboundMessage::closed(recoverable, None)
    }

    /// Returns true if a listen is registered at exactly `path`.
    pub fn is_listening(&self, path: &Path) -> bool {
        self.listens.contains(path)
    }

    /// Registered listens in path order.
    pub fn listens(&self) -> impl Iterator<Item = &Path> + '_ {
        self.listens.iter()
    }

    /// Returns true after an accepted auth on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Server-side value at `path`.
    pub fn value_at(&self, path: &Path) -> Value {
        self.data.value_at(path)
    }

    /// Every request processed so far.
    pub fn received(&self) -> &[OutboundRequest] {
        &self.received
    }

    /// Changes data on the server side, as another client would.
    ///
    /// Returns the updates sent to listeners.
    pub fn set_value(&mut self, path: &Path, value: Value) -> Vec<InboundMessage> {
        self.data.put(path, &value);
        self.fan_out(path, InboundMessage::put(path.clone(), value))
    }

    /// Handles one request and returns the replies in send order.
    pub fn process(&mut self, request: &OutboundRequest) -> Vec<InboundMessage> {
        trace!(request_id = request.id.0, action = request.action.code(), "fake server request");
        self.received.push(request.clone());

        let path = request.path.clone().unwrap_or_default();
        match request.action {
            Action::Listen => {
                if self.is_rejected(&path) {
                    return vec![InboundMessage::rejected(request.id, PERMISSION_DENIED)];
                }
                self.listens.insert(path.clone());
                let initial = InboundMessage::put(path.clone(), self.data.value_at(&path));
                vec![initial, InboundMessage::ok(request.id)]
            }
            Action::Unlisten => {
                self.listens.remove(&path);
                Vec::new()
            }
            Action::Put | Action::Merge => {
                if self.is_rejected(&path) {
                    return vec![InboundMessage::rejected(request.id, PERMISSION_DENIED)];
                }
                let data = request.data.clone().unwrap_or_default();
                let update = if request.action == Action::Put {
                    self.data.put(&path, &data);
                    InboundMessage::put(path.clone(), data)
                } else {
                    self.data.merge(&path, &data);
                    InboundMessage::merge(path.clone(), data)
                };
                let mut replies = self.fan_out(&path, update);
                replies.push(InboundMessage::ok(request.id));
                replies
            }
            Action::Auth => {
                let credential = request.credential.as_deref().unwrap_or_default();
                if self.accepted_tokens.contains(credential) {
                    self.authenticated = true;
                    vec![InboundMessage::ok(request.id)]
                } else {
                    vec![InboundMessage::rejected(request.id, INVALID_TOKEN)]
                }
            }
            Action::Keepalive => Vec::new(),
        }
    }

    /// Handles a batch of requests, concatenating the replies.
    pub fn process_all(&mut self, requests: &[OutboundRequest]) -> Vec<InboundMessage> {
        requests.iter().flat_map(|r| self.process(r)).collect()
    }

    fn is_rejected(&self, path: &Path) -> bool {
        self.rejected_paths.iter().any(|r| r.is_prefix_of(path))
    }

    /// Updates for every listener affected by a change at `changed`.
    ///
    /// Listeners at or above the change get `update` itself; listeners
    /// below it get a put of their new value.
    fn fan_out(&self, changed: &Path, update: InboundMessage) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        if self.listens.iter().any(|l| l.is_prefix_of(changed)) {
            messages.push(update);
        }
        for listen in self.listens.iter().filter(|l| changed.is_strict_prefix_of(l)) {
            messages.push(InboundMessage::put(listen.clone(), self.data.value_at(listen)));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_protocol::RequestId;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn listen_sends_initial_value_then_ok() {
        let mut server = FakeServer::new();
        server.set_value(&p("/a/b"), Value::from(1));

        let replies = server.process(&OutboundRequest::listen(RequestId(1), p("/a")));
        assert_eq!(
            replies,
            vec![
                InboundMessage::put(p("/a"), Value::object([("b", Value::Number(1.0))])),
                InboundMessage::ok(RequestId(1)),
            ]
        );
        assert!(server.is_listening(&p("/a")));
    }

    #[test]
    fn writes_echo_to_covering_and_nested_listeners() {
        let mut server = FakeServer::new();
        server.process(&OutboundRequest::listen(RequestId(1), p("/a")));
        server.process(&OutboundRequest::listen(RequestId(2), p("/x/y")));

        let put = OutboundRequest::put(RequestId(3), p("/a/b"), Value::from(2));
        let replies = server.process(&put);
        assert_eq!(
            replies,
            vec![
                InboundMessage::put(p("/a/b"), Value::from(2)),
                InboundMessage::ok(RequestId(3)),
            ]
        );

        let replies = server.set_value(&p("/x"), Value::object([("y", Value::from(true))]));
        assert_eq!(replies, vec![InboundMessage::put(p("/x/y"), Value::Bool(true))]);
    }

    #[test]
    fn rejections() {
        let mut server = FakeServer::new();
        server.reject_path(p("/private"));
        server.accept_token("good");

        assert_eq!(
            server.process(&OutboundRequest::listen(RequestId(1), p("/private/x"))),
            vec![InboundMessage::rejected(RequestId(1), PERMISSION_DENIED)]
        );
        assert_eq!(
            server.process(&OutboundRequest::auth(RequestId(2), "bad")),
            vec![InboundMessage::rejected(RequestId(2), INVALID_TOKEN)]
        );
        assert!(!server.is_authenticated());
        server.process(&OutboundRequest::auth(RequestId(3), "good"));
        assert!(server.is_authenticated());
    }

    #[test]
    fn disconnect_drops_listens() {
        let mut server = FakeServer::new();
        server.process(&OutboundRequest::listen(RequestId(1), p("/a")));
        assert_eq!(server.disconnect(true), InboundMessage::closed(true, None));
        assert_eq!(server.listens().count(), 0);
        assert_eq!(server.received().len(), 1);
    }
}
