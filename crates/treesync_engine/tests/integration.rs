//! Integration tests for the session against an in-memory server.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use treesync_codec::{from_json_str, Value};
use treesync_core::Path;
use treesync_engine::{
    ConnectionState, Event, EventKind, ListenStatus, ManualClock, MockTransport, Session,
    SessionConfig, SyncError,
};
use treesync_protocol::{Action, InboundMessage, OutboundRequest};
use treesync_testkit::{FakeServer, INVALID_TOKEN, PERMISSION_DENIED};

const T0: u64 = 1_700_000_000_000;

/// A session wired to a fake server through a mock transport.
///
/// Every request and reply goes through its wire encoding.
struct Harness {
    session: Session<MockTransport, ManualClock>,
    transport: MockTransport,
    clock: ManualClock,
    server: FakeServer,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        init_tracing();
        let transport = MockTransport::new();
        let clock = ManualClock::new(T0);
        Self {
            session: Session::with_clock(config, transport.clone(), clock.clone()),
            transport,
            clock,
            server: FakeServer::new().with_time(T0 + 1_000),
        }
    }

    fn connected() -> Self {
        let mut harness = Self::new(SessionConfig::new("mock://chat"));
        harness.connect();
        harness
    }

    fn connect(&mut self) {
        self.session.connect().unwrap();
        let handshake = self.server.handshake();
        self.deliver(handshake);
        self.pump();
    }

    fn deliver(&mut self, message: InboundMessage) {
        self.session.handle_frame(&message.encode()).unwrap();
    }

    fn deliver_all(&mut self, messages: Vec<InboundMessage>) {
        for message in messages {
            self.deliver(message);
        }
    }

    /// Runs request/reply rounds until the client stops sending.
    fn pump(&mut self) {
        loop {
            let sent = self.transport.take_sent();
            if sent.is_empty() {
                break;
            }
            for request in sent {
                let request = OutboundRequest::decode(&request.encode()).unwrap();
                let replies = self.server.process(&request);
                self.deliver_all(replies);
            }
        }
    }

    fn drop_connection(&mut self) {
        self.transport.take_sent();
        let closed = self.server.disconnect(true);
        self.deliver(closed);
    }

    fn reconnect_after(&mut self, delay: Duration) {
        self.clock.advance(delay);
        self.session.tick();
        assert_eq!(self.session.state(), ConnectionState::Connecting);
        let handshake = self.server.handshake();
        self.deliver(handshake);
        self.pump();
    }

    fn requests_of(&self, action: Action) -> usize {
        self.server
            .received()
            .iter()
            .filter(|r| r.action == action)
            .count()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn p(s: &str) -> Path {
    Path::parse(s).unwrap()
}

fn recorder() -> (Arc<Mutex<Vec<Event>>>, impl FnMut(&Event) + Send + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &Event| sink.lock().push(event.clone()))
}

#[test]
fn chat_messages_arrive_in_push_order() {
    let mut h = Harness::connected();
    let messages = p("/rooms/r1/messages");
    let (events, handler) = recorder();
    h.session.watch(&messages, EventKind::ChildAdded, handler);
    h.pump();
    assert_eq!(h.session.listen_status(&messages), Some(ListenStatus::Active));

    let (first, _) = h.session.push(&messages, Value::string("hello")).unwrap();
    let (second, _) = h.session.push(&messages, Value::string("world")).unwrap();
    assert!(first < second);
    assert!(events.lock().is_empty());

    h.pump();
    let events = events.lock();
    let keys: Vec<_> = events.iter().filter_map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![first.clone(), second]);
    assert_eq!(events[0].snapshot, Value::string("hello"));
    assert_eq!(
        h.session.value_at(&messages.child(first.as_str()).unwrap()),
        Value::string("hello")
    );
    assert_eq!(h.server.value_at(&messages), h.session.value_at(&messages));
}

#[test]
fn ancestor_listen_replaces_descendant_on_the_wire() {
    let mut h = Harness::connected();
    h.session.watch(&p("/a/b"), EventKind::Value, |_: &Event| {});
    let outer = h.session.watch(&p("/a"), EventKind::Value, |_: &Event| {});
    h.pump();

    assert_eq!(h.server.listens().cloned().collect::<Vec<_>>(), vec![p("/a")]);
    assert_eq!(h.session.listen_status(&p("/a")), Some(ListenStatus::Active));
    assert_eq!(h.session.listen_status(&p("/a/b")), Some(ListenStatus::Masked));

    h.session.unwatch(outer).unwrap();
    h.pump();
    assert_eq!(h.server.listens().cloned().collect::<Vec<_>>(), vec![p("/a/b")]);
    assert_eq!(h.session.listen_status(&p("/a/b")), Some(ListenStatus::Active));
}

#[test]
fn remote_changes_fire_value_callbacks_once() {
    let mut h = Harness::connected();
    let (events, handler) = recorder();
    h.session.watch(&p("/scores"), EventKind::Value, handler);
    h.pump();

    let updates = h.server.set_value(&p("/scores/alice"), Value::from(10));
    h.deliver_all(updates);
    let updates = h.server.set_value(&p("/scores/alice"), Value::from(10));
    h.deliver_all(updates);
    let updates = h.server.set_value(&p("/scores/bob"), Value::from(7));
    h.deliver_all(updates);

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].snapshot, from_json_str(r#"{"alice":10}"#).unwrap());
    assert_eq!(
        events[1].snapshot,
        from_json_str(r#"{"alice":10,"bob":7}"#).unwrap()
    );
}

#[test]
fn writes_survive_a_dropped_connection() {
    let mut h = Harness::connected();
    h.session.watch(&p("/x"), EventKind::Value, |_: &Event| {});
    h.pump();

    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    h.session
        .write_with(&p("/x/y"), Value::from(1), move |_, result| {
            *sink.lock() = Some(result);
        })
        .unwrap();
    h.drop_connection();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.server.value_at(&p("/x/y")), Value::Null);

    h.reconnect_after(Duration::from_secs(1));
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert!(h.server.is_listening(&p("/x")));
    assert_eq!(h.server.value_at(&p("/x/y")), Value::Number(1.0));
    assert_eq!(h.session.value_at(&p("/x/y")), Value::Number(1.0));
    assert_eq!(*outcome.lock(), Some(Ok(None)));
    assert_eq!(h.session.stats().reconnects, 1);
    assert_eq!(h.session.stats().handshakes, 2);
}

#[test]
fn offline_writes_go_out_after_listens() {
    let mut h = Harness::new(SessionConfig::new("mock://chat"));
    h.session.watch(&p("/todo"), EventKind::ChildAdded, |_: &Event| {});
    h.session
        .merge(&p("/todo"), from_json_str(r#"{"1":"milk","2":"eggs"}"#).unwrap())
        .unwrap();
    h.session.write(&p("/todo/3"), Value::string("bread")).unwrap();
    assert!(h.transport.sent().is_empty());

    h.connect();
    let actions: Vec<Action> = h.server.received().iter().map(|r| r.action).collect();
    assert_eq!(actions, vec![Action::Listen, Action::Merge, Action::Put]);
    assert_eq!(
        h.session.value_at(&p("/todo")),
        from_json_str(r#"{"1":"milk","2":"eggs","3":"bread"}"#).unwrap()
    );
}

#[test]
fn credentials_are_presented_on_every_connection() {
    let mut h = Harness::new(SessionConfig::new("mock://chat").with_auth_token("secret"));
    h.server.accept_token("secret");
    h.connect();
    assert!(h.server.is_authenticated());

    h.drop_connection();
    assert!(!h.server.is_authenticated());
    h.reconnect_after(Duration::from_secs(1));
    assert!(h.server.is_authenticated());
    assert_eq!(h.requests_of(Action::Auth), 2);
}

#[test]
fn bad_credentials_are_reported() {
    let mut h = Harness::connected();
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    h.session.authenticate_with("wrong", move |_, result| {
        *sink.lock() = Some(result);
    });
    h.pump();
    assert_eq!(
        *outcome.lock(),
        Some(Err(SyncError::rejected(INVALID_TOKEN, None)))
    );
}

#[test]
fn rejected_listens_are_not_retried() {
    let mut h = Harness::connected();
    h.server.reject_path(p("/private"));
    h.session.watch(&p("/private/notes"), EventKind::Value, |_: &Event| {});
    h.pump();
    assert_eq!(
        h.session.listen_status(&p("/private/notes")),
        Some(ListenStatus::Failed)
    );

    h.drop_connection();
    h.reconnect_after(Duration::from_secs(1));
    assert_eq!(h.requests_of(Action::Listen), 1);

    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    h.session
        .write_with(&p("/private/notes"), Value::from(true), move |_, result| {
            *sink.lock() = Some(result);
        })
        .unwrap();
    h.pump();
    assert_eq!(
        *outcome.lock(),
        Some(Err(SyncError::rejected(PERMISSION_DENIED, None)))
    );
}

#[test]
fn server_requested_backoff_and_shutdown() {
    let mut h = Harness::connected();
    h.deliver(InboundMessage::closed(true, Some(Duration::from_secs(30))));
    h.clock.advance(Duration::from_secs(29));
    h.session.tick();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    h.reconnect_after(Duration::from_secs(1));
    assert_eq!(h.session.state(), ConnectionState::Connected);

    h.deliver(InboundMessage::closed(false, None));
    h.clock.advance(Duration::from_secs(600));
    h.session.tick();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.open_count(), 2);
}

#[test]
fn push_keys_use_server_time() {
    let mut h = Harness::connected();
    assert_eq!(h.session.server_time_offset(), 1_000);
    let (key, _) = h.session.push(&p("/log"), Value::Bool(true)).unwrap();
    assert_eq!(
        treesync_protocol::push_id_millis(&key),
        Some(T0 + 1_000)
    );
}
