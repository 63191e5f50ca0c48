//! The client session.
//!
//! [`Session`] owns every piece of client state: the cache, both
//! registries, the request table and the connection. All entry points take
//! `&mut self` and run to completion, so there is exactly one logical
//! thread of mutation. Callbacks run inside those calls and cannot re-enter
//! the session.

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::listen::{ListenRegistry, ListenSink, ListenStatus};
use crate::on::{EventHandler, EventKind, OnRegistry, SubscriptionHandle};
use crate::transport::Transport;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use treesync_codec::Value;
use treesync_core::{Cache, Path};
use treesync_protocol::{
    Action, InboundMessage, OutboundRequest, PushIdGenerator, RequestId, ResponseStatus,
    UpdateKind,
};

/// Invoked exactly once with the outcome of a write or auth request.
pub type CompletionCallback = Box<dyn FnOnce(RequestId, SyncResult<Option<Value>>) + Send>;

/// Counters about session activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Successful handshakes.
    pub handshakes: u64,
    /// Reconnect attempts started by the backoff timer.
    pub reconnects: u64,
    /// Listen requests sent.
    pub listens_sent: u64,
    /// Unlisten requests sent.
    pub unlistens_sent: u64,
    /// Put and merge requests sent, resends included.
    pub writes_sent: u64,
    /// Keepalive frames sent.
    pub keepalives_sent: u64,
    /// Application callbacks invoked.
    pub callbacks_fired: u64,
    /// Responses dropped because their id was unknown.
    pub dropped_responses: u64,
    /// Inbound frames that failed to decode.
    pub protocol_errors: u64,
}

struct PendingRequest {
    request: OutboundRequest,
    on_complete: Option<CompletionCallback>,
}

impl PendingRequest {
    fn finish(self, result: SyncResult<Option<Value>>) {
        if let Some(callback) = self.on_complete {
            callback(self.request.id, result);
        }
    }
}

/// Writes and auth requests awaiting a response.
///
/// Unlistens and keepalives have no completion; their ids sit in `untracked`
/// so the server's answer is recognized and discarded.
#[derive(Default)]
struct RequestTable {
    last_id: RequestId,
    in_flight: HashMap<RequestId, PendingRequest>,
    queued: BTreeMap<RequestId, PendingRequest>,
    untracked: HashSet<RequestId>,
}

impl RequestTable {
    fn allocate(&mut self) -> RequestId {
        self.last_id = self.last_id.next();
        self.last_id
    }

    fn allocate_untracked(&mut self) -> RequestId {
        let id = self.allocate();
        self.untracked.insert(id);
        id
    }

    fn outstanding(&self) -> usize {
        self.in_flight.len() + self.queued.len()
    }

    fn requeue_in_flight(&mut self) {
        self.untracked.clear();
        let count = self.in_flight.len();
        self.queued.extend(self.in_flight.drain());
        if count > 0 {
            debug!(count, "in-flight requests queued for resend");
        }
    }
}

/// Adapter the listen registry sends through.
struct WireSink<'a, T> {
    transport: &'a mut T,
    requests: &'a mut RequestTable,
    stats: &'a mut SessionStats,
}

impl<'a, T: Transport> WireSink<'a, T> {
    fn new(
        transport: &'a mut T,
        requests: &'a mut RequestTable,
        stats: &'a mut SessionStats,
    ) -> Self {
        Self {
            transport,
            requests,
            stats,
        }
    }
}

impl<T: Transport> ListenSink for WireSink<'_, T> {
    fn listen(&mut self, path: &Path) -> RequestId {
        let id = self.requests.allocate();
        match self.transport.send(&OutboundRequest::listen(id, path.clone())) {
            Ok(()) => self.stats.listens_sent += 1,
            Err(err) => warn!(path = %path, error = %err, "failed to send listen"),
        }
        id
    }

    fn unlisten(&mut self, path: &Path) {
        let id = self.requests.allocate_untracked();
        match self.transport.send(&OutboundRequest::unlisten(id, path.clone())) {
            Ok(()) => self.stats.unlistens_sent += 1,
            Err(err) => warn!(path = %path, error = %err, "failed to send unlisten"),
        }
    }
}

/// A synchronized view of a server tree.
pub struct Session<T: Transport, C: Clock = SystemClock> {
    config: SessionConfig,
    transport: T,
    clock: C,
    connection: Connection,
    cache: Cache,
    listens: ListenRegistry,
    ons: OnRegistry,
    requests: RequestTable,
    push_ids: PushIdGenerator,
    credential: Option<String>,
    stats: SessionStats,
}

impl<T: Transport> Session<T, SystemClock> {
    /// Creates a session on the system clock.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self::with_clock(config, transport, SystemClock)
    }
}

impl<T: Transport, C: Clock> Session<T, C> {
    /// Creates a session with an explicit clock.
    pub fn with_clock(config: SessionConfig, transport: T, clock: C) -> Self {
        Self {
            connection: Connection::new(&config),
            credential: config.auth_token.clone(),
            config,
            transport,
            clock,
            cache: Cache::new(),
            listens: ListenRegistry::new(),
            ons: OnRegistry::new(),
            requests: RequestTable::default(),
            push_ids: PushIdGenerator::new(),
            stats: SessionStats::default(),
        }
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Gets the connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Gets the local cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Cached value at `path`.
    pub fn value_at(&self, path: &Path) -> Value {
        self.cache.value_at(path)
    }

    /// Gets the listen registry.
    pub fn listens(&self) -> &ListenRegistry {
        &self.listens
    }

    /// Wire status of the listen at `path`.
    pub fn listen_status(&self, path: &Path) -> Option<ListenStatus> {
        self.listens.status(path)
    }

    /// Gets the activity counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Gets the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Server time minus local time in milliseconds, from the last handshake.
    pub fn server_time_offset(&self) -> i64 {
        self.connection.clock_offset_millis()
    }

    /// Estimated server wall clock in milliseconds since the epoch.
    pub fn server_now_millis(&self) -> u64 {
        let estimate = i128::from(self.clock.wall_millis()) + i128::from(self.server_time_offset());
        u64::try_from(estimate.max(0)).unwrap_or(u64::MAX)
    }

    /// Earliest timer the caller should wake up for and then call [`Session::tick`].
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connection.next_deadline()
    }

    /// Opens the transport.
    ///
    /// If opening fails with a retryable error a reconnect is scheduled
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] unless disconnected,
    /// or the transport's open error.
    pub fn connect(&mut self) -> SyncResult<()> {
        self.connection.begin_connect()?;
        info!(url = %self.config.url, "connecting");
        if let Err(err) = self.transport.open(&self.config.url) {
            warn!(error = %err, "transport open failed");
            self.handle_closed(err.is_retryable(), None);
            return Err(err);
        }
        Ok(())
    }

    /// Requests a graceful close. No reconnect follows.
    ///
    /// The state stays Disconnecting until the transport reports the close.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error, after forcing Disconnected.
    pub fn close(&mut self) -> SyncResult<()> {
        if !self.connection.begin_close() {
            return Ok(());
        }
        info!("closing connection");
        if let Err(err) = self.transport.close() {
            warn!(error = %err, "transport close failed");
            self.handle_closed(false, None);
            return Err(err);
        }
        Ok(())
    }

    /// Subscribes to changes at `path`.
    pub fn watch<H>(&mut self, path: &Path, kind: EventKind, handler: H) -> SubscriptionHandle
    where
        H: EventHandler + 'static,
    {
        self.watch_boxed(path, kind, Box::new(handler))
    }

    /// Subscribes with an already boxed handler.
    pub fn watch_boxed(
        &mut self,
        path: &Path,
        kind: EventKind,
        handler: Box<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let handle = self.ons.subscribe(path.clone(), kind, handler, &self.cache);
        let mut sink = WireSink::new(&mut self.transport, &mut self.requests, &mut self.stats);
        self.listens.acquire(path, &mut sink);
        handle
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownHandle`] if the handle is not registered.
    pub fn unwatch(&mut self, handle: SubscriptionHandle) -> SyncResult<()> {
        let path = self
            .ons
            .unsubscribe(handle)
            .ok_or(SyncError::UnknownHandle(handle.id()))?;
        let mut sink = WireSink::new(&mut self.transport, &mut self.requests, &mut self.stats);
        self.listens.release(&path, &mut sink);
        Ok(())
    }

    /// Replaces the server value at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TooManyPendingRequests`] when the pending
    /// write limit is reached.
    pub fn write(&mut self, path: &Path, value: Value) -> SyncResult<RequestId> {
        self.submit(Action::Put, path, value, None)
    }

    /// Like [`Session::write`], with a completion callback.
    ///
    /// # Errors
    ///
    /// See [`Session::write`].
    pub fn write_with<F>(
        &mut self,
        path: &Path,
        value: Value,
        on_complete: F,
    ) -> SyncResult<RequestId>
    where
        F: FnOnce(RequestId, SyncResult<Option<Value>>) + Send + 'static,
    {
        self.submit(Action::Put, path, value, Some(Box::new(on_complete)))
    }

    /// Merges an object into the server value at `path`.
    ///
    /// # Errors
    ///
    /// See [`Session::write`].
    pub fn merge(&mut self, path: &Path, value: Value) -> SyncResult<RequestId> {
        self.submit(Action::Merge, path, value, None)
    }

    /// Like [`Session::merge`], with a completion callback.
    ///
    /// # Errors
    ///
    /// See [`Session::write`].
    pub fn merge_with<F>(
        &mut self,
        path: &Path,
        value: Value,
        on_complete: F,
    ) -> SyncResult<RequestId>
    where
        F: FnOnce(RequestId, SyncResult<Option<Value>>) + Send + 'static,
    {
        self.submit(Action::Merge, path, value, Some(Box::new(on_complete)))
    }

    /// Writes `value` under a new time-ordered child key of `path`.
    ///
    /// # Errors
    ///
    /// Fails if `path` is already at maximum depth, or see [`Session::write`].
    pub fn push(&mut self, path: &Path, value: Value) -> SyncResult<(String, RequestId)> {
        self.push_inner(path, value, None)
    }

    /// Like [`Session::push`], with a completion callback.
    ///
    /// # Errors
    ///
    /// See [`Session::push`].
    pub fn push_with<F>(
        &mut self,
        path: &Path,
        value: Value,
        on_complete: F,
    ) -> SyncResult<(String, RequestId)>
    where
        F: FnOnce(RequestId, SyncResult<Option<Value>>) + Send + 'static,
    {
        self.push_inner(path, value, Some(Box::new(on_complete)))
    }

    fn push_inner(
        &mut self,
        path: &Path,
        value: Value,
        on_complete: Option<CompletionCallback>,
    ) -> SyncResult<(String, RequestId)> {
        let key = self.push_ids.generate(self.server_now_millis());
        let child = path.child(key.as_str())?;
        let id = self.submit(Action::Put, &child, value, on_complete)?;
        Ok((key, id))
    }

    /// Presents a credential now (or at the next handshake) and after every
    /// later handshake.
    pub fn authenticate(&mut self, credential: impl Into<String>) -> RequestId {
        self.submit_auth(credential.into(), None)
    }

    /// Like [`Session::authenticate`], with a completion callback.
    pub fn authenticate_with<F>(
        &mut self,
        credential: impl Into<String>,
        on_complete: F,
    ) -> RequestId
    where
        F: FnOnce(RequestId, SyncResult<Option<Value>>) + Send + 'static,
    {
        self.submit_auth(credential.into(), Some(Box::new(on_complete)))
    }

    /// Replaces the cache with a snapshot and notifies every subscription
    /// whose data changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be decoded; the cache is left
    /// unchanged.
    pub fn restore_cache(&mut self, snapshot: &[u8]) -> SyncResult<()> {
        self.cache.load_snapshot(snapshot)?;
        let fired = self.ons.on_cache_changed(&Path::root(), &self.cache);
        self.stats.callbacks_fired += fired as u64;
        Ok(())
    }

    /// Encodes the cache as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn save_cache(&self) -> SyncResult<Vec<u8>> {
        Ok(self.cache.save_snapshot()?)
    }

    /// Decodes and handles one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns the decode error. The session state is untouched in that case.
    pub fn handle_frame(&mut self, frame: &str) -> SyncResult<()> {
        match InboundMessage::decode(frame) {
            Ok(message) => {
                self.handle_message(message);
                Ok(())
            }
            Err(err) => {
                self.stats.protocol_errors += 1;
                warn!(error = %err, "dropping malformed frame");
                Err(err.into())
            }
        }
    }

    /// Handles one inbound message.
    pub fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Handshake { server_time_millis } => {
                self.handle_handshake(server_time_millis);
            }
            InboundMessage::DataUpdate { kind, path, data } => {
                self.apply_update(kind, &path, &data);
            }
            InboundMessage::Response { id, status, data } => {
                self.handle_response(id, status, data);
            }
            InboundMessage::ConnectionClosed {
                recoverable,
                retry_after,
            } => self.handle_closed(recoverable, retry_after),
        }
    }

    /// Fires due timers: keepalive while connected, reconnect while
    /// disconnected.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if self.connection.take_keepalive(now) {
            let id = self.requests.allocate_untracked();
            match self.transport.send(&OutboundRequest::keepalive(id)) {
                Ok(()) => {
                    self.stats.keepalives_sent += 1;
                    trace!(request_id = id.0, "keepalive sent");
                }
                Err(err) => warn!(error = %err, "failed to send keepalive"),
            }
        }
        if self.connection.take_reconnect(now) {
            self.stats.reconnects += 1;
            if let Err(err) = self.connect() {
                debug!(error = %err, "reconnect attempt failed");
            }
        }
    }

    /// Closes the connection and drops all state. Outstanding completion
    /// callbacks receive [`SyncError::Cancelled`].
    pub fn teardown(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "close during teardown failed");
        }
        self.ons.clear();
        self.listens.clear();
        self.cache.clear();
        self.requests.untracked.clear();
        let in_flight: Vec<PendingRequest> =
            self.requests.in_flight.drain().map(|(_, r)| r).collect();
        let queued = std::mem::take(&mut self.requests.queued);
        for pending in in_flight.into_iter().chain(queued.into_values()) {
            pending.finish(Err(SyncError::Cancelled));
        }
        info!("session torn down");
    }

    fn submit(
        &mut self,
        action: Action,
        path: &Path,
        value: Value,
        on_complete: Option<CompletionCallback>,
    ) -> SyncResult<RequestId> {
        let limit = self.config.max_pending_requests;
        if self.requests.outstanding() >= limit {
            return Err(SyncError::TooManyPendingRequests { limit });
        }
        let id = self.requests.allocate();
        let request = match action {
            Action::Merge => OutboundRequest::merge(id, path.clone(), value),
            _ => OutboundRequest::put(id, path.clone(), value),
        };
        self.dispatch(PendingRequest {
            request,
            on_complete,
        });
        Ok(id)
    }

    fn submit_auth(
        &mut self,
        credential: String,
        on_complete: Option<CompletionCallback>,
    ) -> RequestId {
        self.credential = Some(credential.clone());

        let stale: Vec<RequestId> = self
            .requests
            .queued
            .iter()
            .filter(|(_, r)| r.request.action == Action::Auth)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(pending) = self.requests.queued.remove(&id) {
                pending.finish(Err(SyncError::Cancelled));
            }
        }

        let id = self.requests.allocate();
        self.dispatch(PendingRequest {
            request: OutboundRequest::auth(id, credential),
            on_complete,
        });
        id
    }

    fn dispatch(&mut self, pending: PendingRequest) {
        let id = pending.request.id;
        if self.connection.state() == ConnectionState::Connected {
            match self.transport.send(&pending.request) {
                Ok(()) => {
                    if pending.request.action.is_write() {
                        self.stats.writes_sent += 1;
                    }
                    trace!(
                        request_id = id.0,
                        action = pending.request.action.code(),
                        "request sent"
                    );
                    self.requests.in_flight.insert(id, pending);
                    return;
                }
                Err(err) => warn!(request_id = id.0, error = %err, "send failed, queueing"),
            }
        }
        trace!(request_id = id.0, "request queued until connected");
        self.requests.queued.insert(id, pending);
    }

    fn handle_handshake(&mut self, server_millis: u64) {
        let now = self.clock.now();
        let wall = self.clock.wall_millis();
        if let Err(err) = self.connection.on_handshake(now, wall, server_millis) {
            warn!(error = %err, "ignoring unexpected handshake");
            return;
        }
        self.stats.handshakes += 1;

        let queued = std::mem::take(&mut self.requests.queued);
        let (auth, writes): (Vec<_>, Vec<_>) = queued
            .into_values()
            .partition(|r| r.request.action == Action::Auth);

        if auth.is_empty() {
            if let Some(credential) = self.credential.clone() {
                let id = self.requests.allocate();
                self.dispatch(PendingRequest {
                    request: OutboundRequest::auth(id, credential),
                    on_complete: None,
                });
            }
        }
        for pending in auth {
            self.dispatch(pending);
        }

        let mut sink = WireSink::new(&mut self.transport, &mut self.requests, &mut self.stats);
        self.listens.resume_all(&mut sink);

        let resent = writes.len();
        for pending in writes {
            self.dispatch(pending);
        }
        debug!(resent, "handshake processed");
    }

    fn apply_update(&mut self, kind: UpdateKind, path: &Path, data: &Value) {
        match kind {
            UpdateKind::Put => self.cache.put(path, data),
            UpdateKind::Merge => self.cache.merge(path, data),
        }
        let fired = self.ons.on_cache_changed(path, &self.cache);
        self.stats.callbacks_fired += fired as u64;
    }

    fn handle_response(&mut self, id: RequestId, status: ResponseStatus, data: Option<Value>) {
        let ok = status.is_ok();
        let mut sink = WireSink::new(&mut self.transport, &mut self.requests, &mut self.stats);
        if self.listens.handle_response(id, ok, &mut sink) {
            return;
        }

        if self.requests.untracked.remove(&id) {
            trace!(request_id = id.0, ok, "untracked request answered");
            return;
        }
        let Some(pending) = self.requests.in_flight.remove(&id) else {
            self.stats.dropped_responses += 1;
            debug!(request_id = id.0, "dropping response with unknown request id");
            return;
        };
        let result = match status {
            ResponseStatus::Ok => Ok(data),
            ResponseStatus::Rejected(status) => {
                warn!(request_id = id.0, status = %status, "request rejected");
                let message = data.as_ref().and_then(Value::as_str).map(str::to_string);
                Err(SyncError::rejected(status, message))
            }
        };
        pending.finish(result);
    }

    fn handle_closed(&mut self, recoverable: bool, retry_after: Option<Duration>) {
        if self.connection.state() == ConnectionState::Disconnected {
            return;
        }
        let delay = self
            .connection
            .on_closed(self.clock.now(), recoverable, retry_after);
        self.listens.suspend_all();
        self.requests.requeue_in_flight();
        match delay {
            Some(delay) => debug!(delay_ms = delay.as_millis() as u64, "disconnected"),
            None => debug!("disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::on::Event;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use treesync_codec::from_json_str;
    use treesync_protocol::push_id_millis;

    const T0: u64 = 1_700_000_000_000;

    type TestSession = Session<MockTransport, ManualClock>;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn session_with(config: SessionConfig) -> (TestSession, MockTransport, ManualClock) {
        let transport = MockTransport::new();
        let clock = ManualClock::new(T0);
        let session = Session::with_clock(config, transport.clone(), clock.clone());
        (session, transport, clock)
    }

    fn connected() -> (TestSession, MockTransport, ManualClock) {
        let (mut session, transport, clock) = session_with(SessionConfig::new("mock://db"));
        session.connect().unwrap();
        session.handle_message(InboundMessage::handshake(T0));
        (session, transport, clock)
    }

    fn actions(transport: &MockTransport) -> Vec<(Action, Option<String>)> {
        transport
            .take_sent()
            .into_iter()
            .map(|r| (r.action, r.path.map(|p| p.to_string())))
            .collect()
    }

    fn recorder() -> (Arc<Mutex<Vec<Event>>>, impl EventHandler + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: &Event| sink.lock().push(event.clone()))
    }

    #[test]
    fn connect_and_handshake() {
        let (mut session, transport, _clock) = session_with(SessionConfig::new("mock://db"));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(transport.url().as_deref(), Some("mock://db"));

        session.handle_message(InboundMessage::handshake(T0 + 250));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.server_time_offset(), 250);
        assert_eq!(session.server_now_millis(), T0 + 250);
        assert_eq!(session.stats().handshakes, 1);
    }

    #[test]
    fn watch_masks_descendant_listens() {
        let (mut session, transport, _clock) = connected();
        session.watch(&p("/a"), EventKind::Value, |_: &Event| {});
        session.watch(&p("/a/b"), EventKind::Value, |_: &Event| {});

        assert_eq!(actions(&transport), vec![(Action::Listen, Some("/a".into()))]);
        assert_eq!(session.listen_status(&p("/a/b")), Some(ListenStatus::Masked));
    }

    #[test]
    fn unwatch_unmasks_and_unlistens() {
        let (mut session, transport, _clock) = connected();
        let outer = session.watch(&p("/a"), EventKind::Value, |_: &Event| {});
        session.watch(&p("/a/b"), EventKind::Value, |_: &Event| {});
        transport.take_sent();

        session.unwatch(outer).unwrap();
        assert_eq!(
            actions(&transport),
            vec![
                (Action::Unlisten, Some("/a".into())),
                (Action::Listen, Some("/a/b".into())),
            ]
        );
        assert_eq!(session.unwatch(outer), Err(SyncError::UnknownHandle(outer.id())));
    }

    #[test]
    fn data_updates_reach_callbacks_once_per_change() {
        let (mut session, _transport, _clock) = connected();
        let (events, handler) = recorder();
        session.watch(&p("/x"), EventKind::Value, handler);

        session.handle_message(InboundMessage::put(p("/x"), Value::from(5)));
        session.handle_message(InboundMessage::put(p("/x"), Value::from(5)));
        session.handle_message(InboundMessage::put(p("/x"), Value::from(6)));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].snapshot, Value::Number(5.0));
        assert_eq!(events[1].snapshot, Value::Number(6.0));
        assert_eq!(session.stats().callbacks_fired, 2);
    }

    #[test]
    fn merge_updates_cache() {
        let (mut session, _transport, _clock) = connected();
        session.handle_message(InboundMessage::put(p("/a/b"), Value::from(42)));
        session.handle_message(InboundMessage::merge(
            p("/a"),
            from_json_str(r#"{"c":"x"}"#).unwrap(),
        ));
        assert_eq!(
            session.value_at(&p("/a")),
            from_json_str(r#"{"b":42,"c":"x"}"#).unwrap()
        );
    }

    #[test]
    fn write_completion_ok_and_rejected() {
        let (mut session, transport, _clock) = connected();
        let results = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&results);
        let ok_id = session
            .write_with(&p("/a"), Value::from(1), move |id, result| {
                sink.lock().push((id, result));
            })
            .unwrap();
        let sink = Arc::clone(&results);
        let bad_id = session
            .merge_with(&p("/b"), from_json_str(r#"{"k":1}"#).unwrap(), move |id, result| {
                sink.lock().push((id, result));
            })
            .unwrap();
        assert_eq!(
            actions(&transport),
            vec![
                (Action::Put, Some("/a".into())),
                (Action::Merge, Some("/b".into())),
            ]
        );

        session.handle_message(InboundMessage::ok(ok_id));
        session.handle_message(InboundMessage::rejected(bad_id, "permission_denied"));
        session.handle_message(InboundMessage::ok(ok_id));

        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], (ok_id, Ok(None)));
        assert_eq!(
            results[1],
            (bad_id, Err(SyncError::rejected("permission_denied", None)))
        );
        assert_eq!(session.stats().dropped_responses, 1);
    }

    #[test]
    fn offline_writes_flush_after_auth_and_listens() {
        let (mut session, transport, _clock) =
            session_with(SessionConfig::new("mock://db").with_auth_token("tok"));
        session.write(&p("/w"), Value::from(true)).unwrap();
        session.watch(&p("/l"), EventKind::Value, |_: &Event| {});
        assert!(transport.sent().is_empty());

        session.connect().unwrap();
        session.handle_message(InboundMessage::handshake(T0));
        assert_eq!(
            actions(&transport),
            vec![
                (Action::Auth, None),
                (Action::Listen, Some("/l".into())),
                (Action::Put, Some("/w".into())),
            ]
        );
    }

    #[test]
    fn disconnect_requeues_writes_and_relistens() {
        let (mut session, transport, clock) = connected();
        session.watch(&p("/l"), EventKind::Value, |_: &Event| {});
        let id = session.write(&p("/w"), Value::from(1)).unwrap();
        transport.take_sent();

        session.handle_message(InboundMessage::closed(true, None));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.listen_status(&p("/l")), Some(ListenStatus::Required));

        clock.advance(Duration::from_secs(1));
        session.tick();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.stats().reconnects, 1);

        session.handle_message(InboundMessage::handshake(T0));
        let resent = transport.take_sent();
        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0].action, Action::Listen);
        assert_eq!(resent[1].id, id);
        assert_eq!(resent[1].action, Action::Put);
    }

    #[test]
    fn backoff_grows_until_handshake() {
        let (mut session, transport, clock) = session_with(SessionConfig::new("mock://db"));
        transport.set_fail_open(true);
        assert!(session.connect().is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let start = clock.now();
        assert_eq!(session.next_deadline(), Some(start + Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        session.tick();
        assert_eq!(transport.open_count(), 2);
        assert_eq!(
            session.next_deadline(),
            Some(clock.now() + Duration::from_secs(2))
        );

        transport.set_fail_open(false);
        clock.advance(Duration::from_secs(2));
        session.tick();
        session.handle_message(InboundMessage::handshake(T0));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.stats().reconnects, 2);
    }

    #[test]
    fn retry_after_and_unrecoverable_close() {
        let (mut session, _transport, clock) = connected();
        session.handle_message(InboundMessage::closed(true, Some(Duration::from_secs(9))));
        assert_eq!(
            session.next_deadline(),
            Some(clock.now() + Duration::from_secs(9))
        );

        let (mut session, _transport, _clock) = connected();
        session.handle_message(InboundMessage::closed(false, None));
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn graceful_close() {
        let (mut session, transport, clock) = connected();
        session.close().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        assert_eq!(transport.close_count(), 1);

        session.handle_message(InboundMessage::closed(true, None));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        clock.advance(Duration::from_secs(120));
        session.tick();
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn keepalive_fires_on_interval() {
        let (mut session, transport, clock) = connected();
        clock.advance(Duration::from_secs(44));
        session.tick();
        assert!(transport.sent().is_empty());

        clock.advance(Duration::from_secs(1));
        session.tick();
        assert_eq!(actions(&transport), vec![(Action::Keepalive, None)]);
        assert_eq!(session.stats().keepalives_sent, 1);
    }

    #[test]
    fn unlisten_and_keepalive_acks_are_not_dropped() {
        let (mut session, transport, clock) = connected();
        let handle = session.watch(&p("/a"), EventKind::Value, |_: &Event| {});
        let listen = transport.take_sent().remove(0);
        session.handle_message(InboundMessage::ok(listen.id));

        session.unwatch(handle).unwrap();
        let unlisten = transport.take_sent().remove(0);
        assert_eq!(unlisten.action, Action::Unlisten);
        session.handle_message(InboundMessage::ok(unlisten.id));

        clock.advance(Duration::from_secs(45));
        session.tick();
        let keepalive = transport.take_sent().remove(0);
        session.handle_message(InboundMessage::ok(keepalive.id));

        assert_eq!(session.stats().dropped_responses, 0);
        session.handle_message(InboundMessage::ok(unlisten.id));
        assert_eq!(session.stats().dropped_responses, 1);
    }

    #[test]
    fn push_uses_server_time() {
        let (mut session, transport, _clock) = session_with(SessionConfig::new("mock://db"));
        session.connect().unwrap();
        session.handle_message(InboundMessage::handshake(T0 + 5_000));

        let (key, id) = session.push(&p("/messages"), Value::from("hi")).unwrap();
        assert_eq!(push_id_millis(&key), Some(T0 + 5_000));
        let sent = transport.take_sent();
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].path, Some(p("/messages").child(key.as_str()).unwrap()));

        let (second, _) = session.push(&p("/messages"), Value::from("again")).unwrap();
        assert!(second > key);
    }

    #[test]
    fn pending_write_limit() {
        let (mut session, _transport, _clock) =
            session_with(SessionConfig::new("mock://db").with_max_pending_requests(2));
        session.write(&p("/a"), Value::from(1)).unwrap();
        session.write(&p("/b"), Value::from(2)).unwrap();
        assert_eq!(
            session.write(&p("/c"), Value::from(3)),
            Err(SyncError::TooManyPendingRequests { limit: 2 })
        );
    }

    #[test]
    fn reauthentication_replaces_queued_auth() {
        let (mut session, transport, _clock) = session_with(SessionConfig::new("mock://db"));
        let cancelled = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&cancelled);
        session.authenticate_with("old", move |_, result| *sink.lock() = Some(result));
        session.authenticate("new");
        assert_eq!(*cancelled.lock(), Some(Err(SyncError::Cancelled)));

        session.connect().unwrap();
        session.handle_message(InboundMessage::handshake(T0));
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].credential.as_deref(), Some("new"));
    }

    #[test]
    fn credential_is_resent_after_reconnect() {
        let (mut session, transport, clock) = connected();
        let id = session.authenticate("tok");
        session.handle_message(InboundMessage::ok(id));
        transport.take_sent();

        session.handle_message(InboundMessage::closed(true, None));
        clock.advance(Duration::from_secs(1));
        session.tick();
        session.handle_message(InboundMessage::handshake(T0));
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::Auth);
        assert_eq!(sent[0].credential.as_deref(), Some("tok"));
    }

    #[test]
    fn malformed_frame_is_counted() {
        let (mut session, _transport, _clock) = connected();
        assert!(matches!(
            session.handle_frame("{"),
            Err(SyncError::Protocol(_))
        ));
        assert_eq!(session.stats().protocol_errors, 1);

        session
            .handle_frame(r#"{"t":"d","a":"p","b":{"p":"/k","d":"v"}}"#)
            .unwrap();
        assert_eq!(session.value_at(&p("/k")), Value::string("v"));
    }

    #[test]
    fn teardown_cancels_outstanding_requests() {
        let (mut session, transport, _clock) = connected();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        session
            .write_with(&p("/a"), Value::from(1), move |_, result| sink.lock().push(result))
            .unwrap();
        session.handle_message(InboundMessage::put(p("/a"), Value::from(1)));

        session.teardown();
        assert_eq!(*results.lock(), vec![Err(SyncError::Cancelled)]);
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        assert!(session.cache().root().is_null());
        assert!(session.listens().is_empty());
        assert!(!transport.is_open());
    }

    #[test]
    fn snapshot_restore_notifies() {
        let (mut session, _transport, _clock) = connected();
        session.handle_message(InboundMessage::put(p("/a"), Value::from(1)));
        let snapshot = session.save_cache().unwrap();

        let (mut other, _transport, _clock) = connected();
        let (events, handler) = recorder();
        other.watch(&p("/a"), EventKind::Value, handler);
        other.restore_cache(&snapshot).unwrap();
        assert_eq!(events.lock()[0].snapshot, Value::Number(1.0));
        assert!(other.restore_cache(&[0xff]).is_err());
    }
}
