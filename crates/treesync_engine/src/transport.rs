//! Transport layer abstraction.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::Arc;
use treesync_protocol::OutboundRequest;

/// The outbound half of a connection to the server.
///
/// Inbound traffic does not flow through this trait: the transport (or
/// whatever owns its read side) hands every parsed frame to
/// `Session::handle_message`, including a final `ConnectionClosed` after
/// [`Transport::close`] or a failure.
pub trait Transport: Send {
    /// Starts connecting. Success means the attempt is under way; the
    /// handshake arrives later as an inbound message.
    fn open(&mut self, url: &str) -> SyncResult<()>;

    /// Sends one request.
    fn send(&mut self, request: &OutboundRequest) -> SyncResult<()>;

    /// Starts closing the connection.
    fn close(&mut self) -> SyncResult<()>;
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    url: Option<String>,
    open_count: usize,
    close_count: usize,
    fail_open: bool,
    sent: Vec<OutboundRequest>,
}

/// A transport that records traffic instead of sending it.
///
/// Clones share state, so a test keeps one clone and gives the other to
/// the session.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail with a retryable error.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Returns true between a successful `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// URL passed to the last `open`.
    pub fn url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }

    /// Number of `open` calls, failed ones included.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// All requests sent so far.
    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.state.lock().sent.clone()
    }

    /// Drains and returns the requests sent so far.
    pub fn take_sent(&self) -> Vec<OutboundRequest> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Encoded frames of all requests sent so far.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(OutboundRequest::encode)
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self, url: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.open_count += 1;
        state.url = Some(url.to_string());
        if state.fail_open {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        state.open = true;
        Ok(())
    }

    fn send(&mut self, request: &OutboundRequest) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SyncError::NotConnected);
        }
        state.sent.push(request.clone());
        Ok(())
    }

    fn close(&mut self) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.close_count += 1;
        state.open = false;
        Ok(())
    }
}
