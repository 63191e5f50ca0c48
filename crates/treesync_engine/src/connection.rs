//! Connection lifecycle state machine.
//!
//! This type only tracks state and timers. The session performs the
//! transport calls and registry updates each transition implies.

use crate::config::{RetryConfig, SessionConfig};
use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; a reconnect may be scheduled.
    Disconnected,
    /// Transport opened, waiting for the handshake.
    Connecting,
    /// Handshake received.
    Connected,
    /// Close requested, waiting for the transport to confirm.
    Disconnecting,
}

impl ConnectionState {
    /// Returns true if the transport is (or is becoming) usable.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection state plus its timers.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    retry: RetryConfig,
    keepalive_interval: Duration,
    attempts: u32,
    auto_reconnect: bool,
    reconnect_at: Option<Instant>,
    keepalive_at: Option<Instant>,
    clock_offset_millis: i64,
}

impl Connection {
    /// Creates a disconnected connection.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry: config.retry.clone(),
            keepalive_interval: config.keepalive_interval,
            attempts: 0,
            auto_reconnect: false,
            reconnect_at: None,
            keepalive_at: None,
            clock_offset_millis: 0,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last handshake.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Server time minus local time, from the last handshake.
    pub fn clock_offset_millis(&self) -> i64 {
        self.clock_offset_millis
    }

    /// When the scheduled reconnect fires, if any.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    fn transition(&mut self, to: ConnectionState) {
        debug!(from = %self.state, to = %to, "connection state change");
        self.state = to;
    }

    fn invalid(&self, to: ConnectionState) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Disconnected → Connecting.
    pub fn begin_connect(&mut self) -> SyncResult<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(self.invalid(ConnectionState::Connecting));
        }
        self.auto_reconnect = true;
        self.reconnect_at = None;
        self.transition(ConnectionState::Connecting);
        Ok(())
    }

    /// Connecting → Connected. Resets backoff, records the clock offset and
    /// arms the keepalive timer.
    pub fn on_handshake(
        &mut self,
        now: Instant,
        local_wall_millis: u64,
        server_millis: u64,
    ) -> SyncResult<()> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid(ConnectionState::Connected));
        }
        self.attempts = 0;
        self.clock_offset_millis = millis_diff(server_millis, local_wall_millis);
        self.keepalive_at = Some(now + self.keepalive_interval);
        self.transition(ConnectionState::Connected);
        info!(offset_ms = self.clock_offset_millis, "connected");
        Ok(())
    }

    /// Handles the transport going away.
    ///
    /// Returns the reconnect delay if one was scheduled. `retry_after`
    /// overrides the computed backoff; an unrecoverable close or a
    /// requested close schedules nothing.
    pub fn on_closed(
        &mut self,
        now: Instant,
        recoverable: bool,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        let was = self.state;
        if was == ConnectionState::Disconnected {
            return None;
        }
        self.keepalive_at = None;
        self.transition(ConnectionState::Disconnected);

        if was == ConnectionState::Disconnecting || !self.auto_reconnect {
            return None;
        }
        if !recoverable {
            self.auto_reconnect = false;
            info!("connection closed, not reconnecting");
            return None;
        }

        let delay = retry_after.unwrap_or_else(|| self.retry.delay_for_attempt(self.attempts));
        self.attempts = self.attempts.saturating_add(1);
        self.reconnect_at = Some(now + delay);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        Some(delay)
    }

    /// Starts a requested close.
    ///
    /// Returns true if the transport must be closed. From Disconnected this
    /// only cancels a scheduled reconnect.
    pub fn begin_close(&mut self) -> bool {
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.keepalive_at = None;
        if self.state.is_active() {
            self.transition(ConnectionState::Disconnecting);
            true
        } else {
            false
        }
    }

    /// Consumes a due reconnect timer.
    pub fn take_reconnect(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now && self.state == ConnectionState::Disconnected => {
                self.reconnect_at = None;
                true
            }
            _ => false,
        }
    }

    /// Consumes a due keepalive timer and re-arms it.
    pub fn take_keepalive(&mut self, now: Instant) -> bool {
        match self.keepalive_at {
            Some(at) if at <= now && self.state == ConnectionState::Connected => {
                self.keepalive_at = Some(now + self.keepalive_interval);
                true
            }
            _ => false,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.keepalive_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn millis_diff(a: u64, b: u64) -> i64 {
    let diff = i128::from(a) - i128::from(b);
    i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
}
