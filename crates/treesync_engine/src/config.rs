//! Configuration for a sync session.

use rand::Rng;
use std::time::Duration;

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server URL handed to the transport.
    pub url: String,
    /// Interval between keepalive frames while connected.
    pub keepalive_interval: Duration,
    /// Reconnect backoff.
    pub retry: RetryConfig,
    /// Credential sent after every handshake.
    pub auth_token: Option<String>,
    /// Maximum number of writes waiting for acknowledgement.
    pub max_pending_requests: usize,
}

impl SessionConfig {
    /// Creates a new session configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keepalive_interval: Duration::from_secs(45),
            retry: RetryConfig::default(),
            auth_token: None,
            max_pending_requests: 1024,
        }
    }

    /// Sets the keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the credential.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the pending write limit.
    pub fn with_max_pending_requests(mut self, limit: usize) -> Self {
        self.max_pending_requests = limit;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Delay before reconnecting after `attempt` consecutive failures
    /// (0-indexed: the first failure uses `initial_delay`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
