//! Timing parameters for the consensus engine and the replicated store

use std::time::Duration;

/// Configuration for Paxos proposer retries
#[derive(Debug, Clone)]
pub struct PaxosConfig {
    /// Minimum pause before retrying a lost or unreachable round (default: 5ms)
    pub backoff_min: Duration,
    /// Maximum pause before retrying a lost or unreachable round (default: 50ms)
    pub backoff_max: Duration,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
        }
    }
}

impl PaxosConfig {
    /// Create a new config with a custom retry backoff range
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    /// Pick a random pause within the configured backoff range
    pub fn random_backoff(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.backoff_min.as_millis() as u64;
        let max_ms = self.backoff_max.as_millis() as u64;
        let pause_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(pause_ms)
    }
}

/// Configuration for the replicated key-value server
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// How long a single client request may spend proposing before the server
    /// gives up and tells the client to retry elsewhere (default: 2s)
    pub request_timeout: Duration,
    /// How long to wait for a pending slot to be decided by its own proposer
    /// before filling it with a no-op (default: 20ms)
    pub gap_fill_delay: Duration,
    /// Interval of the background apply / catch-up pass (default: 25ms)
    pub apply_interval: Duration,
    /// Interval between Done watermark broadcasts (default: 100ms)
    pub done_interval: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            gap_fill_delay: Duration::from_millis(20),
            apply_interval: Duration::from_millis(25),
            done_interval: Duration::from_millis(100),
        }
    }
}

impl KvConfig {
    /// Create a new config with custom request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Create a new config with custom gap fill delay
    pub fn with_gap_fill_delay(mut self, delay: Duration) -> Self {
        self.gap_fill_delay = delay;
        self
    }

    /// Create a new config with custom apply interval
    pub fn with_apply_interval(mut self, interval: Duration) -> Self {
        self.apply_interval = interval;
        self
    }

    /// Create a new config with custom Done broadcast interval
    pub fn with_done_interval(mut self, interval: Duration) -> Self {
        self.done_interval = interval;
        self
    }
}
