//! Runtime configuration.
//!
//! Configuration for a production consensus node: identity, peers, the
//! inbound queue bound, and timing.

use std::time::Duration;

use caravel_core::limits::MAX_PENDING_DEFAULT;
use caravel_core::Address;

/// Configuration for one consensus node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's own address; also where the transport listens.
    pub local: Address,
    /// The initial peer addresses of the cluster, excluding this node.
    pub peers: Vec<Address>,
    /// Bound on queued-but-unconsumed inbound messages.
    pub max_pending: usize,
    /// Timing configuration.
    pub timing: TimingConfig,
}

impl NodeConfig {
    /// Creates a node configuration with default tunables.
    #[must_use]
    pub fn new(local: Address) -> Self {
        Self {
            local,
            peers: Vec::new(),
            max_pending: MAX_PENDING_DEFAULT,
            timing: TimingConfig::default(),
        }
    }

    /// Sets the peer list.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<Address>) -> Self {
        self.peers = peers;
        self
    }

    /// Sets the inbound queue bound.
    #[must_use]
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

/// Timing configuration for elections and heartbeats.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Client request timeout.
    pub request_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl TimingConfig {
    /// Creates timing config suitable for testing (faster timeouts).
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(1),
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_max < self.election_timeout_min {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_max must be >= election_timeout_min".to_string(),
            });
        }

        // A heartbeat must land well before any follower gives up on the
        // leader.
        if self.election_timeout_min <= self.heartbeat_interval * 2 {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_min must be > 2 * heartbeat_interval".to_string(),
            });
        }

        Ok(())
    }

    /// Generates a random election timeout within the configured range.
    #[must_use]
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;

        #[allow(clippy::cast_possible_truncation)]
        let min_ms = self.election_timeout_min.as_millis() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid timing configuration.
    InvalidTiming {
        /// Error description.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTiming { message } => write!(f, "invalid timing: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_is_valid() {
        let timing = TimingConfig::default();
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_fast_timing_is_valid() {
        let timing = TimingConfig::fast_for_testing();
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let timing = TimingConfig {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_undercut_election_timeout() {
        let timing = TimingConfig {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(90),
            ..Default::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_random_timeout_stays_in_range() {
        let timing = TimingConfig::default();
        for _ in 0..100 {
            let timeout = timing.random_election_timeout();
            assert!(timeout >= timing.election_timeout_min);
            assert!(timeout <= timing.election_timeout_max);
        }
    }

    #[test]
    fn test_node_config_builder() {
        let local = Address::parse("/ip4/127.0.0.1/tcp/9001").unwrap();
        let peer = Address::parse("/ip4/127.0.0.1/tcp/9002").unwrap();

        let config = NodeConfig::new(local.clone())
            .with_peers(vec![peer.clone()])
            .with_max_pending(42)
            .with_timing(TimingConfig::fast_for_testing());

        assert_eq!(config.local, local);
        assert_eq!(config.peers, vec![peer]);
        assert_eq!(config.max_pending, 42);
    }
}
