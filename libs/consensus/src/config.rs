//! Peer configuration

use crate::{RaftError, Result};
use rand::Rng;
use std::time::Duration;

/// How a voter judges whether a candidate's log is recent enough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoteCheck {
    /// Grant only to candidates whose last entry has a higher term, or the
    /// same term and an index at least as large, in every term.
    #[default]
    UpToDate,

    /// Grant unconditionally when the request carries a newer term; within
    /// the current term compare last-entry terms only, ties going to the
    /// candidate. Leader Completeness does not hold under this mode.
    Reference,
}

/// Configuration for a consensus peer
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// The actual timeout is drawn uniformly between min and max on every
    /// reset to avoid repeated split votes.
    pub election_timeout_min: Duration,

    /// Maximum election timeout (exclusive)
    pub election_timeout_max: Duration,

    /// Heartbeat interval (how often the leader sends AppendEntries)
    ///
    /// Must be smaller than the minimum election timeout so followers do not
    /// time out under normal operation.
    pub heartbeat_interval: Duration,

    /// Maximum number of entries carried by a single AppendEntries RPC
    pub max_append_entries: usize,

    /// Log recency rule applied when granting votes
    pub vote_check: VoteCheck,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),

            heartbeat_interval: Duration::from_millis(100),

            max_append_entries: 100,

            vote_check: VoteCheck::UpToDate,
        }
    }
}

impl RaftConfig {
    /// Draws a fresh election timeout in `[min, max)`.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if max <= min {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(
                "heartbeat_interval must be less than election_timeout_min".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Config(
                "max_append_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn vote_check(mut self, check: VoteCheck) -> Self {
        self.config.vote_check = check;
        self
    }

    pub fn build(self) -> Result<RaftConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
