//! Member configuration

use std::time::Duration;

/// Configuration for a member engine
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// Member name, used in logs and stamped on every reply
    pub name: String,

    /// How long a prepare callback may stay unanswered before the
    /// watchdog forces a terminal response
    pub prepare_timeout: Duration,

    /// Credit applied to queries that arrive with a credit of zero
    pub default_credits: u32,

    /// Fixed growth step of a commit-ledger array
    pub ledger_growth_chunk: usize,

    /// How long a released transaction is remembered for late retries
    pub completed_retention: Duration,

    /// Hold timer for leases taken from a safe application-data store
    pub lease_timeout: Duration,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            name: "member".to_string(),
            prepare_timeout: Duration::from_secs(30),
            default_credits: 1000,
            ledger_growth_chunk: 16,
            completed_retention: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(5),
        }
    }
}

impl MemberConfig {
    /// Create a config with the given member name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the prepare watchdog timeout
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    /// Set the default query credit
    pub fn with_default_credits(mut self, credits: u32) -> Self {
        self.default_credits = credits.max(1);
        self
    }

    /// Set the commit-ledger growth chunk
    pub fn with_ledger_growth_chunk(mut self, chunk: usize) -> Self {
        self.ledger_growth_chunk = chunk.max(1);
        self
    }

    /// Set how long END tombstones are kept
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    /// Set the safe-store lease timeout
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }
}
