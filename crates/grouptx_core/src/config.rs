//! Coordinator and groomer configuration.

use std::time::Duration;

/// Default root of the coordination tree.
pub const DEFAULT_ROOT_PATH: &str = "/grouptx";

/// Configuration shared by every tenant of a [`crate::Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Root path under which `apps/` and `groomerlock` live.
    pub root_path: String,

    /// Maximum number of entity groups a cross-group transaction may lock.
    ///
    /// Groups count once locked, even after their lock is released.
    pub max_groups_per_xg: usize,

    /// Age after which an unfinished transaction is treated as crashed.
    pub max_transaction_lifetime: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            max_groups_per_xg: 5,
            max_transaction_lifetime: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root path of the coordination tree.
    #[must_use]
    pub fn root_path(mut self, path: impl Into<String>) -> Self {
        self.root_path = path.into();
        self
    }

    /// Sets the cross-group lock limit.
    #[must_use]
    pub const fn max_groups_per_xg(mut self, limit: usize) -> Self {
        self.max_groups_per_xg = limit;
        self
    }

    /// Sets the maximum transaction lifetime.
    #[must_use]
    pub const fn max_transaction_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_transaction_lifetime = lifetime;
        self
    }
}

/// Configuration for the background [`crate::Groomer`].
#[derive(Debug, Clone)]
pub struct GroomerConfig {
    /// Upper bound of the random wait between grooming attempts.
    pub poll_period: Duration,

    /// How long a blacklist entry is kept before it may be purged.
    pub blacklist_retention: Duration,

    /// How long a superseded validity record is kept.
    pub validity_retention: Duration,
}

impl Default for GroomerConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(60 * 60),
            blacklist_retention: Duration::from_secs(24 * 60 * 60),
            validity_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl GroomerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll period.
    #[must_use]
    pub const fn poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Sets the blacklist retention.
    #[must_use]
    pub const fn blacklist_retention(mut self, retention: Duration) -> Self {
        self.blacklist_retention = retention;
        self
    }

    /// Sets the validity record retention.
    #[must_use]
    pub const fn validity_retention(mut self, retention: Duration) -> Self {
        self.validity_retention = retention;
        self
    }
}
