//! Pool and worker configuration types.

use std::time::Duration;

/// Client ID the server assigns when none is announced.
///
/// While the pool's ID equals this value, no `SET_CLIENT_ID` packet is sent.
pub const DEFAULT_CLIENT_ID: &str = "-";

/// What a worker does with open connections once it has no functions left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Close every connection as soon as the last function is removed.
    #[default]
    CloseImmediately,
    /// Keep connections open for the given period, then close them if no
    /// function was registered in the meantime.
    GracePeriod(Duration),
}

/// Job-server pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a controller waits after a lost connection before it may
    /// reconnect.
    pub reconnect_period: Duration,
    /// How long an outstanding request may go unanswered before the
    /// connection is considered dead.
    pub response_timeout: Duration,
    /// Client ID announced to every server.
    pub client_id: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconnect_period: Duration::from_secs(60),
            response_timeout: Duration::from_secs(60),
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

impl PoolConfig {
    /// Set the reconnect period.
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    /// Set the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Settings for the underlying pool.
    pub pool: PoolConfig,
    /// Period of the heartbeat sweep.
    pub heartbeat_period: Duration,
    /// Behavior once the last function is removed.
    pub idle_policy: IdlePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            heartbeat_period: Duration::from_secs(20),
            idle_policy: IdlePolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Set the pool configuration.
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Set the heartbeat period.
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Set the idle policy.
    pub fn with_idle_policy(mut self, policy: IdlePolicy) -> Self {
        self.idle_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.reconnect_period, Duration::from_secs(60));
        assert_eq!(config.response_timeout, Duration::from_secs(60));
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_pool_config(PoolConfig::default().with_reconnect_period(Duration::from_secs(5)))
            .with_heartbeat_period(Duration::from_secs(1))
            .with_idle_policy(IdlePolicy::GracePeriod(Duration::from_secs(30)));

        assert_eq!(config.pool.reconnect_period, Duration::from_secs(5));
        assert_eq!(config.heartbeat_period, Duration::from_secs(1));
        assert_eq!(
            config.idle_policy,
            IdlePolicy::GracePeriod(Duration::from_secs(30))
        );
        assert_eq!(WorkerConfig::default().idle_policy, IdlePolicy::CloseImmediately);
    }
}
