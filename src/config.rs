//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum uses per identity per calendar day.
    pub daily_limit: u32,
    /// Maximum number of concurrently live sessions.
    pub session_pool_size: usize,
    /// How long a task waits for a free session before failing the attempt.
    pub session_acquire_timeout: Duration,
    /// Poll interval while waiting for a session to free up.
    pub session_poll_interval: Duration,
    /// How long to wait for a confirmation code before giving up.
    pub confirm_timeout: Duration,
    /// Poll interval between mailbox scans.
    pub confirm_poll_interval: Duration,
    /// Only consider messages delivered within this window.
    pub confirm_since_window: Duration,
    /// How many recent messages to inspect per scan.
    pub confirm_scan_depth: usize,
    /// Base pause between sequential batch items.
    pub batch_interval: Duration,
    /// Upper bound of the random jitter added to `batch_interval` (seconds).
    pub batch_jitter_secs: u64,
    /// Default worker count for parallel batches.
    pub max_workers: usize,
    /// Path to the local database file.
    pub db_path: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            daily_limit: 3,
            session_pool_size: 3,
            session_acquire_timeout: Duration::from_secs(300),
            session_poll_interval: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(120),
            confirm_poll_interval: Duration::from_secs(5),
            confirm_since_window: Duration::from_secs(5 * 60),
            confirm_scan_depth: 20,
            batch_interval: Duration::from_secs(60),
            batch_jitter_secs: 30,
            max_workers: 3,
            db_path: "./data/taskpilot.db".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Build a config from `TASKPILOT_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = env_u64("TASKPILOT_DAILY_LIMIT")? {
            cfg.daily_limit = v as u32;
        }
        if let Some(v) = env_u64("TASKPILOT_SESSION_POOL_SIZE")? {
            cfg.session_pool_size = v as usize;
        }
        if let Some(v) = env_u64("TASKPILOT_SESSION_TIMEOUT_SECS")? {
            cfg.session_acquire_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TASKPILOT_CONFIRM_TIMEOUT_SECS")? {
            cfg.confirm_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TASKPILOT_CONFIRM_POLL_SECS")? {
            cfg.confirm_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TASKPILOT_BATCH_INTERVAL_SECS")? {
            cfg.batch_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TASKPILOT_BATCH_JITTER_SECS")? {
            cfg.batch_jitter_secs = v;
        }
        if let Some(v) = env_u64("TASKPILOT_MAX_WORKERS")? {
            cfg.max_workers = v as usize;
        }
        if let Ok(v) = std::env::var("TASKPILOT_DB_PATH") {
            cfg.db_path = v;
        }

        Ok(cfg)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.daily_limit, 3);
        assert_eq!(cfg.session_pool_size, 3);
        assert!(cfg.confirm_timeout > cfg.confirm_poll_interval);
    }
}
