//! Race configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `GPU_RACE_*` environment variables. The CLI applies its own flags last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RaceError;

/// Default number of offers raced per round.
pub const DEFAULT_CANDIDATES_PER_ROUND: usize = 5;

/// Default number of rounds before a race is exhausted.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Default per-round deadline in seconds.
const DEFAULT_ROUND_DEADLINE_SECS: u64 = 900;

/// Default interval between status polls in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default hard timeout for a single candidate in seconds.
const DEFAULT_MAX_WAIT_SECS: u64 = 600;

/// Default retries for transient poll errors.
const DEFAULT_NETWORK_RETRIES: u32 = 3;

/// Default base backoff for transient poll errors in milliseconds.
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

const ENV_CANDIDATES: &str = "GPU_RACE_CANDIDATES";
const ENV_MAX_ROUNDS: &str = "GPU_RACE_MAX_ROUNDS";
const ENV_ROUND_DEADLINE: &str = "GPU_RACE_ROUND_DEADLINE_SECS";
const ENV_POLL_INTERVAL: &str = "GPU_RACE_POLL_INTERVAL_MS";
const ENV_MAX_WAIT: &str = "GPU_RACE_MAX_WAIT_SECS";
const ENV_NETWORK_RETRIES: &str = "GPU_RACE_NETWORK_RETRIES";
const ENV_RETRY_BACKOFF: &str = "GPU_RACE_RETRY_BACKOFF_MS";

/// Failover/storage strategy for the eventually-accepted instance.
///
/// Chosen by the user and forwarded to the provider untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverStrategy {
    /// Minutes between volume snapshots.
    pub snapshot_interval_mins: u32,
    /// Keep a CPU standby instance warm.
    #[serde(default)]
    pub standby_cpu: bool,
    /// Target bucket for snapshots.
    pub bucket: String,
}

/// Tunables for a provisioning race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Offers raced concurrently per round.
    pub candidates_per_round: usize,
    /// Rounds before the race is exhausted.
    pub max_rounds: u32,
    /// Coarse deadline for a whole round, in seconds.
    pub round_deadline_secs: u64,
    /// Delay between status polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Hard timeout for a single candidate, in seconds.
    pub max_wait_secs: u64,
    /// Retries for transient poll errors before a candidate fails.
    pub network_retries: u32,
    /// Base backoff between retries, doubled each attempt, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Optional failover strategy forwarded on create.
    pub failover: Option<FailoverStrategy>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            candidates_per_round: DEFAULT_CANDIDATES_PER_ROUND,
            max_rounds: DEFAULT_MAX_ROUNDS,
            round_deadline_secs: DEFAULT_ROUND_DEADLINE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            network_retries: DEFAULT_NETWORK_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            failover: None,
        }
    }
}

impl RaceConfig {
    /// Load configuration from an optional TOML file, then the environment.
    ///
    /// # Errors
    /// Returns [`RaceError::Config`] if the file cannot be read or parsed,
    /// or if the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, RaceError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    ///
    /// # Errors
    /// Returns [`RaceError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, RaceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RaceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns [`RaceError::Config`] on malformed input.
    pub fn from_toml(content: &str) -> Result<Self, RaceError> {
        toml::from_str(content).map_err(|e| RaceError::Config(e.to_string()))
    }

    /// Override fields from `GPU_RACE_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse(ENV_CANDIDATES) {
            self.candidates_per_round = v;
        }
        if let Some(v) = env_parse(ENV_MAX_ROUNDS) {
            self.max_rounds = v;
        }
        if let Some(v) = env_parse(ENV_ROUND_DEADLINE) {
            self.round_deadline_secs = v;
        }
        if let Some(v) = env_parse(ENV_POLL_INTERVAL) {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse(ENV_MAX_WAIT) {
            self.max_wait_secs = v;
        }
        if let Some(v) = env_parse(ENV_NETWORK_RETRIES) {
            self.network_retries = v;
        }
        if let Some(v) = env_parse(ENV_RETRY_BACKOFF) {
            self.retry_backoff_ms = v;
        }
    }

    /// Reject configurations that cannot produce a race.
    ///
    /// # Errors
    /// Returns [`RaceError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), RaceError> {
        if self.candidates_per_round == 0 {
            return Err(RaceError::Config(
                "candidates_per_round must be at least 1".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(RaceError::Config("max_rounds must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(RaceError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_wait_secs == 0 || self.round_deadline_secs == 0 {
            return Err(RaceError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    /// Per-round deadline.
    #[must_use]
    pub const fn round_deadline(&self) -> Duration {
        Duration::from_secs(self.round_deadline_secs)
    }

    /// Interval between status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Hard per-candidate timeout.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Base backoff for transient poll errors.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => {
            debug!(key, value = %raw, "Config override from environment");
            Some(v)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const ALL_ENV: [&str; 7] = [
        ENV_CANDIDATES,
        ENV_MAX_ROUNDS,
        ENV_ROUND_DEADLINE,
        ENV_POLL_INTERVAL,
        ENV_MAX_WAIT,
        ENV_NETWORK_RETRIES,
        ENV_RETRY_BACKOFF,
    ];

    fn clear_env() {
        for key in ALL_ENV {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RaceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.candidates_per_round, 5);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RaceConfig::from_toml(
            r#"
            max_rounds = 5

            [failover]
            snapshot_interval_mins = 30
            bucket = "s3://snapshots"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.candidates_per_round, DEFAULT_CANDIDATES_PER_ROUND);
        let failover = config.failover.unwrap();
        assert_eq!(failover.snapshot_interval_mins, 30);
        assert!(!failover.standby_cpu);
    }

    #[test]
    fn test_validate_rejects_zero_rounds() {
        let config = RaceConfig {
            max_rounds: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RaceError::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(RaceConfig::from_toml("max_rounds = \"three\"").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_retry_settings() {
        clear_env();
        std::env::set_var(ENV_NETWORK_RETRIES, "7");
        std::env::set_var(ENV_RETRY_BACKOFF, " 250 ");
        std::env::set_var(ENV_MAX_WAIT, "45");

        let mut config = RaceConfig::default();
        config.apply_env();
        clear_env();

        assert_eq!(config.network_retries, 7);
        assert_eq!(config.retry_backoff(), Duration::from_millis(250));
        assert_eq!(config.max_wait(), Duration::from_secs(45));
        assert_eq!(config.max_rounds, DEFAULT_MAX_ROUNDS);
    }

    #[test]
    #[serial]
    fn test_unparseable_env_is_ignored() {
        clear_env();
        std::env::set_var(ENV_NETWORK_RETRIES, "abc");
        std::env::set_var(ENV_RETRY_BACKOFF, "-5");

        let mut config = RaceConfig::default();
        config.apply_env();
        clear_env();

        assert_eq!(config.network_retries, DEFAULT_NETWORK_RETRIES);
        assert_eq!(config.retry_backoff_ms, DEFAULT_RETRY_BACKOFF_MS);
    }

    #[test]
    #[serial]
    fn test_load_layers_file_then_env() {
        clear_env();
        let path = std::env::temp_dir().join(format!("gpu-race-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "candidates_per_round = 2\nnetwork_retries = 1\n").unwrap();
        std::env::set_var(ENV_NETWORK_RETRIES, "4");

        let loaded = RaceConfig::load(Some(&path));
        clear_env();
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.candidates_per_round, 2);
        assert_eq!(config.network_retries, 4);
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_env() {
        clear_env();
        std::env::set_var(ENV_CANDIDATES, "0");

        let loaded = RaceConfig::load(None);
        clear_env();

        assert!(matches!(loaded, Err(RaceError::Config(_))));
    }
}
