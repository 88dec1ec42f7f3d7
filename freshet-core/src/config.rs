//! Reader configuration

use crate::{ColumnKey, ConfigError, FreshetError, FreshetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default freshening timeout when a call does not give one.
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Default size of the compute worker pool.
pub const DEFAULT_MAX_CONCURRENT_COMPUTES: usize = 16;

/// Default time `close()` waits for in-flight compute tasks.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ============================================================================
// MODES
// ============================================================================

/// What to do when a freshness policy returns an error or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFailureMode {
    /// Treat the column as stale and run its compute function.
    Recompute,
    /// Skip the compute; the column is reported Failed with its stored value.
    #[default]
    Fallback,
    /// Treat the column as fresh.
    AssumeFresh,
}

impl PolicyFailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recompute => "recompute",
            Self::Fallback => "fallback",
            Self::AssumeFresh => "assume_fresh",
        }
    }
}

impl fmt::Display for PolicyFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyFailureMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "recompute" => Ok(Self::Recompute),
            "fallback" => Ok(Self::Fallback),
            "assume_fresh" | "assume-fresh" => Ok(Self::AssumeFresh),
            _ => Err(ConfigError::InvalidValue {
                field: "policy_failure_mode".to_string(),
                value: s.to_string(),
                reason: "expected recompute, fallback or assume_fresh".to_string(),
            }),
        }
    }
}

/// Whether the reader gathers per-freshener statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsMode {
    None,
    #[default]
    All,
}

impl StatisticsMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl FromStr for StatisticsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "all" | "on" => Ok(Self::All),
            _ => Err(ConfigError::InvalidValue {
                field: "statistics_mode".to_string(),
                value: s.to_string(),
                reason: "expected none or all".to_string(),
            }),
        }
    }
}

// ============================================================================
// READER CONFIG
// ============================================================================

/// Configuration for a freshening reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Timeout applied when a call does not pass its own.
    pub default_timeout: Duration,
    /// Maximum number of compute functions running at once. Further tasks
    /// queue for a slot.
    pub max_concurrent_computes: usize,
    /// Return a mix of computed and stale columns when only some computes
    /// finish in time. When false, any stale column makes the whole row fall
    /// back to stored data.
    pub allow_partial: bool,
    pub policy_failure_mode: PolicyFailureMode,
    pub statistics_mode: StatisticsMode,
    /// Log a statistics summary at this interval, if set.
    pub statistics_log_interval: Option<Duration>,
    /// How long `close()` waits for queued and running compute tasks.
    pub shutdown_grace: Duration,
    /// Only load fresheners attached to these keys. `None` loads all records.
    pub columns_to_freshen: Option<BTreeSet<ColumnKey>>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_concurrent_computes: DEFAULT_MAX_CONCURRENT_COMPUTES,
            allow_partial: true,
            policy_failure_mode: PolicyFailureMode::default(),
            statistics_mode: StatisticsMode::default(),
            statistics_log_interval: None,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            columns_to_freshen: None,
        }
    }
}

impl ReaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_computes(mut self, max: usize) -> Self {
        self.max_concurrent_computes = max;
        self
    }

    pub fn with_allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    pub fn with_policy_failure_mode(mut self, mode: PolicyFailureMode) -> Self {
        self.policy_failure_mode = mode;
        self
    }

    pub fn with_statistics_mode(mut self, mode: StatisticsMode) -> Self {
        self.statistics_mode = mode;
        self
    }

    pub fn with_statistics_log_interval(mut self, interval: Duration) -> Self {
        self.statistics_log_interval = Some(interval);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_columns_to_freshen<I>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnKey>,
    {
        self.columns_to_freshen = Some(columns.into_iter().collect());
        self
    }

    /// Returns true if a record attached to `column` should be loaded.
    pub fn should_freshen(&self, column: &ColumnKey) -> bool {
        match &self.columns_to_freshen {
            None => true,
            Some(columns) => columns.iter().any(|allowed| allowed.covers(column)),
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `FRESHET_DEFAULT_TIMEOUT_MS` (default: 100)
    /// - `FRESHET_MAX_CONCURRENT_COMPUTES` (default: 16)
    /// - `FRESHET_ALLOW_PARTIAL` (default: true)
    /// - `FRESHET_POLICY_FAILURE_MODE`: recompute | fallback | assume_fresh (default: fallback)
    /// - `FRESHET_STATISTICS_MODE`: none | all (default: all)
    /// - `FRESHET_STATISTICS_LOG_INTERVAL_SECS` (default: unset)
    /// - `FRESHET_SHUTDOWN_GRACE_MS` (default: 5000)
    /// - `FRESHET_COLUMNS_TO_FRESHEN`: comma-separated column names (default: all)
    ///
    /// Unparseable values are rejected rather than silently replaced.
    pub fn from_env() -> FreshetResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> FreshetResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "FRESHET_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "FRESHET_MAX_CONCURRENT_COMPUTES")? {
            config.max_concurrent_computes = max;
        }
        if let Some(allow) = lookup("FRESHET_ALLOW_PARTIAL") {
            config.allow_partial = allow.to_lowercase() != "false";
        }
        if let Some(mode) = lookup("FRESHET_POLICY_FAILURE_MODE") {
            config.policy_failure_mode = mode.parse()?;
        }
        if let Some(mode) = lookup("FRESHET_STATISTICS_MODE") {
            config.statistics_mode = mode.parse()?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FRESHET_STATISTICS_LOG_INTERVAL_SECS")? {
            config.statistics_log_interval = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FRESHET_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(columns) = lookup("FRESHET_COLUMNS_TO_FRESHEN") {
            let parsed = columns
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ColumnKey::from_str)
                .collect::<Result<BTreeSet<_>, _>>()?;
            config.columns_to_freshen = Some(parsed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_concurrent_computes > 0
    /// - statistics_log_interval, if set, is positive
    pub fn validate(&self) -> FreshetResult<()> {
        if self.max_concurrent_computes == 0 {
            return Err(FreshetError::Config(ConfigError::InvalidValue {
                field: "max_concurrent_computes".to_string(),
                value: self.max_concurrent_computes.to_string(),
                reason: "max_concurrent_computes must be greater than 0".to_string(),
            }));
        }

        if let Some(interval) = self.statistics_log_interval {
            if interval.is_zero() {
                return Err(FreshetError::Config(ConfigError::InvalidValue {
                    field: "statistics_log_interval".to_string(),
                    value: format!("{:?}", interval),
                    reason: "statistics_log_interval must be positive".to_string(),
                }));
            }
        }

        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> FreshetResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                FreshetError::Config(ConfigError::InvalidValue {
                    field: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
        })
        .transpose()
}
