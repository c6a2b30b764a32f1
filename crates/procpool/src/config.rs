//! Pool sizing configuration.
//!
//! Validated before any process is spawned; violations never reach a child.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sizing and lifecycle parameters of a process pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum number of executors kept alive.
    #[serde(default)]
    pub min_size: usize,

    /// Maximum number of executors, including starting and stopping ones.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Number of idle executors the pool tries to keep warm.
    #[serde(default)]
    pub reserve_size: usize,

    /// How long an executor may sit idle before it is retired, when the pool
    /// is above its minimum size. `None` disables retirement.
    #[serde(default = "default_keep_alive")]
    #[serde(with = "humantime_serde_opt")]
    pub keep_alive: Option<Duration>,

    /// How long a stopping executor waits for its child to exit after
    /// closing stdin before killing it.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

const fn default_max_size() -> usize {
    1
}

const fn default_keep_alive() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            reserve_size: 0,
            keep_alive: default_keep_alive(),
            grace_period: default_grace_period(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given size bounds.
    #[must_use]
    pub fn new(min_size: usize, max_size: usize, reserve_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            reserve_size,
            ..Self::default()
        }
    }

    /// Set the idle keep-alive interval.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the stop grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Number of executors started during warmup.
    #[must_use]
    pub fn initial_size(&self) -> usize {
        self.min_size.max(self.reserve_size)
    }

    /// Check the size bounds.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMax);
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::MinAboveMax {
                min: self.min_size,
                max: self.max_size,
            });
        }
        if self.reserve_size > self.max_size {
            return Err(ConfigError::ReserveAboveMax {
                reserve: self.reserve_size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The maximum pool size is zero.
    #[error("maximum pool size must be at least 1")]
    ZeroMax,

    /// The minimum pool size exceeds the maximum.
    #[error("minimum pool size {min} exceeds maximum pool size {max}")]
    MinAboveMax {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The reserve size exceeds the maximum pool size.
    #[error("reserve size {reserve} exceeds maximum pool size {max}")]
    ReserveAboveMax {
        /// Configured reserve.
        reserve: usize,
        /// Configured maximum.
        max: usize,
    },
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => {
                serializer.serialize_some(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
