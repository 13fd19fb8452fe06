//! Runtime configuration.
//!
//! Defaults cover most deployments. Values can be read from JSON or
//! overridden from the environment:
//!
//! | Variable                   | Field                          |
//! |----------------------------|--------------------------------|
//! | `CRIS_PARALLEL_RUNNERS`    | `host.initial_runners`         |
//! | `CRIS_MAX_RUNNERS`         | `host.max_runners`             |
//! | `CRIS_MAX_TIMER_DELAY_MS`  | `scheduler.max_timer_delay_ms` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CrisError, Result};

pub const DEFAULT_MAX_RUNNERS: usize = 1000;

/// Longest delay a single timer arm may use (`u32::MAX - 1` milliseconds).
/// Longer waits fire early and re-arm.
pub const DEFAULT_MAX_TIMER_DELAY_MS: u64 = 4_294_967_294;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisConfig {
    pub host: HostConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Runners started with the host.
    pub initial_runners: usize,
    /// Upper bound accepted by `set_parallel_runner_count`.
    pub max_runners: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            initial_runners: 1,
            max_runners: DEFAULT_MAX_RUNNERS,
        }
    }
}

impl HostConfig {
    pub fn with_runners(initial_runners: usize) -> Self {
        Self {
            initial_runners,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_runners == 0 {
            return Err(CrisError::Config("host.max_runners must be at least 1".into()));
        }
        if self.initial_runners == 0 || self.initial_runners > self.max_runners {
            return Err(CrisError::InvalidRunnerCount {
                requested: self.initial_runners,
                max: self.max_runners,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_timer_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_timer_delay_ms: DEFAULT_MAX_TIMER_DELAY_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn max_timer_delay(&self) -> Duration {
        Duration::from_millis(self.max_timer_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_timer_delay_ms == 0 {
            return Err(CrisError::Config(
                "scheduler.max_timer_delay_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl CrisConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CrisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CRIS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "CRIS_PARALLEL_RUNNERS")? {
            config.host.initial_runners = v;
        }
        if let Some(v) = parse_var(&lookup, "CRIS_MAX_RUNNERS")? {
            config.host.max_runners = v;
        }
        if let Some(v) = parse_var(&lookup, "CRIS_MAX_TIMER_DELAY_MS")? {
            config.scheduler.max_timer_delay_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        self.scheduler.validate()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| CrisError::Config(format!("{key}: cannot parse {raw:?}")))
}
