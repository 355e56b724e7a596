//! Runtime knobs, read from `MIRRA_*` environment variables.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::{Backoff, MirraError, MirraResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// First delay after a failed list/watch.
    pub watch_backoff_min: Duration,
    /// Cap for list/watch retry delays.
    pub watch_backoff_max: Duration,
    /// Force a relist after this long on one watch; `None` disables it.
    pub relist_every: Option<Duration>,
    /// Number of reconciler workers.
    pub workers: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long the CLI waits for the initial sync.
    pub wait_for_sync: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_backoff_min: Duration::from_millis(200),
            watch_backoff_max: Duration::from_secs(30),
            relist_every: None,
            workers: 2,
            retry_base: Duration::from_millis(5),
            retry_max: Duration::from_secs(300),
            wait_for_sync: Duration::from_secs(8),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

impl Config {
    /// Defaults overridden by whatever `MIRRA_*` variables are set.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            watch_backoff_min: env_parse::<u64>("MIRRA_WATCH_BACKOFF_MIN_MS").map(Duration::from_millis).unwrap_or(d.watch_backoff_min),
            watch_backoff_max: env_parse::<u64>("MIRRA_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            relist_every: match env_parse::<u64>("MIRRA_RELIST_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => d.relist_every,
            },
            workers: env_parse("MIRRA_WORKERS").unwrap_or(d.workers),
            retry_base: env_parse::<u64>("MIRRA_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(d.retry_base),
            retry_max: env_parse::<u64>("MIRRA_RETRY_MAX_SECS").map(Duration::from_secs).unwrap_or(d.retry_max),
            wait_for_sync: env_parse::<u64>("MIRRA_WAIT_SECS").map(Duration::from_secs).unwrap_or(d.wait_for_sync),
        }
    }

    pub fn validate(&self) -> MirraResult<()> {
        if self.workers == 0 {
            return Err(MirraError::fatal("MIRRA_WORKERS must be at least 1"));
        }
        if self.watch_backoff_min > self.watch_backoff_max {
            return Err(MirraError::fatal("watch backoff min exceeds max"));
        }
        if self.retry_base > self.retry_max {
            return Err(MirraError::fatal("retry base exceeds retry max"));
        }
        Ok(())
    }

    pub fn watch_backoff(&self) -> Backoff { Backoff::new(self.watch_backoff_min, self.watch_backoff_max) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_fatal() {
        let cfg = Config { workers: 0, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(MirraError::Fatal(_))));
    }
}
