//! Engine configuration.
//!
//! Every setting has a default and can be overridden through a `WEIR_*`
//! environment variable. Durations are integer seconds unless the variable
//! name ends in `_MS`.

use std::path::PathBuf;
use std::time::Duration;

use weir_core::observability::LogFormat;

use crate::dedup::DEFAULT_DEDUP_WINDOW;
use crate::error::{Error, Result};
use crate::lease::DEFAULT_LEASE_TTL;
use crate::retry::RetryPolicy;
use crate::topology::Topology;
use crate::tracker::DEFAULT_CAS_ATTEMPTS;

const ENV_LEASE_TTL_SECS: &str = "WEIR_LEASE_TTL_SECS";
const ENV_DISPATCH_MAX_ATTEMPTS: &str = "WEIR_DISPATCH_MAX_ATTEMPTS";
const ENV_DISPATCH_BASE_DELAY_MS: &str = "WEIR_DISPATCH_BASE_DELAY_MS";
const ENV_DISPATCH_MAX_DELAY_MS: &str = "WEIR_DISPATCH_MAX_DELAY_MS";
const ENV_STORE_MAX_ATTEMPTS: &str = "WEIR_STORE_MAX_ATTEMPTS";
const ENV_STORE_BASE_DELAY_MS: &str = "WEIR_STORE_BASE_DELAY_MS";
const ENV_DEDUP_WINDOW_SECS: &str = "WEIR_DEDUP_WINDOW_SECS";
const ENV_STALE_PENDING_SECS: &str = "WEIR_STALE_PENDING_SECS";
const ENV_DISPATCH_RETENTION_SECS: &str = "WEIR_DISPATCH_RETENTION_SECS";
const ENV_LOT_RETENTION_SECS: &str = "WEIR_LOT_RETENTION_SECS";
const ENV_MAX_CONCURRENCY: &str = "WEIR_MAX_CONCURRENCY";
const ENV_CAS_MAX_ATTEMPTS: &str = "WEIR_CAS_MAX_ATTEMPTS";
const ENV_LOG_FORMAT: &str = "WEIR_LOG_FORMAT";
const ENV_TOPOLOGY_PATH: &str = "WEIR_TOPOLOGY_PATH";

const DEFAULT_STALE_PENDING: Duration = Duration::from_secs(120);
const DEFAULT_DISPATCH_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_LOT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Runtime settings of an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// TTL of leases granted to workers.
    pub lease_ttl: Duration,
    /// Backoff for trigger dispatch.
    pub dispatch_retry: RetryPolicy,
    /// Backoff for transient store failures while processing an event.
    pub store_retry: RetryPolicy,
    /// How long processed event ids are remembered.
    pub dedup_window: Duration,
    /// Age after which an untouched pending dispatch may be taken over.
    pub stale_pending_after: Duration,
    /// Age after which consumed dispatch records are garbage-collected.
    pub dispatch_record_retention: Duration,
    /// Age after which the state and observed objects of a completed lot are
    /// deleted. The manifest is kept.
    pub lot_retention: Duration,
    /// Events processed concurrently within one batch.
    pub max_concurrency: usize,
    /// CAS attempts before reporting contention.
    pub cas_max_attempts: u32,
    /// Log output format.
    pub log_format: LogFormat,
    /// Topology declaration file.
    pub topology_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            dispatch_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1)),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            stale_pending_after: DEFAULT_STALE_PENDING,
            dispatch_record_retention: DEFAULT_DISPATCH_RETENTION,
            lot_retention: DEFAULT_LOT_RETENTION,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cas_max_attempts: DEFAULT_CAS_ATTEMPTS,
            log_format: LogFormat::default(),
            topology_path: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable does not parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable does not parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&get_env, ENV_LEASE_TTL_SECS)? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_u32(&get_env, ENV_DISPATCH_MAX_ATTEMPTS)? {
            config.dispatch_retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_u64(&get_env, ENV_DISPATCH_BASE_DELAY_MS)? {
            config.dispatch_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&get_env, ENV_DISPATCH_MAX_DELAY_MS)? {
            config.dispatch_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_u32(&get_env, ENV_STORE_MAX_ATTEMPTS)? {
            config.store_retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_u64(&get_env, ENV_STORE_BASE_DELAY_MS)? {
            config.store_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&get_env, ENV_DEDUP_WINDOW_SECS)? {
            config.dedup_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get_env, ENV_STALE_PENDING_SECS)? {
            config.stale_pending_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get_env, ENV_DISPATCH_RETENTION_SECS)? {
            config.dispatch_record_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get_env, ENV_LOT_RETENTION_SECS)? {
            config.lot_retention = Duration::from_secs(secs);
        }
        if let Some(n) = parse_u64(&get_env, ENV_MAX_CONCURRENCY)? {
            config.max_concurrency = usize::try_from(n).map_err(|_| {
                Error::config(format!("{ENV_MAX_CONCURRENCY} value {n} exceeds supported range"))
            })?;
        }
        if let Some(attempts) = parse_u32(&get_env, ENV_CAS_MAX_ATTEMPTS)? {
            config.cas_max_attempts = attempts;
        }
        if let Some(raw) = get_env(ENV_LOG_FORMAT) {
            config.log_format = raw
                .parse()
                .map_err(|e| Error::config(format!("{ENV_LOG_FORMAT}: {e}")))?;
        }
        if let Some(path) = get_env(ENV_TOPOLOGY_PATH).filter(|p| !p.trim().is_empty()) {
            config.topology_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that settings are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(Error::config("lease TTL must be greater than zero"));
        }
        for (name, policy) in [("dispatch", &self.dispatch_retry), ("store", &self.store_retry)] {
            if policy.max_attempts == 0 {
                return Err(Error::config(format!("{name} retry needs at least one attempt")));
            }
            if policy.base_delay > policy.max_delay {
                return Err(Error::config(format!(
                    "{name} retry base delay exceeds its max delay"
                )));
            }
        }
        if self.stale_pending_after <= self.dispatch_retry.max_delay {
            return Err(Error::config(
                "stale pending threshold must exceed the dispatch max delay",
            ));
        }
        if self.dedup_window.is_zero() {
            return Err(Error::config("dedup window must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::config("max concurrency must be at least 1"));
        }
        if self.cas_max_attempts == 0 {
            return Err(Error::config("CAS attempts must be at least 1"));
        }
        Ok(())
    }

    /// Loads the topology named by `topology_path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no path is configured, or
    /// [`Error::InvalidTopology`] if the file is unreadable or invalid.
    pub fn load_topology(&self) -> Result<Topology> {
        let path = self
            .topology_path
            .as_deref()
            .ok_or_else(|| Error::config(format!("{ENV_TOPOLOGY_PATH} is not set")))?;
        Topology::from_path(path)
    }
}

fn parse_u64<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::config(format!("{key} must be a non-negative integer, got '{raw}'")))
}

fn parse_u32<F>(get_env: &F, key: &str) -> Result<Option<u32>>
where
    F: Fn(&str) -> Option<String>,
{
    parse_u64(get_env, key)?
        .map(|value| {
            u32::try_from(value)
                .map_err(|_| Error::config(format!("{key} value {value} exceeds supported range")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
        assert_eq!(EngineConfig::from_env_with(lookup(&[])).unwrap(), EngineConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_env_with(lookup(&[
            ("WEIR_LEASE_TTL_SECS", "30"),
            ("WEIR_DISPATCH_MAX_ATTEMPTS", "7"),
            ("WEIR_MAX_CONCURRENCY", "4"),
            ("WEIR_LOT_RETENTION_SECS", "86400"),
            ("WEIR_LOG_FORMAT", "json"),
            ("WEIR_TOPOLOGY_PATH", "/etc/weir/topology.yaml"),
        ]))
        .unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.dispatch_retry.max_attempts, 7);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.lot_retention, Duration::from_secs(86_400));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.topology_path,
            Some(PathBuf::from("/etc/weir/topology.yaml"))
        );
    }

    #[test]
    fn rejects_garbage_and_inconsistent_values() {
        assert!(EngineConfig::from_env_with(lookup(&[("WEIR_LEASE_TTL_SECS", "soon")])).is_err());
        assert!(EngineConfig::from_env_with(lookup(&[("WEIR_DISPATCH_MAX_ATTEMPTS", "0")])).is_err());
        assert!(EngineConfig::from_env_with(lookup(&[("WEIR_LOG_FORMAT", "xml")])).is_err());

        let err = EngineConfig::from_env_with(lookup(&[
            ("WEIR_STALE_PENDING_SECS", "1"),
            ("WEIR_DISPATCH_MAX_DELAY_MS", "5000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("stale pending"));
    }
}
