//! Typed configuration for the primitive engine, validated at startup.
//!
//! Mirrors the teacher's `DaemonConfig` layering: built-in defaults, then a
//! `[platform]` section of a TOML file, then explicit overrides (the
//! equivalent of CLI/env in the teacher). Every invalid value is collected
//! into a single aggregated error rather than failing on the first bad
//! field (spec §6).

use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BATCH_SIZE: u32 = 50;
const DEFAULT_LEASE_DURATION_SECS: u64 = 30;
const DEFAULT_CLAIM_LEASE_DURATION_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_DISCOVERY_REFRESH_SECS: u64 = 30;
const DEFAULT_ATTEMPT_LOCK_SECS: u64 = 60;
const DEFAULT_MIN_CHECK_INTERVAL_SECS: u64 = 15;

/// How an external-side-effect coordinator should treat a `checkFn` result
/// of `Unknown` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UnknownCheckBehavior {
    #[default]
    RetryLater,
    ExecuteAnyway,
}

/// `{data_dir}/config.toml`'s `[platform]` section — all fields optional
/// overrides layered beneath explicit construction args, above built-in
/// defaults.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    schema_name: Option<String>,
    batch_size: Option<u32>,
    lease_duration_secs: Option<u64>,
    claim_lease_duration_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    retention_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    discovery_refresh_secs: Option<u64>,
    external_effect_attempt_lock_secs: Option<u64>,
    external_effect_min_check_interval_secs: Option<u64>,
    unknown_check_behavior: Option<UnknownCheckBehavior>,
}

/// Validated runtime configuration for a [`crate::providers::StoreProvider`]
/// and the dispatchers built on top of it.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// SQLite/Postgres connection string for the default (single-database)
    /// provider. Empty is rejected by `validate()`.
    pub connection_string: String,
    /// Logical schema/namespace prefix for table names. Empty is rejected.
    pub schema_name: String,
    pub batch_size: u32,
    pub lease_duration: Duration,
    pub claim_lease_duration: Duration,
    pub poll_interval: Duration,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub discovery_refresh_interval: Duration,
    pub external_effect_attempt_lock_duration: Duration,
    pub external_effect_min_check_interval: Duration,
    pub unknown_check_behavior: UnknownCheckBehavior,
}

impl PlatformConfig {
    /// Build configuration for `connection_string`, applying an optional
    /// TOML override file found at `{data_dir}/config.toml`, then validate.
    pub fn load(connection_string: impl Into<String>, data_dir: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let toml_cfg = data_dir.and_then(load_toml).unwrap_or_default();

        let cfg = PlatformConfig {
            connection_string: connection_string.into(),
            schema_name: toml_cfg.schema_name.unwrap_or_else(|| "public".to_string()),
            batch_size: toml_cfg.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            lease_duration: Duration::from_secs(
                toml_cfg.lease_duration_secs.unwrap_or(DEFAULT_LEASE_DURATION_SECS),
            ),
            claim_lease_duration: Duration::from_secs(
                toml_cfg
                    .claim_lease_duration_secs
                    .unwrap_or(DEFAULT_CLAIM_LEASE_DURATION_SECS),
            ),
            poll_interval: Duration::from_millis(
                toml_cfg.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            retention: Duration::from_secs(toml_cfg.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS)),
            cleanup_interval: Duration::from_secs(
                toml_cfg.cleanup_interval_secs.unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
            ),
            discovery_refresh_interval: Duration::from_secs(
                toml_cfg
                    .discovery_refresh_secs
                    .unwrap_or(DEFAULT_DISCOVERY_REFRESH_SECS),
            ),
            external_effect_attempt_lock_duration: Duration::from_secs(
                toml_cfg
                    .external_effect_attempt_lock_secs
                    .unwrap_or(DEFAULT_ATTEMPT_LOCK_SECS),
            ),
            external_effect_min_check_interval: Duration::from_secs(
                toml_cfg
                    .external_effect_min_check_interval_secs
                    .unwrap_or(DEFAULT_MIN_CHECK_INTERVAL_SECS),
            ),
            unknown_check_behavior: toml_cfg.unknown_check_behavior.unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Aggregate every invalid field into a single error (spec §6).
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        if self.connection_string.trim().is_empty() {
            problems.push("connection_string must not be empty".to_string());
        }
        if self.schema_name.trim().is_empty() {
            problems.push("schema_name must not be empty".to_string());
        }
        if self.lease_duration.is_zero() {
            problems.push("lease_duration_secs must be positive".to_string());
        }
        if self.claim_lease_duration.is_zero() {
            problems.push("claim_lease_duration_secs must be positive".to_string());
        }
        if self.poll_interval.is_zero() {
            problems.push("poll_interval_ms must be positive".to_string());
        }
        if self.cleanup_interval.is_zero() {
            problems.push("cleanup_interval_secs must be positive".to_string());
        }
        if self.discovery_refresh_interval.is_zero() {
            problems.push("discovery_refresh_secs must be positive".to_string());
        }
        if self.external_effect_attempt_lock_duration.is_zero() {
            problems.push("external_effect_attempt_lock_secs must be positive".to_string());
        }
        if self.external_effect_min_check_interval.is_zero() {
            problems.push("external_effect_min_check_interval_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid platform configuration:\n  - {}", problems.join("\n  - "))
        }
    }
}

fn load_toml(data_dir: &std::path::Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    #[derive(Deserialize, Default)]
    struct Wrapper {
        platform: Option<TomlConfig>,
    }
    match toml::from_str::<Wrapper>(&contents) {
        Ok(w) => w.platform,
        Err(e) => {
            tracing::error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_connection_string() {
        let cfg = PlatformConfig {
            connection_string: String::new(),
            schema_name: "public".into(),
            batch_size: 10,
            lease_duration: Duration::from_secs(1),
            claim_lease_duration: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            retention: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(1),
            discovery_refresh_interval: Duration::from_secs(1),
            external_effect_attempt_lock_duration: Duration::from_secs(1),
            external_effect_min_check_interval: Duration::from_secs(1),
            unknown_check_behavior: UnknownCheckBehavior::RetryLater,
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("connection_string"));
    }

    #[test]
    fn aggregates_multiple_problems() {
        let cfg = PlatformConfig {
            connection_string: String::new(),
            schema_name: String::new(),
            batch_size: 10,
            lease_duration: Duration::from_secs(0),
            claim_lease_duration: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            retention: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(1),
            discovery_refresh_interval: Duration::from_secs(1),
            external_effect_attempt_lock_duration: Duration::from_secs(1),
            external_effect_min_check_interval: Duration::from_secs(1),
            unknown_check_behavior: UnknownCheckBehavior::RetryLater,
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("connection_string"));
        assert!(err.contains("schema_name"));
        assert!(err.contains("lease_duration_secs"));
    }
}
