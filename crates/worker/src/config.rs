use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Directory holding the `_scripts/` tree.
    pub working_root: PathBuf,
    pub script_poll_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep_enabled: bool,
    /// Reclaim attempts per node before a version conflict is reported.
    pub sweep_max_attempts: u32,
    pub db_max_connections: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default    |
    /// |-----------------------------|------------|
    /// | `DATABASE_URL`              | (required) |
    /// | `WORKING_ROOT`              | `.`        |
    /// | `SCRIPT_POLL_INTERVAL_SECS` | `5`        |
    /// | `SWEEP_INTERVAL_SECS`       | `60`       |
    /// | `SWEEP_ENABLED`             | `true`     |
    /// | `SWEEP_MAX_ATTEMPTS`        | `3`        |
    /// | `DB_MAX_CONNECTIONS`        | `20`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let working_root = lookup("WORKING_ROOT")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let poll_secs: u64 = parse_or(&lookup, "SCRIPT_POLL_INTERVAL_SECS", 5);
        let sweep_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", 60);

        Ok(Self {
            database_url,
            working_root,
            script_poll_interval: Duration::from_secs(poll_secs.max(1)),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            sweep_enabled: parse_or(&lookup, "SWEEP_ENABLED", true),
            sweep_max_attempts: parse_or(&lookup, "SWEEP_MAX_ATTEMPTS", 3u32).max(1),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 20),
        })
    }
}

/// Parse `name`, falling back to `default` when unset or invalid.
fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, ?default, "Invalid value, using default");
            default
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
