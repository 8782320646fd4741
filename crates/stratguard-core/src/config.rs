//! Configuration for strategy loading and execution.
//!
//! A [`GuardConfig`] is read from TOML, optionally overridden by
//! `STRATGUARD_*` environment variables, and validated before any loader is
//! built from it.
//!
//! # Examples
//!
//! ```
//! use stratguard_core::GuardConfig;
//!
//! let config = GuardConfig::from_toml_str(
//!     r#"
//!     strict_mode = false
//!     wall_clock_timeout_seconds = 2.5
//!
//!     [policy]
//!     modules = ["math"]
//!     "#,
//! )
//! .unwrap();
//!
//! assert!(!config.strict_mode);
//! assert_eq!(config.policy.modules, vec!["math".to_string()]);
//! assert_eq!(config.max_cache_size, 256);
//! ```

use crate::types::ExecutionLimits;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables recognized by
/// [`GuardConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "STRATGUARD_";

/// Loader, sandbox, cache and audit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Reject any finding, not just high and critical ones.
    ///
    /// Default: true
    pub strict_mode: bool,

    /// CPU budget per execution.
    ///
    /// Default: 10.0
    pub cpu_limit_seconds: f64,

    /// Memory budget per execution, in mebibytes.
    ///
    /// Default: 64
    pub memory_limit_mb: u64,

    /// Wall-clock budget per execution.
    ///
    /// Default: 30.0
    pub wall_clock_timeout_seconds: f64,

    /// Lifetime of a cache entry.
    ///
    /// Default: 3600
    pub cache_ttl_seconds: u64,

    /// Maximum number of cached classes.
    ///
    /// Default: 256
    pub max_cache_size: usize,

    /// JSONL audit file. `None` keeps the audit trail in memory only.
    pub audit_log_path: Option<PathBuf>,

    /// Capacity of the in-memory audit ring buffer (and of the channel to
    /// the durable writer).
    ///
    /// Default: 1024
    pub audit_buffer_capacity: usize,

    /// Sandbox fuel units granted per CPU second.
    ///
    /// Default: 100,000,000
    pub fuel_per_cpu_second: u64,

    /// Period of the engine epoch ticker in milliseconds. Bounds how quickly
    /// timeouts and cancellation take effect.
    ///
    /// Default: 10
    pub epoch_tick_ms: u64,

    /// Number of cache shards.
    ///
    /// Default: 8
    pub cache_shards: usize,

    /// Permission policy.
    pub policy: PolicyConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            cpu_limit_seconds: 10.0,
            memory_limit_mb: 64,
            wall_clock_timeout_seconds: 30.0,
            cache_ttl_seconds: 3600,
            max_cache_size: 256,
            audit_log_path: None,
            audit_buffer_capacity: 1024,
            fuel_per_cpu_second: 100_000_000,
            epoch_tick_ms: 10,
            cache_shards: 8,
            policy: PolicyConfig::default(),
        }
    }
}

/// Whitelists and denials the permission checker is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Importable modules.
    pub modules: Vec<String>,
    /// Callable builtins.
    pub builtins: Vec<String>,
    /// Symbols removed from the namespace even if whitelisted, written as
    /// `name` or `module.member`.
    pub denied: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            modules: vec!["math".to_string(), "typing".to_string()],
            builtins: ["abs", "min", "max", "len", "range", "round", "int", "float", "bool"]
                .into_iter()
                .map(String::from)
                .collect(),
            denied: Vec::new(),
        }
    }
}

impl GuardConfig {
    /// Creates a configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::GuardConfig;
    ///
    /// let config = GuardConfig::builder()
    ///     .strict_mode(false)
    ///     .wall_clock_timeout_seconds(0.5)
    ///     .max_cache_size(16)
    ///     .build();
    ///
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.wall_clock_timeout().as_millis(), 500);
    /// ```
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::new()
    }

    /// Parses TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] on malformed TOML, unknown keys or a
    /// failed [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::ConfigError {
            message: format!("invalid configuration: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigError {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigError {
            message: format!("cannot serialize configuration: {e}"),
        })
    }

    /// Default configuration file location, `<config dir>/stratguard/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stratguard").join("config.toml"))
    }

    /// Applies `STRATGUARD_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if a recognized variable has an
    /// unparseable value.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies overrides from `(NAME, value)` pairs. Names without the
    /// `STRATGUARD_` prefix or with an unknown suffix are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if a recognized variable has an
    /// unparseable value.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::GuardConfig;
    ///
    /// let mut config = GuardConfig::default();
    /// config
    ///     .apply_overrides([
    ///         ("STRATGUARD_STRICT_MODE".to_string(), "false".to_string()),
    ///         ("STRATGUARD_MEMORY_LIMIT_MB".to_string(), "32".to_string()),
    ///         ("HOME".to_string(), "/root".to_string()),
    ///     ])
    ///     .unwrap();
    /// assert!(!config.strict_mode);
    /// assert_eq!(config.memory_limit_mb, 32);
    /// ```
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match key {
                "STRICT_MODE" => self.strict_mode = parse_env(&name, value)?,
                "CPU_LIMIT_SECONDS" => self.cpu_limit_seconds = parse_env(&name, value)?,
                "MEMORY_LIMIT_MB" => self.memory_limit_mb = parse_env(&name, value)?,
                "WALL_CLOCK_TIMEOUT_SECONDS" => {
                    self.wall_clock_timeout_seconds = parse_env(&name, value)?;
                }
                "CACHE_TTL_SECONDS" => self.cache_ttl_seconds = parse_env(&name, value)?,
                "MAX_CACHE_SIZE" => self.max_cache_size = parse_env(&name, value)?,
                "AUDIT_LOG_PATH" => {
                    self.audit_log_path = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                "FUEL_PER_CPU_SECOND" => self.fuel_per_cpu_second = parse_env(&name, value)?,
                "EPOCH_TICK_MS" => self.epoch_tick_ms = parse_env(&name, value)?,
                _ => continue,
            }
            tracing::debug!(variable = %name, "applied configuration override");
        }
        Ok(())
    }

    /// Validates ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] naming the first offending option.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::GuardConfig;
    ///
    /// assert!(GuardConfig::default().validate().is_ok());
    ///
    /// let mut invalid = GuardConfig::default();
    /// invalid.max_cache_size = 0;
    /// assert!(invalid.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        self.limits().budget()?;
        let checks: [(bool, &str); 6] = [
            (self.memory_limit_mb > 0, "memory_limit_mb must be greater than zero"),
            (self.max_cache_size > 0, "max_cache_size must be greater than zero"),
            (self.cache_shards > 0, "cache_shards must be greater than zero"),
            (
                self.audit_buffer_capacity > 0,
                "audit_buffer_capacity must be greater than zero",
            ),
            (
                self.fuel_per_cpu_second > 0,
                "fuel_per_cpu_second must be greater than zero",
            ),
            (
                self.epoch_tick_ms > 0 && self.epoch_tick_ms <= 1000,
                "epoch_tick_ms must be between 1 and 1000",
            ),
        ];
        if let Some((_, message)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(Error::ConfigError {
                message: (*message).to_string(),
            });
        }
        if let Some(path) = &self.audit_log_path
            && path.as_os_str().is_empty()
        {
            return Err(Error::ConfigError {
                message: "audit_log_path cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Per-execution limits derived from the configuration.
    #[must_use]
    pub const fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            cpu_seconds: self.cpu_limit_seconds,
            memory_bytes: self.memory_limit_mb.saturating_mul(1024 * 1024),
            wall_clock_seconds: self.wall_clock_timeout_seconds,
        }
    }

    /// Cache entry lifetime.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// Wall-clock budget.
    #[must_use]
    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.wall_clock_timeout_seconds.max(0.0))
    }

    /// Epoch ticker period.
    #[must_use]
    pub const fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| Error::ConfigError {
        message: format!("{name}={value:?}: {e}"),
    })
}

/// Builder for [`GuardConfig`].
#[derive(Debug, Default)]
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets strict mode.
    #[must_use]
    pub const fn strict_mode(mut self, strict: bool) -> Self {
        self.config.strict_mode = strict;
        self
    }

    /// Sets the CPU budget.
    #[must_use]
    pub const fn cpu_limit_seconds(mut self, seconds: f64) -> Self {
        self.config.cpu_limit_seconds = seconds;
        self
    }

    /// Sets the memory budget.
    #[must_use]
    pub const fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.config.memory_limit_mb = mb;
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub const fn wall_clock_timeout_seconds(mut self, seconds: f64) -> Self {
        self.config.wall_clock_timeout_seconds = seconds;
        self
    }

    /// Sets the cache TTL.
    #[must_use]
    pub const fn cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.config.cache_ttl_seconds = seconds;
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub const fn max_cache_size(mut self, size: usize) -> Self {
        self.config.max_cache_size = size;
        self
    }

    /// Sets the audit log file.
    #[must_use]
    pub fn audit_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.audit_log_path = Some(path.into());
        self
    }

    /// Sets the audit ring buffer capacity.
    #[must_use]
    pub const fn audit_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.audit_buffer_capacity = capacity;
        self
    }

    /// Sets fuel per CPU second.
    #[must_use]
    pub const fn fuel_per_cpu_second(mut self, fuel: u64) -> Self {
        self.config.fuel_per_cpu_second = fuel;
        self
    }

    /// Sets the epoch tick period.
    #[must_use]
    pub const fn epoch_tick_ms(mut self, ms: u64) -> Self {
        self.config.epoch_tick_ms = ms;
        self
    }

    /// Sets the number of cache shards.
    #[must_use]
    pub const fn cache_shards(mut self, shards: usize) -> Self {
        self.config.cache_shards = shards;
        self
    }

    /// Sets the permission policy.
    #[must_use]
    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.config.policy = policy;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> GuardConfig {
        self.config
    }
}
