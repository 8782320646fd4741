//! Engine-level sandbox configuration.
//!
//! Per-execution limits travel with each [`ResourceBudget`]; this struct only
//! holds what is fixed when the engine is created.
//!
//! [`ResourceBudget`]: stratguard_core::ResourceBudget
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use stratguard_runtime::config::SandboxConfig;
//!
//! let config = SandboxConfig::builder()
//!     .fuel_per_cpu_second(1_000_000)
//!     .epoch_tick(Duration::from_millis(5))
//!     .build();
//!
//! assert_eq!(config.fuel_per_cpu_second(), 1_000_000);
//! assert_eq!(config.module_cache_size(), 256);
//! ```

use std::time::Duration;
use stratguard_core::GuardConfig;

/// Sandbox engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    fuel_per_cpu_second: u64,
    epoch_tick: Duration,
    module_cache_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel_per_cpu_second: 100_000_000,
            epoch_tick: Duration::from_millis(10),
            module_cache_size: 256,
        }
    }
}

impl SandboxConfig {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Takes the sandbox-related fields of a validated [`GuardConfig`].
    #[must_use]
    pub fn from_guard(config: &GuardConfig) -> Self {
        Self {
            fuel_per_cpu_second: config.fuel_per_cpu_second,
            epoch_tick: config.epoch_tick(),
            module_cache_size: config.max_cache_size,
        }
    }

    /// Fuel granted per CPU second.
    #[must_use]
    pub const fn fuel_per_cpu_second(&self) -> u64 {
        self.fuel_per_cpu_second
    }

    /// Period of the epoch ticker.
    #[must_use]
    pub const fn epoch_tick(&self) -> Duration {
        self.epoch_tick
    }

    /// Capacity of the compiled module cache.
    #[must_use]
    pub const fn module_cache_size(&self) -> usize {
        self.module_cache_size
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Sets fuel per CPU second (at least 1).
    #[must_use]
    pub fn fuel_per_cpu_second(mut self, fuel: u64) -> Self {
        self.config.fuel_per_cpu_second = fuel.max(1);
        self
    }

    /// Sets the epoch tick (at least 1ms).
    #[must_use]
    pub fn epoch_tick(mut self, tick: Duration) -> Self {
        self.config.epoch_tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Sets the module cache capacity.
    #[must_use]
    pub const fn module_cache_size(mut self, size: usize) -> Self {
        self.config.module_cache_size = size;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_guard_copies_fields() {
        let guard = GuardConfig::builder()
            .fuel_per_cpu_second(42)
            .epoch_tick_ms(3)
            .max_cache_size(7)
            .build();
        let config = SandboxConfig::from_guard(&guard);
        assert_eq!(config.fuel_per_cpu_second(), 42);
        assert_eq!(config.epoch_tick(), Duration::from_millis(3));
        assert_eq!(config.module_cache_size(), 7);
    }

    #[test]
    fn test_builder_clamps_degenerate_values() {
        let config = SandboxConfig::builder()
            .fuel_per_cpu_second(0)
            .epoch_tick(Duration::ZERO)
            .build();
        assert_eq!(config.fuel_per_cpu_second(), 1);
        assert_eq!(config.epoch_tick(), Duration::from_millis(1));
    }
}
