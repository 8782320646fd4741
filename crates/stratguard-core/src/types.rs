//! Strong domain types for strategy loading.
//!
//! Newtypes over primitives keep identifiers, hashes and budgets from being
//! mixed up at call sites.
//!
//! # Examples
//!
//! ```
//! use stratguard_core::{SourceType, StrategyId, StrategySourceRecord};
//!
//! let record = StrategySourceRecord::new(
//!     StrategyId::new("momentum-7"),
//!     "class S(BaseStrategy):\n    def generate_signals(self, data): return {}\n",
//!     "S",
//!     SourceType::Ai,
//! );
//! assert!(record.source_type().is_dynamic());
//! ```

use crate::hash::ContentHash;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Strategy record identifier (newtype over String).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrategyId(String);

impl StrategyId {
    /// Creates a new strategy identifier.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Provenance of a strategy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Pre-registered trusted class configured by parameters.
    Builtin,
    /// Source generated by a model.
    Ai,
    /// Hand-written source.
    Custom,
}

impl SourceType {
    /// Returns the lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Ai => "ai",
            Self::Custom => "custom",
        }
    }

    /// Whether records of this type carry arbitrary source code.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, Self::Ai | Self::Custom)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "builtin" => Ok(Self::Builtin),
            "ai" => Ok(Self::Ai),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidArgument(format!(
                "unknown source type '{other}'"
            ))),
        }
    }
}

/// Strategy source as fetched from the external store.
///
/// Immutable once constructed. For [`SourceType::Builtin`] the source text is
/// a JSON object of parameters and the class name refers to a registered
/// trusted class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySourceRecord {
    id: StrategyId,
    source_text: String,
    declared_class_name: String,
    source_type: SourceType,
}

impl StrategySourceRecord {
    /// Creates a new record.
    #[must_use]
    pub fn new(
        id: StrategyId,
        source_text: impl Into<String>,
        declared_class_name: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            id,
            source_text: source_text.into(),
            declared_class_name: declared_class_name.into(),
            source_type,
        }
    }

    /// Record identifier.
    #[must_use]
    pub const fn id(&self) -> &StrategyId {
        &self.id
    }

    /// Raw source text.
    #[must_use]
    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    /// Class the record claims to define.
    #[must_use]
    pub fn declared_class_name(&self) -> &str {
        &self.declared_class_name
    }

    /// Provenance.
    #[must_use]
    pub const fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Content hash of the source text.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.source_text)
    }
}

/// Operation surface of the strategy contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOp {
    /// Produce trading signals keyed by bar index.
    GenerateSignals,
    /// Produce ranking scores keyed by bar index.
    CalculateScores,
}

impl StrategyOp {
    /// All operations, in contract order.
    pub const ALL: [Self; 2] = [Self::GenerateSignals, Self::CalculateScores];

    /// Method name implementing the operation.
    #[must_use]
    pub const fn method_name(self) -> &'static str {
        match self {
            Self::GenerateSignals => "generate_signals",
            Self::CalculateScores => "calculate_scores",
        }
    }

    /// Looks up an operation by its method name.
    #[must_use]
    pub fn from_method_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.method_name() == name)
    }
}

impl fmt::Display for StrategyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

impl FromStr for StrategyOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_method_name(s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown strategy operation '{s}'")))
    }
}

/// Price series field addressable from strategy code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    /// Opening price
    Open,
    /// High price
    High,
    /// Low price
    Low,
    /// Closing price
    Close,
    /// Traded volume
    Volume,
}

impl Field {
    /// All fields in code order.
    pub const ALL: [Self; 5] = [Self::Open, Self::High, Self::Low, Self::Close, Self::Volume];

    /// Attribute name used in strategy code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
        }
    }

    /// Stable numeric code passed across the sandbox boundary.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::High => 1,
            Self::Low => 2,
            Self::Close => 3,
            Self::Volume => 4,
        }
    }

    /// Inverse of [`code`](Self::code).
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Inverse of [`name`](Self::name).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Bar data handed to a strategy. All series have equal length.
///
/// # Examples
///
/// ```
/// use stratguard_core::{Field, MarketData};
///
/// let data = MarketData::from_closes(vec![1.0, 2.0, 3.0]);
/// assert_eq!(data.len(), 3);
/// assert_eq!(data.series(Field::High), &[1.0, 2.0, 3.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
}

impl MarketData {
    /// Creates market data from OHLCV columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the columns differ in length.
    pub fn new(
        open: Vec<f64>,
        high: Vec<f64>,
        low: Vec<f64>,
        close: Vec<f64>,
        volume: Vec<f64>,
    ) -> Result<Self> {
        let n = close.len();
        if [open.len(), high.len(), low.len(), volume.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err(Error::InvalidArgument(
                "market data columns must have equal length".to_string(),
            ));
        }
        Ok(Self {
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Creates market data where every price column equals `closes` and
    /// volume is zero.
    #[must_use]
    pub fn from_closes(closes: Vec<f64>) -> Self {
        let volume = vec![0.0; closes.len()];
        Self {
            open: closes.clone(),
            high: closes.clone(),
            low: closes.clone(),
            close: closes,
            volume,
        }
    }

    /// Number of bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.close.len()
    }

    /// Whether there are no bars.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// Returns one column.
    #[must_use]
    pub fn series(&self, field: Field) -> &[f64] {
        match field {
            Field::Open => &self.open,
            Field::High => &self.high,
            Field::Low => &self.low,
            Field::Close => &self.close,
            Field::Volume => &self.volume,
        }
    }
}

/// Strategy output: value per bar index.
pub type Signals = BTreeMap<i64, f64>;

/// Which budget an aborted execution exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Wall-clock timeout
    WallClock,
    /// CPU budget (fuel)
    Cpu,
    /// Memory budget
    Memory,
}

impl LimitKind {
    /// Outcome label used in `execution_end` audit records.
    #[must_use]
    pub const fn outcome(self) -> &'static str {
        match self {
            Self::WallClock => "timeout",
            Self::Cpu => "cpu_limit",
            Self::Memory => "memory_limit",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WallClock => "wall_clock",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        })
    }
}

/// Reusable limits from which one [`ResourceBudget`] is minted per execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// CPU seconds
    pub cpu_seconds: f64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Wall-clock seconds
    pub wall_clock_seconds: f64,
}

impl ExecutionLimits {
    /// Mints a fresh budget for one execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if any limit is not positive and finite.
    pub fn budget(&self) -> Result<ResourceBudget> {
        ResourceBudget::new(self.cpu_seconds, self.memory_bytes, self.wall_clock_seconds)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 10.0,
            memory_bytes: 64 * 1024 * 1024,
            wall_clock_seconds: 30.0,
        }
    }
}

/// Budget for exactly one execution.
///
/// Deliberately neither `Clone` nor `Copy`: the execution consumes it.
#[derive(Debug, PartialEq)]
pub struct ResourceBudget {
    cpu_seconds: f64,
    memory_bytes: u64,
    wall_clock_seconds: f64,
}

impl ResourceBudget {
    /// Creates a budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if any limit is not positive and finite.
    ///
    /// # Examples
    ///
    /// ```
    /// use stratguard_core::ResourceBudget;
    ///
    /// let budget = ResourceBudget::new(1.0, 1024 * 1024, 2.5).unwrap();
    /// assert_eq!(budget.wall_clock().as_millis(), 2500);
    /// assert!(ResourceBudget::new(0.0, 1, 1.0).is_err());
    /// ```
    pub fn new(cpu_seconds: f64, memory_bytes: u64, wall_clock_seconds: f64) -> Result<Self> {
        for (name, value) in [
            ("cpu_seconds", cpu_seconds),
            ("wall_clock_seconds", wall_clock_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::ConfigError {
                    message: format!("{name} must be a positive number, got {value}"),
                });
            }
        }
        if memory_bytes == 0 {
            return Err(Error::ConfigError {
                message: "memory_bytes must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            cpu_seconds,
            memory_bytes,
            wall_clock_seconds,
        })
    }

    /// CPU budget in seconds.
    #[must_use]
    pub const fn cpu_seconds(&self) -> f64 {
        self.cpu_seconds
    }

    /// Memory ceiling in bytes.
    #[must_use]
    pub const fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    /// Wall-clock budget in seconds.
    #[must_use]
    pub const fn wall_clock_seconds(&self) -> f64 {
        self.wall_clock_seconds
    }

    /// Wall-clock budget as a [`Duration`].
    #[must_use]
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs_f64(self.wall_clock_seconds)
    }

    /// CPU budget converted to sandbox fuel units.
    #[must_use]
    pub fn fuel(&self, fuel_per_cpu_second: u64) -> u64 {
        let fuel = self.cpu_seconds * fuel_per_cpu_second as f64;
        if fuel >= u64::MAX as f64 {
            u64::MAX
        } else {
            fuel.max(1.0) as u64
        }
    }
}

/// Resources consumed by a completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Sandbox fuel consumed (zero on the trusted native path)
    pub fuel_consumed: u64,
    /// Wall-clock time in microseconds
    pub elapsed_us: u64,
    /// Peak host-side memory charged to the execution
    pub peak_memory_bytes: u64,
}

/// Result of one successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Values keyed by bar index
    pub output: Signals,
    /// Resources consumed
    pub usage: ResourceUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_id_display() {
        let id = StrategyId::new("alpha");
        assert_eq!(id.to_string(), "alpha");
        assert_eq!(StrategyId::from("alpha"), id);
    }

    #[test]
    fn test_source_type_parse_and_dynamic() {
        assert_eq!("AI".parse::<SourceType>().unwrap(), SourceType::Ai);
        assert!(SourceType::Custom.is_dynamic());
        assert!(!SourceType::Builtin.is_dynamic());
        assert!("vendor".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_record_hash_ignores_id() {
        let a = StrategySourceRecord::new(StrategyId::new("a"), "x = 1", "S", SourceType::Ai);
        let b = StrategySourceRecord::new(StrategyId::new("b"), "x = 1", "S", SourceType::Custom);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_strategy_op_names() {
        assert_eq!(StrategyOp::GenerateSignals.method_name(), "generate_signals");
        assert_eq!(
            "calculate_scores".parse::<StrategyOp>().unwrap(),
            StrategyOp::CalculateScores
        );
        assert!(StrategyOp::from_method_name("run").is_none());
    }

    #[test]
    fn test_field_codes_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_code(field.code()), Some(field));
            assert_eq!(Field::from_name(field.name()), Some(field));
        }
        assert_eq!(Field::from_code(9), None);
    }

    #[test]
    fn test_market_data_rejects_ragged_columns() {
        let result = MarketData::new(
            vec![1.0],
            vec![1.0],
            vec![1.0],
            vec![1.0, 2.0],
            vec![0.0],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_budget_validation() {
        assert!(ResourceBudget::new(1.0, 1, 1.0).is_ok());
        assert!(ResourceBudget::new(f64::NAN, 1, 1.0).is_err());
        assert!(ResourceBudget::new(1.0, 0, 1.0).is_err());
        assert!(ResourceBudget::new(1.0, 1, -2.0).is_err());
    }

    #[test]
    fn test_budget_fuel_conversion() {
        let budget = ResourceBudget::new(0.5, 1, 1.0).unwrap();
        assert_eq!(budget.fuel(1_000_000), 500_000);
        let huge = ResourceBudget::new(1e30, 1, 1.0).unwrap();
        assert_eq!(huge.fuel(1_000_000), u64::MAX);
    }

    #[test]
    fn test_limits_mint_independent_budgets() {
        let limits = ExecutionLimits::default();
        let first = limits.budget().unwrap();
        let second = limits.budget().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_limit_kind_outcomes() {
        assert_eq!(LimitKind::WallClock.outcome(), "timeout");
        assert_eq!(LimitKind::Cpu.outcome(), "cpu_limit");
        assert_eq!(LimitKind::Memory.to_string(), "memory");
    }
}
