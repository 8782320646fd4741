//! Host functions and per-execution host state.
//!
//! Guest values are all `f64`. Market data and signal maps live on the host
//! and are passed to the guest as numeric handles: `0` is `None`, `1` is the
//! market data of the current call, and signal maps start at `2`. Every
//! host allocation is charged to the execution's [`MemoryAccount`].

use crate::limiter::MemoryAccount;
use crate::permissions::ExecutionNamespace;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratguard_core::{Error, Field, MarketData, Result, Signals};
use wasmtime::{Caller, Linker};

/// Import module for the core runtime functions.
pub const RT_MODULE: &str = "rt";

/// Import module for host-implemented `math` members.
pub const MATH_MODULE: &str = "math";

/// Handle of the market data passed to an entry operation.
pub const DATA_HANDLE: f64 = 1.0;

const FIRST_MAP_HANDLE: usize = 2;
const MAP_OVERHEAD_BYTES: usize = 64;
const MAP_ENTRY_BYTES: usize = 48;

/// Guest-raised failure codes.
pub mod fail_code {
    /// Division or modulo by zero
    pub const ZERO_DIVISION: f64 = 1.0;
    /// `assert` evaluated false
    pub const ASSERTION: f64 = 2.0;
    /// Explicit `raise`
    pub const RAISED: f64 = 3.0;
}

/// Faults raised by host functions. Each one aborts the guest call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostFault {
    /// An allocation would pass the memory budget
    #[error("memory budget exceeded: {requested} bytes requested, limit {limit}")]
    MemoryExceeded {
        /// Total bytes the allocation would reach
        requested: usize,
        /// Byte limit
        limit: usize,
    },
    /// Series index outside the data
    #[error("index {index} out of range for {len} bars")]
    IndexOutOfRange {
        /// Requested index
        index: f64,
        /// Number of bars
        len: usize,
    },
    /// Map lookup of a missing key
    #[error("key {key} not found in signal map")]
    KeyMissing {
        /// Missing key
        key: f64,
    },
    /// Map keys must be finite integers
    #[error("signal map keys must be integers, got {key}")]
    InvalidKey {
        /// Offending key
        key: f64,
    },
    /// A value used as a handle does not name a live object
    #[error("value {handle} is not a market data or signal map reference")]
    InvalidHandle {
        /// Offending value
        handle: f64,
    },
    /// Operation needs a signal map
    #[error("operation requires a signal map")]
    NotAMap,
    /// Operation needs market data
    #[error("operation requires market data")]
    NotData,
    /// Unknown data field code
    #[error("unknown data field code {code}")]
    UnknownField {
        /// Offending code
        code: f64,
    },
    /// Guest-raised error
    #[error("{}", describe_failure(*.code))]
    Raised {
        /// One of [`fail_code`]
        code: f64,
    },
}

fn describe_failure(code: f64) -> &'static str {
    if code == fail_code::ZERO_DIVISION {
        "division by zero"
    } else if code == fail_code::ASSERTION {
        "assertion failed"
    } else {
        "strategy raised an exception"
    }
}

type Fault<T> = std::result::Result<T, HostFault>;

enum Target {
    Data,
    Map(usize),
}

/// State of one execution, owned by its Wasmtime store.
#[derive(Debug)]
pub struct HostState {
    data: Arc<MarketData>,
    maps: Vec<BTreeMap<i64, f64>>,
    memory: MemoryAccount,
    host_calls: u64,
}

impl HostState {
    /// Creates state for one call with a memory budget in bytes.
    #[must_use]
    pub fn new(data: Arc<MarketData>, memory_bytes: u64) -> Self {
        Self {
            data,
            maps: Vec::new(),
            memory: MemoryAccount::new(memory_bytes),
            host_calls: 0,
        }
    }

    /// Memory account, for installing as the store limiter.
    pub const fn memory_mut(&mut self) -> &mut MemoryAccount {
        &mut self.memory
    }

    /// Peak accounted memory in bytes.
    #[must_use]
    pub const fn peak_memory(&self) -> usize {
        self.memory.peak()
    }

    /// Host calls made so far.
    #[must_use]
    pub const fn host_calls(&self) -> u64 {
        self.host_calls
    }

    fn target(&self, handle: f64) -> Fault<Target> {
        if !handle.is_finite() || handle.fract() != 0.0 || handle < DATA_HANDLE {
            return Err(HostFault::InvalidHandle { handle });
        }
        let raw = handle as usize;
        if raw == 1 {
            return Ok(Target::Data);
        }
        let index = raw - FIRST_MAP_HANDLE;
        if index < self.maps.len() {
            Ok(Target::Map(index))
        } else {
            Err(HostFault::InvalidHandle { handle })
        }
    }

    fn map_index(&self, handle: f64) -> Fault<usize> {
        match self.target(handle)? {
            Target::Map(index) => Ok(index),
            Target::Data => Err(HostFault::NotAMap),
        }
    }

    fn bar(&self, series: &[f64], index: f64) -> Fault<f64> {
        let len = series.len();
        if !index.is_finite() || index.fract() != 0.0 {
            return Err(HostFault::IndexOutOfRange { index, len });
        }
        let resolved = if index < 0.0 { len as f64 + index } else { index };
        if resolved < 0.0 || resolved >= len as f64 {
            return Err(HostFault::IndexOutOfRange { index, len });
        }
        Ok(series[resolved as usize])
    }

    /// Allocates an empty signal map and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`HostFault::MemoryExceeded`] past the budget.
    pub fn new_map(&mut self) -> Fault<f64> {
        self.host_calls += 1;
        self.memory.charge(MAP_OVERHEAD_BYTES)?;
        self.maps.push(BTreeMap::new());
        Ok((self.maps.len() - 1 + FIRST_MAP_HANDLE) as f64)
    }

    /// `target[key]`: close price for market data, value for a map.
    ///
    /// # Errors
    ///
    /// Faults on bad handles, out-of-range indexes and missing keys.
    pub fn get_item(&mut self, handle: f64, key: f64) -> Fault<f64> {
        self.host_calls += 1;
        match self.target(handle)? {
            Target::Data => self.bar(self.data.series(Field::Close), key),
            Target::Map(index) => {
                let key = map_key(key)?;
                self.maps[index]
                    .get(&key)
                    .copied()
                    .ok_or(HostFault::KeyMissing { key: key as f64 })
            }
        }
    }

    /// `map[key] = value`.
    ///
    /// # Errors
    ///
    /// Faults on non-map handles, non-integer keys and memory exhaustion.
    pub fn set_item(&mut self, handle: f64, key: f64, value: f64) -> Fault<()> {
        self.host_calls += 1;
        let index = self.map_index(handle)?;
        let key = map_key(key)?;
        if !self.maps[index].contains_key(&key) {
            self.memory.charge(MAP_ENTRY_BYTES)?;
        }
        self.maps[index].insert(key, value);
        Ok(())
    }

    /// `map.get(key, default)`.
    ///
    /// # Errors
    ///
    /// Faults on non-map handles and non-integer keys.
    pub fn get_or(&mut self, handle: f64, key: f64, default: f64) -> Fault<f64> {
        self.host_calls += 1;
        let index = self.map_index(handle)?;
        let key = map_key(key)?;
        Ok(self.maps[index].get(&key).copied().unwrap_or(default))
    }

    /// `key in target`: valid bar index for data, present key for a map.
    ///
    /// # Errors
    ///
    /// Faults on bad handles.
    pub fn contains(&mut self, handle: f64, key: f64) -> Fault<f64> {
        self.host_calls += 1;
        let found = match self.target(handle)? {
            Target::Data => {
                key.fract() == 0.0 && key >= 0.0 && key < self.data.len() as f64
            }
            Target::Map(index) => {
                map_key(key).is_ok_and(|k| self.maps[index].contains_key(&k))
            }
        };
        Ok(if found { 1.0 } else { 0.0 })
    }

    /// `len(target)`.
    ///
    /// # Errors
    ///
    /// Faults on bad handles.
    pub fn length(&mut self, handle: f64) -> Fault<f64> {
        self.host_calls += 1;
        Ok(match self.target(handle)? {
            Target::Data => self.data.len() as f64,
            Target::Map(index) => self.maps[index].len() as f64,
        })
    }

    /// `data.<field>[index]`.
    ///
    /// # Errors
    ///
    /// Faults unless `handle` is market data, `code` a field code and
    /// `index` in range.
    pub fn field(&mut self, handle: f64, code: f64, index: f64) -> Fault<f64> {
        self.host_calls += 1;
        if !matches!(self.target(handle)?, Target::Data) {
            return Err(HostFault::NotData);
        }
        let field = (code.fract() == 0.0 && (0.0..=255.0).contains(&code))
            .then(|| Field::from_code(code as u8))
            .flatten()
            .ok_or(HostFault::UnknownField { code })?;
        self.bar(self.data.series(field), index)
    }

    /// Moves the map behind `handle` out as the operation's result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionFailed`] unless `handle` is a signal map.
    pub fn take_signals(&mut self, handle: f64) -> Result<Signals> {
        let index = self.map_index(handle).map_err(|_| Error::ExecutionFailed {
            message: format!("operation must return a signal map, got {handle}"),
        })?;
        let map = std::mem::take(&mut self.maps[index]);
        self.memory
            .release(MAP_OVERHEAD_BYTES + map.len() * MAP_ENTRY_BYTES);
        Ok(map)
    }
}

fn map_key(key: f64) -> Fault<i64> {
    if key.is_finite() && key.fract() == 0.0 && key.abs() < 9.0e15 {
        Ok(key as i64)
    } else {
        Err(HostFault::InvalidKey { key })
    }
}

fn fault(err: HostFault) -> wasmtime::Error {
    wasmtime::Error::new(err)
}

/// Defines the host imports on `linker`.
///
/// Core runtime functions are always defined. `math` members that need
/// the host are defined only when `namespace` allows them, so a module
/// importing anything else fails to instantiate.
///
/// # Errors
///
/// Returns [`Error::RuntimeError`] if a definition fails.
pub fn link(linker: &mut Linker<HostState>, namespace: &ExecutionNamespace) -> Result<()> {
    link_core(linker).map_err(link_error)?;
    for member in namespace.host_math_imports() {
        link_math(linker, member).map_err(link_error)?;
    }
    Ok(())
}

fn link_error(err: wasmtime::Error) -> Error {
    Error::RuntimeError {
        message: format!("failed to link host function: {err}"),
    }
}

fn link_core(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(RT_MODULE, "new_map", |mut caller: Caller<'_, HostState>| {
        caller.data_mut().new_map().map_err(fault)
    })?;
    linker.func_wrap(
        RT_MODULE,
        "get_item",
        |mut caller: Caller<'_, HostState>, handle: f64, key: f64| {
            caller.data_mut().get_item(handle, key).map_err(fault)
        },
    )?;
    linker.func_wrap(
        RT_MODULE,
        "set_item",
        |mut caller: Caller<'_, HostState>, handle: f64, key: f64, value: f64| {
            caller.data_mut().set_item(handle, key, value).map_err(fault)
        },
    )?;
    linker.func_wrap(
        RT_MODULE,
        "get_or",
        |mut caller: Caller<'_, HostState>, handle: f64, key: f64, default: f64| {
            caller.data_mut().get_or(handle, key, default).map_err(fault)
        },
    )?;
    linker.func_wrap(
        RT_MODULE,
        "contains",
        |mut caller: Caller<'_, HostState>, handle: f64, key: f64| {
            caller.data_mut().contains(handle, key).map_err(fault)
        },
    )?;
    linker.func_wrap(
        RT_MODULE,
        "length",
        |mut caller: Caller<'_, HostState>, handle: f64| {
            caller.data_mut().length(handle).map_err(fault)
        },
    )?;
    linker.func_wrap(
        RT_MODULE,
        "field",
        |mut caller: Caller<'_, HostState>, handle: f64, code: f64, index: f64| {
            caller.data_mut().field(handle, code, index).map_err(fault)
        },
    )?;
    linker.func_wrap(RT_MODULE, "fail", |code: f64| -> wasmtime::Result<()> {
        Err(fault(HostFault::Raised { code }))
    })?;
    linker.func_wrap(RT_MODULE, "pow", |base: f64, exp: f64| base.powf(exp))?;
    Ok(())
}

fn link_math(linker: &mut Linker<HostState>, member: &str) -> wasmtime::Result<()> {
    match member {
        "log" => linker.func_wrap(MATH_MODULE, "log", f64::ln)?,
        "log10" => linker.func_wrap(MATH_MODULE, "log10", f64::log10)?,
        "exp" => linker.func_wrap(MATH_MODULE, "exp", f64::exp)?,
        "tanh" => linker.func_wrap(MATH_MODULE, "tanh", f64::tanh)?,
        "pow" => linker.func_wrap(MATH_MODULE, "pow", f64::powf)?,
        _ => return Ok(()),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HostState {
        let data = MarketData::new(
            vec![1.0, 2.0, 3.0],
            vec![1.5, 2.5, 3.5],
            vec![0.5, 1.5, 2.5],
            vec![1.2, 2.2, 3.2],
            vec![100.0, 200.0, 300.0],
        )
        .unwrap();
        HostState::new(Arc::new(data), 1024 * 1024)
    }

    #[test]
    fn test_data_indexing() {
        let mut host = state();
        assert!((host.get_item(DATA_HANDLE, 0.0).unwrap() - 1.2).abs() < f64::EPSILON);
        assert!((host.get_item(DATA_HANDLE, -1.0).unwrap() - 3.2).abs() < f64::EPSILON);
        assert!(matches!(
            host.get_item(DATA_HANDLE, 3.0),
            Err(HostFault::IndexOutOfRange { .. })
        ));
        let high = f64::from(Field::High.code());
        assert!((host.field(DATA_HANDLE, high, 1.0).unwrap() - 2.5).abs() < f64::EPSILON);
        assert!(matches!(
            host.field(DATA_HANDLE, 9.0, 0.0),
            Err(HostFault::UnknownField { .. })
        ));
        assert!((host.length(DATA_HANDLE).unwrap() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_map_round_trip_into_signals() {
        let mut host = state();
        let map = host.new_map().unwrap();
        assert!((map - 2.0).abs() < f64::EPSILON);
        host.set_item(map, 1.0, 0.5).unwrap();
        host.set_item(map, 2.0, -1.0).unwrap();
        assert!((host.get_or(map, 7.0, 9.0).unwrap() - 9.0).abs() < f64::EPSILON);
        assert!((host.contains(map, 1.0).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!(matches!(host.get_item(map, 7.0), Err(HostFault::KeyMissing { .. })));

        let signals = host.take_signals(map).unwrap();
        assert_eq!(signals.len(), 2);
        assert!((signals[&2] + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_map_rejects_fractional_keys() {
        let mut host = state();
        let map = host.new_map().unwrap();
        assert!(matches!(
            host.set_item(map, 1.5, 0.0),
            Err(HostFault::InvalidKey { .. })
        ));
        assert!(matches!(
            host.set_item(DATA_HANDLE, 1.0, 0.0),
            Err(HostFault::NotAMap)
        ));
    }

    #[test]
    fn test_invalid_handles() {
        let mut host = state();
        assert!(matches!(
            host.length(0.0),
            Err(HostFault::InvalidHandle { .. })
        ));
        assert!(matches!(
            host.length(42.0),
            Err(HostFault::InvalidHandle { .. })
        ));
        assert!(host.take_signals(DATA_HANDLE).is_err());
    }

    #[test]
    fn test_allocation_counts_against_budget() {
        let data = Arc::new(MarketData::from_closes(vec![1.0]));
        let mut host = HostState::new(data, 200);
        let map = host.new_map().unwrap();
        host.set_item(map, 0.0, 1.0).unwrap();
        host.set_item(map, 0.0, 2.0).unwrap();
        host.set_item(map, 1.0, 1.0).unwrap();
        assert!(matches!(
            host.set_item(map, 2.0, 1.0),
            Err(HostFault::MemoryExceeded { .. })
        ));
    }

    #[test]
    fn test_raised_messages() {
        assert_eq!(
            HostFault::Raised {
                code: fail_code::ZERO_DIVISION
            }
            .to_string(),
            "division by zero"
        );
        assert_eq!(
            HostFault::Raised {
                code: fail_code::ASSERTION
            }
            .to_string(),
            "assertion failed"
        );
    }
}
