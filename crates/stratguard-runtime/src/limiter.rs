//! Resource bounds for one execution.
//!
//! Three budgets apply to every call into guest code:
//!
//! - CPU: Wasmtime fuel, set on the store before the call
//! - memory: [`MemoryAccount`], one byte budget shared by linear memory
//!   growth and host-side allocations made on the guest's behalf
//! - wall clock: [`run_bounded`], which also services cancellation
//!
//! Breaches surface as traps and are mapped into the error taxonomy by
//! [`classify`].

use crate::host::HostFault;
use std::future::Future;
use std::time::{Duration, Instant};
use stratguard_core::{Error, LimitKind, Result};
use tokio_util::sync::CancellationToken;

/// Maximum table elements a module may grow to.
pub const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Byte budget covering linear memory and host allocations.
#[derive(Debug)]
pub struct MemoryAccount {
    limit: usize,
    linear: usize,
    host: usize,
    peak: usize,
}

impl MemoryAccount {
    /// Creates an account with a byte limit.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            linear: 0,
            host: 0,
            peak: 0,
        }
    }

    /// Byte limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently accounted.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.linear.saturating_add(self.host)
    }

    /// Highest accounted total so far.
    #[must_use]
    pub const fn peak(&self) -> usize {
        self.peak
    }

    /// Charges a host allocation.
    ///
    /// # Errors
    ///
    /// Returns [`HostFault::MemoryExceeded`] if the charge would pass the
    /// limit. Nothing is charged in that case.
    pub fn charge(&mut self, bytes: usize) -> std::result::Result<(), HostFault> {
        let next = self.in_use().saturating_add(bytes);
        if next > self.limit {
            return Err(HostFault::MemoryExceeded {
                requested: next,
                limit: self.limit,
            });
        }
        self.host += bytes;
        self.peak = self.peak.max(next);
        Ok(())
    }

    /// Returns bytes to the account.
    pub const fn release(&mut self, bytes: usize) {
        self.host = self.host.saturating_sub(bytes);
    }
}

impl wasmtime::ResourceLimiter for MemoryAccount {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let next = self.host.saturating_add(desired);
        if next > self.limit {
            tracing::warn!(current, desired, limit = self.limit, "linear memory limit exceeded");
            return Err(wasmtime::Error::new(HostFault::MemoryExceeded {
                requested: next,
                limit: self.limit,
            }));
        }
        tracing::trace!(current, desired, "linear memory growing");
        self.linear = desired;
        self.peak = self.peak.max(next);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// Runs `call` until it finishes, the wall clock expires, or `cancel` fires.
///
/// The future is dropped on every exit path, so nothing it owns outlives
/// the call. Guest code must yield periodically for the timer and token to
/// be observed; the sandbox arranges that with epoch interruption.
///
/// # Errors
///
/// Returns whatever `call` returns, [`Error::ResourceLimitExceeded`] with
/// [`LimitKind::WallClock`] on timeout, or [`Error::Cancelled`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stratguard_runtime::limiter::run_bounded;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cancel = CancellationToken::new();
/// let slow = async {
///     tokio::time::sleep(Duration::from_secs(10)).await;
///     Ok(())
/// };
/// let err = run_bounded(slow, Duration::from_millis(10), &cancel).await.unwrap_err();
/// assert!(err.is_resource_limit());
/// # }
/// ```
pub async fn run_bounded<F, T>(call: F, wall_clock: Duration, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!(elapsed_ms = started.elapsed().as_millis(), "execution cancelled");
            Err(Error::Cancelled {
                operation: "strategy execution".to_string(),
            })
        }
        outcome = tokio::time::timeout(wall_clock, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::ResourceLimitExceeded {
                limit: LimitKind::WallClock,
                message: format!(
                    "exceeded wall-clock budget of {:.3}s",
                    wall_clock.as_secs_f64()
                ),
            }),
        },
    }
}

/// Budget figures used to phrase limit errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitContext {
    /// CPU seconds granted
    pub cpu_seconds: f64,
    /// Fuel granted
    pub fuel: u64,
    /// Memory bytes granted
    pub memory_bytes: u64,
}

/// Maps a Wasmtime error or trap into the error taxonomy.
#[must_use]
pub fn classify(err: &wasmtime::Error, context: &LimitContext) -> Error {
    if let Some(fault) = err.downcast_ref::<HostFault>() {
        return match fault {
            HostFault::MemoryExceeded { requested, .. } => Error::ResourceLimitExceeded {
                limit: LimitKind::Memory,
                message: format!(
                    "exceeded memory budget of {} bytes (requested {requested})",
                    context.memory_bytes
                ),
            },
            other => Error::ExecutionFailed {
                message: other.to_string(),
            },
        };
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return match trap {
            wasmtime::Trap::OutOfFuel => Error::ResourceLimitExceeded {
                limit: LimitKind::Cpu,
                message: format!(
                    "exceeded CPU budget of {:.3}s ({} fuel)",
                    context.cpu_seconds, context.fuel
                ),
            },
            other => Error::ExecutionFailed {
                message: format!("guest trapped: {other}"),
            },
        };
    }
    Error::ExecutionFailed {
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::ResourceLimiter;

    #[test]
    fn test_host_charges_respect_limit() {
        let mut account = MemoryAccount::new(1000);
        account.charge(600).unwrap();
        assert!(matches!(
            account.charge(500),
            Err(HostFault::MemoryExceeded { .. })
        ));
        assert_eq!(account.in_use(), 600);
        account.release(200);
        account.charge(500).unwrap();
        assert_eq!(account.peak(), 900);
    }

    #[test]
    fn test_linear_and_host_share_budget() {
        let mut account = MemoryAccount::new(100_000);
        account.charge(50_000).unwrap();
        assert!(account.memory_growing(0, 65_536, None).is_err());
        account.release(50_000);
        assert!(account.memory_growing(0, 65_536, None).unwrap());
        assert!(account.charge(40_000).is_err());
    }

    #[test]
    fn test_classify_memory_fault() {
        let context = LimitContext {
            cpu_seconds: 1.0,
            fuel: 100,
            memory_bytes: 1024,
        };
        let err = wasmtime::Error::new(HostFault::MemoryExceeded {
            requested: 2048,
            limit: 1024,
        });
        let mapped = classify(&err, &context);
        assert_eq!(mapped.limit_kind(), Some(LimitKind::Memory));
    }

    #[test]
    fn test_classify_out_of_fuel() {
        let context = LimitContext {
            cpu_seconds: 0.5,
            fuel: 100,
            memory_bytes: 1024,
        };
        let err = wasmtime::Error::new(wasmtime::Trap::OutOfFuel);
        assert_eq!(classify(&err, &context).limit_kind(), Some(LimitKind::Cpu));
    }

    #[test]
    fn test_classify_guest_fault() {
        let context = LimitContext {
            cpu_seconds: 1.0,
            fuel: 1,
            memory_bytes: 1,
        };
        let err = wasmtime::Error::new(HostFault::KeyMissing { key: 3.0 });
        let mapped = classify(&err, &context);
        assert!(matches!(mapped, Error::ExecutionFailed { .. }));
        assert!(mapped.to_string().contains('3'));
    }

    #[tokio::test]
    async fn test_run_bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = run_bounded(async { Ok(7) }, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_bounded_cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_bounded(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
