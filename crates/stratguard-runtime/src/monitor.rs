//! Per-execution resource accounting.
//!
//! A [`ResourceMonitor`] is started when an execution begins and turned
//! into a [`ResourceUsage`] report once the guest returns or is aborted.
//!
//! # Examples
//!
//! ```
//! use stratguard_runtime::monitor::ResourceMonitor;
//!
//! let monitor = ResourceMonitor::start(1_000);
//! monitor.record_fuel_remaining(400);
//! monitor.record_peak_memory(4096);
//!
//! let usage = monitor.usage();
//! assert_eq!(usage.fuel_consumed, 600);
//! assert_eq!(usage.peak_memory_bytes, 4096);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use stratguard_core::ResourceUsage;

/// Resource monitor for one guest execution.
///
/// Counters are atomics so a monitor can be read from a watchdog while the
/// execution task updates it.
#[derive(Debug)]
pub struct ResourceMonitor {
    start_time: Instant,
    fuel_granted: u64,
    fuel_remaining: AtomicU64,
    peak_memory: AtomicU64,
    host_calls: AtomicU64,
}

impl ResourceMonitor {
    /// Starts timing an execution granted `fuel_granted` fuel.
    #[must_use]
    pub fn start(fuel_granted: u64) -> Self {
        Self {
            start_time: Instant::now(),
            fuel_granted,
            fuel_remaining: AtomicU64::new(fuel_granted),
            peak_memory: AtomicU64::new(0),
            host_calls: AtomicU64::new(0),
        }
    }

    /// Records fuel left in the store.
    pub fn record_fuel_remaining(&self, fuel: u64) {
        self.fuel_remaining.store(fuel, Ordering::Relaxed);
    }

    /// Records the peak accounted memory.
    pub fn record_peak_memory(&self, bytes: usize) {
        self.peak_memory
            .fetch_max(bytes as u64, Ordering::Relaxed);
    }

    /// Records host calls made by the guest.
    pub fn record_host_calls(&self, calls: u64) {
        self.host_calls.store(calls, Ordering::Relaxed);
    }

    /// Fuel consumed so far.
    #[must_use]
    pub fn fuel_consumed(&self) -> u64 {
        self.fuel_granted
            .saturating_sub(self.fuel_remaining.load(Ordering::Relaxed))
    }

    /// Host calls recorded.
    #[must_use]
    pub fn host_call_count(&self) -> u64 {
        self.host_calls.load(Ordering::Relaxed)
    }

    /// Time since the execution started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Usage report.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            fuel_consumed: self.fuel_consumed(),
            elapsed_us: u64::try_from(self.elapsed().as_micros()).unwrap_or(u64::MAX),
            peak_memory_bytes: self.peak_memory.load(Ordering::Relaxed),
        }
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "fuel: {}/{}, peak memory: {}KB, elapsed: {}ms, host calls: {}",
            self.fuel_consumed(),
            self.fuel_granted,
            self.peak_memory.load(Ordering::Relaxed) / 1024,
            self.elapsed().as_millis(),
            self.host_call_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_monitor_starts_empty() {
        let monitor = ResourceMonitor::start(500);
        assert_eq!(monitor.fuel_consumed(), 0);
        assert_eq!(monitor.host_call_count(), 0);
        assert_eq!(monitor.usage().peak_memory_bytes, 0);
    }

    #[test]
    fn test_fuel_consumption_saturates() {
        let monitor = ResourceMonitor::start(100);
        monitor.record_fuel_remaining(30);
        assert_eq!(monitor.fuel_consumed(), 70);
        monitor.record_fuel_remaining(500);
        assert_eq!(monitor.fuel_consumed(), 0);
    }

    #[test]
    fn test_peak_memory_keeps_maximum() {
        let monitor = ResourceMonitor::start(1);
        monitor.record_peak_memory(2048);
        monitor.record_peak_memory(1024);
        assert_eq!(monitor.usage().peak_memory_bytes, 2048);
    }

    #[test]
    fn test_elapsed_time() {
        let monitor = ResourceMonitor::start(1);
        thread::sleep(Duration::from_millis(10));
        assert!(monitor.elapsed() >= Duration::from_millis(10));
        assert!(monitor.usage().elapsed_us >= 10_000);
    }

    #[test]
    fn test_summary() {
        let monitor = ResourceMonitor::start(10);
        monitor.record_fuel_remaining(4);
        monitor.record_peak_memory(5 * 1024);
        monitor.record_host_calls(3);
        let summary = monitor.summary();
        assert!(summary.contains("fuel: 6/10"));
        assert!(summary.contains("peak memory: 5KB"));
        assert!(summary.contains("host calls: 3"));
    }
}
