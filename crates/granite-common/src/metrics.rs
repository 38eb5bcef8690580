//! Metrics collection and reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Thread-safe counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Thread-safe gauge
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Raise the gauge to `value` if it is currently lower.
    #[inline]
    pub fn fetch_max(&self, value: u64) {
        self.value.fetch_max(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Lock subsystem metrics
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Deadlock cycles detected and broken
    pub deadlocks: Counter,
    /// Record lock waits entered
    pub wait_count: Counter,
    /// Cumulative time spent in record lock waits, in microseconds
    pub wait_time_us: Counter,
    /// Longest single record lock wait observed, in microseconds
    pub wait_time_max_us: Gauge,
    /// Record lock waits currently in progress
    pub pending_waits: Gauge,
    /// Lock wait timeouts
    pub timeouts: Counter,

    /// Record lock structures created / removed
    pub reclock_created: Counter,
    pub reclock_removed: Counter,
    /// Record lock structures currently allocated
    pub reclock_count: Gauge,

    /// Table lock structures created / removed
    pub tablelock_created: Counter,
    pub tablelock_removed: Counter,
    /// Table lock structures currently allocated
    pub tablelock_count: Gauge,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a record lock wait started.
    pub fn wait_start(&self) {
        self.pending_waits.inc();
        self.wait_count.inc();
    }

    /// Note that a record lock wait resumed after `elapsed`.
    pub fn wait_resume(&self, elapsed: Duration) {
        self.pending_waits.dec();
        let us = elapsed.as_micros() as u64;
        self.wait_time_us.add(us);
        self.wait_time_max_us.fetch_max(us);
    }
}
