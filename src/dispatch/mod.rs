//! Rate-paced dispatch of submission work
//!
//! A pacing loop issues one [`DispatchToken`] per tick. Tokens go to an idle
//! worker when one can be claimed; otherwise the pool grows by one worker
//! seeded with the token, up to an optional limit past which tokens are
//! rejected.

mod engine;
mod worker;

pub use engine::DispatchEngine;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// One "send now" unit issued by the pacing loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchToken {
    pub seq: u64,
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub actions_per_second: u32,
    /// Workers started before the first tick
    pub workers: usize,
    /// Pool limit; `None` lets the pool grow without bound
    pub max_workers: Option<usize>,
    /// How long tokens are issued for
    pub duration: Duration,
    /// How long to wait for in-flight submissions at shutdown
    pub drain_grace: Duration,
}

impl DispatchConfig {
    /// Time between two consecutive tokens
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.actions_per_second.max(1)))
    }
}

/// Live counters shared with the status API
#[derive(Debug, Default)]
pub struct EngineStats {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    workers: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub rejected: u64,
    pub workers: usize,
    pub in_flight: usize,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            workers: self.workers.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_dispatched();
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_rejected();
    }

    fn worker_started(&self) -> usize {
        let count = self.workers.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::record_workers(count);
        count
    }

    fn worker_stopped(&self) {
        let count = self.workers.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::record_workers(count);
    }

    fn unit_started(&self) {
        let count = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::record_in_flight(count);
    }

    fn unit_finished(&self) {
        let count = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::record_in_flight(count);
    }
}
