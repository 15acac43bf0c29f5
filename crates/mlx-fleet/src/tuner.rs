//! Runtime degradation and throughput tuning.
//!
//! Periodically samples fleet throughput for the metrics windows, shrinks
//! per-instance worker batch sizes under system memory pressure, and nudges
//! batch sizes toward the throughput sweet spot. Purely a degradation
//! mechanism — request correctness never depends on it.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::store::InstanceStore;

/// Tick cadence.
const TUNE_INTERVAL: Duration = Duration::from_secs(15);
/// System memory percentage above which batch sizes are shrunk.
const MEMORY_PRESSURE_PERCENT: u64 = 80;
/// Throughput below this grows the batch size.
const LOW_TPS: f64 = 1000.0;
/// Throughput above this shrinks the batch size.
const HIGH_TPS: f64 = 2000.0;
/// Minimum requests before an instance's throughput is trusted.
const MIN_REQUESTS: u64 = 10;
/// Batch-size bounds for throughput tuning.
const BATCH_MIN: u32 = 2;
const BATCH_MAX: u32 = 10;
/// Hard floor under memory pressure.
const PRESSURE_FLOOR: u32 = 1;

/// The periodic tuner task.
pub struct PerformanceTuner {
    store: Arc<InstanceStore>,
    dispatcher: Arc<Dispatcher>,
}

impl PerformanceTuner {
    pub fn new(store: Arc<InstanceStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Run the tuner loop until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = TUNE_INTERVAL.as_secs(),
            "performance tuner started"
        );
        let mut system = System::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("performance tuner shutting down");
                    return;
                }
                _ = tokio::time::sleep(TUNE_INTERVAL) => {
                    self.tick(&mut system);
                }
            }
        }
    }

    /// One tick: sample throughput, react to memory pressure, tune batches.
    pub fn tick(&self, system: &mut System) {
        self.dispatcher.sample_global_throughput();

        system.refresh_memory();
        let total = system.total_memory();
        if total > 0 {
            let used_percent = system.used_memory() * 100 / total;
            if used_percent > MEMORY_PRESSURE_PERCENT {
                warn!(used_percent, "high system memory usage, shrinking batch sizes");
                for inst in self.store.iter() {
                    inst.adjust_batch_size(-1, PRESSURE_FLOOR, BATCH_MAX);
                }
                return;
            }
        }

        self.tune_batches();
    }

    /// Nudge each busy instance's batch size toward the throughput target.
    fn tune_batches(&self) {
        for inst in self.store.iter() {
            if inst.totals().requests() <= MIN_REQUESTS {
                continue;
            }
            let tps = inst.current_tps();
            if tps < LOW_TPS {
                inst.adjust_batch_size(1, BATCH_MIN, BATCH_MAX);
            } else if tps > HIGH_TPS {
                inst.adjust_batch_size(-1, BATCH_MIN, BATCH_MAX);
            }
        }
    }
}
