// Scheduler module - drives periodic collection cycles
//
// Each tick gathers the registry once, which runs one collection cycle of
// every registered collector, and stores the resulting snapshot.
//
// # Architecture
// - Uses Tokio's interval timer for periodic execution
// - Gathering runs on the blocking pool since collectors do blocking HTTP
// - Ticks are awaited in sequence, so cycles never overlap
// - A failed cycle is logged and the loop carries on

use prometheus::Registry;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::storage::{MetricStorage, Snapshot};

/// Periodic collector of a prometheus registry
pub struct MetricScheduler {
    /// Registry holding every collector to run each cycle
    registry: Registry,

    /// Where gathered snapshots are written
    storage: MetricStorage,

    /// Seconds between two cycles
    interval_secs: u64,
}

impl MetricScheduler {
    /// Creates a new MetricScheduler instance
    ///
    /// # Arguments
    /// * `registry` - Registry with collectors already registered
    /// * `storage` - Destination for snapshots
    /// * `interval_secs` - How often to run a collection cycle
    pub fn new(registry: Registry, storage: MetricStorage, interval_secs: u64) -> Self {
        MetricScheduler {
            registry,
            storage,
            interval_secs,
        }
    }

    /// Runs collection cycles forever at the configured interval
    ///
    /// The first cycle starts immediately. If a cycle takes longer than the
    /// interval, the missed ticks are skipped rather than bunched up.
    pub async fn start(self) {
        info!(
            "Starting collection loop (every {}s) writing to '{}'",
            self.interval_secs,
            self.storage.target()
        );

        let mut interval_timer = interval(Duration::from_secs(self.interval_secs));
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval_timer.tick().await;
            self.collect_once().await;
        }
    }

    /// Runs a single collection cycle and stores its snapshot
    ///
    /// # Returns
    /// Number of samples written, 0 if gathering or storing failed
    pub async fn collect_once(&self) -> usize {
        let registry = self.registry.clone();

        let families = match tokio::task::spawn_blocking(move || registry.gather()).await {
            Ok(families) => families,
            Err(e) => {
                error!("Collection cycle panicked: {}", e);
                return 0;
            }
        };

        let snapshot = Snapshot::new(families);
        let sample_count = snapshot.sample_count();
        debug!(
            "Gathered {} sample(s) in {} metric family(ies)",
            sample_count,
            snapshot.families.len()
        );

        if self.storage.store_snapshot_safe(&snapshot).await {
            sample_count
        } else {
            0
        }
    }
}
