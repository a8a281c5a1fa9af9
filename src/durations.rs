//! The opaque timing sink the engine reports producer durations to.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Receives one measurement per producer invocation.
///
/// The engine only ever calls [`record`][DurationSink::record]; aggregation
/// and reporting belong to the collaborator behind the sink.
pub trait DurationSink: Send + Sync {
    fn record(&self, key: &str, duration: Duration);
}

/// The default sink: a thread-safe ledger of per-key invocation counts and
/// cumulative durations.
#[derive(Default)]
pub struct DurationLedger {
    measurements: Mutex<BTreeMap<String, KeyDurations>>,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct KeyDurations {
    pub count: u64,
    pub total: Duration,
}

impl DurationLedger {
    pub fn new() -> DurationLedger {
        DurationLedger::default()
    }

    /// Number of recorded invocations for one key.
    pub fn count(&self, key: &str) -> u64 {
        self.measurements
            .lock()
            .get(key)
            .map(|d| d.count)
            .unwrap_or(0)
    }

    /// Cumulative recorded duration for one key.
    pub fn total(&self, key: &str) -> Duration {
        self.measurements
            .lock()
            .get(key)
            .map(|d| d.total)
            .unwrap_or_default()
    }

    /// Snapshot of every key's measurements.
    pub fn totals(&self) -> BTreeMap<String, KeyDurations> {
        self.measurements.lock().clone()
    }
}

impl DurationSink for DurationLedger {
    fn record(&self, key: &str, duration: Duration) {
        let mut measurements = self.measurements.lock();
        let entry = measurements.entry(key.to_owned()).or_default();
        entry.count += 1;
        entry.total += duration;
    }
}
