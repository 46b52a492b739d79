//! Counter capability for the external monitoring sink. Any component may
//! create counters here to report operational events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Counter name reported when a resource group rejects a capacity change.
pub const RESOURCE_GROUP_MODIFICATION_FAILED: &str =
    "poolscaler.resource_group_modification_failed";

pub trait Counter {
    fn count(&self);
}

/// Handle to the monitoring sink. Concrete sinks (statsd, SignalFx, ...)
/// live outside this crate.
pub trait MonitoringClient {
    fn create_counter(
        &self,
        name: &str,
        dimensions: &BTreeMap<String, String>,
    ) -> Box<dyn Counter>;
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopMonitoringClient;

struct NoopCounter;

impl Counter for NoopCounter {
    fn count(&self) {}
}

impl MonitoringClient for NoopMonitoringClient {
    fn create_counter(
        &self,
        _name: &str,
        _dimensions: &BTreeMap<String, String>,
    ) -> Box<dyn Counter> {
        Box::new(NoopCounter)
    }
}

/// Sink that keeps counts in memory, readable by dimension set. Used by
/// tests and as the development default.
#[derive(Clone, Default)]
pub struct InMemoryMonitoringClient {
    counts: Arc<Mutex<BTreeMap<(String, BTreeMap<String, String>), u64>>>,
}

impl InMemoryMonitoringClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, name: &str, dimensions: &BTreeMap<String, String>) -> u64 {
        self.counts
            .lock()
            .expect("monitoring counts poisoned")
            .get(&(name.to_string(), dimensions.clone()))
            .copied()
            .unwrap_or(0)
    }
}

struct InMemoryCounter {
    key: (String, BTreeMap<String, String>),
    counts: Arc<Mutex<BTreeMap<(String, BTreeMap<String, String>), u64>>>,
}

impl Counter for InMemoryCounter {
    fn count(&self) {
        *self
            .counts
            .lock()
            .expect("monitoring counts poisoned")
            .entry(self.key.clone())
            .or_insert(0) += 1;
    }
}

impl MonitoringClient for InMemoryMonitoringClient {
    fn create_counter(
        &self,
        name: &str,
        dimensions: &BTreeMap<String, String>,
    ) -> Box<dyn Counter> {
        Box::new(InMemoryCounter {
            key: (name.to_string(), dimensions.clone()),
            counts: self.counts.clone(),
        })
    }
}
