use crate::probe::ProbeOutcome;
use crate::telemetry::{runtime_counters, RuntimeCounters, RuntimeCountersSnapshot};
use std::sync::OnceLock;

/// Facade over the process-wide counters. Monitors and the orchestrator go
/// through [`metrics()`] so call sites stay one identifier long.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

static COLLECTOR: OnceLock<MetricsCollector> = OnceLock::new();

pub fn metrics() -> &'static MetricsCollector {
    COLLECTOR.get_or_init(|| MetricsCollector {
        counters: runtime_counters(),
    })
}

impl MetricsCollector {
    pub fn record_probe_outcome(&self, service: &str, outcome: ProbeOutcome) {
        self.counters.record_probe_outcome(service, outcome);
    }

    pub fn record_activation(&self, service: &str) {
        self.counters.record_activation(service);
    }

    pub fn record_forced_failure(&self, service: &str, reason: &str) {
        self.counters.record_forced_failure(service, reason);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }
}
