#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use convoy::config::registry::{ProbeSpec, ProbeTarget, ServiceDescriptor};
use convoy::probe::{ProbeOutcome, ProbeResult, Prober};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic prober for tests: each service plays back a scripted
/// outcome sequence, repeating the final entry once the script is spent.
/// Services without a script always succeed.
pub struct ScriptedProber {
    scripts: Mutex<BTreeMap<String, Script>>,
}

struct Script {
    outcomes: Vec<ProbeOutcome>,
    cursor: usize,
    attempts: usize,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn script(self, service: &str, outcomes: &[ProbeOutcome]) -> Self {
        {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.insert(
                service.to_string(),
                Script {
                    outcomes: outcomes.to_vec(),
                    cursor: 0,
                    attempts: 0,
                },
            );
        }
        self
    }

    /// Number of probes executed against `service` so far.
    pub fn attempts(&self, service: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .get(service)
            .map(|script| script.attempts)
            .unwrap_or(0)
    }

    fn next_outcome(&self, service: &str) -> ProbeOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(service.to_string()).or_insert(Script {
            outcomes: Vec::new(),
            cursor: 0,
            attempts: 0,
        });
        script.attempts += 1;

        let outcome = script
            .outcomes
            .get(script.cursor)
            .or_else(|| script.outcomes.last())
            .copied()
            .unwrap_or(ProbeOutcome::Success);
        if script.cursor < script.outcomes.len() {
            script.cursor += 1;
        }
        outcome
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn execute(&self, service: &str, _spec: &ProbeSpec) -> ProbeResult {
        let outcome = self.next_outcome(service);
        let detail = match outcome {
            ProbeOutcome::Success => None,
            ProbeOutcome::Failure => Some(format!("scripted failure for {service}")),
            ProbeOutcome::Timeout => Some(format!("scripted timeout for {service}")),
        };
        ProbeResult {
            service: service.to_string(),
            at: Utc::now(),
            outcome,
            latency: Duration::ZERO,
            detail,
        }
    }
}

pub fn probe_spec() -> ProbeSpec {
    ProbeSpec {
        target: ProbeTarget::Connectivity {
            address: "127.0.0.1:1".to_string(),
        },
        interval: Duration::from_millis(25),
        timeout: Duration::from_millis(10),
        success_threshold: 1,
        retries: 3,
        start_period: Duration::ZERO,
        jitter: None,
    }
}

pub fn service(name: &str, requires: &[&str]) -> ServiceDescriptor {
    service_with_spec(name, requires, probe_spec())
}

pub fn service_with_spec(name: &str, requires: &[&str], probe: ProbeSpec) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        probe,
        requires: requires.iter().map(|dep| dep.to_string()).collect(),
    }
}
