use crate::config::registry::JitterMode;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::metrics::metrics;
use crate::monitor::{
    HealthPhase, Monitor, ServiceHealth, Transition, TransitionEvent, REASON_DEADLINE,
    REASON_DEPENDENCY_FAILED, REASON_GRAPH_CONSTRUCTED, REASON_INTERRUPTED,
};
use crate::probe::Prober;
use crate::reporter::StatusReporter;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_DEPTH: usize = 64;

/// System-wide health, a pure function of the per-service states: `Failed`
/// if any service is `Failed`, `AllHealthy` if every service is `Healthy`
/// (vacuously true for an empty graph), `Degraded` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    AllHealthy,
    Degraded,
    Failed,
}

impl Aggregate {
    pub fn of(services: &BTreeMap<String, ServiceHealth>) -> Self {
        let mut all_healthy = true;
        for health in services.values() {
            match health.phase {
                HealthPhase::Failed => return Aggregate::Failed,
                HealthPhase::Healthy => {}
                _ => all_healthy = false,
            }
        }
        if all_healthy {
            Aggregate::AllHealthy
        } else {
            Aggregate::Degraded
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Aggregate::AllHealthy => "ALL_HEALTHY",
            Aggregate::Degraded => "DEGRADED",
            Aggregate::Failed => "FAILED",
        }
    }
}

/// Consistent point-in-time view of the whole run: the aggregate always
/// matches the per-service states it was computed from.
#[derive(Clone, Debug)]
pub struct SystemSnapshot {
    pub services: BTreeMap<String, ServiceHealth>,
    pub aggregate: Aggregate,
}

/// How the run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    AllHealthy,
    Failed,
    DeadlineExceeded,
    Interrupted,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::AllHealthy => "ALL_HEALTHY",
            Verdict::Failed => "FAILED",
            Verdict::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Verdict::Interrupted => "INTERRUPTED",
        }
    }
}

/// Per-service diagnostic carried in the final report for everything that
/// did not reach `Healthy`.
#[derive(Clone, Debug)]
pub struct FailureSummary {
    pub service: String,
    pub phase: HealthPhase,
    pub consecutive_failures: u32,
    pub last_detail: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub verdict: Verdict,
    pub snapshot: SystemSnapshot,
    pub failures: Vec<FailureSummary>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunSettings {
    pub deadline: Option<Duration>,
    pub jitter: JitterMode,
}

/// Drives one startup run over a validated dependency graph: spawns a
/// monitor per service as its dependencies turn healthy, consumes their
/// transition events, propagates failures downstream and enforces the global
/// deadline. Sole writer of the published snapshot.
pub struct Orchestrator {
    graph: Arc<DependencyGraph>,
    prober: Arc<dyn Prober>,
    settings: RunSettings,
    reporter: StatusReporter,
}

impl Orchestrator {
    pub fn new(graph: Arc<DependencyGraph>, prober: Arc<dyn Prober>, settings: RunSettings) -> Self {
        let reporter = StatusReporter::new(graph.names().map(str::to_string));
        Self {
            graph,
            prober,
            settings,
            reporter,
        }
    }

    /// Handle for observers. Snapshots, the transition log and the push
    /// stream all come from here.
    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    /// Runs the startup sequence to a terminal verdict. `shutdown` is the
    /// caller's interrupt signal; cancelling it ends the run as
    /// `Interrupted`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunReport> {
        if self.graph.is_empty() {
            return Ok(self.report(Verdict::AllHealthy).await);
        }

        let (events_tx, mut events_rx) = mpsc::channel::<TransitionEvent>(EVENT_CHANNEL_DEPTH);
        let run_token = CancellationToken::new();
        let mut shadow: BTreeMap<String, ServiceHealth> = self
            .graph
            .names()
            .map(|name| (name.to_string(), ServiceHealth::pending()))
            .collect();
        let mut healthy: BTreeSet<String> = BTreeSet::new();
        let mut activated: BTreeSet<String> = BTreeSet::new();

        // The whole graph leaves Pending the moment construction succeeds;
        // monitors then own the Waiting -> Probing step for their service.
        for name in self.graph.topological_order() {
            let event = waiting_event(&mut shadow, &name);
            self.reporter.publish(&event).await;
        }

        for name in self.graph.roots() {
            self.activate(name, &events_tx, &run_token, &mut activated);
        }

        let deadline = self.settings.deadline;
        let deadline_expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_expired);

        let verdict = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!(reason = REASON_INTERRUPTED, "run interrupted before completion");
                    self.force_failures(&mut shadow, REASON_INTERRUPTED).await;
                    break Verdict::Interrupted;
                }
                _ = &mut deadline_expired => {
                    tracing::warn!(reason = REASON_DEADLINE, "startup deadline expired");
                    self.force_failures(&mut shadow, REASON_DEADLINE).await;
                    break Verdict::DeadlineExceeded;
                }
                event = events_rx.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => break Verdict::Interrupted,
                    };

                    // A cancelled monitor may deliver a transition that was
                    // already in flight when its service was forced to
                    // Failed; terminal states are final.
                    if shadow
                        .get(&event.service)
                        .is_some_and(|health| health.phase.is_terminal())
                    {
                        continue;
                    }

                    shadow.insert(event.service.clone(), event.health.clone());
                    let aggregate = self.reporter.publish(&event).await;

                    match event.transition.to {
                        HealthPhase::Healthy => {
                            healthy.insert(event.service.clone());
                            for name in self.graph.unblocked_by(&event.service, &healthy) {
                                if !activated.contains(&name) {
                                    self.activate(&name, &events_tx, &run_token, &mut activated);
                                }
                            }
                            if aggregate == Aggregate::AllHealthy {
                                break Verdict::AllHealthy;
                            }
                        }
                        HealthPhase::Unhealthy => {
                            healthy.remove(&event.service);
                        }
                        HealthPhase::Failed => {
                            healthy.remove(&event.service);
                            self.propagate_failure(&event.service, &mut shadow).await;
                            break Verdict::Failed;
                        }
                        _ => {}
                    }
                }
            }
        };

        run_token.cancel();
        Ok(self.report(verdict).await)
    }

    fn activate(
        &self,
        name: &str,
        events_tx: &mpsc::Sender<TransitionEvent>,
        run_token: &CancellationToken,
        activated: &mut BTreeSet<String>,
    ) {
        let Some(descriptor) = self.graph.get(name) else {
            return;
        };
        activated.insert(name.to_string());
        Monitor::spawn(
            descriptor.clone(),
            self.settings.jitter,
            self.prober.clone(),
            events_tx.clone(),
            run_token.child_token(),
        );
    }

    /// Fail-fast: every transitive dependent of `origin` is forced to
    /// `Failed` without consuming a probe. Activated dependents keep their
    /// monitor until the run token is cancelled; terminal states make the
    /// monitor's remaining events no-ops.
    async fn propagate_failure(&self, origin: &str, shadow: &mut BTreeMap<String, ServiceHealth>) {
        for name in self.graph.downstream_of(origin) {
            if let Some(event) = failed_event(shadow, &name, REASON_DEPENDENCY_FAILED) {
                metrics().record_forced_failure(&name, REASON_DEPENDENCY_FAILED);
                self.reporter.publish(&event).await;
            }
        }
    }

    /// Forces every service that is neither `Healthy` nor already terminal
    /// to `Failed` with the given reason. Used at deadline expiry and on
    /// interrupt.
    async fn force_failures(&self, shadow: &mut BTreeMap<String, ServiceHealth>, reason: &str) {
        let names: Vec<String> = shadow
            .iter()
            .filter(|(_, health)| {
                !matches!(health.phase, HealthPhase::Healthy | HealthPhase::Failed)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            if let Some(event) = failed_event(shadow, &name, reason) {
                metrics().record_forced_failure(&name, reason);
                self.reporter.publish(&event).await;
            }
        }
    }

    async fn report(&self, verdict: Verdict) -> RunReport {
        let snapshot = self.reporter.snapshot().await;
        let failures: Vec<FailureSummary> = snapshot
            .services
            .iter()
            .filter(|(_, health)| health.phase != HealthPhase::Healthy)
            .map(|(service, health)| FailureSummary {
                service: service.clone(),
                phase: health.phase,
                consecutive_failures: health.consecutive_failures,
                last_detail: health.last_detail.clone(),
            })
            .collect();

        tracing::info!(
            verdict = verdict.as_str(),
            aggregate = snapshot.aggregate.as_str(),
            services = snapshot.services.len() as u64,
            failures = failures.len() as u64,
            "run finished"
        );

        RunReport {
            verdict,
            snapshot,
            failures,
        }
    }
}

fn waiting_event(shadow: &mut BTreeMap<String, ServiceHealth>, service: &str) -> TransitionEvent {
    let at = Utc::now();
    let health = shadow
        .entry(service.to_string())
        .or_insert_with(ServiceHealth::pending);
    let from = health.phase;
    health.phase = HealthPhase::Waiting;
    health.last_transition = at;
    TransitionEvent {
        service: service.to_string(),
        transition: Transition {
            from,
            to: HealthPhase::Waiting,
            reason: REASON_GRAPH_CONSTRUCTED.to_string(),
            at,
        },
        health: health.clone(),
    }
}

fn failed_event(
    shadow: &mut BTreeMap<String, ServiceHealth>,
    service: &str,
    reason: &str,
) -> Option<TransitionEvent> {
    let health = shadow.get_mut(service)?;
    if health.phase.is_terminal() {
        return None;
    }
    let at = Utc::now();
    let from = health.phase;
    health.phase = HealthPhase::Failed;
    health.last_transition = at;
    Some(TransitionEvent {
        service: service.to_string(),
        transition: Transition {
            from,
            to: HealthPhase::Failed,
            reason: reason.to_string(),
            at,
        },
        health: health.clone(),
    })
}
