use crate::config::registry::{JitterMode, ProbeSpec, ServiceDescriptor};
use crate::metrics::metrics;
use crate::probe::{ProbeOutcome, ProbeResult, Prober};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const HISTORY_DEPTH: usize = 8;

pub const REASON_GRAPH_CONSTRUCTED: &str = "graph_constructed";
pub const REASON_DEPENDENCIES_HEALTHY: &str = "dependencies_healthy";
pub const REASON_PROBE_SUCCESS: &str = "probe_success";
pub const REASON_PROBE_FAILURE: &str = "probe_failure";
pub const REASON_RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";
pub const REASON_DEPENDENCY_FAILED: &str = "dependency_failed";
pub const REASON_DEADLINE: &str = "startup deadline exceeded";
pub const REASON_INTERRUPTED: &str = "run_interrupted";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthPhase {
    Pending,
    Waiting,
    Probing,
    Healthy,
    Unhealthy,
    Failed,
}

impl HealthPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthPhase::Pending => "PENDING",
            HealthPhase::Waiting => "WAITING",
            HealthPhase::Probing => "PROBING",
            HealthPhase::Healthy => "HEALTHY",
            HealthPhase::Unhealthy => "UNHEALTHY",
            HealthPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HealthPhase::Failed)
    }

    /// Legal moves in the per-service state machine. `Failed` is reachable
    /// from every non-terminal state (fail-fast, deadline); everything else
    /// follows the startup progression.
    pub fn can_transition(self, next: HealthPhase) -> bool {
        if next == HealthPhase::Failed {
            return self != HealthPhase::Failed;
        }
        match self {
            HealthPhase::Pending => matches!(next, HealthPhase::Waiting),
            HealthPhase::Waiting => matches!(next, HealthPhase::Probing),
            HealthPhase::Probing => matches!(next, HealthPhase::Healthy | HealthPhase::Unhealthy),
            HealthPhase::Healthy => matches!(next, HealthPhase::Unhealthy),
            HealthPhase::Unhealthy => matches!(next, HealthPhase::Healthy),
            HealthPhase::Failed => false,
        }
    }
}

/// Mutable health record for one service. Exclusively owned by that
/// service's monitor; the orchestrator only ever sees copies.
#[derive(Clone, Debug)]
pub struct ServiceHealth {
    pub phase: HealthPhase,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub last_detail: Option<String>,
}

impl ServiceHealth {
    pub fn pending() -> Self {
        Self {
            phase: HealthPhase::Pending,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_transition: Utc::now(),
            last_detail: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HealthPolicy {
    pub success_threshold: u32,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthPolicy {
    pub fn from_spec(spec: &ProbeSpec) -> Self {
        Self {
            success_threshold: spec.success_threshold.max(1),
            retries: spec.retries.max(1),
            start_period: spec.start_period,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub from: HealthPhase,
    pub to: HealthPhase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Delivered from a monitor task to the orchestrator over the transition
/// channel. Carries a copy of the health record taken after the transition.
#[derive(Clone, Debug)]
pub struct TransitionEvent {
    pub service: String,
    pub transition: Transition,
    pub health: ServiceHealth,
}

/// Pure state machine driving one service's health from probe outcomes.
/// Time is injected so the grace-window logic stays deterministic in tests.
#[derive(Debug)]
pub struct HealthTracker {
    policy: HealthPolicy,
    health: ServiceHealth,
    probing_since: Option<Instant>,
}

impl HealthTracker {
    /// Trackers are created at activation time, so they start in `Waiting`;
    /// the orchestrator records `Pending -> Waiting` for the whole graph
    /// before any monitor exists.
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            health: ServiceHealth {
                phase: HealthPhase::Waiting,
                ..ServiceHealth::pending()
            },
            probing_since: None,
        }
    }

    pub fn health(&self) -> &ServiceHealth {
        &self.health
    }

    pub fn begin_probing(&mut self, now: Instant) -> Transition {
        self.probing_since = Some(now);
        self.apply(HealthPhase::Probing, REASON_DEPENDENCIES_HEALTHY)
    }

    /// Feeds one probe result into the state machine. Returns the resulting
    /// transitions in order; a single failing probe can legally produce two
    /// (`Probing -> Unhealthy -> Failed` when retries = 1).
    pub fn observe(&mut self, result: &ProbeResult, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();

        match result.outcome {
            ProbeOutcome::Success => {
                self.health.consecutive_failures = 0;
                self.health.consecutive_successes =
                    self.health.consecutive_successes.saturating_add(1);

                let eligible = matches!(
                    self.health.phase,
                    HealthPhase::Probing | HealthPhase::Unhealthy
                );
                if eligible && self.health.consecutive_successes >= self.policy.success_threshold {
                    transitions.push(self.apply(HealthPhase::Healthy, REASON_PROBE_SUCCESS));
                }
            }
            ProbeOutcome::Failure | ProbeOutcome::Timeout => {
                self.health.consecutive_successes = 0;
                self.health.last_detail = result.detail.clone();

                if self.within_grace(now) {
                    // Warm-up noise: the failure is recorded as a diagnostic
                    // but does not move the state machine or spend budget.
                    return transitions;
                }

                self.health.consecutive_failures =
                    self.health.consecutive_failures.saturating_add(1);

                if matches!(self.health.phase, HealthPhase::Probing | HealthPhase::Healthy) {
                    transitions.push(self.apply(HealthPhase::Unhealthy, REASON_PROBE_FAILURE));
                }

                if self.health.phase == HealthPhase::Unhealthy
                    && self.health.consecutive_failures >= self.policy.retries
                {
                    transitions
                        .push(self.apply(HealthPhase::Failed, REASON_RETRY_BUDGET_EXHAUSTED));
                }
            }
        }

        transitions
    }

    fn within_grace(&self, now: Instant) -> bool {
        match self.probing_since {
            Some(started) => now.duration_since(started) < self.policy.start_period,
            None => false,
        }
    }

    fn apply(&mut self, next: HealthPhase, reason: &str) -> Transition {
        debug_assert!(
            self.health.phase.can_transition(next),
            "illegal transition {} -> {}",
            self.health.phase.as_str(),
            next.as_str()
        );
        let from = self.health.phase;
        let at = Utc::now();
        self.health.phase = next;
        self.health.last_transition = at;
        Transition {
            from,
            to: next,
            reason: reason.to_string(),
            at,
        }
    }
}

/// One independent task per service: drives the probe schedule, feeds the
/// tracker and reports transitions back to the orchestrator. Cancellation is
/// checked around both the probe and the interval sleep, so propagated
/// failure stops the monitor within one probe timeout.
pub(crate) struct Monitor {
    descriptor: ServiceDescriptor,
    jitter: JitterMode,
    prober: Arc<dyn Prober>,
    events: mpsc::Sender<TransitionEvent>,
    cancel: CancellationToken,
}

impl Monitor {
    pub(crate) fn spawn(
        descriptor: ServiceDescriptor,
        default_jitter: JitterMode,
        prober: Arc<dyn Prober>,
        events: mpsc::Sender<TransitionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let jitter = descriptor.probe.jitter.unwrap_or(default_jitter);
        let monitor = Self {
            descriptor,
            jitter,
            prober,
            events,
            cancel,
        };
        tokio::spawn(monitor.run())
    }

    async fn run(self) {
        let mut tracker = HealthTracker::new(HealthPolicy::from_spec(&self.descriptor.probe));
        let mut history: VecDeque<ProbeResult> = VecDeque::with_capacity(HISTORY_DEPTH);

        metrics().record_activation(&self.descriptor.name);
        let begin = tracker.begin_probing(Instant::now());
        if !self.emit(begin, tracker.health().clone()).await {
            return;
        }

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.prober.execute(&self.descriptor.name, &self.descriptor.probe) => result,
            };

            metrics().record_probe_outcome(&self.descriptor.name, result.outcome);
            tracing::debug!(
                service = self.descriptor.name.as_str(),
                outcome = result.outcome.as_str(),
                latency_ms = result.latency.as_millis() as u64,
                detail = result.detail.as_deref().unwrap_or(""),
                "probe completed"
            );

            if history.len() == HISTORY_DEPTH {
                history.pop_front();
            }
            history.push_back(result.clone());

            let transitions = tracker.observe(&result, Instant::now());
            for transition in transitions {
                if transition.to == HealthPhase::Failed {
                    log_failure_history(&self.descriptor.name, &history);
                }
                if !self.emit(transition, tracker.health().clone()).await {
                    return;
                }
            }

            if tracker.health().phase.is_terminal() {
                return;
            }

            let delay = jittered_interval(self.descriptor.probe.interval, self.jitter);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn emit(&self, transition: Transition, health: ServiceHealth) -> bool {
        let event = TransitionEvent {
            service: self.descriptor.name.clone(),
            transition,
            health,
        };
        self.events.send(event).await.is_ok()
    }
}

fn log_failure_history(service: &str, history: &VecDeque<ProbeResult>) {
    let outcomes = history
        .iter()
        .map(|result| result.outcome.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let last_detail = history
        .iter()
        .rev()
        .find_map(|result| result.detail.as_deref())
        .unwrap_or("none");
    tracing::error!(
        service = service,
        recent_outcomes = outcomes.as_str(),
        last_detail = last_detail,
        "service exhausted its failure budget"
    );
}

/// Spreads probe starts so co-scheduled monitors do not hammer a shared
/// target in lockstep.
pub fn jittered_interval(interval: Duration, mode: JitterMode) -> Duration {
    match mode {
        JitterMode::None => interval,
        JitterMode::Equal => jitter_between(interval.mul_f64(0.5), interval),
        JitterMode::Full => jitter_between(Duration::ZERO, interval),
    }
}

fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}
