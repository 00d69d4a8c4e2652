use convoy::monitor::{
    HealthPhase, HealthPolicy, HealthTracker, REASON_DEPENDENCIES_HEALTHY, REASON_PROBE_FAILURE,
    REASON_PROBE_SUCCESS, REASON_RETRY_BUDGET_EXHAUSTED,
};
use convoy::probe::{ProbeOutcome, ProbeResult};
use chrono::Utc;
use std::time::{Duration, Instant};

fn policy(success_threshold: u32, retries: u32, start_period: Duration) -> HealthPolicy {
    HealthPolicy {
        success_threshold,
        retries,
        start_period,
    }
}

fn probe(outcome: ProbeOutcome) -> ProbeResult {
    ProbeResult {
        service: "svc".to_string(),
        at: Utc::now(),
        outcome,
        latency: Duration::from_millis(1),
        detail: match outcome {
            ProbeOutcome::Success => None,
            _ => Some("connection refused".to_string()),
        },
    }
}

#[test]
fn transition_legality() {
    use HealthPhase::*;

    assert!(Pending.can_transition(Waiting));
    assert!(Waiting.can_transition(Probing));
    assert!(Probing.can_transition(Healthy));
    assert!(Probing.can_transition(Unhealthy));
    assert!(Healthy.can_transition(Unhealthy));
    assert!(Unhealthy.can_transition(Healthy));

    // Failed is reachable from every non-terminal state and is final.
    for phase in [Pending, Waiting, Probing, Healthy, Unhealthy] {
        assert!(phase.can_transition(Failed), "{} -> FAILED", phase.as_str());
    }
    assert!(!Failed.can_transition(Probing));
    assert!(!Failed.can_transition(Healthy));
    assert!(!Failed.can_transition(Failed));

    assert!(!Pending.can_transition(Probing));
    assert!(!Waiting.can_transition(Healthy));
    assert!(!Probing.can_transition(Waiting));
    assert!(!Healthy.can_transition(Probing));
}

#[test]
fn activation_enters_probing() {
    let mut tracker = HealthTracker::new(policy(1, 3, Duration::ZERO));
    assert_eq!(tracker.health().phase, HealthPhase::Waiting);

    let transition = tracker.begin_probing(Instant::now());
    assert_eq!(transition.from, HealthPhase::Waiting);
    assert_eq!(transition.to, HealthPhase::Probing);
    assert_eq!(transition.reason, REASON_DEPENDENCIES_HEALTHY);
}

#[test]
fn success_threshold_gates_healthy() {
    let mut tracker = HealthTracker::new(policy(2, 3, Duration::ZERO));
    let now = Instant::now();
    tracker.begin_probing(now);

    assert!(tracker.observe(&probe(ProbeOutcome::Success), now).is_empty());
    assert_eq!(tracker.health().phase, HealthPhase::Probing);
    assert_eq!(tracker.health().consecutive_successes, 1);

    let transitions = tracker.observe(&probe(ProbeOutcome::Success), now);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, HealthPhase::Healthy);
    assert_eq!(transitions[0].reason, REASON_PROBE_SUCCESS);
}

#[test]
fn retry_budget_exhaustion_reaches_failed() {
    let mut tracker = HealthTracker::new(policy(1, 3, Duration::ZERO));
    let now = Instant::now();
    tracker.begin_probing(now);

    let first = tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to, HealthPhase::Unhealthy);
    assert_eq!(first[0].reason, REASON_PROBE_FAILURE);

    assert!(tracker.observe(&probe(ProbeOutcome::Timeout), now).is_empty());
    assert_eq!(tracker.health().consecutive_failures, 2);

    let last = tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].to, HealthPhase::Failed);
    assert_eq!(last[0].reason, REASON_RETRY_BUDGET_EXHAUSTED);
    assert!(tracker.health().phase.is_terminal());
}

#[test]
fn intervening_success_resets_the_budget() {
    let mut tracker = HealthTracker::new(policy(1, 3, Duration::ZERO));
    let now = Instant::now();
    tracker.begin_probing(now);

    tracker.observe(&probe(ProbeOutcome::Failure), now);
    tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(tracker.health().consecutive_failures, 2);

    let recovered = tracker.observe(&probe(ProbeOutcome::Success), now);
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].to, HealthPhase::Healthy);
    assert_eq!(tracker.health().consecutive_failures, 0);

    // The budget starts over: two more failures are not enough to fail.
    tracker.observe(&probe(ProbeOutcome::Failure), now);
    tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(tracker.health().phase, HealthPhase::Unhealthy);

    let failed = tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(failed.last().map(|t| t.to), Some(HealthPhase::Failed));
}

#[test]
fn single_probe_can_yield_two_transitions_when_retries_is_one() {
    let mut tracker = HealthTracker::new(policy(1, 1, Duration::ZERO));
    let now = Instant::now();
    tracker.begin_probing(now);

    let transitions = tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].from, HealthPhase::Probing);
    assert_eq!(transitions[0].to, HealthPhase::Unhealthy);
    assert_eq!(transitions[1].from, HealthPhase::Unhealthy);
    assert_eq!(transitions[1].to, HealthPhase::Failed);
}

#[test]
fn failures_inside_the_grace_window_spend_no_budget() {
    let mut tracker = HealthTracker::new(policy(1, 2, Duration::from_secs(5)));
    let started = Instant::now();
    tracker.begin_probing(started);

    let early = started + Duration::from_secs(1);
    assert!(tracker.observe(&probe(ProbeOutcome::Failure), early).is_empty());
    assert!(tracker.observe(&probe(ProbeOutcome::Timeout), early).is_empty());
    assert_eq!(tracker.health().phase, HealthPhase::Probing);
    assert_eq!(tracker.health().consecutive_failures, 0);
    // Diagnostics are still recorded during the grace period.
    assert!(tracker.health().last_detail.is_some());

    // After the window the same failures count.
    let late = started + Duration::from_secs(6);
    let transitions = tracker.observe(&probe(ProbeOutcome::Failure), late);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, HealthPhase::Unhealthy);
    assert_eq!(tracker.health().consecutive_failures, 1);
}

#[test]
fn grace_window_does_not_delay_success() {
    let mut tracker = HealthTracker::new(policy(1, 3, Duration::from_secs(30)));
    let started = Instant::now();
    tracker.begin_probing(started);

    let transitions = tracker.observe(&probe(ProbeOutcome::Success), started);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, HealthPhase::Healthy);
}

#[test]
fn healthy_service_can_degrade_and_recover() {
    let mut tracker = HealthTracker::new(policy(1, 5, Duration::ZERO));
    let now = Instant::now();
    tracker.begin_probing(now);
    tracker.observe(&probe(ProbeOutcome::Success), now);
    assert_eq!(tracker.health().phase, HealthPhase::Healthy);

    let degraded = tracker.observe(&probe(ProbeOutcome::Failure), now);
    assert_eq!(degraded[0].from, HealthPhase::Healthy);
    assert_eq!(degraded[0].to, HealthPhase::Unhealthy);

    let recovered = tracker.observe(&probe(ProbeOutcome::Success), now);
    assert_eq!(recovered[0].from, HealthPhase::Unhealthy);
    assert_eq!(recovered[0].to, HealthPhase::Healthy);
}
