use crate::monitor::{ServiceHealth, TransitionEvent};
use crate::orchestrator::{Aggregate, SystemSnapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const STREAM_DEPTH: usize = 256;

/// One entry of the append-only transition log, also the payload pushed to
/// subscribers. States are carried as their canonical uppercase names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub service: String,
    pub state_from: &'static str,
    pub state_to: &'static str,
    pub reason: String,
}

/// Publication surface for run status: pull snapshots, the full transition
/// log and a push stream. The orchestrator is the only writer; `publish`
/// updates the snapshot, the log and the stream under one write lock so a
/// reader never observes a torn combination.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    state: RwLock<ReporterState>,
    stream: broadcast::Sender<TransitionRecord>,
}

struct ReporterState {
    snapshot: SystemSnapshot,
    log: Vec<TransitionRecord>,
}

impl StatusReporter {
    /// Every known service starts in `Pending` before the first published
    /// transition.
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: BTreeMap<String, ServiceHealth> = services
            .into_iter()
            .map(|name| (name.into(), ServiceHealth::pending()))
            .collect();
        let aggregate = Aggregate::of(&services);
        let (stream, _) = broadcast::channel(STREAM_DEPTH);

        Self {
            inner: Arc::new(ReporterInner {
                state: RwLock::new(ReporterState {
                    snapshot: SystemSnapshot {
                        services,
                        aggregate,
                    },
                    log: Vec::new(),
                }),
                stream,
            }),
        }
    }

    pub(crate) async fn publish(&self, event: &TransitionEvent) -> Aggregate {
        let record = TransitionRecord {
            at: event.transition.at,
            service: event.service.clone(),
            state_from: event.transition.from.as_str(),
            state_to: event.transition.to.as_str(),
            reason: event.transition.reason.clone(),
        };

        tracing::info!(
            service = record.service.as_str(),
            state_from = record.state_from,
            state_to = record.state_to,
            reason = record.reason.as_str(),
            "service health transition"
        );

        let mut state = self.inner.state.write().await;
        state
            .snapshot
            .services
            .insert(event.service.clone(), event.health.clone());
        state.snapshot.aggregate = Aggregate::of(&state.snapshot.services);
        state.log.push(record.clone());
        // Lagging or absent subscribers never block the run.
        let _ = self.inner.stream.send(record);
        state.snapshot.aggregate
    }

    /// Point-in-time copy of every service's health plus the aggregate.
    pub async fn snapshot(&self) -> SystemSnapshot {
        self.inner.state.read().await.snapshot.clone()
    }

    pub async fn aggregate(&self) -> Aggregate {
        self.inner.state.read().await.snapshot.aggregate
    }

    /// Copy of the append-only transition log, oldest first.
    pub async fn transitions(&self) -> Vec<TransitionRecord> {
        self.inner.state.read().await.log.clone()
    }

    /// Live stream of transition records in publication order. A receiver
    /// that falls more than the channel depth behind observes a lag error,
    /// not a torn record.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.inner.stream.subscribe()
    }
}
