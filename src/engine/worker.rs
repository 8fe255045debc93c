//! Worker loop: dequeue one item at a time, execute it, isolate failures.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::execute::{Execution, ExecutionResult};
use crate::event::{EventBus, EventKind};
use crate::model::{WorkItem, WorkerState};
use crate::queue::WorkReceiver;
use crate::scope::ScopeFactory;
use crate::telemetry::{metrics, work::record_outcome};

/// How the worker came to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The in-flight item (if any) finished within the shutdown timeout.
    Graceful,
    /// The in-flight item overran the shutdown timeout and was aborted.
    Forced,
}

/// The single consumer of the task queue.
pub struct WorkerLoop {
    receiver: WorkReceiver,
    scopes: Arc<dyn ScopeFactory>,
    shutdown_timeout: Duration,
    events: EventBus,
    state: watch::Sender<WorkerState>,
}

impl WorkerLoop {
    pub fn new(
        receiver: WorkReceiver,
        scopes: Arc<dyn ScopeFactory>,
        shutdown_timeout: Duration,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Running);
        Self {
            receiver,
            scopes,
            shutdown_timeout,
            events,
            state,
        }
    }

    /// Observe state changes.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run until `stopping` is cancelled or every producer is gone.
    pub async fn run(mut self, stopping: CancellationToken) -> ShutdownOutcome {
        info!(
            shutdown_timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "background worker started"
        );
        self.events.emit(EventKind::WorkerStarted);

        let mut outcome = ShutdownOutcome::Graceful;
        while let Some(item) = self.receiver.dequeue(&stopping).await {
            if self.process(item, &stopping).await == ShutdownOutcome::Forced {
                outcome = ShutdownOutcome::Forced;
            }
            if stopping.is_cancelled() {
                break;
            }
        }

        if stopping.is_cancelled() {
            self.begin_drain();
        } else {
            info!("all task queue handles dropped, worker exiting");
        }

        let discarded = self.receiver.close_and_discard();
        if discarded > 0 {
            warn!(count = discarded, "discarded queued work at shutdown");
            self.events.emit(EventKind::WorkDiscarded { count: discarded });
        }

        self.transition(WorkerState::Stopped);
        self.events.emit(EventKind::WorkerStopped);
        info!(?outcome, "background worker stopped");
        outcome
    }

    /// Execute one item; if shutdown is requested meanwhile, drain it.
    async fn process(&mut self, item: WorkItem, stopping: &CancellationToken) -> ShutdownOutcome {
        let mut exec = Execution::spawn(item, Arc::clone(&self.scopes));
        self.events.emit(EventKind::WorkStarted {
            id: exec.id,
            work_kind: exec.kind.to_string(),
            dependency: exec.dependency.map(str::to_string),
        });

        let result = tokio::select! {
            biased;
            result = exec.wait() => result,
            _ = stopping.cancelled() => {
                self.begin_drain();
                exec.drain(self.shutdown_timeout).await
            }
        };

        self.report(&exec, &result);
        match result {
            ExecutionResult::Aborted { .. } => ShutdownOutcome::Forced,
            _ => ShutdownOutcome::Graceful,
        }
    }

    fn report(&self, exec: &Execution, result: &ExecutionResult) {
        record_outcome(&exec.span, result.outcome());
        let labels = [
            KeyValue::new("kind", exec.kind),
            KeyValue::new("result", result.outcome()),
        ];
        metrics::work_executed().add(1, &labels);
        metrics::work_duration_ms().record(
            result.duration_ms() as f64,
            &[KeyValue::new("kind", exec.kind)],
        );

        let dependency = exec.dependency.unwrap_or("-");
        match result {
            ExecutionResult::Completed { duration_ms } => {
                debug!(work.id = %exec.id, work.kind = exec.kind, duration_ms, "background work completed");
                self.events.emit(EventKind::WorkCompleted {
                    id: exec.id,
                    duration_ms: *duration_ms,
                });
            }
            ExecutionResult::Failed { error, duration_ms } => {
                error!(
                    work.id = %exec.id,
                    work.kind = exec.kind,
                    work.dependency = dependency,
                    duration_ms,
                    %error,
                    "background work failed"
                );
                self.events.emit(EventKind::WorkFailed {
                    id: exec.id,
                    error: error.clone(),
                    duration_ms: *duration_ms,
                });
            }
            ExecutionResult::Panicked {
                message,
                duration_ms,
            } => {
                error!(
                    work.id = %exec.id,
                    work.kind = exec.kind,
                    work.dependency = dependency,
                    duration_ms,
                    panic = %message,
                    "background work panicked"
                );
                self.events.emit(EventKind::WorkPanicked {
                    id: exec.id,
                    message: message.clone(),
                });
            }
            ExecutionResult::Aborted { duration_ms } => {
                warn!(
                    work.id = %exec.id,
                    work.kind = exec.kind,
                    duration_ms,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "forced stop: in-flight work exceeded shutdown timeout"
                );
                self.events.emit(EventKind::ForcedStop { id: exec.id });
            }
        }
    }

    /// Stop intake and move to `Draining`. Enqueue fails with `QueueClosed`
    /// from here on.
    fn begin_drain(&mut self) {
        self.receiver.close();
        if self.transition(WorkerState::Draining) {
            info!(queued = self.receiver.len(), "background worker draining");
            self.events.emit(EventKind::DrainStarted);
        }
    }

    /// Apply a forward state transition. Returns false if it was not allowed
    /// (e.g. already draining).
    fn transition(&self, to: WorkerState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                debug!(from = %state, to = %to, "worker state transition");
                *state = to;
                true
            } else {
                false
            }
        })
    }
}
