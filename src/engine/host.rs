//! Host lifecycle: start the worker at boot, stop it with a bounded drain.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::worker::{ShutdownOutcome, WorkerLoop};
use crate::config::QueueConfig;
use crate::event::{Event, EventBus};
use crate::model::WorkerState;
use crate::queue::{self, TaskQueue, WorkReceiver};
use crate::scope::ScopeFactory;

/// Create a queue and start its worker in one step.
pub fn start(config: &QueueConfig, scopes: Arc<dyn ScopeFactory>) -> (TaskQueue, BackgroundHost) {
    let (queue, receiver) = queue::channel(config);
    let host = BackgroundHost::start(receiver, scopes, config);
    (queue, host)
}

/// Owns the running worker loop.
pub struct BackgroundHost {
    stopping: CancellationToken,
    worker: JoinHandle<ShutdownOutcome>,
    state: watch::Receiver<WorkerState>,
    events: EventBus,
}

impl BackgroundHost {
    /// Spawn the worker loop on its own task.
    pub fn start(
        receiver: WorkReceiver,
        scopes: Arc<dyn ScopeFactory>,
        config: &QueueConfig,
    ) -> Self {
        Self::start_with_events(receiver, scopes, config, EventBus::default())
    }

    /// Like [`start`](Self::start), publishing to a caller-provided bus so
    /// subscribers created beforehand see every event.
    pub fn start_with_events(
        receiver: WorkReceiver,
        scopes: Arc<dyn ScopeFactory>,
        config: &QueueConfig,
        events: EventBus,
    ) -> Self {
        let stopping = CancellationToken::new();
        let worker = WorkerLoop::new(receiver, scopes, config.shutdown_timeout, events.clone());
        let state = worker.state();
        let worker = tokio::spawn(worker.run(stopping.clone()));

        Self {
            stopping,
            worker,
            state,
            events,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Request a stop without waiting for it.
    pub fn request_shutdown(&self) {
        self.stopping.cancel();
    }

    /// Stop taking work, let the in-flight item finish within the shutdown
    /// timeout, and wait for the worker to reach `Stopped`.
    pub async fn shutdown(self) -> ShutdownOutcome {
        info!("background host shutting down");
        self.stopping.cancel();
        self.join().await
    }

    /// Wait for the worker to stop on its own (every queue handle dropped or
    /// shutdown requested elsewhere).
    pub async fn join(self) -> ShutdownOutcome {
        match self.worker.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "background worker task failed");
                ShutdownOutcome::Forced
            }
        }
    }
}
