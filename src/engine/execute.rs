//! Execution of a single work item.
//!
//! Each item runs in its own tokio task with its own cancellation token, so
//! a panic or a cancellation stays inside that item. Scoped items open a
//! scope, resolve their dependency, run, and dispose the scope on every exit
//! path: success, error, panic, or abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, warn};

use crate::model::{WorkId, WorkItem};
use crate::scope::{ScopeFactory, ScopeGuard};
use crate::telemetry::work::start_work_span;

/// How long an aborted item may take to unwind before it is left detached.
pub const ABORT_GRACE: Duration = Duration::from_millis(100);

/// How a work item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed { duration_ms: u64 },
    Failed { error: String, duration_ms: u64 },
    Panicked { message: String, duration_ms: u64 },
    /// Cut short by a forced stop.
    Aborted { duration_ms: u64 },
}

impl ExecutionResult {
    /// Label for spans and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            ExecutionResult::Completed { .. } => "ok",
            ExecutionResult::Failed { .. } => "error",
            ExecutionResult::Panicked { .. } => "panic",
            ExecutionResult::Aborted { .. } => "aborted",
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            ExecutionResult::Completed { duration_ms }
            | ExecutionResult::Failed { duration_ms, .. }
            | ExecutionResult::Panicked { duration_ms, .. }
            | ExecutionResult::Aborted { duration_ms } => *duration_ms,
        }
    }
}

/// An in-flight work item.
pub struct Execution {
    pub id: WorkId,
    pub kind: &'static str,
    pub dependency: Option<&'static str>,
    pub span: Span,
    token: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
    started: Instant,
}

impl Execution {
    /// Start running `item` on its own task with a fresh cancellation token.
    pub fn spawn(item: WorkItem, scopes: Arc<dyn ScopeFactory>) -> Self {
        let (id, kind, dependency) = (item.id(), item.kind(), item.dependency());
        let span = start_work_span(id, kind, dependency);
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_item(item, scopes, token.clone()).instrument(span.clone()));

        Self {
            id,
            kind,
            dependency,
            span,
            token,
            handle,
            started: Instant::now(),
        }
    }

    /// Wait for the item to finish.
    pub async fn wait(&mut self) -> ExecutionResult {
        let joined = (&mut self.handle).await;
        self.classify(joined)
    }

    /// Give the item at most `grace` to finish, then cancel its token and
    /// abort it.
    ///
    /// Once `grace` has run out the result is always `Aborted`. An item that
    /// blocks without yielding cannot be aborted; it is left to finish
    /// detached after [`ABORT_GRACE`].
    pub async fn drain(&mut self, grace: Duration) -> ExecutionResult {
        if let Ok(joined) = tokio::time::timeout(grace, &mut self.handle).await {
            return self.classify(joined);
        }

        self.token.cancel();
        self.handle.abort();
        if tokio::time::timeout(ABORT_GRACE, &mut self.handle)
            .await
            .is_err()
        {
            warn!(work.id = %self.id, "work did not yield after abort, leaving it detached");
        }
        ExecutionResult::Aborted {
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn classify(&self, joined: Result<anyhow::Result<()>, JoinError>) -> ExecutionResult {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match joined {
            Ok(Ok(())) => ExecutionResult::Completed { duration_ms },
            Ok(Err(e)) => ExecutionResult::Failed {
                error: format!("{e:#}"),
                duration_ms,
            },
            Err(e) if e.is_panic() => ExecutionResult::Panicked {
                message: panic_message(e.into_panic()),
                duration_ms,
            },
            Err(_) => ExecutionResult::Aborted { duration_ms },
        }
    }
}

async fn run_item(
    item: WorkItem,
    scopes: Arc<dyn ScopeFactory>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    match item {
        WorkItem::Unscoped(work) => (work.action)(token).await,
        WorkItem::Scoped(work) => {
            let mut scope = ScopeGuard::open(scopes.as_ref())?;
            let action = (work.action)(&mut scope, token)?;
            let result = action.await;
            scope.close();
            result
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
