//! Core data model.
//!
//! A work item is a deferred unit of asynchronous work. It is either
//! unscoped (a plain action) or scoped (an action that needs a dependency
//! resolved from a fresh scope at execution time). Work items live only in
//! memory: owned by the queue until dequeued, then by the worker until done.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::scope::ScopeGuard;

/// The future produced by a work item's action.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;

pub(crate) type UnscopedAction = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>;
pub(crate) type ScopedAction =
    Box<dyn FnOnce(&mut ScopeGuard, CancellationToken) -> Result<WorkFuture> + Send>;

// ---------------------------------------------------------------------------
// Work Id
// ---------------------------------------------------------------------------

/// Transient identifier used to correlate log lines and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of deferred work.
pub enum WorkItem {
    Unscoped(UnscopedWork),
    Scoped(ScopedWork),
}

/// Work that runs with only a cancellation token.
pub struct UnscopedWork {
    pub id: WorkId,
    pub enqueued_at: DateTime<Utc>,
    pub(crate) action: UnscopedAction,
}

/// Work that receives a dependency resolved from its own scope.
pub struct ScopedWork {
    pub id: WorkId,
    pub enqueued_at: DateTime<Utc>,
    /// Type name of the requested dependency, for diagnostics.
    pub dependency: &'static str,
    pub(crate) action: ScopedAction,
}

impl WorkItem {
    /// Build an unscoped work item from an async closure.
    pub fn unscoped<F, Fut>(action: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        WorkItem::Unscoped(UnscopedWork {
            id: WorkId::new(),
            enqueued_at: Utc::now(),
            action: Box::new(move |token| action(token).boxed()),
        })
    }

    /// Build a scoped work item. `T` is resolved from a fresh scope when the
    /// item executes; the scope is disposed once the action finishes.
    pub fn scoped<T, F, Fut>(action: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        WorkItem::Scoped(ScopedWork {
            id: WorkId::new(),
            enqueued_at: Utc::now(),
            dependency: std::any::type_name::<T>(),
            action: Box::new(move |scope, token| {
                let dependency = scope.resolve::<T>()?;
                Ok(action(dependency, token).boxed())
            }),
        })
    }

    pub fn id(&self) -> WorkId {
        match self {
            WorkItem::Unscoped(work) => work.id,
            WorkItem::Scoped(work) => work.id,
        }
    }

    /// "unscoped" or "scoped"; used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Unscoped(_) => "unscoped",
            WorkItem::Scoped(_) => "scoped",
        }
    }

    /// The dependency type a scoped item asks for.
    pub fn dependency(&self) -> Option<&'static str> {
        match self {
            WorkItem::Unscoped(_) => None,
            WorkItem::Scoped(work) => Some(work.dependency),
        }
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        match self {
            WorkItem::Unscoped(work) => work.enqueued_at,
            WorkItem::Scoped(work) => work.enqueued_at,
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("dependency", &self.dependency())
            .field("enqueued_at", &self.enqueued_at())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker State
// ---------------------------------------------------------------------------

/// Lifecycle state of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Dequeuing and executing items.
    Running,
    /// Stop requested; finishing the in-flight item, taking nothing new.
    Draining,
    /// Terminal.
    Stopped,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Running, Draining) | (Running, Stopped) | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
