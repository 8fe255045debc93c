//! Dependency scopes for scoped work.
//!
//! A scope is a lifetime boundary: dependencies resolved inside it are
//! private to one work item and released when the scope is disposed. The
//! hosting application supplies a [`ScopeFactory`]; [`ServiceContainer`] is
//! the bundled implementation.

pub mod container;

pub use container::{ContainerScope, ServiceContainer};

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A type-erased resolved instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// One open dependency scope.
///
/// Resolving the same type twice within a scope must yield the same
/// instance. `dispose` releases everything the scope created.
pub trait ServiceScope: Send {
    fn resolve_any(&mut self, type_id: TypeId, type_name: &'static str) -> Result<Instance>;

    fn dispose(&mut self);
}

/// Creates scopes. Shared by the worker for the life of the process.
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> Result<Box<dyn ServiceScope>>;
}

/// Owns an open scope and disposes it exactly once: on [`ScopeGuard::close`]
/// or on drop, whichever comes first. Drop covers errors, panics and aborted
/// tasks.
pub struct ScopeGuard {
    scope: Option<Box<dyn ServiceScope>>,
}

impl ScopeGuard {
    pub fn new(scope: Box<dyn ServiceScope>) -> Self {
        Self { scope: Some(scope) }
    }

    /// Open a new scope from `factory`.
    pub fn open(factory: &dyn ScopeFactory) -> Result<Self> {
        factory.create_scope().map(Self::new)
    }

    /// Resolve `T` from the scope.
    pub fn resolve<T>(&mut self) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let scope = self
            .scope
            .as_mut()
            .ok_or_else(|| Error::Scope(format!("resolve of {type_name} after dispose")))?;

        scope
            .resolve_any(TypeId::of::<T>(), type_name)?
            .downcast::<T>()
            .map_err(|_| Error::Scope(format!("scope returned the wrong type for {type_name}")))
    }

    /// Dispose the scope now.
    pub fn close(mut self) {
        self.dispose_once();
    }

    fn dispose_once(&mut self) {
        if let Some(mut scope) = self.scope.take() {
            scope.dispose();
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.dispose_once();
    }
}
