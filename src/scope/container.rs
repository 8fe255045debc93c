//! In-process service container with per-scope instances.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::{Instance, ScopeFactory, ServiceScope};
use crate::error::{Error, Result};

type Construct = Arc<dyn Fn(&mut ContainerScope) -> anyhow::Result<Instance> + Send + Sync>;
type Dispose = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    construct: Construct,
    dispose: Option<Dispose>,
}

/// Registry of scoped services.
///
/// Built during startup, then shared by every scope it creates.
#[derive(Clone, Default)]
pub struct ServiceContainer {
    registrations: Arc<HashMap<TypeId, Registration>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scoped service: constructed at most once per scope.
    ///
    /// The constructor may resolve other scoped services from the scope it
    /// is given. A later registration for the same type replaces the earlier one.
    pub fn register_scoped<T, F>(&mut self, construct: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ContainerScope) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T>(Registration {
            construct: Arc::new(move |scope| Ok(Arc::new(construct(scope)?) as Instance)),
            dispose: None,
        })
    }

    /// Like [`register_scoped`](Self::register_scoped), with a hook that runs
    /// when the owning scope is disposed.
    pub fn register_scoped_with_dispose<T, F, D>(&mut self, construct: F, dispose: D) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ContainerScope) -> anyhow::Result<T> + Send + Sync + 'static,
        D: Fn(&T) + Send + Sync + 'static,
    {
        self.insert::<T>(Registration {
            construct: Arc::new(move |scope| Ok(Arc::new(construct(scope)?) as Instance)),
            dispose: Some(Arc::new(move |instance| {
                if let Some(typed) = instance.downcast_ref::<T>() {
                    dispose(typed);
                }
            })),
        })
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    fn insert<T: 'static>(&mut self, registration: Registration) -> &mut Self {
        Arc::make_mut(&mut self.registrations).insert(TypeId::of::<T>(), registration);
        self
    }
}

impl ScopeFactory for ServiceContainer {
    fn create_scope(&self) -> Result<Box<dyn ServiceScope>> {
        let scope = ContainerScope {
            id: Uuid::new_v4(),
            registrations: Arc::clone(&self.registrations),
            instances: HashMap::new(),
            created: Vec::new(),
            resolving: Vec::new(),
        };
        debug!(scope.id = %scope.id, "scope created");
        Ok(Box::new(scope))
    }
}

/// A scope created by [`ServiceContainer`].
pub struct ContainerScope {
    id: Uuid,
    registrations: Arc<HashMap<TypeId, Registration>>,
    instances: HashMap<TypeId, Instance>,
    /// Construction order, for reverse-order disposal.
    created: Vec<TypeId>,
    /// Types under construction, for cycle detection.
    resolving: Vec<TypeId>,
}

impl ContainerScope {
    /// Typed resolve, for use inside constructors.
    pub fn get<T: Send + Sync + 'static>(&mut self) -> Result<Arc<T>> {
        let type_name = std::any::type_name::<T>();
        self.resolve_any(TypeId::of::<T>(), type_name)?
            .downcast::<T>()
            .map_err(|_| Error::Scope(format!("scope returned the wrong type for {type_name}")))
    }
}

impl ServiceScope for ContainerScope {
    fn resolve_any(&mut self, type_id: TypeId, type_name: &'static str) -> Result<Instance> {
        if let Some(existing) = self.instances.get(&type_id) {
            return Ok(Arc::clone(existing));
        }
        if self.resolving.contains(&type_id) {
            return Err(Error::Scope(format!("dependency cycle while resolving {type_name}")));
        }

        let construct = self
            .registrations
            .get(&type_id)
            .map(|r| Arc::clone(&r.construct))
            .ok_or(Error::Resolve { type_name })?;

        self.resolving.push(type_id);
        let built = construct(self);
        self.resolving.pop();

        let instance = built
            .map_err(|e| Error::Scope(format!("failed to construct {type_name}: {e:#}")))?;
        self.instances.insert(type_id, Arc::clone(&instance));
        self.created.push(type_id);
        Ok(instance)
    }

    fn dispose(&mut self) {
        while let Some(type_id) = self.created.pop() {
            let Some(instance) = self.instances.remove(&type_id) else {
                continue;
            };
            if let Some(dispose) = self.registrations.get(&type_id).and_then(|r| r.dispose.as_ref())
            {
                dispose(instance.as_ref());
            }
        }
        self.instances.clear();
        debug!(scope.id = %self.id, "scope disposed");
    }
}
