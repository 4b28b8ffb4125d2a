//! Service catalog
//!
//! Services are owned by one catalog arena and addressed by [`ServiceHandle`]
//! indices or by type. They are started in dependency order and stopped in
//! reverse. A service never holds the catalog; it receives a borrowed
//! reference while starting and may keep `Arc`s to the services it depends on.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ofc_core::{Error, Result};
use tracing::{error, info};

use crate::controller::ControllerHandle;

/// A long-lived component built on the controller API
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Types of the services that must be started first
    fn dependencies(&self) -> Vec<TypeId> {
        Vec::new()
    }

    async fn start(self: Arc<Self>, controller: &ControllerHandle, catalog: &ServiceCatalog) -> Result<()>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Index of a service in its catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(usize);

impl ServiceHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct ServiceEntry {
    type_id: TypeId,
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Arena of registered services
#[derive(Default)]
pub struct ServiceCatalog {
    entries: Vec<ServiceEntry>,
    by_type: HashMap<TypeId, ServiceHandle>,
    started: Vec<ServiceHandle>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. One instance per type.
    pub fn register<S: Service>(&mut self, service: Arc<S>) -> Result<ServiceHandle> {
        let type_id = TypeId::of::<S>();
        if self.by_type.contains_key(&type_id) {
            return Err(Error::invalid_argument(format!(
                "service '{}' is already registered",
                service.name()
            )));
        }
        let handle = ServiceHandle(self.entries.len());
        info!(service = service.name(), "registered service");
        self.entries.push(ServiceEntry {
            type_id,
            any: service.clone(),
            service,
        });
        self.by_type.insert(type_id, handle);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handle of the service of type `S`
    pub fn handle_of<S: Service>(&self) -> Option<ServiceHandle> {
        self.by_type.get(&TypeId::of::<S>()).copied()
    }

    pub fn get(&self, handle: ServiceHandle) -> Option<&Arc<dyn Service>> {
        self.entries.get(handle.0).map(|entry| &entry.service)
    }

    /// Typed lookup
    pub fn get_service<S: Service>(&self) -> Option<Arc<S>> {
        let handle = self.handle_of::<S>()?;
        let entry = self.entries.get(handle.0)?;
        entry.any.clone().downcast::<S>().ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.service.name().to_string())
            .collect()
    }

    /// Dependency order, ties broken by registration order
    pub fn startup_order(&self) -> Result<Vec<ServiceHandle>> {
        let mut deps = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut resolved = Vec::new();
            for dep in entry.service.dependencies() {
                match self.by_type.get(&dep) {
                    Some(handle) => resolved.push(*handle),
                    None => {
                        return Err(Error::not_found(format!(
                            "service '{}' depends on a service that is not registered",
                            entry.service.name()
                        )))
                    }
                }
            }
            deps.push(resolved);
        }

        let mut placed = vec![false; self.entries.len()];
        let mut order = Vec::with_capacity(self.entries.len());
        while order.len() < self.entries.len() {
            let next = (0..self.entries.len())
                .find(|&i| !placed[i] && deps[i].iter().all(|d| placed[d.0]));
            match next {
                Some(i) => {
                    placed[i] = true;
                    order.push(ServiceHandle(i));
                }
                None => {
                    let stuck: Vec<&str> = (0..self.entries.len())
                        .filter(|&i| !placed[i])
                        .map(|i| self.entries[i].service.name())
                        .collect();
                    return Err(Error::Config(format!(
                        "service dependency cycle among: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }
        Ok(order)
    }

    /// Start every service in dependency order
    pub async fn start_all(&mut self, controller: &ControllerHandle) -> Result<()> {
        let order = self.startup_order()?;
        let mut started = Vec::with_capacity(order.len());
        for handle in order {
            let service = self.entries[handle.0].service.clone();
            info!(service = service.name(), "starting service");
            if let Err(e) = service.clone().start(controller, self).await {
                error!(service = service.name(), "service failed to start: {}", e);
                self.started = started;
                return Err(e);
            }
            started.push(handle);
        }
        self.started = started;
        Ok(())
    }

    /// Stop started services in reverse start order
    pub async fn stop_all(&mut self) {
        let started = std::mem::take(&mut self.started);
        for handle in started.into_iter().rev() {
            let service = self.entries[handle.0].service.clone();
            info!(service = service.name(), "stopping service");
            if let Err(e) = service.stop().await {
                error!(service = service.name(), "service failed to stop cleanly: {}", e);
            }
        }
    }

    pub fn type_of(&self, handle: ServiceHandle) -> Option<TypeId> {
        self.entries.get(handle.0).map(|entry| entry.type_id)
    }
}

impl std::fmt::Debug for ServiceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCatalog")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use ofc_core::ControllerConfig;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Base {
        journal: Journal,
    }

    struct Dependent {
        journal: Journal,
    }

    #[async_trait]
    impl Service for Base {
        fn name(&self) -> &str {
            "base"
        }

        async fn start(self: Arc<Self>, _controller: &ControllerHandle, _catalog: &ServiceCatalog) -> Result<()> {
            self.journal.lock().unwrap().push("start base".into());
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.journal.lock().unwrap().push("stop base".into());
            Ok(())
        }
    }

    #[async_trait]
    impl Service for Dependent {
        fn name(&self) -> &str {
            "dependent"
        }

        fn dependencies(&self) -> Vec<TypeId> {
            vec![TypeId::of::<Base>()]
        }

        async fn start(self: Arc<Self>, _controller: &ControllerHandle, catalog: &ServiceCatalog) -> Result<()> {
            // the dependency is reachable while starting
            assert!(catalog.get_service::<Base>().is_some());
            self.journal.lock().unwrap().push("start dependent".into());
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.journal.lock().unwrap().push("stop dependent".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dependency_order_start_and_reverse_stop() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let controller = Controller::new(ControllerConfig::default()).unwrap();

        let mut catalog = ServiceCatalog::new();
        // registered before its dependency
        catalog
            .register(Arc::new(Dependent {
                journal: journal.clone(),
            }))
            .unwrap();
        catalog
            .register(Arc::new(Base {
                journal: journal.clone(),
            }))
            .unwrap();

        catalog.start_all(&controller.handle()).await.unwrap();
        catalog.stop_all().await;

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["start base", "start dependent", "stop dependent", "stop base"]
        );
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let mut catalog = ServiceCatalog::new();
        catalog
            .register(Arc::new(Dependent {
                journal: Arc::new(Mutex::new(Vec::new())),
            }))
            .unwrap();
        assert!(matches!(catalog.startup_order(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_lookup_by_type_and_handle() {
        let mut catalog = ServiceCatalog::new();
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let handle = catalog.register(Arc::new(Base { journal: journal.clone() })).unwrap();

        assert_eq!(catalog.handle_of::<Base>(), Some(handle));
        assert_eq!(catalog.get(handle).map(|s| s.name().to_string()), Some("base".into()));
        assert!(catalog.get_service::<Dependent>().is_none());
        assert!(catalog.register(Arc::new(Base { journal })).is_err());
        assert_eq!(catalog.type_of(handle), Some(TypeId::of::<Base>()));
    }
}
