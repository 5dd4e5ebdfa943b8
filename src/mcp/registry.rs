use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::join_all;

use crate::mcp::config::EndpointConfig;
use crate::mcp::manager::{ConnectionManager, ManagerSettings};
use crate::mcp::transport::EndpointConnector;

/// Shared map from endpoint name to its connection manager.
///
/// Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    managers: Arc<RwLock<HashMap<String, Arc<ConnectionManager>>>>,
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.names())
            .finish()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one manager per endpoint and start them concurrently. A failed
    /// start is logged; that manager keeps retrying in the background.
    pub async fn from_config(endpoints: &[EndpointConfig], settings: &ManagerSettings) -> Self {
        let registry = Self::new();

        let managers: Vec<Arc<ConnectionManager>> = endpoints
            .iter()
            .map(|cfg| {
                let connector = Arc::new(EndpointConnector::new(cfg.clone()));
                let manager = Arc::new(ConnectionManager::new(
                    cfg.name.clone(),
                    connector,
                    settings.clone(),
                ));
                if let Some(previous) = registry.register(Arc::clone(&manager)) {
                    tracing::warn!(endpoint = %previous.name(), "duplicate endpoint name, later entry wins");
                }
                manager
            })
            .collect();

        let started = join_all(managers.iter().map(|m| async move { (m.name(), m.start().await) })).await;
        for (name, result) in started {
            match result {
                Ok(()) => tracing::info!(endpoint = %name, "endpoint connected"),
                Err(e) => tracing::warn!(endpoint = %name, error = %e, "endpoint start failed, retrying in background"),
            }
        }

        registry
    }

    /// Insert `manager` under its name, returning the one it replaced.
    pub fn register(&self, manager: Arc<ConnectionManager>) -> Option<Arc<ConnectionManager>> {
        let name = manager.name().to_string();
        self.managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, manager)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.managers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every manager; used at shutdown.
    pub async fn close_all(&self) {
        let managers: Vec<Arc<ConnectionManager>> = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for result in join_all(managers.iter().map(|m| m.close())).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "closing endpoint failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::manager::ConnectionState;
    use crate::mcp::manager::tests::MockConnector;
    use crate::mcp::transport::Connector;

    fn mock_manager(name: &str) -> Arc<ConnectionManager> {
        let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());
        Arc::new(ConnectionManager::new(name, connector, ManagerSettings::default()))
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = EndpointRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.register(mock_manager("time")).is_none());
        assert!(registry.register(mock_manager("amap")).is_none());
        assert_eq!(registry.names(), vec!["amap", "time"]);
        assert!(registry.lookup("time").is_some());
        assert!(registry.lookup("weather").is_none());

        assert!(registry.unregister("time").is_some());
        assert!(registry.unregister("time").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_and_clones_share_state() {
        let registry = EndpointRegistry::new();
        let handle = registry.clone();

        let first = mock_manager("time");
        registry.register(Arc::clone(&first));
        let replaced = handle.register(mock_manager("time")).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_terminates_managers() {
        let registry = EndpointRegistry::new();
        let manager = mock_manager("time");
        manager.start().await.unwrap();
        registry.register(Arc::clone(&manager));

        registry.close_all().await;
        assert_eq!(manager.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn test_from_config_keeps_failed_endpoints() {
        let endpoints = vec![EndpointConfig::subprocess(
            "missing",
            "/nonexistent/relay-endpoint-binary",
            Vec::new(),
        )];
        let registry = EndpointRegistry::from_config(&endpoints, &ManagerSettings::default()).await;

        let manager = registry.lookup("missing").unwrap();
        assert_ne!(manager.state(), ConnectionState::Ready);
        registry.close_all().await;
    }
}
