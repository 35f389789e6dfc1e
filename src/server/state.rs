use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::{ClusterBackend, ClusterClient, DryRunClusterClient, KubectlClient};
use crate::config::{IngressStoreKind, Settings};
use crate::ingress::{
    FileIngressStore, IngressDocument, IngressRegistry, IngressStore, MemoryIngressStore,
};
use crate::room::RoomController;
use crate::store::{load_inventory_file, InMemoryStore, StoreError};

/// Failures while wiring the server together
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Failed to load inventory: {0}")]
    Inventory(#[from] StoreError),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RoomController>,
    /// Present when the server owns its room records
    pub store: Option<Arc<InMemoryStore>>,
}

impl AppState {
    pub fn new(controller: Arc<RoomController>) -> Self {
        Self {
            controller,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<InMemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the controller and its collaborators from settings
    pub async fn from_settings(settings: &Settings) -> Result<Self, StartupError> {
        let store = match &settings.rooms.inventory {
            Some(path) => {
                let inventory = load_inventory_file(path)?;
                info!(
                    "Loaded inventory from {} ({} rooms, {} devices)",
                    path.display(),
                    inventory.rooms.len(),
                    inventory.devices.len()
                );
                InMemoryStore::from_inventory(inventory)
            }
            None => {
                warn!("No inventory configured; every room lookup will fail");
                InMemoryStore::new()
            }
        };
        let store = Arc::new(store);

        let cluster: Arc<dyn ClusterClient> = match settings.cluster.backend {
            ClusterBackend::Kubectl => Arc::new(KubectlClient::new(settings.kubectl_config())),
            ClusterBackend::DryRun => {
                info!("Cluster backend is dry-run; no workload will be touched");
                Arc::new(DryRunClusterClient::new().with_timeout(settings.call_timeout()))
            }
        };

        let ingress_store: Arc<dyn IngressStore> = match settings.ingress.store {
            IngressStoreKind::File => {
                let file = FileIngressStore::new(&settings.ingress.file);
                if let Err(e) = file.load().await {
                    warn!(
                        "Ingress document {} is not usable yet: {}",
                        settings.ingress.file.display(),
                        e
                    );
                }
                Arc::new(file)
            }
            IngressStoreKind::Memory => Arc::new(MemoryIngressStore::new(
                IngressDocument::with_host("or-ecosystem", &settings.ingress.host),
            )),
        };
        let ingress = IngressRegistry::new(ingress_store)
            .with_host(settings.ingress.host.clone())
            .with_max_attempts(settings.ingress.cas_attempts);

        let controller = RoomController::new(
            store.clone(),
            store.clone(),
            cluster,
            Arc::new(ingress),
            settings.controller_config(),
        );

        Ok(Self::new(Arc::new(controller)).with_store(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterBackend;

    #[tokio::test]
    async fn test_from_settings_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = dir.path().join("inventory.yaml");
        std::fs::write(
            &inventory,
            "rooms:\n  - id: 1\n    uuid: 6f1c2a4e-8d7b-4c1a-9e2f-3b5d7a9c1e20\n    name: OR 1\n",
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.cluster.backend = ClusterBackend::DryRun;
        settings.ingress.store = IngressStoreKind::Memory;
        settings.rooms.inventory = Some(inventory);

        let state = AppState::from_settings(&settings).await.unwrap();
        let status = state.controller.status(1).await.unwrap();
        assert!(status.unsaved_changes);
        assert!(state.store.is_some());
    }

    #[tokio::test]
    async fn test_from_settings_bad_inventory() {
        let mut settings = Settings::default();
        settings.rooms.inventory = Some("/nonexistent/inventory.yaml".into());

        let result = AppState::from_settings(&settings).await;
        assert!(matches!(result, Err(StartupError::Inventory(_))));
    }
}
