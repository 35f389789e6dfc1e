//! Serialized, version-checked route registration

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{IngressError, IngressStore, DEFAULT_INGRESS_HOST};
use crate::manifest::{render_ingress_patch, Descriptor, IngressRoute};

/// Default number of read-modify-write attempts before giving up
pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// What `register_route` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteChange {
    Added,
    AlreadyPresent,
}

/// Adds room routes to the shared ingress document.
///
/// One registry per process. Its mutex orders local callers; the store's
/// version check catches writers outside the process.
pub struct IngressRegistry {
    store: Arc<dyn IngressStore>,
    host: String,
    max_attempts: u32,
    lock: Mutex<()>,
}

impl IngressRegistry {
    pub fn new(store: Arc<dyn IngressStore>) -> Self {
        Self {
            store,
            host: DEFAULT_INGRESS_HOST.to_string(),
            max_attempts: DEFAULT_CAS_ATTEMPTS,
            lock: Mutex::new(()),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ensure the room's stream path is routed to its service
    pub async fn register_route(
        &self,
        room_uuid: &Uuid,
        port: u16,
    ) -> Result<RouteChange, IngressError> {
        let route = render_ingress_patch(room_uuid, port);
        self.register(&route).await
    }

    pub async fn register(&self, route: &IngressRoute) -> Result<RouteChange, IngressError> {
        let _guard = self.lock.lock().await;

        for attempt in 1..=self.max_attempts {
            let (mut document, version) = self.store.load().await?;

            if !document.add_route(&self.host, route)? {
                debug!("Ingress route {} already present", route.path);
                return Ok(RouteChange::AlreadyPresent);
            }

            match self.store.store(&document, &version).await {
                Ok(_) => {
                    info!(
                        "Added ingress route {} -> {}:{}",
                        route.path, route.service, route.port
                    );
                    return Ok(RouteChange::Added);
                }
                Err(IngressError::VersionMismatch { expected, found }) => {
                    warn!(
                        "Ingress document changed during update (attempt {}/{}, {} -> {}), retrying",
                        attempt, self.max_attempts, expected, found
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(IngressError::Contended {
            attempts: self.max_attempts,
        })
    }

    /// The current document, ready to hand to the cluster
    pub async fn descriptor(&self) -> Result<Descriptor, IngressError> {
        let (document, _) = self.store.load().await?;
        document.to_descriptor()
    }

    /// Paths currently routed under the configured host
    pub async fn routes(&self) -> Result<Vec<String>, IngressError> {
        let (document, _) = self.store.load().await?;
        Ok(document.paths_for(&self.host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::{IngressDocument, IngressVersion, MemoryIngressStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> (Arc<MemoryIngressStore>, IngressRegistry) {
        let store = Arc::new(MemoryIngressStore::new(IngressDocument::with_host(
            "or-ecosystem",
            DEFAULT_INGRESS_HOST,
        )));
        let registry = IngressRegistry::new(store.clone());
        (store, registry)
    }

    #[tokio::test]
    async fn test_register_route_is_idempotent() {
        let (_, registry) = registry();
        let u = Uuid::new_v4();

        assert_eq!(
            registry.register_route(&u, 8007).await.unwrap(),
            RouteChange::Added
        );
        assert_eq!(
            registry.register_route(&u, 8007).await.unwrap(),
            RouteChange::AlreadyPresent
        );
        assert_eq!(
            registry.routes().await.unwrap(),
            vec![format!("/ws/medical-device/{}", u)]
        );
    }

    #[tokio::test]
    async fn test_descriptor_reflects_registered_routes() {
        let (_, registry) = registry();
        let u = Uuid::new_v4();
        registry.register_route(&u, 8007).await.unwrap();

        let descriptor = registry.descriptor().await.unwrap();
        assert_eq!(descriptor.name, "or-ecosystem");
        assert!(descriptor
            .content
            .contains(&format!("/ws/medical-device/{}", u)));
    }

    #[tokio::test]
    async fn test_concurrent_registrations_all_land() {
        let (store, registry) = registry();
        let registry = Arc::new(registry);
        let rooms: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();

        let tasks: Vec<_> = rooms
            .iter()
            .enumerate()
            .map(|(i, u)| {
                let registry = registry.clone();
                let u = *u;
                tokio::spawn(async move { registry.register_route(&u, 8000 + i as u16).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let paths = store.snapshot().await.paths_for(DEFAULT_INGRESS_HOST);
        assert_eq!(paths.len(), rooms.len());
    }

    #[tokio::test]
    async fn test_missing_host_rule_is_error() {
        let (_, registry) = registry();
        let registry = registry.with_host("unknown.example");
        let result = registry.register_route(&Uuid::new_v4(), 8001).await;
        assert!(matches!(result, Err(IngressError::MissingHostRule { .. })));
    }

    /// Lets an "external" writer slip in before the first `n` stores
    struct Interfering {
        inner: MemoryIngressStore,
        remaining: AtomicU32,
    }

    #[async_trait]
    impl IngressStore for Interfering {
        async fn load(&self) -> Result<(IngressDocument, IngressVersion), IngressError> {
            self.inner.load().await
        }

        async fn store(
            &self,
            document: &IngressDocument,
            expected: &IngressVersion,
        ) -> Result<IngressVersion, IngressError> {
            if self.remaining.load(Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                let mut external = self.inner.snapshot().await;
                external.add_route(
                    DEFAULT_INGRESS_HOST,
                    &render_ingress_patch(&Uuid::new_v4(), 9000),
                )?;
                self.inner.replace(external).await;
            }
            self.inner.store(document, expected).await
        }
    }

    #[tokio::test]
    async fn test_external_write_causes_retry_not_lost_update() {
        let store = Arc::new(Interfering {
            inner: MemoryIngressStore::new(IngressDocument::with_host(
                "or-ecosystem",
                DEFAULT_INGRESS_HOST,
            )),
            remaining: AtomicU32::new(2),
        });
        let registry = IngressRegistry::new(store.clone());
        let u = Uuid::new_v4();

        assert_eq!(
            registry.register_route(&u, 8007).await.unwrap(),
            RouteChange::Added
        );

        let paths = store.inner.snapshot().await.paths_for(DEFAULT_INGRESS_HOST);
        // two external routes plus ours
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&format!("/ws/medical-device/{}", u)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = Arc::new(Interfering {
            inner: MemoryIngressStore::new(IngressDocument::with_host(
                "or-ecosystem",
                DEFAULT_INGRESS_HOST,
            )),
            remaining: AtomicU32::new(u32::MAX),
        });
        let registry = IngressRegistry::new(store).with_max_attempts(3);

        let result = registry.register_route(&Uuid::new_v4(), 8007).await;
        assert!(matches!(result, Err(IngressError::Contended { attempts: 3 })));
    }
}
