//! Location sharing: geofence push and withdrawal.
//!
//! Keeps `CurrentLocation` in step with what the server last accepted. A
//! push the server rejects clears it; a network failure leaves it alone.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::auth::{CurrentLocation, TokenStore};
use crate::location::Fix;

pub struct SharingManager {
    api: Arc<ApiClient>,
    store: Arc<TokenStore>,
}

impl SharingManager {
    pub fn new(api: Arc<ApiClient>, store: Arc<TokenStore>) -> Self {
        Self { api, store }
    }

    /// Start sharing at `fix` with the given visibility radius
    pub async fn enable(&self, fix: Fix, radius: f64) -> Result<CurrentLocation, ApiError> {
        let location = self.push(fix, radius).await?;
        self.persist(|store| store.set_sharing_enabled(true));
        info!("Location sharing enabled");
        Ok(location)
    }

    /// Publish a new position with the persisted radius
    pub async fn push_location(&self, fix: Fix) -> Result<CurrentLocation, ApiError> {
        self.push(fix, self.store.radius()).await
    }

    /// Stop sharing and withdraw the geofence
    pub async fn disable(&self) -> Result<(), ApiError> {
        self.api.delete_geofence().await?;
        self.persist(|store| store.set_current_location(None));
        self.persist(|store| store.set_sharing_enabled(false));
        info!("Location sharing disabled");
        Ok(())
    }

    async fn push(&self, fix: Fix, radius: f64) -> Result<CurrentLocation, ApiError> {
        match self.api.update_geofence(fix.lat, fix.lon, radius).await {
            Ok(()) => {
                let location = CurrentLocation {
                    lat: fix.lat,
                    lon: fix.lon,
                    radius,
                };
                self.persist(|store| store.set_current_location(Some(location)));
                Ok(location)
            }
            Err(e @ ApiError::Server { .. }) => {
                warn!("Geofence update rejected: {}", e);
                self.persist(|store| store.set_current_location(None));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn persist(
        &self,
        write: impl FnOnce(&TokenStore) -> Result<(), crate::storage::StorageError>,
    ) {
        if let Err(e) = write(&self.store) {
            error!("Failed to persist sharing state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestPipeline;
    use crate::refresh::RefreshCoordinator;
    use crate::test_support::{json, session, store_in, ScriptedTransport, HERE};
    use crate::transport::{RequestBody, TransportError};
    use reqwest::StatusCode;

    fn manager(transport: Arc<ScriptedTransport>, store: Arc<TokenStore>) -> SharingManager {
        let refresher = Arc::new(RefreshCoordinator::new(transport.clone(), store.clone(), "key"));
        let pipeline = Arc::new(RequestPipeline::new(transport, store.clone(), refresher, "key"));
        SharingManager::new(Arc::new(ApiClient::new(pipeline)), store)
    }

    #[tokio::test]
    async fn enable_persists_location_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, r#"{"success":true}"#)));

        manager(transport, store.clone()).enable(HERE, 300.0).await.unwrap();

        assert!(store.sharing_enabled());
        assert_eq!(
            store.current_location(),
            Some(CurrentLocation { lat: 48.15, lon: 17.11, radius: 300.0 })
        );
    }

    #[tokio::test]
    async fn push_uses_persisted_radius() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        store
            .set_current_location(Some(CurrentLocation { lat: 1.0, lon: 1.0, radius: 750.0 }))
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, r#"{"success":true}"#)));

        manager(transport.clone(), store).push_location(HERE).await.unwrap();

        let RequestBody::Json(body) = &transport.requests()[0].body else {
            panic!("expected json body");
        };
        assert_eq!(body["radius"], 750.0);
    }

    #[tokio::test]
    async fn rejected_push_clears_current_location() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        store
            .set_current_location(Some(CurrentLocation { lat: 1.0, lon: 1.0, radius: 100.0 }))
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, r#"{"success":false}"#)));

        let result = manager(transport, store.clone()).push_location(HERE).await;

        assert!(matches!(result, Err(ApiError::Server { .. })));
        assert!(store.current_location().is_none());
    }

    #[tokio::test]
    async fn network_failure_keeps_current_location() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let previous = CurrentLocation { lat: 1.0, lon: 1.0, radius: 100.0 };
        store.set_current_location(Some(previous)).unwrap();
        let transport = Arc::new(ScriptedTransport::fallible(|_| Err(TransportError::Timeout)));

        let result = manager(transport, store.clone()).push_location(HERE).await;

        assert!(matches!(result, Err(ApiError::Transport(_))));
        assert_eq!(store.current_location(), Some(previous));
    }

    #[tokio::test]
    async fn disable_clears_location_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        store.set_sharing_enabled(true).unwrap();
        store
            .set_current_location(Some(CurrentLocation { lat: 1.0, lon: 1.0, radius: 100.0 }))
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, r#"{"success":true}"#)));

        manager(transport.clone(), store.clone()).disable().await.unwrap();

        assert_eq!(transport.requests()[0].method, reqwest::Method::DELETE);
        assert!(!store.sharing_enabled());
        assert!(store.current_location().is_none());
    }
}
