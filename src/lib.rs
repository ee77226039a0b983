//! Nearby Client Library
//!
//! Session, offline roster cache and background sync engine for the Nearby
//! location-sharing service.

pub mod api;
pub mod auth;
pub mod cache;
pub mod commands;
pub mod config;
pub mod jobs;
pub mod location;
pub mod logging;
pub mod pipeline;
pub mod quiet_hours;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod sharing;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use api::ApiClient;
use auth::TokenStore;
use cache::LocalCache;
use config::ClientConfig;
use jobs::{LocationUpdateJob, RosterSyncJob};
use location::{
    AlwaysOnline, Clock, Connectivity, FixedLocationProvider, LocationProvider, LogNotifier,
    Notifier, PermissionGate, SystemClock, TcpProbe,
};
use pipeline::RequestPipeline;
use refresh::RefreshCoordinator;
use scheduler::{ExistingJobPolicy, SyncScheduler};
use session::SessionManager;
use sharing::SharingManager;
use storage::SecureStorage;
use transport::{HttpTransport, ReqwestTransport, TransportError};

const CONNECTIVITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Host services the engine depends on
#[derive(Clone)]
pub struct Platform {
    pub location: Arc<dyn LocationProvider>,
    pub permission: Arc<dyn PermissionGate>,
    pub notifier: Arc<dyn Notifier>,
    pub connectivity: Arc<dyn Connectivity>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    /// Desktop implementations: configured location, log notifications,
    /// TCP reachability of the API host, local wall clock
    pub fn desktop(config: &ClientConfig) -> Self {
        let location = Arc::new(FixedLocationProvider::new(config.fixed_location));
        let connectivity: Arc<dyn Connectivity> =
            match TcpProbe::for_url(&config.api_url, CONNECTIVITY_PROBE_TIMEOUT) {
                Some(probe) => Arc::new(probe),
                None => Arc::new(AlwaysOnline),
            };

        Self {
            location: location.clone(),
            permission: location,
            notifier: Arc::new(LogNotifier),
            connectivity,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Process-wide singletons
pub struct AppState {
    pub store: Arc<TokenStore>,
    pub api: Arc<ApiClient>,
    pub cache: Arc<LocalCache>,
    pub sessions: Arc<SessionManager>,
    pub sharing: Arc<SharingManager>,
    pub scheduler: Arc<SyncScheduler>,
    pub platform: Platform,
}

impl AppState {
    /// Wire the engine against the real HTTP transport
    pub fn new(config: &ClientConfig, platform: Platform) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(&config.api_url, &config.upload_url, config.http_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport), platform))
    }

    pub fn with_transport(
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
        platform: Platform,
    ) -> Self {
        let storage = SecureStorage::at(&config.data_dir);
        let store = Arc::new(TokenStore::open(storage.clone()));
        let refresher = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            &config.api_key,
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            transport,
            store.clone(),
            refresher,
            &config.api_key,
        ));
        let api = Arc::new(ApiClient::new(pipeline));
        let cache = Arc::new(LocalCache::open(storage, api.clone(), store.clone()));
        let sessions = Arc::new(SessionManager::new(api.clone(), store.clone(), cache.clone()));
        let sharing = Arc::new(SharingManager::new(api.clone(), store.clone()));
        let scheduler = Arc::new(SyncScheduler::new(platform.connectivity.clone()));

        Self {
            store,
            api,
            cache,
            sessions,
            sharing,
            scheduler,
            platform,
        }
    }

    /// Schedule both periodic jobs, keeping any that already run
    pub fn start_background_sync(&self) {
        let roster = Arc::new(RosterSyncJob::new(self.store.clone(), self.cache.clone()));
        let location = Arc::new(LocationUpdateJob::new(
            self.store.clone(),
            self.cache.clone(),
            self.sharing.clone(),
            self.platform.location.clone(),
            self.platform.permission.clone(),
            self.platform.notifier.clone(),
            self.platform.clock.clone(),
        ));

        self.scheduler
            .enqueue_unique_periodic(roster, jobs::roster_sync_spec(), ExistingJobPolicy::Keep);
        self.scheduler.enqueue_unique_periodic(
            location,
            jobs::location_update_spec(),
            ExistingJobPolicy::Keep,
        );
        info!("Background sync started");
    }

    pub fn stop_background_sync(&self) {
        self.scheduler.cancel_unique(jobs::ROSTER_SYNC);
        self.scheduler.cancel_unique(jobs::LOCATION_UPDATE);
        info!("Background sync stopped");
    }
}
