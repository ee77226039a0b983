//! Offline-first roster cache.
//!
//! The roster is persisted as one value and mirrored in a watch channel.
//! Every replace swaps the whole list, so observers only ever see complete
//! generations.

use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, GeofenceList};
use crate::auth::{CurrentLocation, TokenStore, DEFAULT_RADIUS_M};
use crate::location::Fix;
use crate::storage::{SecureStorage, StorageError};

const ROSTER_KEY: &str = "roster";

/// A peer visible to the current user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub uid: String,
    pub name: String,
    pub updated: String,
    /// `0.0` together with `lon == 0.0` means "not disclosed"
    pub lat: f64,
    pub lon: f64,
    pub radius: f64,
    #[serde(default)]
    pub photo: String,
}

impl RosterEntry {
    pub fn has_location(&self) -> bool {
        Fix { lat: self.lat, lon: self.lon }.is_disclosed()
    }
}

pub type Roster = Arc<Vec<RosterEntry>>;

/// Result of a successful roster fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Roster replaced with this many entries
    Updated(usize),
    /// Server returned no peers; the user has to enable sharing first
    SharingRequired,
}

pub struct LocalCache {
    storage: SecureStorage,
    api: Arc<ApiClient>,
    store: Arc<TokenStore>,
    roster: watch::Sender<Roster>,
    write_lock: Mutex<()>,
}

impl LocalCache {
    /// Open the cache, seeding it with the persisted roster
    pub fn open(storage: SecureStorage, api: Arc<ApiClient>, store: Arc<TokenStore>) -> Self {
        let persisted = storage
            .load_optional::<Vec<RosterEntry>>(ROSTER_KEY)
            .unwrap_or_else(|e| {
                warn!("Discarding unreadable roster: {}", e);
                None
            })
            .unwrap_or_default();
        debug!("Roster cache opened with {} entries", persisted.len());

        let (roster, _) = watch::channel(Arc::new(persisted));
        Self {
            storage,
            api,
            store,
            roster,
            write_lock: Mutex::new(()),
        }
    }

    /// Current roster snapshot
    pub fn snapshot(&self) -> Roster {
        self.roster.borrow().clone()
    }

    /// Stream of roster snapshots.
    ///
    /// Yields the persisted roster immediately, then one snapshot per
    /// replace. Each call starts an independent stream.
    pub fn observe(&self) -> impl Stream<Item = Roster> + Send + 'static {
        let rx = self.roster.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        })
    }

    /// Fetch the roster and replace the cached one wholesale
    pub async fn refresh(&self, access_token: &str) -> Result<RefreshOutcome, ApiError> {
        let list = self.api.list_geofence(access_token).await?;
        self.apply(list)
    }

    fn apply(&self, list: GeofenceList) -> Result<RefreshOutcome, ApiError> {
        match &list.me {
            Some(me) => {
                self.store.set_sharing_enabled(true)?;
                let fix = Fix {
                    lat: me.lat.unwrap_or(0.0),
                    lon: me.lon.unwrap_or(0.0),
                };
                if fix.is_disclosed() {
                    self.store.set_current_location(Some(CurrentLocation {
                        lat: fix.lat,
                        lon: fix.lon,
                        radius: me.radius.unwrap_or(DEFAULT_RADIUS_M),
                    }))?;
                }
            }
            None => {
                debug!("No own geofence record, sharing is off");
                self.store.set_sharing_enabled(false)?;
            }
        }

        if list.list.is_empty() {
            warn!("Roster is empty, sharing must be enabled first");
            self.replace(Vec::new())?;
            return Ok(RefreshOutcome::SharingRequired);
        }

        let entries = merge_self(list);
        let count = entries.len();
        self.replace(entries)?;
        info!("Roster replaced with {} entries", count);
        Ok(RefreshOutcome::Updated(count))
    }

    /// Persist and publish a new roster generation
    pub fn replace(&self, entries: Vec<RosterEntry>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.storage.save(ROSTER_KEY, &entries)?;
        self.roster.send_replace(Arc::new(entries));
        Ok(())
    }

    /// Drop all cached rows
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.storage.delete(ROSTER_KEY)?;
        self.roster.send_replace(Arc::new(Vec::new()));
        Ok(())
    }
}

/// Build roster rows, filling the caller's own row from the `me` record
fn merge_self(list: GeofenceList) -> Vec<RosterEntry> {
    let me = list.me.as_ref().and_then(|me| {
        let fix = Fix {
            lat: me.lat.unwrap_or(0.0),
            lon: me.lon.unwrap_or(0.0),
        };
        fix.is_disclosed().then(|| (me.uid.as_str(), fix))
    });

    list.list
        .iter()
        .map(|peer| {
            let own = me.filter(|(uid, _)| *uid == peer.uid).map(|(_, fix)| fix);
            let fix = own.unwrap_or(Fix {
                lat: peer.lat.unwrap_or(0.0),
                lon: peer.lon.unwrap_or(0.0),
            });
            RosterEntry {
                uid: peer.uid.clone(),
                name: peer.name.clone(),
                updated: peer.updated.clone(),
                lat: fix.lat,
                lon: fix.lon,
                radius: peer.radius.unwrap_or(0.0),
                photo: peer.photo.clone(),
            }
        })
        .collect()
}
