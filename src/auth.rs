//! Authentication Module
//!
//! Holds the current session (identity + token pair) and the small set of
//! persisted client flags. All reads and writes go through one mutex so a
//! write that has returned is visible to every later read in the process.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::quiet_hours::QuietHours;
use crate::storage::{SecureStorage, StorageError};

const SESSION_KEY: &str = "session";
const PREFERENCES_KEY: &str = "preferences";

/// Geofence radius used when none has been persisted yet, in meters
pub const DEFAULT_RADIUS_M: f64 = 100.0;

/// `last_user_count` value meaning the roster size was never sampled
pub const USER_COUNT_UNSAMPLED: i64 = -1;

/// Logged-in identity plus its token pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub email: String,
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub photo: String,
}

impl Session {
    /// A session with an empty access token cannot authorize requests
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn can_refresh(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// Own position last accepted by the server
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentLocation {
    pub lat: f64,
    pub lon: f64,
    pub radius: f64,
}

/// Persisted client flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub sharing_enabled: bool,
    pub auto_update_enabled: bool,
    pub current_location: Option<CurrentLocation>,
    pub last_user_count: i64,
    pub quiet_hours: Option<QuietHours>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            sharing_enabled: false,
            auto_update_enabled: false,
            current_location: None,
            last_user_count: USER_COUNT_UNSAMPLED,
            quiet_hours: None,
        }
    }
}

struct StoreState {
    session: Option<Session>,
    prefs: Preferences,
}

/// Durable, mutex-guarded session and flag storage
pub struct TokenStore {
    storage: SecureStorage,
    state: Mutex<StoreState>,
}

impl TokenStore {
    /// Open the store, loading whatever was persisted by a previous run
    pub fn open(storage: SecureStorage) -> Self {
        let session = storage
            .load_optional::<Session>(SESSION_KEY)
            .unwrap_or_else(|e| {
                warn!("Discarding unreadable stored session: {}", e);
                None
            });
        let prefs = storage
            .load_optional::<Preferences>(PREFERENCES_KEY)
            .unwrap_or_else(|e| {
                warn!("Discarding unreadable preferences: {}", e);
                None
            })
            .unwrap_or_default();

        if let Some(session) = &session {
            info!("Restored session for user: {}", session.uid);
        }

        Self {
            storage,
            state: Mutex::new(StoreState { session, prefs }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session, if logged in
    pub fn get(&self) -> Option<Session> {
        self.state().session.clone()
    }

    /// Non-empty access token of the current session
    pub fn access_token(&self) -> Option<String> {
        self.get()
            .filter(Session::is_authenticated)
            .map(|s| s.access_token)
    }

    /// Replace the session; `None` logs out
    pub fn put(&self, session: Option<Session>) -> Result<(), StorageError> {
        let mut state = self.state();
        match &session {
            Some(s) => {
                self.storage.save(SESSION_KEY, s)?;
                info!("Session set for user: {}", s.uid);
            }
            None => {
                self.storage.delete(SESSION_KEY)?;
                info!("Session cleared");
            }
        }
        state.session = session;
        Ok(())
    }

    /// Swap in a renewed token pair for user `uid`, keeping identity fields.
    ///
    /// Returns the updated session, or `None` when no session for `uid`
    /// exists anymore.
    pub fn update_tokens(
        &self,
        uid: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Option<Session>, StorageError> {
        let mut state = self.state();
        let Some(current) = state.session.as_ref().filter(|s| s.uid == uid) else {
            debug!("Token update skipped, no session for user: {}", uid);
            return Ok(None);
        };

        let updated = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            ..current.clone()
        };
        self.storage.save(SESSION_KEY, &updated)?;
        state.session = Some(updated.clone());
        debug!("Tokens updated for user: {}", updated.uid);
        Ok(Some(updated))
    }

    /// Update the profile photo path of the current session
    pub fn update_photo(&self, photo: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        if let Some(session) = state.session.as_mut() {
            session.photo = photo.to_string();
            self.storage.save(SESSION_KEY, &*session)?;
        }
        Ok(())
    }

    /// Tear down the session together with the own-location snapshot
    pub fn clear_session(&self) -> Result<(), StorageError> {
        let mut state = self.state();
        self.storage.delete(SESSION_KEY)?;
        state.session = None;
        if state.prefs.current_location.take().is_some() {
            self.storage.save(PREFERENCES_KEY, &state.prefs)?;
        }
        info!("Session and current location cleared");
        Ok(())
    }

    /// Tear down the session only while it still belongs to `uid`.
    ///
    /// Returns whether anything was cleared.
    pub fn clear_session_if(&self, uid: &str) -> Result<bool, StorageError> {
        let mut state = self.state();
        if !state.session.as_ref().is_some_and(|s| s.uid == uid) {
            debug!("Session no longer belongs to user {}, keeping it", uid);
            return Ok(false);
        }
        self.storage.delete(SESSION_KEY)?;
        state.session = None;
        if state.prefs.current_location.take().is_some() {
            self.storage.save(PREFERENCES_KEY, &state.prefs)?;
        }
        info!("Session and current location cleared for user: {}", uid);
        Ok(true)
    }

    /// Snapshot of all flags
    pub fn preferences(&self) -> Preferences {
        self.state().prefs.clone()
    }

    fn update_prefs(&self, apply: impl FnOnce(&mut Preferences)) -> Result<(), StorageError> {
        let mut state = self.state();
        let mut prefs = state.prefs.clone();
        apply(&mut prefs);
        if prefs != state.prefs {
            self.storage.save(PREFERENCES_KEY, &prefs)?;
            state.prefs = prefs;
        }
        Ok(())
    }

    pub fn sharing_enabled(&self) -> bool {
        self.state().prefs.sharing_enabled
    }

    pub fn set_sharing_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.update_prefs(|p| p.sharing_enabled = enabled)
    }

    pub fn auto_update_enabled(&self) -> bool {
        self.state().prefs.auto_update_enabled
    }

    pub fn set_auto_update_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.update_prefs(|p| p.auto_update_enabled = enabled)
    }

    pub fn current_location(&self) -> Option<CurrentLocation> {
        self.state().prefs.current_location
    }

    pub fn set_current_location(
        &self,
        location: Option<CurrentLocation>,
    ) -> Result<(), StorageError> {
        self.update_prefs(|p| p.current_location = location)
    }

    /// Radius of the persisted own location, or the default
    pub fn radius(&self) -> f64 {
        self.current_location()
            .map_or(DEFAULT_RADIUS_M, |loc| loc.radius)
    }

    pub fn last_user_count(&self) -> i64 {
        self.state().prefs.last_user_count
    }

    pub fn set_last_user_count(&self, count: i64) -> Result<(), StorageError> {
        self.update_prefs(|p| p.last_user_count = count)
    }

    pub fn quiet_hours(&self) -> Option<QuietHours> {
        self.state().prefs.quiet_hours.clone()
    }

    pub fn set_quiet_hours(&self, window: Option<QuietHours>) -> Result<(), StorageError> {
        self.update_prefs(|p| p.quiet_hours = window)
    }
}
