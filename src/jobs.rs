//! Background jobs: roster sync and location update.
//!
//! Both read the session at run time, so a logout between runs turns the
//! next run into a silent skip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::auth::{TokenStore, USER_COUNT_UNSAMPLED};
use crate::cache::{LocalCache, RefreshOutcome};
use crate::location::{Clock, LocationProvider, Notifier, PermissionGate};
use crate::scheduler::{Job, JobOutcome, PeriodicSpec};
use crate::sharing::SharingManager;

pub const ROSTER_SYNC: &str = "roster_sync";
pub const LOCATION_UPDATE: &str = "location_update";

pub fn roster_sync_spec() -> PeriodicSpec {
    PeriodicSpec::new(Duration::from_secs(60 * 60), Duration::from_secs(15 * 60))
}

pub fn location_update_spec() -> PeriodicSpec {
    PeriodicSpec::new(Duration::from_secs(30 * 60), Duration::from_secs(15 * 60))
}

/// Map a failed roster fetch onto a scheduler outcome
fn outcome_for(error: &ApiError) -> JobOutcome {
    if error.is_retryable() {
        JobOutcome::Retry
    } else {
        JobOutcome::Failure
    }
}

pub struct RosterSyncJob {
    store: Arc<TokenStore>,
    cache: Arc<LocalCache>,
}

impl RosterSyncJob {
    pub fn new(store: Arc<TokenStore>, cache: Arc<LocalCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl Job for RosterSyncJob {
    fn name(&self) -> &str {
        ROSTER_SYNC
    }

    async fn run(&self) -> JobOutcome {
        let Some(token) = self.store.access_token() else {
            debug!("Roster sync skipped, not logged in");
            return JobOutcome::Success;
        };
        if !self.store.sharing_enabled() {
            debug!("Roster sync skipped, sharing disabled");
            return JobOutcome::Success;
        }

        match self.cache.refresh(&token).await {
            Ok(RefreshOutcome::Updated(count)) => {
                debug!("Roster sync fetched {} entries", count);
                JobOutcome::Success
            }
            Ok(RefreshOutcome::SharingRequired) => JobOutcome::Success,
            Err(e) => {
                warn!("Roster sync failed: {}", e);
                outcome_for(&e)
            }
        }
    }
}

/// Change in roster size worth telling the user about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountChange {
    FirstSample(i64),
    Changed { delta: i64, total: i64 },
}

impl CountChange {
    pub fn title(&self) -> &'static str {
        match self {
            CountChange::FirstSample(_) => "Users around you",
            CountChange::Changed { .. } => "User count changed",
        }
    }

    pub fn message(&self) -> String {
        match *self {
            CountChange::FirstSample(total) => {
                format!("There are {} user(s) around you", total)
            }
            CountChange::Changed { delta, total } if delta > 0 => {
                format!("{} more user(s) nearby. Total around you: {}", delta, total)
            }
            CountChange::Changed { delta, total } => {
                format!("{} fewer user(s) nearby. Total around you: {}", -delta, total)
            }
        }
    }
}

/// Compare a fresh roster size against the last persisted one
pub fn count_delta(last: i64, current: i64) -> Option<CountChange> {
    if last == USER_COUNT_UNSAMPLED {
        Some(CountChange::FirstSample(current))
    } else if last != current {
        Some(CountChange::Changed {
            delta: current - last,
            total: current,
        })
    } else {
        None
    }
}

pub struct LocationUpdateJob {
    store: Arc<TokenStore>,
    cache: Arc<LocalCache>,
    sharing: Arc<SharingManager>,
    location: Arc<dyn LocationProvider>,
    permission: Arc<dyn PermissionGate>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl LocationUpdateJob {
    pub fn new(
        store: Arc<TokenStore>,
        cache: Arc<LocalCache>,
        sharing: Arc<SharingManager>,
        location: Arc<dyn LocationProvider>,
        permission: Arc<dyn PermissionGate>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            sharing,
            location,
            permission,
            notifier,
            clock,
        }
    }

    /// Whether the quiet-hours window rules this run out
    fn outside_window(&self) -> bool {
        let Some(window) = self.store.quiet_hours() else {
            return false;
        };
        match window.contains(self.clock.minute_of_day()) {
            Ok(inside) => !inside,
            Err(e) => {
                warn!("Ignoring quiet hours: {}", e);
                false
            }
        }
    }

    /// Fetch the roster and announce a change in its size
    async fn notify_count(&self, token: &str) {
        let count = match self.cache.refresh(token).await {
            Ok(RefreshOutcome::Updated(count)) => count as i64,
            Ok(RefreshOutcome::SharingRequired) => {
                debug!("Roster empty after location update");
                return;
            }
            Err(e) => {
                warn!("Roster fetch after location update failed: {}", e);
                return;
            }
        };

        if let Some(change) = count_delta(self.store.last_user_count(), count) {
            self.notifier.notify(change.title(), &change.message());
        }
        if let Err(e) = self.store.set_last_user_count(count) {
            warn!("Failed to persist user count: {}", e);
        }
    }
}

#[async_trait]
impl Job for LocationUpdateJob {
    fn name(&self) -> &str {
        LOCATION_UPDATE
    }

    async fn run(&self) -> JobOutcome {
        if self.store.access_token().is_none()
            || !self.store.auto_update_enabled()
            || !self.store.sharing_enabled()
        {
            debug!("Location update skipped");
            return JobOutcome::Success;
        }
        if self.outside_window() {
            debug!("Location update skipped, outside the update window");
            return JobOutcome::Success;
        }
        if !self.permission.location_granted() {
            warn!("Location permission not granted");
            return JobOutcome::Failure;
        }
        let Some(fix) = self.location.last_known().await else {
            debug!("No location fix yet");
            return JobOutcome::Retry;
        };

        if let Err(e) = self.sharing.push_location(fix).await {
            warn!("Location push failed: {}", e);
            return JobOutcome::Retry;
        }
        info!("Location pushed");

        // The push may have refreshed the token.
        if let Some(token) = self.store.access_token() {
            self.notify_count(&token).await;
        }
        JobOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_always_reported() {
        let change = count_delta(USER_COUNT_UNSAMPLED, 5).unwrap();

        assert_eq!(change, CountChange::FirstSample(5));
        assert_eq!(change.title(), "Users around you");
        assert_eq!(change.message(), "There are 5 user(s) around you");
    }

    #[test]
    fn increase_and_decrease_are_worded() {
        let up = count_delta(5, 8).unwrap();
        let down = count_delta(8, 3).unwrap();

        assert_eq!(up.message(), "3 more user(s) nearby. Total around you: 8");
        assert_eq!(down.message(), "5 fewer user(s) nearby. Total around you: 3");
        assert_eq!(down.title(), "User count changed");
    }

    #[test]
    fn unchanged_count_is_silent() {
        assert_eq!(count_delta(8, 8), None);
    }

    #[test]
    fn first_sample_of_zero_is_reported() {
        assert_eq!(count_delta(USER_COUNT_UNSAMPLED, 0), Some(CountChange::FirstSample(0)));
    }

    #[test]
    fn validation_errors_are_not_retried() {
        assert_eq!(outcome_for(&ApiError::Validation("x".into())), JobOutcome::Failure);
        assert_eq!(outcome_for(&ApiError::EmptyResponse("geofence list".into())), JobOutcome::Retry);
    }
}
