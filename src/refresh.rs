//! Single-flight access token renewal.
//!
//! Callers that received a 401 with the same stale token queue on a per-uid
//! lock. Whoever holds the lock first performs the network renewal and
//! commits the new pair to the [`TokenStore`] before releasing it; everyone
//! queued behind re-reads the store and joins that result instead of spending
//! the (possibly single-use) refresh token again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{Session, TokenStore};
use crate::storage::StorageError;
use crate::transport::{
    ApiRequest, HttpTransport, TransportError, HEADER_API_KEY, HEADER_USER,
};

pub const REFRESH_PATH: &str = "user/refresh.php";

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    uid: String,
    access: String,
    refresh: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("No session to refresh")]
    SessionCleared,

    #[error("Refresh token is empty")]
    MissingRefreshToken,

    #[error("Refresh rejected with status {0}")]
    Rejected(u16),

    #[error("Refresh response was empty or malformed: {0}")]
    EmptyResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct RefreshCoordinator {
    transport: Arc<dyn HttpTransport>,
    store: Arc<TokenStore>,
    api_key: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RefreshCoordinator {
    pub fn new(transport: Arc<dyn HttpTransport>, store: Arc<TokenStore>, api_key: &str) -> Self {
        Self {
            transport,
            store,
            api_key: api_key.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, uid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(uid.to_string()).or_default().clone()
    }

    /// Renew the tokens of `stale`, the session as it was when its request
    /// was rejected. Returns the session holding a fresh access token.
    pub async fn refresh(&self, stale: &Session) -> Result<Session, RefreshError> {
        let lock = self.lock_for(&stale.uid);
        let _guard = lock.lock().await;

        // Also covers a different user having logged in meanwhile.
        let Some(current) = self.store.get().filter(|s| s.uid == stale.uid) else {
            debug!("Session for user {} gone while waiting for refresh", stale.uid);
            return Err(RefreshError::SessionCleared);
        };

        if current.is_authenticated() && current.access_token != stale.access_token {
            debug!("Joined refresh already completed for user: {}", current.uid);
            return Ok(current);
        }

        if !current.can_refresh() {
            return Err(RefreshError::MissingRefreshToken);
        }

        let renewed = self.renew(&current).await?;
        let updated = self
            .store
            .update_tokens(&current.uid, &renewed.access, &renewed.refresh)?;
        match updated {
            Some(session) => {
                info!("Access token refreshed for user: {}", session.uid);
                Ok(session)
            }
            None => Err(RefreshError::SessionCleared),
        }
    }

    async fn renew(&self, session: &Session) -> Result<RefreshResponse, RefreshError> {
        let request = ApiRequest::post(REFRESH_PATH)
            .with_header(HEADER_API_KEY, &self.api_key)
            .with_header(HEADER_USER, &session.uid)
            .json(&RefreshRequest { refresh: &session.refresh_token })
            .map_err(|e| RefreshError::EmptyResponse(e.to_string()))?;

        let response = self.transport.send(request).await?;

        if !response.is_success() {
            warn!("Token refresh rejected: {}", response.status);
            return Err(RefreshError::Rejected(response.status.as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .map_err(|e| RefreshError::EmptyResponse(e.to_string()))?;

        if body.access.is_empty() {
            return Err(RefreshError::EmptyResponse("access token missing".into()));
        }
        if !body.uid.is_empty() && body.uid != session.uid {
            warn!("Refresh returned tokens for a different user: {}", body.uid);
            return Err(RefreshError::EmptyResponse("uid mismatch".into()));
        }

        Ok(body)
    }
}
