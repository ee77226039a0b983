//! Account flows that create, use or destroy the session.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::api::{ApiClient, ApiError, AuthResponse, Profile};
use crate::auth::{Session, TokenStore};
use crate::cache::LocalCache;

/// Result of a logout; the local session is gone either way
#[derive(Debug)]
pub struct LogoutOutcome {
    /// Server-side invalidation failed, if it did
    pub server_error: Option<ApiError>,
}

pub struct SessionManager {
    api: Arc<ApiClient>,
    store: Arc<TokenStore>,
    cache: Arc<LocalCache>,
}

impl SessionManager {
    pub fn new(api: Arc<ApiClient>, store: Arc<TokenStore>, cache: Arc<LocalCache>) -> Self {
        Self { api, store, cache }
    }

    pub fn current(&self) -> Option<Session> {
        self.store.get()
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<Session, ApiError> {
        let auth = self.api.register(name, email, password).await?;
        self.start(name, email, auth)
    }

    /// Log in by username or e-mail
    pub async fn login(&self, name_or_email: &str, password: &str) -> Result<Session, ApiError> {
        let auth = self.api.login(name_or_email, password).await?;
        let name = name_or_email
            .split_once('@')
            .map_or(name_or_email, |(local, _)| local);
        self.start(name, name_or_email, auth)
    }

    fn start(&self, name: &str, email: &str, auth: AuthResponse) -> Result<Session, ApiError> {
        let session = Session {
            name: name.to_string(),
            email: email.to_string(),
            uid: auth.uid,
            access_token: auth.access,
            refresh_token: auth.refresh,
            photo: String::new(),
        };
        self.store.put(Some(session.clone()))?;
        Ok(session)
    }

    /// Log out locally, telling the server on a best-effort basis
    pub async fn logout(&self) -> LogoutOutcome {
        let server_error = if self.store.access_token().is_some() {
            self.api.logout().await.err()
        } else {
            None
        };
        if let Some(e) = &server_error {
            warn!("Server logout failed, logging out locally: {}", e);
        }

        if let Err(e) = self.store.clear_session() {
            error!("Failed to clear session: {}", e);
        }
        if let Err(e) = self.cache.clear() {
            error!("Failed to clear roster cache: {}", e);
        }
        info!("Logged out");
        LogoutOutcome { server_error }
    }

    pub async fn reset_password(&self, email: &str) -> Result<(), ApiError> {
        self.api.reset_password(email).await
    }

    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), ApiError> {
        self.api.change_password(old_password, new_password).await
    }

    pub async fn profile(&self, uid: &str) -> Result<Profile, ApiError> {
        self.api.profile(uid).await
    }

    /// Upload a JPEG from disk as the profile photo
    pub async fn upload_photo(&self, path: &Path) -> Result<Profile, ApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ApiError::Validation(format!("Cannot read photo: {}", e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("photo.jpg");

        let profile = self.api.upload_photo(file_name, bytes).await?;
        self.store.update_photo(&profile.photo)?;
        Ok(profile)
    }

    pub async fn delete_photo(&self) -> Result<Profile, ApiError> {
        let profile = self.api.delete_photo().await?;
        self.store.update_photo("")?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestPipeline;
    use crate::refresh::RefreshCoordinator;
    use crate::storage::SecureStorage;
    use crate::test_support::{json, session, store_in, ScriptedTransport};
    use crate::transport::Endpoint;
    use reqwest::StatusCode;

    fn manager(
        dir: &Path,
        transport: Arc<ScriptedTransport>,
        store: Arc<TokenStore>,
    ) -> (SessionManager, Arc<LocalCache>) {
        let refresher = Arc::new(RefreshCoordinator::new(transport.clone(), store.clone(), "key"));
        let pipeline = Arc::new(RequestPipeline::new(transport, store.clone(), refresher, "key"));
        let api = Arc::new(ApiClient::new(pipeline));
        let cache = Arc::new(LocalCache::open(SecureStorage::at(dir), api.clone(), store.clone()));
        (SessionManager::new(api, store, cache.clone()), cache)
    }

    #[tokio::test]
    async fn login_with_email_derives_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None);
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::OK, r#"{"uid":"42","access":"a1","refresh":"r1"}"#)
        }));
        let (sessions, _) = manager(dir.path(), transport, store.clone());

        let session = sessions.login("anna@example.com", "pw").await.unwrap();

        assert_eq!(session.name, "anna");
        assert_eq!(session.email, "anna@example.com");
        assert_eq!(store.get(), Some(session));
    }

    #[tokio::test]
    async fn logout_clears_locally_even_if_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::INTERNAL_SERVER_ERROR, "")
        }));
        let (sessions, cache) = manager(dir.path(), transport, store.clone());
        cache
            .replace(vec![crate::cache::RosterEntry {
                uid: "7".into(),
                name: "ben".into(),
                updated: String::new(),
                lat: 0.0,
                lon: 0.0,
                radius: 100.0,
                photo: String::new(),
            }])
            .unwrap();

        let outcome = sessions.logout().await;

        assert!(outcome.server_error.is_some());
        assert!(store.get().is_none());
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn photo_upload_updates_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::OK, r#"{"id":"42","name":"anna","photo":"photos/42.jpg"}"#)
        }));
        let (sessions, _) = manager(dir.path(), transport.clone(), store.clone());
        let photo = dir.path().join("me.jpg");
        std::fs::write(&photo, [0xFF, 0xD8, 0xFF]).unwrap();

        let profile = sessions.upload_photo(&photo).await.unwrap();

        assert_eq!(profile.photo, "photos/42.jpg");
        assert_eq!(store.get().unwrap().photo, "photos/42.jpg");
        assert_eq!(transport.requests()[0].endpoint, Endpoint::Upload);
    }
}
