//! Request pipeline.
//!
//! Every outbound call passes through [`RequestPipeline::execute`], which
//! adds the API key and bearer token, and on a 401 drives one token refresh
//! followed by exactly one resend. Status codes other than 401 are returned
//! untouched; mapping them to domain errors is up to the caller.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::auth::{Session, TokenStore};
use crate::refresh::RefreshCoordinator;
use crate::transport::{
    ApiRequest, ApiResponse, HttpTransport, TransportError, HEADER_API_KEY,
    HEADER_AUTHORIZATION,
};

pub struct RequestPipeline {
    transport: Arc<dyn HttpTransport>,
    store: Arc<TokenStore>,
    refresher: Arc<RefreshCoordinator>,
    api_key: String,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<TokenStore>,
        refresher: Arc<RefreshCoordinator>,
        api_key: &str,
    ) -> Self {
        Self {
            transport,
            store,
            refresher,
            api_key: api_key.to_string(),
        }
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let session = self.store.get();
        let outgoing = self.prepare(&request, session.as_ref());
        let sent_token = outgoing.bearer_token().map(str::to_string);

        let response = self.transport.send(outgoing).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let Some(session) = session.filter(Session::can_refresh) else {
            debug!("401 on {} with nothing to refresh", request.path);
            return Ok(response);
        };

        // The token that was actually rejected, which may be a caller-supplied one.
        let stale = Session {
            access_token: sent_token.unwrap_or_else(|| session.access_token.clone()),
            ..session
        };

        match self.refresher.refresh(&stale).await {
            Ok(renewed) => {
                debug!("Retrying {} with refreshed token", request.path);
                let retry = self
                    .with_api_key(request)
                    .bearer(&renewed.access_token);
                self.transport.send(retry).await
            }
            Err(e) => {
                warn!("Token refresh failed, logging out user {}: {}", stale.uid, e);
                if let Err(e) = self.store.clear_session_if(&stale.uid) {
                    error!("Failed to clear session after refresh failure: {}", e);
                }
                Ok(response)
            }
        }
    }

    fn prepare(&self, request: &ApiRequest, session: Option<&Session>) -> ApiRequest {
        let mut outgoing = self.with_api_key(request.clone());
        if outgoing.header(HEADER_AUTHORIZATION).is_none() {
            if let Some(session) = session.filter(|s| s.is_authenticated()) {
                outgoing = outgoing.bearer(&session.access_token);
            }
        }
        outgoing
    }

    fn with_api_key(&self, mut request: ApiRequest) -> ApiRequest {
        if request.header(HEADER_API_KEY).is_none() {
            request.set_header(HEADER_API_KEY, &self.api_key);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::REFRESH_PATH;
    use crate::test_support::{json, session, store_in, ScriptedTransport};
    use reqwest::StatusCode;

    fn pipeline(
        transport: Arc<ScriptedTransport>,
        store: Arc<TokenStore>,
    ) -> RequestPipeline {
        let refresher = Arc::new(RefreshCoordinator::new(transport.clone(), store.clone(), "key"));
        RequestPipeline::new(transport, store, refresher, "key")
    }

    #[tokio::test]
    async fn adds_api_key_and_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, "{}")));

        pipeline(transport.clone(), store)
            .execute(ApiRequest::get("geofence/list.php"))
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.header(HEADER_API_KEY), Some("key"));
        assert_eq!(sent.bearer_token(), Some("a1"));
    }

    #[tokio::test]
    async fn caller_headers_win() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, "{}")));

        pipeline(transport.clone(), store)
            .execute(
                ApiRequest::get("geofence/list.php")
                    .bearer("explicit")
                    .with_header(HEADER_API_KEY, "other"),
            )
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.header(HEADER_API_KEY), Some("other"));
        assert_eq!(sent.bearer_token(), Some("explicit"));
    }

    #[tokio::test]
    async fn no_bearer_without_access_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, "{}")));

        pipeline(transport.clone(), store)
            .execute(ApiRequest::post("user/login.php"))
            .await
            .unwrap();

        assert!(transport.requests()[0].header(HEADER_AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn non_401_errors_pass_through_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#)
        }));

        let response = pipeline(transport.clone(), store)
            .execute(ApiRequest::get("geofence/list.php"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_token_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "")));
        let transport = Arc::new(ScriptedTransport::tokens_rotate());

        let response = pipeline(transport.clone(), store.clone())
            .execute(ApiRequest::get("geofence/list.php"))
            .await
            .unwrap();

        assert!(response.is_unauthorized());
        assert!(transport.requests_to(REFRESH_PATH).is_empty());
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::fallible(|_| {
            Err(TransportError::Network("offline".into()))
        }));

        let result = pipeline(transport.clone(), store)
            .execute(ApiRequest::get("geofence/list.php"))
            .await;

        assert!(matches!(result, Err(TransportError::Network(_))));
        assert_eq!(transport.requests().len(), 1);
    }
}
