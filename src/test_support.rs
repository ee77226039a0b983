//! Fakes for unit and integration tests.
//!
//! Compiled for `cfg(test)` and for the `test-utils` feature. Not for
//! production use.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::auth::{Session, TokenStore};
use crate::config::ClientConfig;
use crate::location::{AlwaysOnline, Clock, FixedLocationProvider, Fix, Notifier};
use crate::refresh::REFRESH_PATH;
use crate::storage::SecureStorage;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};
use crate::{AppState, Platform};

/// Position every fake platform reports
pub const HERE: Fix = Fix { lat: 48.15, lon: 17.11 };

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and recording every request
pub struct ScriptedTransport {
    handler: Box<Handler>,
    delays: Mutex<Vec<(String, Duration)>>,
    log: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static) -> Self {
        Self::fallible(move |req| Ok(handler(req)))
    }

    pub fn fallible(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delays: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Server that accepts only access token `a2` and rotates `r1` to `a2/r2`
    pub fn tokens_rotate() -> Self {
        Self::new(|req| {
            if req.path == REFRESH_PATH {
                return json(
                    StatusCode::OK,
                    r#"{"uid":"42","access":"a2","refresh":"r2"}"#,
                );
            }
            match req.bearer_token() {
                Some("a2") => json(StatusCode::OK, "{}"),
                _ => ApiResponse::new(StatusCode::UNAUTHORIZED, ""),
            }
        })
    }

    /// Delay answers for `path` by `delay`
    pub fn with_delay(self, path: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .push((path.to_string(), delay));
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.log.lock().unwrap().push(request.clone());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| *p == request.path)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }
}

pub fn json(status: StatusCode, body: &str) -> ApiResponse {
    ApiResponse::new(status, body.as_bytes().to_vec())
}

/// Session for user `42` with the given token pair
pub fn session(access: &str, refresh: &str) -> Session {
    Session {
        name: "anna".into(),
        email: "anna@example.com".into(),
        uid: "42".into(),
        access_token: access.into(),
        refresh_token: refresh.into(),
        photo: String::new(),
    }
}

/// Store in `dir` preloaded with `session`
pub fn store_in(dir: &std::path::Path, session: Option<Session>) -> Arc<TokenStore> {
    let store = Arc::new(TokenStore::open(SecureStorage::at(dir)));
    store.put(session).expect("persist session");
    store
}

/// Notifier that keeps every `(title, message)` pair
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, message: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }
}

/// Clock stuck at a settable minute of the day
pub struct FixedClock {
    minute: AtomicU32,
}

impl FixedClock {
    pub fn at(hours: u32, minutes: u32) -> Self {
        Self { minute: AtomicU32::new(hours * 60 + minutes) }
    }

    pub fn set(&self, hours: u32, minutes: u32) {
        self.minute.store(hours * 60 + minutes, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn minute_of_day(&self) -> u32 {
        self.minute.load(Ordering::SeqCst)
    }
}

/// Config rooted at `dir` with a fixed API key
pub fn config_in(dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        api_url: "http://nearby.test".into(),
        upload_url: "http://upload.nearby.test".into(),
        api_key: "key".into(),
        http_timeout: Duration::from_secs(5),
        data_dir: dir.to_path_buf(),
        fixed_location: Some(HERE),
    }
}

/// Platform that is always online, located at `fix` and stuck at `clock`
pub fn platform(fix: Option<Fix>, clock: Arc<FixedClock>) -> (Platform, Arc<RecordingNotifier>) {
    let location = Arc::new(FixedLocationProvider::new(fix));
    let notifier = Arc::new(RecordingNotifier::default());
    let platform = Platform {
        location: location.clone(),
        permission: location,
        notifier: notifier.clone(),
        connectivity: Arc::new(AlwaysOnline),
        clock,
    };
    (platform, notifier)
}

/// Fully wired engine over `transport`, located at [`HERE`] at noon
pub fn app_in(
    dir: &std::path::Path,
    transport: Arc<dyn HttpTransport>,
) -> (AppState, Arc<RecordingNotifier>) {
    let (platform, notifier) = platform(Some(HERE), Arc::new(FixedClock::at(12, 0)));
    let app = AppState::with_transport(&config_in(dir), transport, platform);
    (app, notifier)
}
