//! Commands Module
//!
//! UI-facing facade. Every command returns a [`CommandResult`] carrying a
//! human-readable message instead of an error, so callers branch on
//! `success` rather than unwinding.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::auth::Session;
use crate::cache::RefreshOutcome;
use crate::location::Fix;
use crate::quiet_hours::QuietHours;
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl<E: std::fmt::Display> From<Result<CommandResult, E>> for CommandResult {
    fn from(result: Result<CommandResult, E>) -> Self {
        result.unwrap_or_else(|e| CommandResult::failed(e.to_string()))
    }
}

/// Session fields safe to hand to the UI (no tokens)
fn session_view(session: &Session) -> Value {
    json!({
        "uid": session.uid,
        "name": session.name,
        "email": session.email,
        "photo": session.photo,
    })
}

pub fn get_stored_session(state: &AppState) -> CommandResult {
    debug!("Getting stored session");
    match state.sessions.current() {
        Some(session) => CommandResult::ok("Session restored").with_payload(session_view(&session)),
        None => CommandResult::failed("Not logged in"),
    }
}

pub async fn register(state: &AppState, name: &str, email: &str, password: &str) -> CommandResult {
    match state.sessions.register(name, email, password).await {
        Ok(session) => {
            state.start_background_sync();
            CommandResult::ok("Account created").with_payload(session_view(&session))
        }
        Err(e) => {
            error!("Registration failed: {}", e);
            CommandResult::failed(e.to_string())
        }
    }
}

pub async fn login(state: &AppState, name_or_email: &str, password: &str) -> CommandResult {
    match state.sessions.login(name_or_email, password).await {
        Ok(session) => {
            state.start_background_sync();
            CommandResult::ok("Logged in").with_payload(session_view(&session))
        }
        Err(e) => {
            error!("Login failed: {}", e);
            CommandResult::failed(e.to_string())
        }
    }
}

/// Always succeeds locally; a failed server call is reported in the message
pub async fn logout(state: &AppState) -> CommandResult {
    info!("Logging out");
    let outcome = state.sessions.logout().await;
    match outcome.server_error {
        None => CommandResult::ok("Logged out"),
        Some(e) => CommandResult::ok(format!("Logged out locally ({})", e)),
    }
}

pub async fn reset_password(state: &AppState, email: &str) -> CommandResult {
    state
        .sessions
        .reset_password(email)
        .await
        .map(|()| CommandResult::ok("Password reset e-mail sent"))
        .into()
}

pub async fn change_password(state: &AppState, old_password: &str, new_password: &str) -> CommandResult {
    state
        .sessions
        .change_password(old_password, new_password)
        .await
        .map(|()| CommandResult::ok("Password changed"))
        .into()
}

/// Fetch the roster now; the payload carries the new snapshot
pub async fn refresh_roster(state: &AppState) -> CommandResult {
    let Some(token) = state.store.access_token() else {
        return CommandResult::failed("Not logged in");
    };

    match state.cache.refresh(&token).await {
        Ok(RefreshOutcome::Updated(count)) => {
            let roster = state.cache.snapshot();
            CommandResult::ok(format!("{} user(s) around you", count))
                .with_payload(json!({ "roster": *roster }))
        }
        Ok(RefreshOutcome::SharingRequired) => {
            CommandResult::failed("Enable location sharing to see users around you")
                .with_payload(json!({ "sharing_required": true }))
        }
        Err(e) => CommandResult::failed(e.to_string()),
    }
}

pub async fn enable_sharing(state: &AppState, lat: f64, lon: f64, radius: f64) -> CommandResult {
    state
        .sharing
        .enable(Fix { lat, lon }, radius)
        .await
        .map(|location| {
            CommandResult::ok("Location sharing enabled").with_payload(json!(location))
        })
        .into()
}

pub async fn disable_sharing(state: &AppState) -> CommandResult {
    state
        .sharing
        .disable()
        .await
        .map(|()| CommandResult::ok("Location sharing disabled"))
        .into()
}

pub fn set_auto_update(state: &AppState, enabled: bool) -> CommandResult {
    state
        .store
        .set_auto_update_enabled(enabled)
        .map(|()| {
            CommandResult::ok(if enabled {
                "Automatic updates enabled"
            } else {
                "Automatic updates disabled"
            })
        })
        .into()
}

/// Set the update window, or clear it when either bound is missing
pub fn set_quiet_hours(state: &AppState, from: Option<&str>, to: Option<&str>) -> CommandResult {
    let window = match (from, to) {
        (Some(from), Some(to)) => match QuietHours::new(from, to) {
            Ok(window) => Some(window),
            Err(e) => return CommandResult::failed(e.to_string()),
        },
        _ => None,
    };

    let message = match &window {
        Some(w) => format!("Updates limited to {}-{}", w.from, w.to),
        None => "Update window cleared".to_string(),
    };
    state
        .store
        .set_quiet_hours(window)
        .map(|()| CommandResult::ok(message))
        .into()
}

pub fn start_background_sync(state: &AppState) -> CommandResult {
    state.start_background_sync();
    CommandResult::ok("Background sync started")
}

pub fn stop_background_sync(state: &AppState) -> CommandResult {
    state.stop_background_sync();
    CommandResult::ok("Background sync stopped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app_in, json as respond, session, ScriptedTransport};
    use reqwest::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn stored_session_hides_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_in(dir.path(), Arc::new(ScriptedTransport::tokens_rotate()));
        app.store.put(Some(session("a1", "r1"))).unwrap();

        let result = get_stored_session(&app);

        assert!(result.success);
        let payload = result.payload.unwrap();
        assert_eq!(payload["uid"], "42");
        assert!(payload.get("access_token").is_none());
    }

    #[tokio::test]
    async fn login_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(|_| {
            respond(StatusCode::OK, r#"{"uid":"-1","access":"","refresh":""}"#)
        });
        let (app, _) = app_in(dir.path(), Arc::new(transport));

        let result = login(&app, "anna", "wrong").await;

        assert!(!result.success);
        assert!(!result.message.is_empty());
        assert!(app.store.get().is_none());
    }

    #[tokio::test]
    async fn empty_roster_asks_for_sharing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(|_| respond(StatusCode::OK, r#"{"list":[]}"#));
        let (app, _) = app_in(dir.path(), Arc::new(transport));
        app.store.put(Some(session("a1", "r1"))).unwrap();

        let result = refresh_roster(&app).await;

        assert!(!result.success);
        assert_eq!(result.payload.unwrap()["sharing_required"], true);
    }

    #[tokio::test]
    async fn invalid_quiet_hours_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_in(dir.path(), Arc::new(ScriptedTransport::tokens_rotate()));

        assert!(!set_quiet_hours(&app, Some("25:00"), Some("08:00")).success);
        assert!(app.store.quiet_hours().is_none());

        assert!(set_quiet_hours(&app, Some("17:00"), Some("08:00")).success);
        assert_eq!(app.store.quiet_hours(), Some(QuietHours::new("17:00", "08:00").unwrap()));

        assert!(set_quiet_hours(&app, None, None).success);
        assert!(app.store.quiet_hours().is_none());
    }

    #[tokio::test]
    async fn background_sync_toggles_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_in(dir.path(), Arc::new(ScriptedTransport::tokens_rotate()));

        start_background_sync(&app);
        assert!(app.scheduler.is_scheduled(crate::jobs::ROSTER_SYNC));
        assert!(app.scheduler.is_scheduled(crate::jobs::LOCATION_UPDATE));

        stop_background_sync(&app);
        assert!(!app.scheduler.is_scheduled(crate::jobs::ROSTER_SYNC));
        assert!(!app.scheduler.is_scheduled(crate::jobs::LOCATION_UPDATE));
    }
}
