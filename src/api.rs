//! API Module
//!
//! Typed endpoints of the location-sharing backend. Every call goes through
//! the [`RequestPipeline`]; this layer validates input before any network
//! traffic and maps responses onto [`ApiError`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info};

use crate::pipeline::RequestPipeline;
use crate::storage::StorageError;
use crate::transport::{ApiRequest, ApiResponse, Endpoint, MultipartFile, TransportError};

/// API client for the location-sharing backend
pub struct ApiClient {
    pipeline: Arc<RequestPipeline>,
}

impl ApiClient {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    /// Create an account
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ApiError> {
        require(name, "Username can not be empty")?;
        require(email, "Email can not be empty")?;
        require(password, "Password can not be empty")?;

        debug!("Sending registration request for user: {}", name);
        let request = ApiRequest::post("user/create.php")
            .json(&RegisterRequest { name, email, password })?;
        let body: AuthResponse = self.call(request).await?;

        match body.uid.as_str() {
            "-1" => Err(ApiError::Server {
                status: 200,
                message: "Username already exists. Choose another one.".into(),
            }),
            "-2" => Err(ApiError::Server {
                status: 200,
                message: "Email already exists. Choose another one.".into(),
            }),
            _ if body.access.is_empty() => Err(ApiError::EmptyResponse(
                "Registration failed. Try again.".into(),
            )),
            _ => {
                info!("User created: {}", body.uid);
                Ok(body)
            }
        }
    }

    /// Log in with a username or e-mail
    pub async fn login(&self, name_or_email: &str, password: &str) -> Result<AuthResponse, ApiError> {
        require(name_or_email, "Name or email can not be empty")?;
        require(password, "Password can not be empty")?;

        debug!("Sending login request for: {}", name_or_email);
        let request = ApiRequest::post("user/login.php").json(&LoginRequest {
            name: name_or_email,
            password,
        })?;
        let body: AuthResponse = self.call(request).await?;

        if body.uid == "-1" {
            return Err(ApiError::Server {
                status: 200,
                message: "Wrong username or password".into(),
            });
        }
        if body.access.is_empty() {
            return Err(ApiError::EmptyResponse("Login failed. Try again.".into()));
        }
        info!("Login successful: {}", body.uid);
        Ok(body)
    }

    /// Invalidate the session server-side
    pub async fn logout(&self) -> Result<(), ApiError> {
        let response = self.pipeline.execute(ApiRequest::post("user/logout.php")).await?;
        check(response).map(|_| ())
    }

    /// Send a password-reset e-mail
    pub async fn reset_password(&self, email: &str) -> Result<(), ApiError> {
        require(email, "Email can not be empty")?;

        let request = ApiRequest::post("user/reset.php").json(&ResetRequest { email })?;
        let response = self.pipeline.execute(request).await?;
        let status = response.status.as_u16();

        let body: StatusResponse = if response.is_success() {
            parse(&response)?
        } else {
            response.json().unwrap_or_default()
        };
        if response.is_success() && body.status == "success" {
            info!("Password reset e-mail sent");
            return Ok(());
        }
        Err(ApiError::Server {
            status,
            message: body.message.unwrap_or_else(|| "Failed to send e-mail".into()),
        })
    }

    /// Change the password of the logged-in user
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), ApiError> {
        require(old_password, "Old password can not be empty")?;
        require(new_password, "New password can not be empty")?;

        let request = ApiRequest::post("user/password.php").json(&PasswordChange {
            old_password,
            new_password,
        })?;
        let body: StatusResponse = self.call(request).await?;

        if body.status != "success" {
            return Err(ApiError::Server {
                status: 200,
                message: "Failed to change password".into(),
            });
        }
        info!("Password changed");
        Ok(())
    }

    /// Publish own position and visibility radius
    pub async fn update_geofence(&self, lat: f64, lon: f64, radius: f64) -> Result<(), ApiError> {
        validate_position(lat, lon, radius)?;

        debug!("Updating geofence: radius={}", radius);
        let request = ApiRequest::post("geofence/update.php")
            .json(&GeofenceUpdate { lat, lon, radius })?;
        let body: SuccessResponse = self.call(request).await?;

        if !body.success {
            return Err(ApiError::Server {
                status: 200,
                message: "Failed to update location".into(),
            });
        }
        Ok(())
    }

    /// Withdraw own position
    pub async fn delete_geofence(&self) -> Result<(), ApiError> {
        let body: SuccessResponse = self.call(ApiRequest::delete("geofence/update.php")).await?;

        if !body.success {
            return Err(ApiError::Server {
                status: 200,
                message: "Failed to remove location".into(),
            });
        }
        Ok(())
    }

    /// Fetch the roster visible from the caller's geofence
    pub async fn list_geofence(&self, access_token: &str) -> Result<GeofenceList, ApiError> {
        require(access_token, "Access token can not be empty")?;

        let request = ApiRequest::get("geofence/list.php").bearer(access_token);
        self.call(request).await
    }

    /// Fetch a user's public profile
    pub async fn profile(&self, uid: &str) -> Result<Profile, ApiError> {
        require(uid, "User id can not be empty")?;

        self.call(ApiRequest::get("user/get.php").query("id", uid)).await
    }

    /// Upload a JPEG profile photo
    pub async fn upload_photo(&self, file_name: &str, bytes: Vec<u8>) -> Result<Profile, ApiError> {
        if bytes.is_empty() {
            return Err(ApiError::Validation("Photo can not be empty".into()));
        }

        info!("Uploading photo: {} ({} bytes)", file_name, bytes.len());
        let request = ApiRequest::post("user/photo.php")
            .on(Endpoint::Upload)
            .multipart(MultipartFile {
                field: "image".into(),
                file_name: file_name.to_string(),
                mime: "image/jpeg".into(),
                bytes,
            });
        self.call(request).await
    }

    /// Remove the profile photo
    pub async fn delete_photo(&self) -> Result<Profile, ApiError> {
        self.call(ApiRequest::delete("user/photo.php").on(Endpoint::Upload)).await
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = self.pipeline.execute(request).await.map_err(|e| {
            error!("{} failed: {}", path, e);
            ApiError::Transport(e)
        })?;
        let response = check(response)?;
        parse(&response)
    }
}

fn require(value: &str, message: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(message.to_string()));
    }
    Ok(())
}

fn validate_position(lat: f64, lon: f64, radius: f64) -> Result<(), ApiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(ApiError::Validation("Coordinates out of range".into()));
    }
    if !radius.is_finite() || radius <= 0.0 {
        return Err(ApiError::Validation("Radius must be positive".into()));
    }
    Ok(())
}

/// Map non-2xx statuses onto [`ApiError`]
fn check(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    if response.is_unauthorized() {
        return Err(ApiError::Unauthorized);
    }
    let status = response.status;
    let message = response
        .json::<ErrorResponse>()
        .ok()
        .and_then(ErrorResponse::into_message)
        .unwrap_or_else(|| format!("Status: {}", status));
    error!("Request failed with {}: {}", status, message);
    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

fn parse<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::EmptyResponse("Server returned empty response".into()));
    }
    response
        .json()
        .map_err(|e| ApiError::EmptyResponse(e.to_string()))
}

// Request/Response types

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ResetRequest<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct PasswordChange<'a> {
    old_password: &'a str,
    new_password: &'a str,
}

#[derive(Serialize)]
struct GeofenceUpdate {
    lat: f64,
    lon: f64,
    radius: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(deserialize_with = "lenient_string")]
    pub uid: String,
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub refresh: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

/// Own geofence record as reported by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeofenceMe {
    #[serde(deserialize_with = "lenient_string")]
    pub uid: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub radius: Option<f64>,
}

/// Peer row as reported by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeofencePeer {
    #[serde(deserialize_with = "lenient_string")]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub updated: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub radius: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub photo: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeofenceList {
    pub me: Option<GeofenceMe>,
    #[serde(default)]
    pub list: Vec<GeofencePeer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    #[serde(default, alias = "uid", deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub photo: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    message: Option<String>,
}

impl ErrorResponse {
    fn into_message(self) -> Option<String> {
        self.error.or(self.message)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Null,
}

/// Accepts `"12.5"`, `12.5`, `""` or `null`
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s.trim().parse().ok(),
        Scalar::Number(n) => n.as_f64(),
        Scalar::Null => None,
    })
}

/// Accepts ids sent either as strings or as numbers
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Number(n) => n.to_string(),
        Scalar::Null => String::new(),
    })
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Check your internet connection: {0}")]
    Transport(#[from] TransportError),

    #[error("Session expired, please log in again")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Empty response: {0}")]
    EmptyResponse(String),

    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApiError {
    /// Whether repeating the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Validation(_))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Validation(format!("Invalid request body: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenStore;
    use crate::refresh::RefreshCoordinator;
    use crate::test_support::{json, session, store_in, ScriptedTransport};
    use reqwest::StatusCode;

    fn client(transport: Arc<ScriptedTransport>, store: Arc<TokenStore>) -> ApiClient {
        let refresher = Arc::new(RefreshCoordinator::new(transport.clone(), store.clone(), "key"));
        ApiClient::new(Arc::new(RequestPipeline::new(transport, store, refresher, "key")))
    }

    #[tokio::test]
    async fn validation_happens_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None);
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, "{}")));
        let api = client(transport.clone(), store);

        assert!(matches!(api.login("", "pw").await, Err(ApiError::Validation(_))));
        assert!(matches!(api.register("a", "", "pw").await, Err(ApiError::Validation(_))));
        assert!(matches!(api.list_geofence("").await, Err(ApiError::Validation(_))));
        assert!(matches!(
            api.update_geofence(48.0, 17.0, 0.0).await,
            Err(ApiError::Validation(_))
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn login_rejects_sentinel_uid() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None);
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::OK, r#"{"uid":"-1","access":"","refresh":""}"#)
        }));

        let err = client(transport, store).login("anna", "pw").await.unwrap_err();

        assert!(matches!(err, ApiError::Server { .. }));
        assert_eq!(err.to_string(), "Server error (200): Wrong username or password");
    }

    #[tokio::test]
    async fn register_reports_taken_email() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), None);
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::OK, r#"{"uid":"-2","access":"","refresh":""}"#)
        }));

        let err = client(transport, store)
            .register("anna", "anna@example.com", "pw")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Email already exists"));
    }

    #[tokio::test]
    async fn server_message_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| {
            json(StatusCode::BAD_REQUEST, r#"{"error":"radius too large"}"#)
        }));

        let err = client(transport, store)
            .update_geofence(48.1, 17.1, 5000.0)
            .await
            .unwrap_err();

        match err {
            ApiError::Server { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "radius too large");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_success_body_is_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "r1")));
        let transport = Arc::new(ScriptedTransport::new(|_| json(StatusCode::OK, "")));

        let err = client(transport, store).profile("42").await.unwrap_err();

        assert!(matches!(err, ApiError::EmptyResponse(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unresolved_401_maps_to_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Some(session("a1", "")));
        let transport = Arc::new(ScriptedTransport::tokens_rotate());

        let err = client(transport, store).delete_geofence().await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[test]
    fn geofence_list_accepts_stringly_numbers() {
        let body = r#"{
            "me": {"uid": "42", "lat": "48.15", "lon": "17.11", "radius": "250"},
            "list": [
                {"uid": 42, "name": "anna", "updated": "2024-05-01 10:00:00", "radius": "250", "photo": null},
                {"uid": "7", "name": "ben", "updated": "2024-05-01 09:00:00", "radius": 100}
            ]
        }"#;

        let list: GeofenceList = serde_json::from_str(body).unwrap();

        let me = list.me.unwrap();
        assert_eq!(me.lat, Some(48.15));
        assert_eq!(me.radius, Some(250.0));
        assert_eq!(list.list[0].uid, "42");
        assert_eq!(list.list[0].photo, "");
        assert_eq!(list.list[1].radius, Some(100.0));
        assert_eq!(list.list[1].lat, None);
    }
}
