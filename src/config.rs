//! Client configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::location::Fix;
use crate::storage::SecureStorage;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    pub upload_url: String,
    pub api_key: String,
    pub http_timeout: Duration,
    pub data_dir: PathBuf,
    /// Position reported by the desktop location provider
    pub fixed_location: Option<Fix>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = var("NEARBY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let upload_url = var("NEARBY_UPLOAD_URL").unwrap_or_else(|| api_url.clone());

        let api_key = var("NEARBY_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("NEARBY_API_KEY is not set, requests will be sent without an API key");
        }

        let http_timeout = match var("NEARBY_HTTP_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!("Invalid NEARBY_HTTP_TIMEOUT_SECS '{}', using default", raw);
                    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
                }
            },
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let data_dir = var("NEARBY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| SecureStorage::default_root());

        let fixed_location = var("NEARBY_FIXED_LOCATION").and_then(|raw| {
            let parsed = parse_fix(&raw);
            if parsed.is_none() {
                warn!("Invalid NEARBY_FIXED_LOCATION '{}', expected \"lat,lon\"", raw);
            }
            parsed
        });

        Self {
            api_url,
            upload_url,
            api_key,
            http_timeout,
            data_dir,
            fixed_location,
        }
    }
}

/// Parse `"lat,lon"` into a fix with in-range coordinates
fn parse_fix(raw: &str) -> Option<Fix> {
    let (lat, lon) = raw.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    let valid = (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
    valid.then_some(Fix { lat, lon })
}
