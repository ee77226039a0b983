//! Platform Module
//!
//! Seams to the host platform: device location, location permission,
//! user notifications, connectivity and wall-clock time. Desktop builds get
//! simple implementations; tests substitute their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A device position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
}

impl Fix {
    /// `0.0/0.0` is reserved for "location not disclosed"
    pub fn is_disclosed(&self) -> bool {
        !(self.lat == 0.0 && self.lon == 0.0)
    }
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Last known device position, if any
    async fn last_known(&self) -> Option<Fix>;
}

pub trait PermissionGate: Send + Sync {
    fn location_granted(&self) -> bool;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

pub trait Clock: Send + Sync {
    /// Local minutes since midnight, `0..1440`
    fn minute_of_day(&self) -> u32;
}

/// Location source configured up front (desktop has no GPS)
#[derive(Debug, Clone, Default)]
pub struct FixedLocationProvider {
    fix: Option<Fix>,
}

impl FixedLocationProvider {
    pub fn new(fix: Option<Fix>) -> Self {
        Self { fix }
    }
}

#[async_trait]
impl LocationProvider for FixedLocationProvider {
    async fn last_known(&self) -> Option<Fix> {
        self.fix
    }
}

impl PermissionGate for FixedLocationProvider {
    /// Granted exactly when a location has been configured
    fn location_granted(&self) -> bool {
        self.fix.is_some()
    }
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, "{}", message);
    }
}

/// Treats the host as online when a TCP connection to the API host succeeds
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe the host and port of `base_url`
    pub fn for_url(base_url: &str, timeout: Duration) -> Option<Self> {
        let url = reqwest::Url::parse(base_url).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self {
            address: format!("{}:{}", host, port),
            timeout,
        })
    }
}

#[async_trait]
impl Connectivity for TcpProbe {
    async fn is_online(&self) -> bool {
        let attempt = tokio::net::TcpStream::connect(&self.address);
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", self.address, e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe to {} timed out", self.address);
                false
            }
        }
    }
}

/// Connectivity that is always available
#[derive(Debug, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Local wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn minute_of_day(&self) -> u32 {
        let now = chrono::Local::now();
        now.hour() * 60 + now.minute()
    }
}
