//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;

use nearby_lib::test_support::{json, ScriptedTransport};
use nearby_lib::transport::ApiRequest;

/// Knobs for a fake geofence server
#[derive(Default)]
pub struct GeofenceServer {
    /// Peers returned by `geofence/list.php`
    pub peers: AtomicUsize,
    /// When set, `geofence/update.php` fails with a 500
    pub reject_updates: AtomicBool,
}

impl GeofenceServer {
    pub fn with_peers(peers: usize) -> Arc<Self> {
        let server = Arc::new(Self::default());
        server.peers.store(peers, Ordering::SeqCst);
        server
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::SeqCst);
    }

    /// Transport that answers geofence calls from this server's state
    pub fn transport(self: &Arc<Self>) -> Arc<ScriptedTransport> {
        let server = self.clone();
        Arc::new(ScriptedTransport::new(move |req: &ApiRequest| {
            match req.path.as_str() {
                "geofence/update.php" if server.reject_updates.load(Ordering::SeqCst) => {
                    json(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"unavailable"}"#)
                }
                "geofence/update.php" => json(StatusCode::OK, r#"{"success":true}"#),
                "geofence/list.php" => {
                    json(StatusCode::OK, &roster_body(server.peers.load(Ordering::SeqCst)))
                }
                _ => json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#),
            }
        }))
    }
}

/// List response with `peers` rows; the caller (uid 42) is the first when present
pub fn roster_body(peers: usize) -> String {
    let rows: Vec<String> = (0..peers)
        .map(|i| {
            let uid = if i == 0 { "42".to_string() } else { format!("{}", 100 + i) };
            format!(
                r#"{{"uid":"{uid}","name":"user-{uid}","updated":"2024-05-01 10:00:00","radius":"100","photo":null}}"#
            )
        })
        .collect();
    format!(
        r#"{{"me":{{"uid":"42","lat":"48.15","lon":"17.11","radius":"100"}},"list":[{}]}}"#,
        rows.join(",")
    )
}
