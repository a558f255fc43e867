use std::path::{Path, PathBuf};
use std::time::Duration;

use ponto_core::types::GeoPoint;
use ponto_hw::Orientation;
use serde::Deserialize;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Base URL of the face inference sidecar.
    pub model_runtime_url: String,
    /// Path to the device identity file (token, site selection, coordinates).
    pub identity_path: PathBuf,
    /// Physical mounting orientation of the kiosk display.
    pub orientation: Orientation,
    /// Minimum detection confidence for a tick to yield a sample.
    pub accept_threshold: f32,
    /// Samples to collect per scan.
    pub target_samples: usize,
    /// Delay between detection ticks.
    pub tick_interval: Duration,
    /// Give up if no sample has been captured for this long.
    pub no_face_deadline: Duration,
    /// Give up after this many consecutive unusable ticks.
    pub max_consecutive_failures: u32,
    /// Timeout for each registration write.
    pub register_timeout: Duration,
    /// Pause between a close and the following open at a new site.
    pub settle_delay: Duration,
    /// Timeout for the geolocation prefetch.
    pub geo_timeout: Duration,
}

impl Config {
    /// Load configuration from `PONTO_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let identity_path = std::env::var("PONTO_IDENTITY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/ponto/device.toml"));

        Self {
            camera_device: std::env::var("PONTO_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_runtime_url: std::env::var("PONTO_MODEL_RUNTIME_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7431".to_string()),
            identity_path,
            orientation: parse_orientation(
                std::env::var("PONTO_ORIENTATION").ok().as_deref(),
            ),
            accept_threshold: env_f32("PONTO_ACCEPT_THRESHOLD", 0.55),
            target_samples: env_usize("PONTO_TARGET_SAMPLES", 5),
            tick_interval: Duration::from_millis(env_u64("PONTO_TICK_INTERVAL_MS", 220)),
            no_face_deadline: Duration::from_secs(env_u64("PONTO_NO_FACE_DEADLINE_SECS", 8)),
            max_consecutive_failures: env_u64("PONTO_MAX_CONSECUTIVE_FAILURES", 8) as u32,
            register_timeout: Duration::from_secs(env_u64("PONTO_REGISTER_TIMEOUT_SECS", 8)),
            settle_delay: Duration::from_millis(env_u64("PONTO_SETTLE_DELAY_MS", 500)),
            geo_timeout: Duration::from_secs(env_u64("PONTO_GEO_TIMEOUT_SECS", 5)),
        }
    }
}

/// Persisted device identity: which site this kiosk serves, how to reach
/// the backend, and where the kiosk physically sits. Read-only input;
/// token refresh is handled outside this daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIdentity {
    /// Backend base URL (identity + attendance services).
    pub api_base_url: String,
    /// Bearer token for the backend.
    pub api_token: String,
    /// Site this kiosk registers against by default.
    pub site_id: String,
    /// Fixed kiosk coordinates, attached to registrations when present.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl DeviceIdentity {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let identity: DeviceIdentity = toml::from_str(&raw)?;
        Ok(identity)
    }

    pub fn coords(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        }
    }
}

fn parse_orientation(raw: Option<&str>) -> Orientation {
    match raw {
        Some("portrait") => Orientation::Portrait,
        Some("landscape") | None => Orientation::Landscape,
        Some(other) => {
            tracing::warn!(value = other, "unknown PONTO_ORIENTATION, using landscape");
            Orientation::Landscape
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
