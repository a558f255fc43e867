//! Geolocation prefetch.
//!
//! Started as soon as a scan begins so its latency hides behind the
//! classifier and identity round trips. Failure degrades to null
//! coordinates; it never aborts the flow.

use std::future::Future;
use std::time::Duration;

use ponto_core::types::GeoPoint;

/// A position fix, possibly empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoFix {
    pub coords: Option<GeoPoint>,
}

pub trait Geolocator: Send + Sync {
    /// Best-effort position within `timeout`. Must not fail: an
    /// unavailable fix is an empty one.
    fn current_position(&self, timeout: Duration) -> impl Future<Output = GeoFix> + Send;
}

/// Serves the kiosk's configured fixed coordinates. Wall-mounted
/// devices do not move; the device identity file is the source of
/// truth.
pub struct FixedGeolocator {
    coords: Option<GeoPoint>,
}

impl FixedGeolocator {
    pub fn new(coords: Option<GeoPoint>) -> Self {
        Self { coords }
    }
}

impl Geolocator for FixedGeolocator {
    async fn current_position(&self, _timeout: Duration) -> GeoFix {
        GeoFix {
            coords: self.coords,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_geolocator_serves_config_coords() {
        let geo = FixedGeolocator::new(Some(GeoPoint {
            lat: -23.5,
            lng: -46.6,
        }));
        let fix = geo.current_position(Duration::from_secs(1)).await;
        assert!(fix.coords.is_some());
    }

    #[tokio::test]
    async fn test_missing_coords_degrade_to_none() {
        let geo = FixedGeolocator::new(None);
        let fix = geo.current_position(Duration::from_secs(1)).await;
        assert!(fix.coords.is_none());
    }
}
