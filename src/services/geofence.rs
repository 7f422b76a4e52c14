//! Circular geofences around stops
//!
//! Distances are great-circle (haversine) on a spherical earth. At stop radii of
//! tens of meters a flat-earth approximation drifts noticeably once routes span
//! a city, so it is not used anywhere.

use crate::domain::types::{LocationSample, Stop};
use crate::infra::error::GeofenceConfigError;

/// Mean earth radius (meters)
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates, in meters
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Result of evaluating a position against a geofence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceResult {
    pub inside_zone: bool,
    pub distance_m: f64,
}

/// A validated circular zone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self { latitude, longitude, radius_m }
    }

    /// Build the zone for a stop, rejecting stops that cannot have one
    pub fn from_stop(stop: &Stop) -> Result<Self, GeofenceConfigError> {
        let (Some(latitude), Some(longitude)) = (stop.latitude, stop.longitude) else {
            return Err(GeofenceConfigError::MissingCoordinates(stop.id.clone()));
        };
        let lat_ok = latitude.is_finite() && (-90.0..=90.0).contains(&latitude);
        let lon_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);
        if !lat_ok || !lon_ok {
            return Err(GeofenceConfigError::InvalidCoordinates {
                stop_id: stop.id.clone(),
                latitude,
                longitude,
            });
        }
        if !stop.radius_meters.is_finite() || stop.radius_meters < 0.0 {
            return Err(GeofenceConfigError::InvalidRadius {
                stop_id: stop.id.clone(),
                radius: stop.radius_meters,
            });
        }
        Ok(Self::new(latitude, longitude, stop.radius_meters))
    }

    /// Evaluate a coordinate pair against this zone
    #[inline]
    pub fn evaluate(&self, latitude: f64, longitude: f64) -> GeofenceResult {
        let distance_m = haversine_distance_m(latitude, longitude, self.latitude, self.longitude);
        GeofenceResult { inside_zone: distance_m <= self.radius_m, distance_m }
    }

    pub fn evaluate_sample(&self, sample: &LocationSample) -> GeofenceResult {
        self.evaluate(sample.latitude, sample.longitude)
    }
}
