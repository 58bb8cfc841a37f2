//! Distance and congestion helpers
//!
//! Pure functions only: haversine distance, density classification and
//! radius filtering over junction records.

use crate::domain::types::JunctionRecord;
use serde::Serialize;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Density at or above which a junction is heavily congested
pub const HEAVY_DENSITY_THRESHOLD: i64 = 60;

/// Density at or above which a junction is moderately congested
pub const MODERATE_DENSITY_THRESHOLD: i64 = 30;

/// A WGS84 coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl From<&JunctionRecord> for GeoPoint {
    fn from(record: &JunctionRecord) -> Self {
        Self { lat: record.latitude, lon: record.longitude }
    }
}

/// Great-circle distance between two coordinates in meters
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards sqrt(1 - a) against rounding just above 1 for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Congestion level derived from vehicle density
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Congestion {
    Light,
    Moderate,
    Heavy,
}

impl Congestion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Congestion::Light => "light",
            Congestion::Moderate => "moderate",
            Congestion::Heavy => "heavy",
        }
    }

    /// Human readable status line
    pub fn label(&self) -> &'static str {
        match self {
            Congestion::Light => "Light Traffic",
            Congestion::Moderate => "Moderate Traffic",
            Congestion::Heavy => "Heavy Traffic",
        }
    }

    /// Map overlay fill colour, ARGB with 50% alpha
    pub fn overlay_argb(&self) -> u32 {
        match self {
            Congestion::Light => 0x8000_FF00,
            Congestion::Moderate => 0x80FF_A500,
            Congestion::Heavy => 0x80FF_0000,
        }
    }
}

/// Classify a density reading
pub fn classify_density(density: i64) -> Congestion {
    if density >= HEAVY_DENSITY_THRESHOLD {
        Congestion::Heavy
    } else if density >= MODERATE_DENSITY_THRESHOLD {
        Congestion::Moderate
    } else {
        Congestion::Light
    }
}

/// Records within `radius_m` of `center`, input order preserved
pub fn filter_within_radius(
    records: &[JunctionRecord],
    center: GeoPoint,
    radius_m: f64,
) -> Vec<JunctionRecord> {
    records
        .iter()
        .filter(|r| distance_meters(center.lat, center.lon, r.latitude, r.longitude) <= radius_m)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const POINTS: [(f64, f64); 6] = [
        (12.9716, 77.5946),
        (12.98, 77.60),
        (-33.8688, 151.2093),
        (51.5074, -0.1278),
        (89.9, 179.9),
        (-89.9, -179.9),
    ];

    #[test]
    fn test_distance_symmetric_and_zero() {
        for &(lat1, lon1) in &POINTS {
            assert_eq!(distance_meters(lat1, lon1, lat1, lon1), 0.0);
            for &(lat2, lon2) in &POINTS {
                let ab = distance_meters(lat1, lon1, lat2, lon2);
                let ba = distance_meters(lat2, lon2, lat1, lon1);
                assert!((ab - ba).abs() < 1e-6, "asymmetric: {ab} vs {ba}");
            }
        }
    }

    #[test]
    fn test_distance_known_value() {
        // One degree of latitude is ~111.19 km on a 6371 km sphere
        let d = distance_meters(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_distance_monotonic_with_separation() {
        let mut last = 0.0;
        for step in 1..=10 {
            let d = distance_meters(12.97, 77.59, 12.97 + step as f64 * 0.01, 77.59);
            assert!(d > last);
            last = d;
        }
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify_density(29), Congestion::Light);
        assert_eq!(classify_density(30), Congestion::Moderate);
        assert_eq!(classify_density(59), Congestion::Moderate);
        assert_eq!(classify_density(60), Congestion::Heavy);
        assert_eq!(classify_density(0), Congestion::Light);
        assert_eq!(classify_density(-3), Congestion::Light);
        assert_eq!(classify_density(250), Congestion::Heavy);
    }

    #[test]
    fn test_labels_and_colours() {
        assert_eq!(classify_density(45).label(), "Moderate Traffic");
        assert_eq!(classify_density(65).overlay_argb(), 0x80FF0000);
        assert_eq!(Congestion::Light.overlay_argb(), 0x8000FF00);
    }

    #[test]
    fn test_filter_radius_zero_keeps_exact_center() {
        let center = GeoPoint::new(12.97, 77.59);
        let records = vec![
            JunctionRecord::new("here", 12.97, 77.59, 10),
            JunctionRecord::new("near", 12.9701, 77.59, 10),
            JunctionRecord::new("also_here", 12.97, 77.59, 20),
        ];

        let hits = filter_within_radius(&records, center, 0.0);
        let ids: Vec<_> = hits.iter().map(|r| r.junction_id.as_str()).collect();
        assert_eq!(ids, vec!["here", "also_here"]);
    }

    #[test]
    fn test_filter_preserves_order() {
        let center = GeoPoint::new(12.97, 77.59);
        let records = vec![
            JunctionRecord::new("b", 12.9705, 77.59, 10),  // ~56 m
            JunctionRecord::new("far", 12.99, 77.59, 10), // ~2.2 km
            JunctionRecord::new("a", 12.97, 77.5905, 10), // ~54 m
        ];

        let hits = filter_within_radius(&records, center, 100.0);
        let ids: Vec<_> = hits.iter().map(|r| r.junction_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
