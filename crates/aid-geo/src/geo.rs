use aid_proto::geofence::LatLng;
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const DEFAULT_RADIUS_M: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeoError {
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
    #[error("invalid safe zone radius: {0}m")]
    InvalidRadius(f64),
}

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self, GeoError> {
        let c = Self { lat, lng };
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), GeoError> {
        let ok = self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat.abs() <= 90.0
            && self.lng.abs() <= 180.0;
        if ok { Ok(()) } else { Err(GeoError::InvalidCoordinate { lat: self.lat, lng: self.lng }) }
    }

    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        haversine_m(self.lat, self.lng, other.lat, other.lng)
    }
}

impl From<LatLng> for Coordinate {
    fn from(p: LatLng) -> Self {
        Self { lat: p.lat, lng: p.lng }
    }
}

impl From<Coordinate> for LatLng {
    fn from(c: Coordinate) -> Self {
        LatLng { lat: c.lat, lng: c.lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeZone {
    pub center: Coordinate,
    pub radius_m: f64,
}

impl SafeZone {
    pub fn new(center: Coordinate, radius_m: f64) -> Result<Self, GeoError> {
        center.validate()?;
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(GeoError::InvalidRadius(radius_m));
        }
        Ok(Self { center, radius_m })
    }

    pub fn contains_distance(&self, distance_m: f64) -> bool {
        distance_m <= self.radius_m
    }
}

// ----- Geometry -----

/// Great-circle distance in meters on a sphere of radius [`EARTH_RADIUS_M`].
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat/2.0).sin().powi(2) + lat1.to_radians().cos()*lat2.to_radians().cos()*(dlon/2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0-a).sqrt());
    EARTH_RADIUS_M * c
}
