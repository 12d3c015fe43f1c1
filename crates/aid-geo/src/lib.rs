pub mod doctor;
pub mod geo;
pub mod location;
pub mod monitor;
pub mod share;

pub use geo::{haversine_m, Coordinate, GeoError, SafeZone, DEFAULT_RADIUS_M};
pub use location::{watch, LocationError, LocationSource, LocationWatch, PositionSample};
pub use monitor::{GeofenceMonitor, MonitorStatus, Notice, Report, DEFAULT_ALERT_COOLDOWN};
