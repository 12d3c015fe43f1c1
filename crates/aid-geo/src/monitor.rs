//! Safe-zone monitor.
//!
//! [`GeofenceMonitor`] is stepped once per position sample, the same way the
//! navigation engine is stepped once per fix: it updates status and distance
//! synchronously and pushes every backend call onto a spawned task, so a slow
//! or dead link never holds up the next sample.
//!
//! Tasks go to the runtime handle given at construction, so the monitor can be
//! driven from threads that are not inside a runtime context.

use std::fmt;
use std::sync::Arc;

use aid_uplink::Backend;
use time::{Duration, OffsetDateTime};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::geo::{Coordinate, GeoError, SafeZone};
use crate::location::PositionSample;

pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    NotSet,
    Inside,
    Outside,
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorStatus::NotSet => "no geofence set yet",
            MonitorStatus::Inside => "inside safe zone",
            MonitorStatus::Outside => "outside safe zone",
        };
        f.write_str(s)
    }
}

/// Outcome of one position sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    /// `None` when no safe zone is set.
    pub distance_m: Option<f64>,
    pub status: MonitorStatus,
    /// An alert dispatch was started for this sample.
    pub alerted: bool,
}

/// Transient message for the user; the host decides how to show it.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ZoneSet,
    ZoneSaveFailed { reason: String },
    AlertSent,
    AlertFailed { reason: String },
    PermissionDenied,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ZoneSet => write!(f, "Geofencing has been set up"),
            Notice::ZoneSaveFailed { reason } => write!(f, "Failed to save geofence in backend ({})", reason),
            Notice::AlertSent => write!(f, "Alert sent to relatives"),
            Notice::AlertFailed { reason } => write!(f, "Failed to send alert ({})", reason),
            Notice::PermissionDenied => write!(f, "Please allow location access"),
        }
    }
}

/// Suppresses alerts until more than `cooldown` has passed since the last one.
#[derive(Debug)]
pub struct AlertRateLimit {
    last_alert: Option<OffsetDateTime>,
    cooldown: Duration,
}

impl AlertRateLimit {
    pub fn new(cooldown: Duration) -> Self {
        Self { last_alert: None, cooldown }
    }

    pub fn allow_at(&mut self, now: OffsetDateTime) -> bool {
        if let Some(t) = self.last_alert {
            if now - t <= self.cooldown { return false; }
        }
        self.last_alert = Some(now);
        true
    }

    pub fn last_alert(&self) -> Option<OffsetDateTime> {
        self.last_alert
    }
}

pub struct GeofenceMonitor {
    backend: Arc<dyn Backend>,
    notices: mpsc::UnboundedSender<Notice>,
    rt: Handle,

    zone: Option<SafeZone>,
    status: MonitorStatus,
    last_distance_m: Option<f64>,
    rate_limit: AlertRateLimit,
}

impl GeofenceMonitor {
    /// `rt` runs the fire-and-forget backend calls. Inside async code pass
    /// `Handle::current()`.
    pub fn new(backend: Arc<dyn Backend>, cooldown: Duration, rt: Handle) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            backend,
            notices: tx,
            rt,
            zone: None,
            status: MonitorStatus::NotSet,
            last_distance_m: None,
            rate_limit: AlertRateLimit::new(cooldown),
        };
        (monitor, rx)
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
    }

    pub fn safe_zone(&self) -> Option<&SafeZone> {
        self.zone.as_ref()
    }

    pub fn last_distance_m(&self) -> Option<f64> {
        self.last_distance_m
    }

    /// Replaces the safe zone and persists it in the background. A failed save
    /// is reported but the local zone stays.
    pub fn set_safe_zone(&mut self, center: Coordinate, radius_m: f64) -> Result<SafeZone, GeoError> {
        let zone = SafeZone::new(center, radius_m)?;
        self.install(zone);
        info!("geofence: safe zone set at ({:.6}, {:.6}) r={}m", center.lat, center.lng, radius_m);
        self.notify(Notice::ZoneSet);

        let backend = self.backend.clone();
        let notices = self.notices.clone();
        self.rt.spawn(async move {
            if let Err(e) = backend.save_geofence(center.into()).await {
                warn!("geofence: failed to save safe zone: {}", e);
                let _ = notices.send(Notice::ZoneSaveFailed { reason: e.to_string() });
            }
        });
        Ok(zone)
    }

    /// Installs a zone the backend already has; nothing is written back.
    pub fn restore_safe_zone(&mut self, zone: SafeZone) {
        self.install(zone);
        info!("geofence: restored safe zone at ({:.6}, {:.6}) r={}m", zone.center.lat, zone.center.lng, zone.radius_m);
    }

    fn install(&mut self, zone: SafeZone) {
        self.zone = Some(zone);
        self.status = MonitorStatus::Inside;
        self.last_distance_m = Some(0.0);
    }

    pub fn report_sample(&mut self, sample: &PositionSample) -> Report {
        self.report_position_at(sample.coord, sample.ts)
    }

    pub fn report_position(&mut self, current: Coordinate) -> Report {
        self.report_position_at(current, OffsetDateTime::now_utc())
    }

    pub fn report_position_at(&mut self, current: Coordinate, now: OffsetDateTime) -> Report {
        let Some(zone) = self.zone else {
            debug!("geofence: sample ignored, no safe zone set");
            return Report { distance_m: None, status: MonitorStatus::NotSet, alerted: false };
        };
        if let Err(e) = current.validate() {
            warn!("geofence: sample dropped: {}", e);
            return Report { distance_m: self.last_distance_m, status: self.status, alerted: false };
        }

        let d = zone.center.distance_m(&current);
        self.last_distance_m = Some(d);

        let prev = self.status;
        let mut alerted = false;
        if zone.contains_distance(d) {
            self.status = MonitorStatus::Inside;
            if prev == MonitorStatus::Outside {
                info!("geofence: back inside safe zone ({:.1}m)", d);
            }
        } else {
            self.status = MonitorStatus::Outside;
            if prev != MonitorStatus::Outside {
                warn!("geofence: outside safe zone ({:.1}m > {}m)", d, zone.radius_m);
            }
            if self.rate_limit.allow_at(now) {
                self.send_alert();
                alerted = true;
            } else {
                debug!("geofence: alert suppressed (cooldown)");
            }
        }
        debug!("geofence: d={:.1}m status={:?}", d, self.status);

        let backend = self.backend.clone();
        self.rt.spawn(async move {
            if let Err(e) = backend.update_location(current.into()).await {
                debug!("geofence: location update dropped: {}", e);
            }
        });

        Report { distance_m: Some(d), status: self.status, alerted }
    }

    /// Starts one alert request. Not retried.
    pub fn send_alert(&self) {
        let backend = self.backend.clone();
        let notices = self.notices.clone();
        self.rt.spawn(async move {
            match backend.send_alert().await {
                Ok(()) => {
                    info!("geofence: alert sent to relatives");
                    let _ = notices.send(Notice::AlertSent);
                }
                Err(e) => {
                    warn!("geofence: failed to send alert: {}", e);
                    let _ = notices.send(Notice::AlertFailed { reason: e.to_string() });
                }
            }
        });
    }

    /// Forwards a notice raised outside the monitor (e.g. by the location source).
    pub fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}
