use std::io;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::geo::Coordinate;

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("location access denied: {0}")]
    PermissionDenied(String),
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("location source exhausted")]
    Exhausted,
    #[error("location read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coord: Coordinate,
    pub ts: OffsetDateTime,
}

impl PositionSample {
    pub fn now(coord: Coordinate) -> Self {
        Self { coord, ts: OffsetDateTime::now_utc() }
    }
}

pub enum LocationSource {
    Serial(BufReader<SerialStream>),
    NmeaFile(BufReader<File>),
    Csv(BufReader<File>),
    Fixed(Coordinate),
}

impl LocationSource {
    pub fn serial(dev: &str, baud: u32) -> Result<Self, LocationError> {
        let port = tokio_serial::new(dev, baud).open_native_async().map_err(|e| {
            if matches!(e.kind(), tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied)) {
                LocationError::PermissionDenied(format!("serial {}: {}", dev, e))
            } else {
                LocationError::Unavailable(format!("serial {}: {}", dev, e))
            }
        })?;
        Ok(Self::Serial(BufReader::new(port)))
    }

    pub fn nmea_file(path: &str) -> Result<Self, LocationError> {
        Ok(Self::NmeaFile(BufReader::new(open_file(path)?)))
    }

    pub fn csv(path: &str) -> Result<Self, LocationError> {
        Ok(Self::Csv(BufReader::new(open_file(path)?)))
    }

    pub fn fixed(coord: Coordinate) -> Self {
        Self::Fixed(coord)
    }

    /// One sample, used when the user asks for "here" rather than a stream.
    pub async fn current_position(&mut self) -> Result<PositionSample, LocationError> {
        self.next_sample().await
    }

    pub async fn next_sample(&mut self) -> Result<PositionSample, LocationError> {
        match self {
            LocationSource::Fixed(c) => Ok(PositionSample::now(*c)),
            LocationSource::Serial(r) => next_from_lines(r, parse_nmea_line)
                .await?
                .ok_or_else(|| LocationError::Unavailable("serial device closed".into())),
            LocationSource::NmeaFile(r) => next_from_lines(r, parse_nmea_line)
                .await?
                .ok_or(LocationError::Exhausted),
            LocationSource::Csv(r) => next_from_lines(r, parse_csv_line)
                .await?
                .ok_or(LocationError::Exhausted),
        }
    }
}

fn open_file(path: &str) -> Result<File, LocationError> {
    let f = std::fs::File::open(path).map_err(|e| open_error(path, e))?;
    Ok(File::from_std(f))
}

fn open_error(what: &str, e: io::Error) -> LocationError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => LocationError::PermissionDenied(format!("{}: {}", what, e)),
        _ => LocationError::Unavailable(format!("{}: {}", what, e)),
    }
}

// Reads lines until `parse` yields a coordinate; `None` on EOF.
async fn next_from_lines<R>(r: &mut R, parse: fn(&str) -> Option<Coordinate>) -> Result<Option<PositionSample>, LocationError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(c) = parse(line.trim()) {
            return Ok(Some(PositionSample::now(c)));
        }
    }
}

// Only RMC carries what we need. Void fixes (status V) are dropped.
fn parse_nmea_line(s: &str) -> Option<Coordinate> {
    if !(s.starts_with("$GNRMC") || s.starts_with("$GPRMC")) {
        return None;
    }
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() <= 6 {
        return None;
    }
    if parts[2] != "A" {
        debug!("location: void RMC fix skipped");
        return None;
    }
    // parts[3]=lat ddmm.mmmm, parts[4]=N/S, parts[5]=lon dddmm.mmmm, parts[6]=E/W
    let lat = parse_deg_min(parts[3], parts[4])?;
    let lng = parse_deg_min(parts[5], parts[6])?;
    Coordinate::new(lat, lng).ok()
}

fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() { return None; }
    // lat: ddmm.mmmm, lon: dddmm.mmmm
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" { out = -out; }
    Some(out)
}

// `lat,lng` per line, `#` comments.
fn parse_csv_line(s: &str) -> Option<Coordinate> {
    if s.is_empty() || s.starts_with('#') {
        return None;
    }
    let parsed = s.split_once(',').and_then(|(a, b)| {
        let lat: f64 = a.trim().parse().ok()?;
        let lng: f64 = b.trim().parse().ok()?;
        Coordinate::new(lat, lng).ok()
    });
    if parsed.is_none() {
        warn!("location: skipping bad csv line {:?}", s);
    }
    parsed
}

/// Live subscription to a [`LocationSource`]. Dropping it stops the watch.
pub struct LocationWatch {
    rx: mpsc::Receiver<Result<PositionSample, LocationError>>,
    task: Option<JoinHandle<()>>,
}

/// Pulls a sample from `source` at most once per `interval`. A source error is
/// delivered once and ends the watch.
pub fn watch(mut source: LocationSource, interval: Duration) -> LocationWatch {
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let res = source.next_sample().await;
            let end = res.is_err();
            if tx.send(res).await.is_err() || end {
                break;
            }
        }
        debug!("location: watch task finished");
    });
    LocationWatch { rx, task: Some(task) }
}

impl LocationWatch {
    /// `None` once the watch is stopped or the source is done.
    pub async fn next(&mut self) -> Option<Result<PositionSample, LocationError>> {
        self.rx.recv().await
    }

    /// No sample is delivered after this returns.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("location: watch stopped");
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn csv_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn parses_rmc_fix() {
        let c = parse_nmea_line("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A").unwrap();
        assert!((c.lat - 48.1173).abs() < 1e-4);
        assert!((c.lng - 11.516_666).abs() < 1e-4);
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        let c = parse_nmea_line("$GNRMC,083559.00,A,3351.6480,S,15112.5580,W,0.0,0.0,010524,,,A*00").unwrap();
        assert!(c.lat < 0.0 && c.lng < 0.0);
        assert!((c.lat + 33.8608).abs() < 1e-4);
    }

    #[test]
    fn skips_void_and_other_sentences() {
        assert_eq!(parse_nmea_line("$GPRMC,123519,V,4807.038,N,01131.000,E,,,230394,,*6A"), None);
        assert_eq!(parse_nmea_line("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47"), None);
        assert_eq!(parse_nmea_line("$GPRMC,123519,A,,N,,E"), None);
        assert_eq!(parse_nmea_line("garbage"), None);
    }

    #[test]
    fn parses_csv_lines() {
        assert_eq!(parse_csv_line("52.5, 13.4"), Some(Coordinate { lat: 52.5, lng: 13.4 }));
        assert_eq!(parse_csv_line("# walk to the park"), None);
        assert_eq!(parse_csv_line(""), None);
        assert_eq!(parse_csv_line("north,east"), None);
        assert_eq!(parse_csv_line("95.0,0.0"), None);
    }

    #[test]
    fn permission_errors_are_distinguished() {
        let e = open_error("x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(e, LocationError::PermissionDenied(_)));
        let e = open_error("x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, LocationError::Unavailable(_)));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let r = LocationSource::csv("/nonexistent/walk.csv");
        assert!(matches!(r, Err(LocationError::Unavailable(_))));
    }

    #[tokio::test]
    async fn csv_source_reads_then_exhausts() {
        let f = csv_file("# start\n0.0,0.0\nbad\n0.001,0.0\n");
        let mut src = LocationSource::csv(f.path().to_str().unwrap()).unwrap();
        assert_eq!(src.next_sample().await.unwrap().coord, Coordinate { lat: 0.0, lng: 0.0 });
        assert_eq!(src.next_sample().await.unwrap().coord, Coordinate { lat: 0.001, lng: 0.0 });
        assert!(matches!(src.next_sample().await, Err(LocationError::Exhausted)));
    }

    #[tokio::test]
    async fn nmea_file_source() {
        let f = csv_file(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\n\
             $GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\n",
        );
        let mut src = LocationSource::nmea_file(f.path().to_str().unwrap()).unwrap();
        let s = src.current_position().await.unwrap();
        assert!((s.coord.lat - 48.1173).abs() < 1e-4);
        assert!(matches!(src.next_sample().await, Err(LocationError::Exhausted)));
    }

    #[tokio::test]
    async fn watch_delivers_until_stopped() {
        let here = Coordinate::new(1.0, 2.0).unwrap();
        let mut w = watch(LocationSource::fixed(here), Duration::from_millis(5));
        assert_eq!(w.next().await.unwrap().unwrap().coord, here);
        assert_eq!(w.next().await.unwrap().unwrap().coord, here);

        w.stop();
        assert!(w.is_stopped());
        assert!(w.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn watch_ends_after_source_error() {
        let f = csv_file("0.0,0.0\n");
        let mut w = watch(LocationSource::csv(f.path().to_str().unwrap()).unwrap(), Duration::from_millis(1));
        assert!(w.next().await.unwrap().is_ok());
        assert!(matches!(w.next().await, Some(Err(LocationError::Exhausted))));
        assert!(w.next().await.is_none());
    }
}
