use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use aid_geo::{doctor as geo_doctor, share, watch};
use aid_geo::{haversine_m, Coordinate, GeofenceMonitor, LocationError, LocationSource, MonitorStatus, Notice, Report, SafeZone};
use aid_uplink::{doctor as uplink_doctor, AlertRoute, Backend, HttpBackend, LinkHealth, Session, DEFAULT_BASE_URL};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::Duration;

const TOKEN_ENV: &str = "NEURO_AID_TOKEN";
// How long `run` waits on exit for in-flight save/alert results.
const NOTICE_DRAIN: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "aid", version, about = "Neuro-Aid - safe-zone monitoring for patients")]
struct Cli {
    #[arg(long, default_value = "aid.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Zone { #[command(subcommand)] cmd: ZoneCmd },
    /// Great-circle distance between two points, in meters.
    Distance {
        #[arg(long, allow_hyphen_values = true)] from_lat: f64,
        #[arg(long, allow_hyphen_values = true)] from_lng: f64,
        #[arg(long, allow_hyphen_values = true)] to_lat: f64,
        #[arg(long, allow_hyphen_values = true)] to_lng: f64,
    },
    /// Print a shareable message with the current position.
    Share,
    Run,
}

#[derive(Debug, Subcommand)]
enum ZoneCmd {
    /// Set the safe zone at the given point, or at the current position.
    Set {
        #[arg(long, allow_hyphen_values = true, requires = "lng")] lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "lat")] lng: Option<f64>,
    },
    /// Show the safe zone stored in the backend.
    Show,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    session: SessionCfg,
    #[serde(default)]
    backend: BackendCfg,
    #[serde(default)]
    alerts: AlertsCfg,
    #[serde(default)]
    zone: ZoneCfg,
    location: LocationCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
struct SessionCfg { token: Option<String> }

#[derive(Debug, serde::Deserialize)]
struct BackendCfg {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

impl Default for BackendCfg {
    fn default() -> Self {
        Self { base_url: default_base_url(), timeout_ms: default_timeout_ms() }
    }
}

#[derive(Debug, serde::Deserialize)]
struct AlertsCfg {
    #[serde(default = "default_route")]
    route: String,
    patient_id: Option<String>,
    message: Option<String>,
    #[serde(default = "default_cooldown_s")]
    cooldown_s: u64,
}

impl Default for AlertsCfg {
    fn default() -> Self {
        Self { route: default_route(), patient_id: None, message: None, cooldown_s: default_cooldown_s() }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ZoneCfg { radius_m: f64 }

impl Default for ZoneCfg {
    fn default() -> Self {
        Self { radius_m: aid_geo::DEFAULT_RADIUS_M }
    }
}

#[derive(Debug, serde::Deserialize)]
struct LocationCfg {
    source: String,
    nmea_device: Option<String>,
    baud: Option<u32>,
    nmea_file: Option<String>,
    csv_file: Option<String>,
    fixed: Option<Coordinate>,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_base_url() -> String { DEFAULT_BASE_URL.to_string() }
fn default_timeout_ms() -> u64 { 10_000 }
fn default_route() -> String { "sms".to_string() }
fn default_cooldown_s() -> u64 { 600 }
fn default_interval_ms() -> u64 { 1_000 }

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Distance { from_lat, from_lng, to_lat, to_lng } => {
            let a = Coordinate::new(from_lat, from_lng)?;
            let b = Coordinate::new(to_lat, to_lng)?;
            println!("{:.1} meters", haversine_m(a.lat, a.lng, b.lat, b.lng));
        }
        Command::Doctor => doctor(&load_config(&cli.config)?)?,
        Command::Zone { cmd } => zone_cmd(&load_config(&cli.config)?, cmd).await?,
        Command::Share => share_cmd(&load_config(&cli.config)?).await?,
        Command::Run => run(&load_config(&cli.config)?).await?,
    }
    Ok(())
}

fn session(cfg: &Config) -> Session {
    match std::env::var(TOKEN_ENV) {
        Ok(t) if !t.trim().is_empty() => Session::new(t),
        _ => Session::new(cfg.session.token.clone().unwrap_or_default()),
    }
}

fn alert_route(cfg: &AlertsCfg) -> Result<AlertRoute> {
    match cfg.route.as_str() {
        "sms" => Ok(AlertRoute::Sms),
        "alert" => Ok(AlertRoute::Alert {
            patient_id: cfg.patient_id.clone().context("alerts.patient_id missing (route = \"alert\")")?,
            message: cfg.message.clone().unwrap_or_else(|| "Patient has left the safe zone".to_string()),
        }),
        other => anyhow::bail!("unknown alerts.route: {}", other),
    }
}

fn backend(cfg: &Config) -> Result<HttpBackend> {
    HttpBackend::new(
        cfg.backend.base_url.clone(),
        session(cfg),
        alert_route(&cfg.alerts)?,
        Duration::from_millis(cfg.backend.timeout_ms),
    )
}

fn open_source(loc: &LocationCfg) -> Result<LocationSource, LocationError> {
    let missing = |key: &str| LocationError::Unavailable(format!("location.{} missing", key));
    match loc.source.as_str() {
        "nmea-serial" => LocationSource::serial(
            loc.nmea_device.as_deref().ok_or_else(|| missing("nmea_device"))?,
            loc.baud.unwrap_or(115_200),
        ),
        "nmea-file" => LocationSource::nmea_file(loc.nmea_file.as_deref().ok_or_else(|| missing("nmea_file"))?),
        "csv" => LocationSource::csv(loc.csv_file.as_deref().ok_or_else(|| missing("csv_file"))?),
        "fixed" => {
            let c = loc.fixed.ok_or_else(|| missing("fixed"))?;
            c.validate().map_err(|e| LocationError::Unavailable(e.to_string()))?;
            Ok(LocationSource::fixed(c))
        }
        other => Err(LocationError::Unavailable(format!("unknown location.source: {}", other))),
    }
}

// Permission problems get the same message the user would see on a phone.
fn location_failure(e: LocationError) -> anyhow::Error {
    if let LocationError::PermissionDenied(_) = &e {
        warn!("location: {}", e);
        println!("{}", Notice::PermissionDenied);
    }
    anyhow::Error::new(e).context("location")
}

async fn current_position(cfg: &Config) -> Result<Coordinate> {
    let mut src = open_source(&cfg.location).map_err(location_failure)?;
    let sample = src.current_position().await.map_err(location_failure)?;
    Ok(sample.coord)
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    uplink_doctor::check_endpoint(&cfg.backend.base_url, &session(cfg), cfg.backend.timeout_ms)?;
    alert_route(&cfg.alerts)?;
    geo_doctor::check_zone(cfg.zone.radius_m)?;
    geo_doctor::check_cooldown(cfg.alerts.cooldown_s)?;
    geo_doctor::check_watch_interval(cfg.location.interval_ms)?;

    match open_source(&cfg.location) {
        Ok(_) => info!("doctor: location source {} OK", cfg.location.source),
        Err(e @ LocationError::PermissionDenied(_)) => return Err(location_failure(e)),
        Err(e) => warn!("doctor: location source not available right now: {}", e),
    }

    info!("doctor: OK");
    Ok(())
}

async fn zone_cmd(cfg: &Config, cmd: ZoneCmd) -> Result<()> {
    let backend = backend(cfg)?;
    match cmd {
        ZoneCmd::Set { lat, lng } => {
            let center = match (lat, lng) {
                (Some(lat), Some(lng)) => Coordinate::new(lat, lng)?,
                _ => current_position(cfg).await?,
            };
            let zone = SafeZone::new(center, cfg.zone.radius_m)?;
            backend.save_geofence(center.into()).await.context("save safe zone")?;
            println!("{}", Notice::ZoneSet);
            println!("center=({:.6}, {:.6}) radius={}m", zone.center.lat, zone.center.lng, zone.radius_m);
        }
        ZoneCmd::Show => match backend.fetch_geofence().await.context("fetch safe zone")? {
            Some(p) => println!("center=({:.6}, {:.6}) radius={}m", p.lat, p.lng, cfg.zone.radius_m),
            None => println!("{}", MonitorStatus::NotSet),
        },
    }
    Ok(())
}

async fn share_cmd(cfg: &Config) -> Result<()> {
    let here = current_position(cfg).await?;
    println!("{}", share::share_message(&here));
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let backend = Arc::new(backend(cfg)?);
    let cooldown = time::Duration::seconds(cfg.alerts.cooldown_s as i64);
    let (mut monitor, mut notices) = GeofenceMonitor::new(backend.clone(), cooldown, tokio::runtime::Handle::current());

    match backend.fetch_geofence().await {
        Ok(Some(p)) => monitor.restore_safe_zone(SafeZone::new(p.into(), cfg.zone.radius_m)?),
        Ok(None) => warn!("run: no safe zone stored yet; use `aid zone set`"),
        Err(e) => warn!("run: could not fetch stored safe zone: {}", e),
    }

    let source = open_source(&cfg.location).map_err(location_failure)?;
    let mut samples = watch(source, Duration::from_millis(cfg.location.interval_ms));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("run: interrupted");
                break;
            }
            Some(n) = notices.recv() => println!("notice: {}", n),
            s = samples.next() => match s {
                Some(Ok(sample)) => {
                    let r = monitor.report_sample(&sample);
                    println!("{}", status_line(&r, &backend.link_health()));
                }
                Some(Err(e)) => {
                    warn!("run: location watch ended: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    samples.stop();

    // The monitor holds the only sender besides the in-flight tasks.
    drop(monitor);
    for n in drain_notices(notices, NOTICE_DRAIN).await {
        println!("notice: {}", n);
    }

    info!("run: stopped ({})", backend.link_health());
    Ok(())
}

/// Collects notices until every sender is gone or `wait` runs out.
async fn drain_notices(mut rx: mpsc::UnboundedReceiver<Notice>, wait: Duration) -> Vec<Notice> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut out = Vec::new();
    while let Ok(Some(n)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(n);
    }
    out
}

fn status_line(r: &Report, link: &LinkHealth) -> String {
    let mut line = match r.distance_m {
        Some(d) => format!(
            "{} | distance from safe zone center: {:.1} meters{}",
            r.status, d, if r.alerted { " | alerting relatives" } else { "" }
        ),
        None => r.status.to_string(),
    };
    if !link.is_reachable() {
        line.push_str(" | ");
        line.push_str(&link.to_string());
    }
    line
}
