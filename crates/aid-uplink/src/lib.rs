pub mod doctor;

use aid_proto::geofence::{parse_geofence_response, AlertRequest, LatLng, ProtoError};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://patient-backend-olyv.onrender.com/api";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{route} returned HTTP {code}")]
    Status { route: &'static str, code: u16 },
    #[error("invalid response schema: {0}")]
    Schema(#[from] ProtoError),
}

/// Authenticated session with the patient backend. Built once by the host and
/// handed to whatever needs to talk to the backend.
#[derive(Clone)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

/// Which alert route the backend exposes.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertRoute {
    /// `POST /alerts/send-sms`, no body; the backend knows whom to text.
    Sms,
    /// `POST /alerts/send-alert` with `{patientId, message}`.
    Alert { patient_id: String, message: String },
}

/// The remote storage/alerting collaborator.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_geofence(&self) -> Result<Option<LatLng>, BackendError>;
    async fn save_geofence(&self, center: LatLng) -> Result<(), BackendError>;
    async fn update_location(&self, current: LatLng) -> Result<(), BackendError>;
    async fn send_alert(&self) -> Result<(), BackendError>;
}

/// Outcome of the most recent backend calls, shown next to the monitor status
/// so a caregiver can tell "inside" from "inside, but nothing is reaching the
/// server".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHealth {
    pub last_rtt_ms: Option<u32>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LinkHealth {
    pub fn is_reachable(&self) -> bool {
        self.consecutive_failures == 0
    }

    fn on_success(&mut self, rtt_ms: u32) {
        self.last_rtt_ms = Some(rtt_ms);
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    fn on_failure(&mut self, err: &BackendError) {
        self.consecutive_failures += 1;
        self.last_error = Some(err.to_string());
    }
}

impl std::fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.last_error, self.last_rtt_ms) {
            (Some(e), _) if self.consecutive_failures > 0 => {
                write!(f, "backend unreachable ({} failed calls, last: {})", self.consecutive_failures, e)
            }
            (_, Some(rtt)) => write!(f, "backend ok ({}ms)", rtt),
            _ => write!(f, "backend not contacted yet"),
        }
    }
}

pub struct HttpBackend {
    base_url: String,
    session: Session,
    alert_route: AlertRoute,
    client: reqwest::Client,
    health: Mutex<LinkHealth>,
}

impl HttpBackend {
    pub fn new(base_url: String, session: Session, alert_route: AlertRoute, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("build http client: {}", e))?;
        info!("backend: {} (alerts via {})", base_url, alert_route_name(&alert_route));
        Ok(Self {
            base_url,
            session,
            alert_route,
            client,
            health: Mutex::new(LinkHealth::default()),
        })
    }

    pub fn link_health(&self) -> LinkHealth {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn url(&self, route: &str) -> String {
        join_url(&self.base_url, route)
    }

    async fn send(&self, route: &'static str, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let start = Instant::now();

        let result = async {
            let resp = req.bearer_auth(self.session.token()).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(BackendError::Status { route, code: status.as_u16() });
            }
            Ok::<_, BackendError>(resp)
        }.await;

        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => {
                let rtt = start.elapsed().as_millis() as u32;
                health.on_success(rtt);
                debug!("backend: {} ok ({}ms)", route, rtt);
            }
            Err(e) => {
                health.on_failure(e);
                debug!("backend: {} failed ({} in a row): {}", route, health.consecutive_failures, e);
            }
        }
        result
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_geofence(&self) -> Result<Option<LatLng>, BackendError> {
        let route = "geofence/get";
        let resp = self.send(route, self.client.get(self.url(route))).await?;
        let body = resp.bytes().await?;
        Ok(parse_geofence_response(&body)?)
    }

    async fn save_geofence(&self, center: LatLng) -> Result<(), BackendError> {
        let route = "geofence/set";
        self.send(route, self.client.post(self.url(route)).json(&center)).await?;
        Ok(())
    }

    async fn update_location(&self, current: LatLng) -> Result<(), BackendError> {
        let route = "geofence/update-location";
        self.send(route, self.client.post(self.url(route)).json(&current)).await?;
        Ok(())
    }

    async fn send_alert(&self) -> Result<(), BackendError> {
        match &self.alert_route {
            AlertRoute::Sms => {
                let route = "alerts/send-sms";
                self.send(route, self.client.post(self.url(route))).await?;
            }
            AlertRoute::Alert { patient_id, message } => {
                let route = "alerts/send-alert";
                let body = AlertRequest { patient_id: patient_id.clone(), message: message.clone() };
                self.send(route, self.client.post(self.url(route)).json(&body)).await?;
            }
        }
        Ok(())
    }
}

fn alert_route_name(route: &AlertRoute) -> &'static str {
    match route {
        AlertRoute::Sms => "send-sms",
        AlertRoute::Alert { .. } => "send-alert",
    }
}

fn join_url(base: &str, route: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), route.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    // Accepts a single connection, answers with `status`/`body` and hands back
    // the raw request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 { break; }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len { break; }
                }
            }
            let resp = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status, body.len(), body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.flush().await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}/api", addr), handle)
    }

    fn backend(base: String, route: AlertRoute) -> HttpBackend {
        HttpBackend::new(base, Session::new("tok-123"), route, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn joins_routes_onto_base() {
        assert_eq!(join_url("https://h/api/", "/geofence/get"), "https://h/api/geofence/get");
        assert_eq!(join_url("https://h/api", "alerts/send-sms"), "https://h/api/alerts/send-sms");
    }

    #[test]
    fn session_debug_hides_token() {
        let s = format!("{:?}", Session::new("secret"));
        assert!(!s.contains("secret"));
        assert!(Session::new("  ").is_empty());
    }

    #[test]
    fn link_health_tracks_failures_and_recovers() {
        let mut h = LinkHealth::default();
        assert_eq!(h.to_string(), "backend not contacted yet");
        let err = BackendError::Status { route: "geofence/update-location", code: 503 };
        h.on_failure(&err);
        h.on_failure(&err);
        assert!(!h.is_reachable());
        assert_eq!(
            h.to_string(),
            "backend unreachable (2 failed calls, last: geofence/update-location returned HTTP 503)"
        );
        h.on_success(40);
        assert!(h.is_reachable());
        assert_eq!(h.last_error, None);
        assert_eq!(h.to_string(), "backend ok (40ms)");
    }

    #[tokio::test]
    async fn fetch_geofence_sends_bearer_and_parses() {
        let (base, server) = serve_once("200 OK", r#"{"geofence":{"lat":10.5,"lng":-3.25}}"#).await;
        let be = backend(base, AlertRoute::Sms);
        let got = be.fetch_geofence().await.unwrap();
        assert_eq!(got, Some(LatLng { lat: 10.5, lng: -3.25 }));

        let req = server.await.unwrap();
        assert!(req.starts_with("GET /api/geofence/get "));
        assert!(req.to_ascii_lowercase().contains("authorization: bearer tok-123"));
        assert_eq!(be.link_health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn fetch_geofence_rejects_bad_schema() {
        let (base, _server) = serve_once("200 OK", r#"{"geofence":[1,2]}"#).await;
        let err = backend(base, AlertRoute::Sms).fetch_geofence().await.unwrap_err();
        assert!(matches!(err, BackendError::Schema(_)));
    }

    #[tokio::test]
    async fn save_geofence_posts_lat_lng() {
        let (base, server) = serve_once("200 OK", "{}").await;
        backend(base, AlertRoute::Sms)
            .save_geofence(LatLng { lat: 1.5, lng: 2.5 })
            .await
            .unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("POST /api/geofence/set "));
        assert!(req.ends_with(r#"{"lat":1.5,"lng":2.5}"#));
    }

    #[tokio::test]
    async fn send_alert_uses_configured_route() {
        let (base, server) = serve_once("200 OK", "{}").await;
        let route = AlertRoute::Alert { patient_id: "p9".into(), message: "left zone".into() };
        backend(base, route).send_alert().await.unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("POST /api/alerts/send-alert "));
        assert!(req.ends_with(r#"{"patientId":"p9","message":"left zone"}"#));
    }

    #[tokio::test]
    async fn send_sms_alert_has_no_body() {
        let (base, server) = serve_once("200 OK", "{}").await;
        backend(base, AlertRoute::Sms).send_alert().await.unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("POST /api/alerts/send-sms "));
        assert!(req.to_ascii_lowercase().contains("authorization: bearer tok-123"));
        assert!(req.ends_with("\r\n\r\n"), "unexpected body in {:?}", req);
    }

    #[tokio::test]
    async fn update_location_posts_lat_lng() {
        let (base, server) = serve_once("200 OK", "{}").await;
        backend(base, AlertRoute::Sms)
            .update_location(LatLng { lat: -33.5, lng: 151.25 })
            .await
            .unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("POST /api/geofence/update-location "));
        assert!(req.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(req.ends_with(r#"{"lat":-33.5,"lng":151.25}"#));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base, _server) = serve_once("401 Unauthorized", r#"{"error":"bad token"}"#).await;
        let be = backend(base, AlertRoute::Sms);
        let err = be.send_alert().await.unwrap_err();
        assert!(matches!(err, BackendError::Status { route: "alerts/send-sms", code: 401 }));
        assert_eq!(be.link_health().consecutive_failures, 1);
        assert!(!be.link_health().is_reachable());
    }
}
