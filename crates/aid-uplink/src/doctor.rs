use anyhow::Result;
use crate::Session;

pub fn check_endpoint(base_url: &str, session: &Session, timeout_ms: u64) -> Result<()> {
    anyhow::ensure!(
        base_url.starts_with("https://") || base_url.starts_with("http://"),
        "backend.base_url must be http(s): {}", base_url
    );
    anyhow::ensure!(!session.is_empty(), "session token missing (set session.token or NEURO_AID_TOKEN)");
    anyhow::ensure!(timeout_ms >= 500 && timeout_ms <= 60_000, "backend.timeout_ms should be 500..60000");
    Ok(())
}
