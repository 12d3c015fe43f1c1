use anyhow::Result;

pub fn check_zone(radius_m: f64) -> Result<()> {
    anyhow::ensure!(radius_m.is_finite(), "zone.radius_m must be a number");
    anyhow::ensure!(radius_m >= 10.0 && radius_m <= 10_000.0, "zone.radius_m should be 10..10000");
    Ok(())
}

pub fn check_cooldown(cooldown_s: u64) -> Result<()> {
    anyhow::ensure!(cooldown_s >= 10, "alerts.cooldown_s too low; relatives would be flooded");
    Ok(())
}

pub fn check_watch_interval(interval_ms: u64) -> Result<()> {
    anyhow::ensure!(interval_ms >= 100, "location.interval_ms too low");
    Ok(())
}
