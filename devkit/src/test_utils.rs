/*!
Helpers for async exporter tests
*/

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// fmt subscriber writing through the test harness; safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses. Returns the last result.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Parses the Prometheus text format into `series -> value`, where series is the
/// sample line left of the value (`ecoflow_pd_soc{device="river"}`). Comments are skipped.
pub fn parse_exposition(body: &str) -> HashMap<String, f64> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            let value = match value {
                "+Inf" => f64::INFINITY,
                "-Inf" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                v => v.parse().ok()?,
            };
            Some((series.to_string(), value))
        })
        .collect()
}

/// Value of `metric{device="<device>"}` in an exposition body.
pub fn sample_value(body: &str, metric: &str, device: &str) -> Option<f64> {
    parse_exposition(body)
        .get(&format!("{}{{device=\"{}\"}}", metric, device))
        .copied()
}
