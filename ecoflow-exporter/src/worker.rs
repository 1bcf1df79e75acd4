//! Processing loop: turns queued quota payloads into gauge values
//!
//! Every `interval` (first run one interval after start):
//! 1. liveness: messages waiting => online=1 and received counter += depth,
//!    nothing waiting => online=0 and every metric cleared
//! 2. drain: each payload's `params` object is applied key by key

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricRegistry;
use crate::models::{Device, Observation};
use crate::queue::ObservationQueue;

/// AC input current is reported as stale non-zero values once AC input voltage drops to zero.
pub const AC_IN_VOLTAGE_KEY: &str = "inv.acInVol";
pub const AC_IN_CURRENT_KEY: &str = "inv.acInAmp";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Cannot parse MQTT payload as JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("MQTT payload has no \"params\" key")]
    MissingParams,
    #[error("MQTT payload \"params\" is not an object")]
    ParamsNotObject,
}

/// What one cycle did, mostly for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub online: bool,
    pub payloads: usize,
    pub skipped_payloads: usize,
    pub applied: usize,
    pub skipped_values: usize,
}

/// Extracts the `params` object of a quota message.
pub fn parse_params(payload: &str) -> Result<Map<String, Value>, PayloadError> {
    let mut message: Value = serde_json::from_str(payload)?;
    match message.get_mut("params").map(Value::take) {
        None => Err(PayloadError::MissingParams),
        Some(Value::Object(params)) => Ok(params),
        Some(_) => Err(PayloadError::ParamsNotObject),
    }
}

pub struct Worker {
    queue: ObservationQueue,
    registry: MetricRegistry,
    device: Device,
    interval: Duration,
    /// Set once `inv.acInVol` = 0 is seen, for the rest of the cycle or until non-zero
    ac_input_down: bool,
}

impl Worker {
    pub fn new(queue: ObservationQueue, registry: MetricRegistry, device: Device, interval: Duration) -> Self {
        Self {
            queue,
            registry,
            device,
            interval,
            ac_input_down: false,
        }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub async fn run(mut self) {
        info!(
            "Processing loop started, collecting every {} seconds",
            self.interval.as_secs()
        );
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.run_cycle();
            debug!(
                "Cycle done: {} payloads ({} skipped), {} values applied ({} skipped)",
                report.payloads, report.skipped_payloads, report.applied, report.skipped_values
            );
        }
    }

    /// One liveness + drain pass.
    pub fn run_cycle(&mut self) -> CycleReport {
        let label = self.device.display_name.clone();
        let mut report = CycleReport::default();

        let depth = self.queue.len();
        if depth > 0 {
            debug!("{} messages waiting in queue", depth);
            self.registry.set_online(&label, true);
            self.registry.record_messages(&label, depth as u64);
            report.online = true;
        } else {
            if self.registry.is_online(&label) {
                warn!("No MQTT messages received for {}, device is offline", label);
            }
            self.registry.set_online(&label, false);
            self.registry.clear_all(&label);
        }

        self.ac_input_down = false;
        while let Some(payload) = self.queue.try_get() {
            report.payloads += 1;
            match parse_params(&payload) {
                Ok(params) => self.apply_params(&label, &params, &mut report),
                Err(e) => {
                    error!("{}: {}", e, payload);
                    report.skipped_payloads += 1;
                }
            }
        }
        report
    }

    fn apply_params(&mut self, label: &str, params: &Map<String, Value>, report: &mut CycleReport) {
        // params come key-sorted, the voltage decides for the whole payload
        if let Some(voltage) = params.get(AC_IN_VOLTAGE_KEY).and_then(Value::as_f64) {
            self.ac_input_down = voltage == 0.0;
        }

        for (key, value) in params {
            let Some(mut observation) = Observation::from_param(key, value) else {
                warn!("Skipping unsupported value type for key {}: {}", key, value);
                report.skipped_values += 1;
                continue;
            };

            if key == AC_IN_CURRENT_KEY && self.ac_input_down {
                observation.value = 0.0;
            }

            match self.registry.resolve(&observation.key) {
                Ok(metric) => {
                    metric.set(label, observation.value);
                    report.applied += 1;
                }
                Err(e) => {
                    error!("{}", e);
                    report.skipped_values += 1;
                }
            }
        }

        // also covers a current series left over from an earlier payload or cleared while offline
        if self.ac_input_down {
            if let Some(current) = self.registry.get(AC_IN_CURRENT_KEY) {
                debug!("AC input voltage is zero, forcing {} to 0", AC_IN_CURRENT_KEY);
                current.set(label, 0.0);
            }
        }
    }
}
