use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::models::Device;
use crate::queue::{new_state, Shared};
use crate::watchdog::ConnectionState;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MqttStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Serialize)]
pub struct ExporterHealth {
    pub uptime_seconds: u64,
    pub device: String,
    pub serial_number: String,
    pub mqtt_status: MqttStatus,
    pub mqtt_reconnects: u32,
    pub reconnecting: bool,
    /// Seconds since the last MQTT message, `None` right after a watchdog reconnect
    pub idle_seconds: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reconnect: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<MqttStatus>,
    last_reconnect: Shared<Option<OffsetDateTime>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state(MqttStatus::Connecting),
            last_reconnect: new_state(None),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Connected;
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Disconnected;
    }

    /// One watchdog reconnect attempt started.
    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = MqttStatus::Reconnecting;
    }

    pub fn mark_reconnected(&self) {
        *self.last_reconnect.lock() = Some(OffsetDateTime::now_utc());
    }

    pub fn mqtt_status(&self) -> MqttStatus {
        *self.mqtt_status.lock()
    }

    pub fn reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, device: &Device, connection: &ConnectionState) -> ExporterHealth {
        ExporterHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            device: device.display_name.clone(),
            serial_number: device.serial_number.clone(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.reconnects(),
            reconnecting: connection.is_reconnecting(),
            idle_seconds: connection.idle_for().map(|d| d.as_secs()),
            last_reconnect: *self.last_reconnect.lock(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
