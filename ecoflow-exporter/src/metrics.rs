//! Dynamic metric registry for EcoFlow quota keys
//!
//! - Derives a Prometheus-safe name from each vendor key (`pd.ext4p8Port` -> `ecoflow_pd_ext4p8_port`)
//! - Creates one labelled gauge per key on first sight, never removes it
//! - Clears every gauge to "no data" when the device goes quiet
//! - Owns the always-present `ecoflow_online` / `ecoflow_mqtt_messages_receive_total` series

use parking_lot::Mutex;
use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub const METRIC_PREFIX: &str = "ecoflow_";
pub const DEVICE_LABEL: &str = "device";

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("Cannot convert payload key {key:?} to comply with the Prometheus data model (got {candidate:?})")]
    InvalidName { key: String, candidate: String },
    #[error("Failed to register metric {name}: {source}")]
    Registration {
        name: String,
        #[source]
        source: prometheus::Error,
    },
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),
}

fn metric_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name regex is valid")
    })
}

/// Converts an EcoFlow payload key into a metric name, without the `ecoflow_` prefix.
///
/// `bms_bmsStatus.maxCellTemp` -> `bms_bms_status_max_cell_temp`
/// `pd.ext4p8Port` -> `pd_ext4p8_port`
pub fn derive_metric_name(source_key: &str) -> Result<String, MetricError> {
    let key = source_key.replace('.', "_");
    let mut chars = key.chars();
    let mut name = String::with_capacity(key.len() + 8);

    if let Some(first) = chars.next() {
        name.extend(first.to_lowercase());
    }
    for c in chars {
        if c.is_uppercase() && !name.ends_with('_') {
            name.push('_');
        }
        name.extend(c.to_lowercase());
    }

    if !metric_name_pattern().is_match(&name) {
        return Err(MetricError::InvalidName {
            key: source_key.to_string(),
            candidate: name,
        });
    }
    Ok(name)
}

/// A gauge bound to one EcoFlow payload key.
pub struct MetricDefinition {
    source_key: String,
    name: String,
    gauge: GaugeVec,
    /// Last value per device label; absent = no data
    values: Mutex<HashMap<String, f64>>,
}

impl MetricDefinition {
    fn new(source_key: &str) -> Result<Self, MetricError> {
        let name = format!("{}{}", METRIC_PREFIX, derive_metric_name(source_key)?);
        let help = format!("value from MQTT object key {}", source_key);
        let gauge = GaugeVec::new(Opts::new(name.clone(), help), &[DEVICE_LABEL]).map_err(|source| {
            MetricError::Registration { name: name.clone(), source }
        })?;

        Ok(Self {
            source_key: source_key.to_string(),
            name,
            gauge,
            values: Mutex::new(HashMap::new()),
        })
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, device: &str, value: f64) {
        debug!("Set {} = {}", self.name, value);
        self.gauge.with_label_values(&[device]).set(value);
        self.values.lock().insert(device.to_string(), value);
    }

    /// Drops the series for `device` so scrapes report absence instead of the last value.
    pub fn clear(&self, device: &str) {
        debug!("Clear {}", self.name);
        // Err only means the series was never set or is already cleared
        let _ = self.gauge.remove_label_values(&[device]);
        self.values.lock().remove(device);
    }

    pub fn value(&self, device: &str) -> Option<f64> {
        self.values.lock().get(device).copied()
    }
}

impl std::fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("source_key", &self.source_key)
            .field("name", &self.name)
            .field("values", &*self.values.lock())
            .finish()
    }
}

/// Owns every exported series. Written only by the processing loop;
/// scrapes go through the shared `prometheus::Registry`.
pub struct MetricRegistry {
    registry: Registry,
    by_source_key: HashMap<String, Arc<MetricDefinition>>,
    by_name: HashMap<String, Arc<MetricDefinition>>,
    online: GaugeVec,
    messages_received: IntCounterVec,
}

impl MetricRegistry {
    /// Registers the status series on `registry` and initializes them for `device`.
    pub fn new(registry: Registry, device: &str) -> Result<Self, MetricError> {
        let online_name = format!("{}online", METRIC_PREFIX);
        let online = GaugeVec::new(
            Opts::new(online_name.clone(), "1 if device is online"),
            &[DEVICE_LABEL],
        )
        .and_then(|g| registry.register(Box::new(g.clone())).map(|_| g))
        .map_err(|source| MetricError::Registration { name: online_name, source })?;

        let received_name = format!("{}mqtt_messages_receive_total", METRIC_PREFIX);
        let messages_received = IntCounterVec::new(
            Opts::new(received_name.clone(), "total MQTT messages"),
            &[DEVICE_LABEL],
        )
        .and_then(|c| registry.register(Box::new(c.clone())).map(|_| c))
        .map_err(|source| MetricError::Registration { name: received_name, source })?;

        online.with_label_values(&[device]).set(0.0);
        messages_received.with_label_values(&[device]).inc_by(0);

        Ok(Self {
            registry,
            by_source_key: HashMap::new(),
            by_name: HashMap::new(),
            online,
            messages_received,
        })
    }

    /// Returns the definition for `source_key`, creating and registering it on first use.
    pub fn resolve(&mut self, source_key: &str) -> Result<Arc<MetricDefinition>, MetricError> {
        if let Some(existing) = self.by_source_key.get(source_key) {
            return Ok(existing.clone());
        }

        let definition = Arc::new(MetricDefinition::new(source_key)?);
        self.registry
            .register(Box::new(definition.gauge.clone()))
            .map_err(|source| MetricError::Registration {
                name: definition.name.clone(),
                source,
            })?;

        info!(
            "Created new metric from payload key {} -> {}",
            source_key, definition.name
        );
        self.by_name.insert(definition.name.clone(), definition.clone());
        self.by_source_key.insert(source_key.to_string(), definition.clone());
        Ok(definition)
    }

    pub fn get(&self, source_key: &str) -> Option<Arc<MetricDefinition>> {
        self.by_source_key.get(source_key).cloned()
    }

    /// Updates the value of an existing metric, by exposed name.
    pub fn set(&self, metric_name: &str, device: &str, value: f64) -> Result<(), MetricError> {
        let definition = self
            .by_name
            .get(metric_name)
            .ok_or_else(|| MetricError::UnknownMetric(metric_name.to_string()))?;
        definition.set(device, value);
        Ok(())
    }

    pub fn clear_all(&self, device: &str) {
        for definition in self.by_source_key.values() {
            definition.clear(device);
        }
    }

    pub fn set_online(&self, device: &str, online: bool) {
        let value = if online { 1.0 } else { 0.0 };
        self.online.with_label_values(&[device]).set(value);
    }

    pub fn is_online(&self, device: &str) -> bool {
        self.online.with_label_values(&[device]).get() >= 1.0
    }

    pub fn record_messages(&self, device: &str, count: u64) {
        self.messages_received.with_label_values(&[device]).inc_by(count);
    }

    pub fn messages_received(&self, device: &str) -> u64 {
        self.messages_received.with_label_values(&[device]).get()
    }

    /// Number of dynamic (payload-derived) metrics.
    pub fn len(&self) -> usize {
        self.by_source_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source_key.is_empty()
    }

    pub fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }
}
