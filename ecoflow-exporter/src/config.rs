//! Exporter configuration, read from the environment (optionally seeded by `.env`)

use std::time::Duration;

use crate::models::Device;

pub const DEFAULT_API_HOST: &str = "api.ecoflow.com";
pub const DEFAULT_EXPORTER_PORT: u16 = 9090;
pub const DEFAULT_COLLECTING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_MQTT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Please, provide all required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Unknown or missing values fall back to INFO.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("DEBUG") => LogLevel::Debug,
            Some("WARNING") | Some("WARN") => LogLevel::Warning,
            Some("ERROR") => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_LEVEL").ok().as_deref())
    }

    /// `tracing_subscriber::EnvFilter` directive
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub device_sn: String,
    pub device_name: Option<String>,
    pub api_host: String,
    pub access_key: String,
    pub secret_key: String,
    pub exporter_port: u16,
    pub collecting_interval: Duration,
    pub mqtt_timeout: Duration,
}

impl ExporterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key -> value source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let device_sn = get("DEVICE_SN");
        let access_key = get("ECOFLOW_ACCESS_KEY");
        let secret_key = get("ECOFLOW_SECRET_KEY");

        let (device_sn, access_key, secret_key) = match (device_sn, access_key, secret_key) {
            (Some(sn), Some(access), Some(secret)) => (sn, access, secret),
            (sn, access, secret) => {
                let missing = [
                    ("DEVICE_SN", sn.is_none()),
                    ("ECOFLOW_ACCESS_KEY", access.is_none()),
                    ("ECOFLOW_SECRET_KEY", secret.is_none()),
                ]
                .into_iter()
                .filter_map(|(var, absent)| absent.then_some(var))
                .collect();
                return Err(ConfigError::Missing(missing));
            }
        };

        let exporter_port = parse_or("EXPORTER_PORT", get("EXPORTER_PORT"), DEFAULT_EXPORTER_PORT)?;
        let interval_secs = parse_or(
            "COLLECTING_INTERVAL",
            get("COLLECTING_INTERVAL"),
            DEFAULT_COLLECTING_INTERVAL_SECS,
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "COLLECTING_INTERVAL",
                value: "0".into(),
                reason: "must be at least 1 second".into(),
            });
        }
        let timeout_secs = parse_or("MQTT_TIMEOUT", get("MQTT_TIMEOUT"), DEFAULT_MQTT_TIMEOUT_SECS)?;

        Ok(Self {
            device_sn,
            device_name: get("DEVICE_NAME"),
            api_host: get("ECOFLOW_API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            access_key,
            secret_key,
            exporter_port,
            collecting_interval: Duration::from_secs(interval_secs),
            mqtt_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn device(&self) -> Device {
        Device::new(self.device_sn.clone(), self.device_name.clone())
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
