use serde::Serialize;
use serde_json::Value;

/// Identity of the single device served by this process.
/// `display_name` is the `device` label on every exported series.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Device {
    pub serial_number: String,
    pub display_name: String,
}

impl Device {
    pub fn new(serial_number: impl Into<String>, display_name: Option<String>) -> Self {
        let serial_number = serial_number.into();
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| serial_number.clone());
        Self { serial_number, display_name }
    }

    /// Topic carrying the device quota stream, ex: "/open/open-abc/R331ZEB4ZEAL0528/quota"
    pub fn quota_topic(&self, username: &str) -> String {
        format!("/open/{}/{}/quota", username, self.serial_number)
    }
}

/// Broker coordinates handed out by the certification endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub topic: String,
}

/// One key/value pair out of a quota message's `params` object.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub value: f64,
}

impl Observation {
    /// Numbers pass through, booleans become 1/0, anything else has no gauge representation.
    pub fn from_param(key: &str, value: &Value) -> Option<Self> {
        let value = match value {
            Value::Number(n) => n.as_f64()?,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => return None,
        };
        Some(Self { key: key.to_string(), value })
    }
}
