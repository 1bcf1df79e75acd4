/*!
Quota payloads as published on `/open/{account}/{serial}/quota`

```json
{"id": 1, "version": "1.0", "timestamp": 1700000000000, "moduleType": 0,
 "params": {"pd.soc": 80, "inv.acInVol": 230000}}
```
*/

use anyhow::Result;
use serde_json::{json, Map, Number, Value};

/// Builds one quota message, `params` first, envelope fields added on `build`.
#[derive(Debug, Clone, Default)]
pub struct QuotaPayloadBuilder {
    id: u64,
    params: Map<String, Value>,
    timestamp: Option<i64>,
}

impl QuotaPayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn param<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Panics on NaN / infinite values, JSON cannot carry them.
    pub fn number<S: Into<String>>(self, key: S, value: f64) -> Self {
        let number = Number::from_f64(value).expect("finite number");
        self.param(key, Value::Number(number))
    }

    pub fn integer<S: Into<String>>(self, key: S, value: i64) -> Self {
        self.param(key, Value::from(value))
    }

    pub fn boolean<S: Into<String>>(self, key: S, value: bool) -> Self {
        self.param(key, Value::Bool(value))
    }

    pub fn text<S: Into<String>, V: Into<String>>(self, key: S, value: V) -> Self {
        self.param(key, Value::String(value.into()))
    }

    /// Millisecond timestamp, like the broker sends
    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = Some(chrono::Utc::now().timestamp_millis());
        self
    }

    pub fn build(&self) -> Value {
        let mut message = json!({
            "id": self.id,
            "version": "1.0",
            "moduleType": 0,
            "params": Value::Object(self.params.clone()),
        });
        if let (Some(ts), Value::Object(obj)) = (self.timestamp, &mut message) {
            obj.insert("timestamp".into(), Value::from(ts));
        }
        message
    }

    pub fn to_json(&self) -> String {
        self.build().to_string()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.build())?)
    }
}

/// Payloads the processing loop must skip without touching any metric.
pub mod invalid {
    pub fn not_json() -> String {
        "{\"params\": {\"pd.soc\": 80".to_string()
    }

    pub fn missing_params() -> String {
        r#"{"id": 7, "version": "1.0", "cmdFunc": 254}"#.to_string()
    }

    pub fn params_not_object() -> String {
        r#"{"id": 8, "params": [80, 120]}"#.to_string()
    }

    pub fn all() -> Vec<String> {
        vec![not_json(), missing_params(), params_not_object()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_shapes_quota_message() {
        let payload = QuotaPayloadBuilder::new()
            .id(3)
            .integer("pd.soc", 80)
            .number("pd.wattsOutSum", 12.5)
            .boolean("pd.beepState", false)
            .text("pd.model", "River2")
            .with_timestamp()
            .build();

        assert_eq!(payload["id"], 3);
        assert_eq!(payload["params"]["pd.soc"], 80);
        assert_eq!(payload["params"]["pd.wattsOutSum"], 12.5);
        assert_eq!(payload["params"]["pd.beepState"], false);
        assert_eq!(payload["params"]["pd.model"], "River2");
        assert!(payload["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_invalid_payloads_are_invalid() {
        assert!(serde_json::from_str::<Value>(&invalid::not_json()).is_err());
        let missing: Value = serde_json::from_str(&invalid::missing_params()).unwrap();
        assert!(missing.get("params").is_none());
        let array: Value = serde_json::from_str(&invalid::params_not_object()).unwrap();
        assert!(array["params"].is_array());
    }
}
