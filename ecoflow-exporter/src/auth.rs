//! EcoFlow developer API authentication
//!
//! Exchanges the access/secret key pair for transient MQTT credentials:
//! - Requests are signed with HMAC-SHA256 (sorted params + accessKey + nonce + timestamp)
//! - `GET /iot-open/sign/certification` returns broker url, port, account and password
//! - Any failure here is fatal for the process, there is no retry

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::info;

use crate::models::{ConnectionParameters, Device};

pub const CERTIFICATION_ENDPOINT: &str = "/iot-open/sign/certification";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Got HTTP status code {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to parse response: {body} Error: {source}")]
    InvalidResponse {
        body: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to extract key \"message\" from {0}")]
    MissingMessage(String),
    #[error("API rejected the request: {0}")]
    Rejected(String),
    #[error("Failed to extract MQTT credentials from API response: {0}")]
    InvalidCertification(#[source] serde_json::Error),
    #[error("Invalid MQTT port in API response: {0}")]
    InvalidPort(String),
    #[error("Failed to sign request: {0}")]
    Signing(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Certification {
    url: String,
    port: PortField,
    certificate_account: String,
    certificate_password: String,
}

#[derive(Debug, Deserialize)]
struct CertificationResponse {
    data: Certification,
}

pub struct EcoflowApi {
    access_key: String,
    secret_key: String,
    api_host: String,
    http: reqwest::Client,
}

impl EcoflowApi {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>, api_host: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            api_host: api_host.into(),
            http: reqwest::Client::new(),
        }
    }

    /// HMAC-SHA256 (hex) of `k1=v1&k2=v2&accessKey=..&nonce=..&timestamp=..`, params sorted by key.
    pub fn generate_signature(
        &self,
        params: &BTreeMap<String, String>,
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, AuthError> {
        let credentials = format!(
            "accessKey={}&nonce={}&timestamp={}",
            self.access_key, nonce, timestamp
        );
        let message = if params.is_empty() {
            credentials
        } else {
            let param_str = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}&{}", param_str, credentials)
        };

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signed GET against the developer API, returns the decoded body on `"message": "Success"`.
    pub async fn call_api(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Value, AuthError> {
        let url = format!("https://{}{}", self.api_host, endpoint);
        let nonce = rand::thread_rng().gen_range(100_000..=999_999).to_string();
        let timestamp = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).to_string();
        let sign = self.generate_signature(params, &nonce, &timestamp)?;

        let mut request = self
            .http
            .get(&url)
            .header("accessKey", &self.access_key)
            .header("nonce", &nonce)
            .header("timestamp", &timestamp)
            .header("sign", sign)
            .header("Content-Type", "application/json;charset=UTF-8");
        if !params.is_empty() {
            request = request.query(params);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        check_response(status, &body)
    }

    /// Fetches MQTT credentials and builds the connection parameters for `device`.
    pub async fn authorize(&self, device: &Device) -> Result<ConnectionParameters, AuthError> {
        info!("Authenticating with EcoFlow Developer API at {}", self.api_host);
        let response = self.call_api(CERTIFICATION_ENDPOINT, &BTreeMap::new()).await?;
        let params = connection_parameters(response, device)?;

        info!("Successfully obtained MQTT credentials");
        info!("MQTT URL: {}:{}", params.address, params.port);
        info!("MQTT Username: {}", params.username);
        Ok(params)
    }
}

/// Validates status and the `message` field of an API response.
pub fn check_response(status: u16, body: &str) -> Result<Value, AuthError> {
    if status != 200 {
        return Err(AuthError::Status { status, body: body.to_string() });
    }

    let response: Value = serde_json::from_str(body).map_err(|source| AuthError::InvalidResponse {
        body: body.to_string(),
        source,
    })?;
    let message = response
        .get("message")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::MissingMessage(body.to_string()))?;
    if !message.eq_ignore_ascii_case("success") {
        return Err(AuthError::Rejected(message.to_string()));
    }
    Ok(response)
}

fn connection_parameters(response: Value, device: &Device) -> Result<ConnectionParameters, AuthError> {
    let certification = serde_json::from_value::<CertificationResponse>(response)
        .map_err(AuthError::InvalidCertification)?
        .data;

    let port = match certification.port {
        PortField::Number(port) => port,
        PortField::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| AuthError::InvalidPort(text.clone()))?,
    };

    let uuid = uuid::Uuid::new_v4().simple().to_string();
    Ok(ConnectionParameters {
        topic: device.quota_topic(&certification.certificate_account),
        address: certification.url,
        port,
        username: certification.certificate_account,
        password: certification.certificate_password,
        client_id: format!("ecoflow-exporter-{}", &uuid[..8]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> EcoflowApi {
        EcoflowApi::new(
            "Fp4SvIprYSDPXtYJidEtUAd1o",
            "WIbFEKre0s6sLnh4ei7SPUeYnptHG6V",
            "api.ecoflow.com",
        )
    }

    #[test]
    fn test_signature_without_params() {
        let sign = api()
            .generate_signature(&BTreeMap::new(), "345164", "1671171709428")
            .unwrap();
        assert_eq!(
            sign,
            "4409ae9efeaf0be9b8b48f02ebef8e804387e745e513588c136955606ca496f5"
        );
    }

    #[test]
    fn test_signature_with_params() {
        let mut params = BTreeMap::new();
        params.insert("sn".to_string(), "R331ZEB4ZEAL0528".to_string());
        let sign = api().generate_signature(&params, "345164", "1671171709428").unwrap();
        assert_eq!(
            sign,
            "e758f4e0e2de2490d0f557659d72f9804e3285b78b167e30a3d82a1cc723177c"
        );
    }

    #[test]
    fn test_check_response() {
        assert!(matches!(
            check_response(401, "denied"),
            Err(AuthError::Status { status: 401, .. })
        ));
        assert!(matches!(
            check_response(200, "<html>"),
            Err(AuthError::InvalidResponse { .. })
        ));
        assert!(matches!(
            check_response(200, r#"{"code":"0"}"#),
            Err(AuthError::MissingMessage(_))
        ));
        assert!(matches!(
            check_response(200, r#"{"code":"8521","message":"signature is wrong"}"#),
            Err(AuthError::Rejected(m)) if m == "signature is wrong"
        ));
        assert!(check_response(200, r#"{"code":"0","message":"SUCCESS"}"#).is_ok());
    }

    #[test]
    fn test_connection_parameters() {
        let device = Device::new("R331ZEB4ZEAL0528", None);
        let response = json!({
            "code": "0",
            "message": "Success",
            "data": {
                "certificateAccount": "open-abc",
                "certificatePassword": "pw",
                "url": "mqtt-e.ecoflow.com",
                "port": "8883",
                "protocol": "mqtts"
            }
        });

        let params = connection_parameters(response, &device).unwrap();
        assert_eq!(params.address, "mqtt-e.ecoflow.com");
        assert_eq!(params.port, 8883);
        assert_eq!(params.username, "open-abc");
        assert_eq!(params.password, "pw");
        assert_eq!(params.topic, "/open/open-abc/R331ZEB4ZEAL0528/quota");
        assert!(params.client_id.starts_with("ecoflow-exporter-"));
        assert_eq!(params.client_id.len(), "ecoflow-exporter-".len() + 8);
    }

    #[test]
    fn test_connection_parameters_errors() {
        let device = Device::new("R331", None);
        let missing = json!({"message": "Success", "data": {"url": "x", "port": 8883}});
        assert!(matches!(
            connection_parameters(missing, &device),
            Err(AuthError::InvalidCertification(_))
        ));

        let bad_port = json!({"message": "Success", "data": {
            "url": "x", "port": "mqtts", "certificateAccount": "a", "certificatePassword": "b"
        }});
        assert!(matches!(
            connection_parameters(bad_port, &device),
            Err(AuthError::InvalidPort(_))
        ));
    }
}
