/*!
# EcoFlow DevKit - test helpers for the exporter

- Quota payload builders shaped like the EcoFlow developer MQTT stream
- Polling and logging helpers for async tests
- A tiny parser for the Prometheus text exposition
*/

pub mod payloads;
pub mod test_utils;

pub use payloads::QuotaPayloadBuilder;
pub use test_utils::{init_test_logging, parse_exposition, sample_value, wait_until};
