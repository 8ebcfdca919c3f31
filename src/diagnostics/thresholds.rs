use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Limits beyond which an operation's diagnostics are worth logging.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DiagnosticsThresholds {
    /// Latency limit for point operations (read, create, replace, ...)
    #[serde(default = "default_point_operation_latency_threshold_ms")]
    pub point_operation_latency_threshold_ms: u64,

    /// Latency limit for queries, feeds and batches
    #[serde(default = "default_non_point_operation_latency_threshold_ms")]
    pub non_point_operation_latency_threshold_ms: u64,

    /// Request units
    #[serde(default = "default_request_charge_threshold")]
    pub request_charge_threshold: f64,

    /// Request or response payload size in bytes
    #[serde(default = "default_payload_size_threshold_bytes")]
    pub payload_size_threshold_bytes: u64,
}

impl Default for DiagnosticsThresholds {
    fn default() -> Self {
        Self {
            point_operation_latency_threshold_ms: default_point_operation_latency_threshold_ms(),
            non_point_operation_latency_threshold_ms: default_non_point_operation_latency_threshold_ms(),
            request_charge_threshold: default_request_charge_threshold(),
            payload_size_threshold_bytes: default_payload_size_threshold_bytes(),
        }
    }
}

impl DiagnosticsThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.point_operation_latency_threshold_ms == 0 || self.non_point_operation_latency_threshold_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "latency thresholds must be greater than 0".into(),
            )));
        }
        if self.request_charge_threshold.is_nan() || self.request_charge_threshold <= 0.0 {
            return Err(Error::Config(ConfigError::Message(
                "request_charge_threshold must be greater than 0".into(),
            )));
        }
        if self.payload_size_threshold_bytes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "payload_size_threshold_bytes must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn point_operation_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.point_operation_latency_threshold_ms)
    }

    pub fn non_point_operation_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.non_point_operation_latency_threshold_ms)
    }
}

fn default_point_operation_latency_threshold_ms() -> u64 {
    1_000
}
fn default_non_point_operation_latency_threshold_ms() -> u64 {
    3_000
}
fn default_request_charge_threshold() -> f64 {
    1_000.0
}
fn default_payload_size_threshold_bytes() -> u64 {
    8 * 1024 * 1024
}
