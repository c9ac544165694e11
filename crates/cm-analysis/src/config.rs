use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRuntimeConfig {
    pub request_timeout_seconds: u64,
    pub max_document_chars: usize,
}

impl LlmRuntimeConfig {
    pub fn from_json(value: Option<&Value>) -> Self {
        let value = value.and_then(|v| v.as_object());
        Self {
            request_timeout_seconds: value
                .and_then(|map| map.get("request_timeout_seconds"))
                .and_then(|v| v.as_u64())
                .unwrap_or(120)
                .clamp(5, 600),
            max_document_chars: value
                .and_then(|map| map.get("max_document_chars"))
                .and_then(|v| v.as_u64())
                .unwrap_or(200_000)
                .clamp(1_000, 2_000_000) as usize,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRuntimeConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub max_attempts: i32,
    pub retry_delay_seconds: u64,
    pub lease_seconds: u64,
    pub llm: LlmRuntimeConfig,
}

impl AnalysisRuntimeConfig {
    pub fn from_json(value: &Value) -> Self {
        Self {
            enabled: value
                .get("enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            poll_interval_seconds: value
                .get("poll_interval_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(5)
                .max(1),
            max_attempts: value
                .get("max_attempts")
                .and_then(|v| v.as_i64())
                .unwrap_or(1)
                .clamp(1, 10) as i32,
            retry_delay_seconds: value
                .get("retry_delay_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(30)
                .max(1),
            lease_seconds: value
                .get("lease_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(300)
                .max(30),
            llm: LlmRuntimeConfig::from_json(value.get("llm")),
        }
    }

    pub fn default_json() -> Value {
        json!({
            "enabled": true,
            "poll_interval_seconds": 5,
            "max_attempts": 1,
            "retry_delay_seconds": 30,
            "lease_seconds": 300,
            "llm": {
                "request_timeout_seconds": 120,
                "max_document_chars": 200000
            }
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// The lease must outlive a full model call or a healthy job would be
    /// reclaimed mid-flight.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(
            self.lease_seconds
                .max(self.llm.request_timeout_seconds.saturating_mul(2)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_default_json() {
        let from_empty = AnalysisRuntimeConfig::from_json(&json!({}));
        let from_defaults = AnalysisRuntimeConfig::from_json(&AnalysisRuntimeConfig::default_json());
        assert_eq!(from_empty, from_defaults);
        assert_eq!(from_empty.max_attempts, 1);
        assert_eq!(from_empty.llm.max_document_chars, 200_000);
        assert_eq!(from_empty.lease(), Duration::from_secs(300));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = AnalysisRuntimeConfig::from_json(&json!({
            "max_attempts": 99,
            "poll_interval_seconds": 0,
            "lease_seconds": 10,
            "llm": { "request_timeout_seconds": 400 }
        }));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.poll_interval_seconds, 1);
        assert_eq!(config.lease(), Duration::from_secs(800));
    }
}
