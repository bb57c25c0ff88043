use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:58888";
pub const DEFAULT_CLOUD_BASE_URL: &str = "https://app.octobrowser.net";

pub const ENV_API_KEY: &str = "OCTO_API_KEY";
pub const ENV_LOCAL_API_URL: &str = "OCTO_LOCAL_API_URL";
pub const ENV_CLOUD_API_URL: &str = "OCTO_CLOUD_API_URL";

/// Connection settings for both API roots plus the transport retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OctoConfig {
    /// Local (desktop app) API root.
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,

    /// Cloud API root.
    #[serde(default = "default_cloud_base_url")]
    pub cloud_base_url: String,

    /// API token sent as `X-Octo-Api-Token` on every request when present.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries beyond the first attempt for transient transport failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_local_base_url() -> String {
    DEFAULT_LOCAL_BASE_URL.to_string()
}

fn default_cloud_base_url() -> String {
    DEFAULT_CLOUD_BASE_URL.to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    8_000
}

impl Default for OctoConfig {
    fn default() -> Self {
        Self {
            local_base_url: default_local_base_url(),
            cloud_base_url: default_cloud_base_url(),
            api_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl OctoConfig {
    /// Defaults overridden by `OCTO_LOCAL_API_URL`, `OCTO_CLOUD_API_URL`,
    /// and `OCTO_API_KEY` where set and non-empty.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_nonempty(ENV_LOCAL_API_URL) {
            config.local_base_url = url;
        }
        if let Some(url) = env_nonempty(ENV_CLOUD_API_URL) {
            config.cloud_base_url = url;
        }
        config.api_token = env_nonempty(ENV_API_KEY);
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_point_at_the_known_roots() {
        let config = OctoConfig::default();
        assert_eq!(config.local_base_url, "http://127.0.0.1:58888");
        assert_eq!(config.cloud_base_url, "https://app.octobrowser.net");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: OctoConfig =
            serde_json::from_str(r#"{ "api_token": "tok", "max_retries": 1 }"#)
                .expect("config should deserialize");
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff_cap_ms, 8_000);
    }
}
