use crate::DeviceError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Where the lock's hub lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the Maker API app, e.g. `http://10.0.0.5/apps/api/12`.
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub device_id: String,
    /// Upper bound on every request to the hub, so a hung hub cannot stall
    /// the scheduler thread.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn new(url: &str, device_id: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            access_token: None,
            device_id: device_id.to_owned(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| DeviceError::Config(format!("invalid device url '{}': {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DeviceError::Config(format!(
                "device url must be http(s), got '{}'",
                parsed.scheme()
            )));
        }
        if self.device_id.trim().is_empty() {
            return Err(DeviceError::Config("device_id must not be empty".to_owned()));
        }
        Ok(())
    }
}
