use crate::CoreError;
use latchkey_device::GatewayConfig;
use latchkey_store::StoreLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SLOT_COUNT: u16 = 30;
pub const MAX_SLOT_COUNT: u16 = 250;
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5002";
const DEFAULT_DATA_DIR: &str = "~/.local/share/latchkey";
const DEFAULT_CONFIG_PATH: &str = "~/.config/latchkey/latchkey.toml";

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_slot_count() -> u16 {
    DEFAULT_SLOT_COUNT
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_owned()
}

/// Daemon settings, read from `latchkey.toml`.
///
/// ```toml
/// data_dir = "~/.local/share/latchkey"
/// slot_count = 30
/// listen = "127.0.0.1:5002"
///
/// [device]
/// url = "http://10.0.0.5/apps/api/12"
/// access_token = "..."
/// device_id = "34"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_slot_count")]
    pub slot_count: u16,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub device: GatewayConfig,
}

impl Config {
    pub fn new(device: GatewayConfig) -> Self {
        Self {
            data_dir: default_data_dir(),
            slot_count: DEFAULT_SLOT_COUNT,
            listen: default_listen(),
            device,
        }
    }

    pub fn default_path() -> Result<PathBuf, CoreError> {
        expand_tilde(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse, expand `~/` in `data_dir`, and validate.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid config: {e}")))?;
        config.data_dir = expand_tilde(&config.data_dir)?;
        config.device.url = config.device.url.trim_end_matches('/').to_owned();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOT_COUNT {
            return Err(CoreError::Config(format!(
                "slot_count must be between 1 and {MAX_SLOT_COUNT}, got {}",
                self.slot_count
            )));
        }
        if self.listen.trim().is_empty() {
            return Err(CoreError::Config("listen address must not be empty".to_owned()));
        }
        self.device.validate()?;
        Ok(())
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(&self.data_dir)
    }
}

/// Replace a leading `~/` with `$HOME`.
pub fn expand_tilde(path: &Path) -> Result<PathBuf, CoreError> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME")
                .map_err(|_| CoreError::Config("HOME not set".to_owned()))?;
            Ok(PathBuf::from(home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
