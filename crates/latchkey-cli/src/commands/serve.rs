use super::EXIT_SUCCESS;
use latchkey_core::Config;
use std::path::Path;
use tracing::info;

pub fn run(config_path: Option<&Path>) -> Result<u8, String> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path().map_err(|e| e.to_string())?,
    };
    let config = Config::load(&path).map_err(|e| e.to_string())?;
    info!("loaded config from {}", path.display());
    latchkey_server::serve(&config).map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
