use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

/// Loads the config file from the data dir, falling back to defaults when
/// absent. A file that exists but does not parse is a startup error, not a
/// silent default.
pub fn load_app_config(data_dir: &Path) -> AppResult<AppConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("config file {:?} malformed: {}", path, e)))
}
