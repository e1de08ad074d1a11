use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::VadConfig;
use crate::connection::protocol::DEFAULT_WS_URL;
use crate::connection::CONNECT_TIMEOUT;

const SETTINGS_DIR_NAME: &str = "medivoice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable overriding the backend URL
pub const WS_URL_ENV: &str = "MEDIVOICE_WS_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Backend WebSocket endpoint.
    pub ws_url: String,

    /// Give up on a connect attempt after this long.
    pub connect_timeout_ms: u64,

    /// Consecutive failed connects after which each further attempt logs a warning.
    pub max_reconnect_attempts: u32,

    /// Speech segmentation tuning for the microphone gate.
    pub vad: VadConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            max_reconnect_attempts: 5,
            vad: VadConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Apply `MEDIVOICE_WS_URL` if it is set and non-empty
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(WS_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                log::info!("Settings: using {} from environment", WS_URL_ENV);
                self.ws_url = url.to_string();
            }
        }
        self
    }
}

/// `<config_dir>/medivoice/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults
pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

/// Write default settings to the default location if no file exists yet,
/// so there is something to edit
pub fn ensure_settings_file() -> Result<(), String> {
    let path = settings_path()?;
    if ensure_settings_file_at(&path)? {
        log::info!("Settings: wrote defaults to {:?}", path);
    }
    Ok(())
}

/// Returns whether a file was written
pub fn ensure_settings_file_at(path: &Path) -> Result<bool, String> {
    if path.exists() {
        return Ok(false);
    }
    save_settings_to(path, &AppSettings::default())?;
    Ok(true)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the destination.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
