use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::camera::types::CameraEye;
use crate::settings::types::LiveSettings;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Environment variables that take precedence over the settings file.
pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_URL: &str = "GEMINI_URL";
pub const ENV_MODEL: &str = "GEMINI_MODEL";
pub const ENV_CAMERA_EYE: &str = "CAMERA_EYE";

/// Settings file plus environment overrides.
///
/// The store only ever writes what it loaded from the file (or defaults);
/// values taken from the environment are applied on read and never saved.
pub struct SettingsStore {
    path: PathBuf,
    data: Mutex<LiveSettings>,
}

impl SettingsStore {
    /// Create a store, loading from disk if the file exists. An unreadable
    /// file is logged and replaced by defaults.
    pub fn new(path: PathBuf) -> Self {
        let data = match Self::load(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to load settings from {}: {e}", path.display());
                LiveSettings::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    /// Load settings from a JSON file, returning defaults when it is missing.
    pub fn load(path: &Path) -> Result<LiveSettings> {
        if !path.exists() {
            return Ok(LiveSettings::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save current settings to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().clone();
        let json = serde_json::to_string_pretty(&data)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        info!("settings saved to {}", self.path.display());
        Ok(())
    }

    /// Write the current settings if the file does not exist yet, so there
    /// is something to edit. Returns whether a file was written.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings as stored, without environment overrides.
    pub fn stored(&self) -> LiveSettings {
        self.data.lock().clone()
    }

    /// Settings with the process environment applied on top.
    pub fn effective(&self) -> LiveSettings {
        with_overrides(self.stored(), |name| std::env::var(name).ok())
    }

    #[cfg(test)]
    pub(crate) fn update(&self, change: impl FnOnce(&mut LiveSettings)) {
        change(&mut *self.data.lock());
    }
}

/// Apply overrides looked up through `var`. Empty values are ignored.
pub fn with_overrides(
    mut settings: LiveSettings,
    var: impl Fn(&str) -> Option<String>,
) -> LiveSettings {
    let lookup = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    if let Some(key) = lookup(ENV_API_KEY) {
        settings.api_key = key.trim().to_string();
    }
    if let Some(url) = lookup(ENV_URL) {
        settings.url = url.trim().to_string();
    }
    if let Some(model) = lookup(ENV_MODEL) {
        settings.setup.model = model.trim().to_string();
    }
    if let Some(eye) = lookup(ENV_CAMERA_EYE) {
        match CameraEye::from_name(&eye) {
            Some(eye) => settings.camera_eye = eye,
            None => warn!("ignoring {ENV_CAMERA_EYE}={eye}: expected left, right or unknown"),
        }
    }
    settings
}
