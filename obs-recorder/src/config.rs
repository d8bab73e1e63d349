//! Persistent settings.
//!
//! Settings live in `settings.json` in the platform config directory
//! (`~/.config/obs-recorder/settings.json` on Linux). Every field has a
//! default, so a partial file or no file at all is fine. Command line
//! options override what is loaded.

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use obs_core::connection::LinkTimeouts;
use obs_core::pipeline::{PipelineConfig, DEFAULT_HANDLEBAR_WIDTH_CM};

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "OpenBikeSensor", "obs-recorder")
}

/// Default location of the settings file
pub fn default_settings_path() -> PathBuf {
    match get_project_dirs() {
        Some(dirs) => dirs.config_dir().join(SETTINGS_FILE),
        None => PathBuf::from(SETTINGS_FILE),
    }
}

/// Default recordings directory: `<data dir>/recordings`
pub fn default_recordings_dir() -> PathBuf {
    let mut path = match get_project_dirs() {
        Some(dirs) => dirs.data_dir().to_owned(),
        None => PathBuf::from("."),
    };
    path.push("recordings");
    path
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Case-insensitive substring a device name must contain
    pub name_filter: String,
    pub handlebar_width_cm: u16,
    pub swap_sensors: bool,
    /// Button presses need readings from both sensors to be kept
    pub require_both_sensors: bool,
    pub stale_after_secs: u64,
    pub discovery_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Closest-approach window
    pub window_secs: u64,
    pub recordings_dir: Option<PathBuf>,
    pub portal_url: Option<String>,
    pub portal_key: Option<String>,
    /// Written into text recordings; `UTC` or `local`
    pub time_zone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name_filter: "OBS".to_string(),
            handlebar_width_cm: DEFAULT_HANDLEBAR_WIDTH_CM,
            swap_sensors: false,
            require_both_sensors: true,
            stale_after_secs: 5,
            discovery_timeout_secs: 5,
            reconnect_delay_ms: 1000,
            window_secs: 5,
            recordings_dir: None,
            portal_url: None,
            portal_key: None,
            time_zone: "UTC".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or the default location.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(),
        };

        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let settings =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text + "\n").map_err(io_err)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            swap_sensors: self.swap_sensors,
            handlebar_width_cm: self.handlebar_width_cm,
            require_both_sensors: self.require_both_sensors,
            horizon_ms: self.window_secs * 1000,
        }
    }

    pub fn link_timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            stale_after_ms: self.stale_after_secs * 1000,
            discovery_timeout_ms: self.discovery_timeout_secs * 1000,
            reconnect_delay_ms: self.reconnect_delay_ms,
        }
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(default_recordings_dir)
    }

    pub fn uses_local_time(&self) -> bool {
        self.time_zone.eq_ignore_ascii_case("local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.link_timeouts(), LinkTimeouts::default());
        assert_eq!(settings.pipeline_config(), PipelineConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(
            &path,
            r#"{ "handlebarWidthCm": 72, "swapSensors": true, "requireBothSensors": false }"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.handlebar_width_cm, 72);
        assert!(settings.swap_sensors);
        assert!(!settings.pipeline_config().require_both_sensors);
        assert_eq!(settings.name_filter, "OBS");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = Settings {
            portal_url: Some("https://portal.example".into()),
            stale_after_secs: 8,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        let loaded = Settings::load(Some(&path)).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.link_timeouts().stale_after_ms, 8_000);
    }
}
