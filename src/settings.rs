// Settings - operator configuration shared by every command

use crate::updater::{CatalogEndpoints, Credentials};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not load {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("No settings.json found (looked in {0})")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub username: String,
    pub token: String,
    /// Directory holding one sub-directory per server installation
    pub serverdir: PathBuf,
    /// Inclusive port range as `"low:high"`; absent means OS-assigned ports
    #[serde(default)]
    pub portrange: Option<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_updater_url")]
    pub updater_url: String,
    #[serde(default = "default_mods_url")]
    pub mods_url: String,
    #[serde(default = "default_package")]
    pub package: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    #[serde(default = "default_settings_template")]
    pub settings_template: PathBuf,
}

fn default_updater_url() -> String {
    CatalogEndpoints::default().updater_url
}

fn default_mods_url() -> String {
    CatalogEndpoints::default().mods_url
}

fn default_package() -> String {
    CatalogEndpoints::default().package
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("updates")
}

fn default_http_timeout() -> u64 {
    60
}

fn default_apply_timeout() -> u64 {
    600
}

fn default_settings_template() -> PathBuf {
    PathBuf::from("server-settings.jj")
}

impl Settings {
    /// Load from `explicit` if given, else the first settings file found in the default locations
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let candidates = default_settings_paths();
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(path),
            None => Err(SettingsError::NotFound(
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parsed `portrange`; malformed or inverted ranges count as absent
    pub fn port_range(&self) -> Option<(u16, u16)> {
        let raw = self.portrange.as_deref()?;
        let (low, high) = raw.split_once(':')?;
        let low: u16 = low.trim().parse().ok()?;
        let high: u16 = high.trim().parse().ok()?;
        if low > high {
            tracing::warn!("Ignoring inverted port range {}", raw);
            return None;
        }
        Some((low, high))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            token: self.token.clone(),
        }
    }

    pub fn endpoints(&self) -> CatalogEndpoints {
        CatalogEndpoints {
            updater_url: self.updater_url.clone(),
            mods_url: self.mods_url.clone(),
            package: self.package.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

fn default_settings_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SETTINGS_FILE)];
    if let Some(home) = directories::UserDirs::new() {
        paths.push(home.home_dir().join("FactorioFleet").join(SETTINGS_FILE));
    }
    paths
}
