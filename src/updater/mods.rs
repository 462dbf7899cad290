// Mod updater - keeps every enabled mod at its newest registry release

use super::catalog::CatalogClient;
use super::version::Version;
use super::UpdateError;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Mods shipped with the game itself, never looked up in the registry
pub const BUILTIN_MODS: &[&str] = &["base"];

pub const MOD_LIST_FILE: &str = "mod-list.json";

#[derive(Error, Debug)]
pub enum ModError {
    #[error("Mod {name} not found in registry: {reason}")]
    NotFound { name: String, reason: String },

    #[error("Download of mod {name} failed: {reason}")]
    DownloadFailed { name: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct ModList {
    mods: Vec<ModListEntry>,
}

#[derive(Debug, Deserialize)]
struct ModListEntry {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ModOutcome {
    UpToDate { file_name: String },
    Updated { file_name: String, removed: Vec<String> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ModResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ModOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModUpdateSummary {
    pub mods: Vec<ModResult>,
}

impl ModUpdateSummary {
    /// Number of mods whose installed file was replaced
    pub fn changed(&self) -> usize {
        self.mods
            .iter()
            .filter(|m| matches!(m.outcome, ModOutcome::Updated { .. }))
            .count()
    }
}

/// Names of enabled, non-builtin mods listed in `<mod_dir>/mod-list.json`
pub fn read_enabled_mods(mod_dir: &Path) -> Result<Vec<String>, UpdateError> {
    let path = mod_dir.join(MOD_LIST_FILE);
    let content = std::fs::read_to_string(&path)?;
    let list: ModList = serde_json::from_str(&content).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {}", path.display(), e),
        )
    })?;

    Ok(list
        .mods
        .into_iter()
        .filter(|m| m.enabled && !BUILTIN_MODS.contains(&m.name.as_str()))
        .map(|m| m.name)
        .collect())
}

pub struct ModUpdater<'a> {
    catalog: &'a CatalogClient,
    mod_dir: PathBuf,
}

impl<'a> ModUpdater<'a> {
    pub fn new(catalog: &'a CatalogClient, mod_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            mod_dir: mod_dir.into(),
        }
    }

    /// Update every enabled mod from the directory's manifest
    pub async fn update_installed(&self) -> Result<ModUpdateSummary, UpdateError> {
        let names = read_enabled_mods(&self.mod_dir)?;
        tracing::info!("Found {} enabled mods in {}", names.len(), MOD_LIST_FILE);
        Ok(self.update_mods(&names).await)
    }

    /// Update each named mod independently. A failing mod is recorded as skipped.
    pub async fn update_mods(&self, names: &[String]) -> ModUpdateSummary {
        let mut summary = ModUpdateSummary::default();

        for name in names {
            let outcome = match self.update_one(name).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", name, e);
                    ModOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
            };
            summary.mods.push(ModResult {
                name: name.clone(),
                outcome,
            });
        }

        tracing::info!("{} of {} mods updated", summary.changed(), names.len());
        summary
    }

    async fn update_one(&self, name: &str) -> Result<ModOutcome, ModError> {
        let release = self.catalog.fetch_mod_release(name).await?;

        if Path::new(&release.file_name).file_name() != Some(OsStr::new(&release.file_name)) {
            return Err(ModError::DownloadFailed {
                name: name.to_string(),
                reason: format!("refusing unsafe file name '{}'", release.file_name),
            });
        }

        let target = self.mod_dir.join(&release.file_name);
        if target.is_file() {
            tracing::info!("{} is up to date ({})", name, release.file_name);
            return Ok(ModOutcome::UpToDate {
                file_name: release.file_name,
            });
        }

        tracing::info!("Downloading {}", release.file_name);
        if let Err(e) = self.catalog.download_mod(&release, &target).await {
            // The partial file carries the new name; the old install is untouched
            if let Err(rm) = std::fs::remove_file(&target) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial {}: {}", target.display(), rm);
                }
            }
            return Err(e);
        }

        let removed = self.remove_stale(name, &release.file_name);
        Ok(ModOutcome::Updated {
            file_name: release.file_name,
            removed,
        })
    }

    fn remove_stale(&self, name: &str, keep: &str) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.mod_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", self.mod_dir.display(), e);
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == keep || !is_release_archive(name, &file_name) {
                continue;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::info!("Removed old mod file {}", file_name);
                    removed.push(file_name);
                }
                Err(e) => tracing::warn!("Failed to remove {}: {}", file_name, e),
            }
        }
        removed.sort();
        removed
    }
}

/// `<name>_<major>.<minor>.<patch>.zip`
fn is_release_archive(name: &str, file_name: &str) -> bool {
    file_name
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".zip"))
        .map(|version| version.parse::<Version>().is_ok())
        .unwrap_or(false)
}
