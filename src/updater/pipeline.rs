// Patch pipeline - stage every patch of a chain, then apply them strictly in order

use super::catalog::CatalogClient;
use super::resolver::UpdateChain;
use super::tool::PatchTool;
use super::version::Version;
use super::UpdateError;
use std::path::{Path, PathBuf};

pub struct PatchPipeline {
    staging_dir: PathBuf,
}

impl PatchPipeline {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Staged location of the patch at `ordinal` in the chain
    pub fn artifact_path(&self, ordinal: usize) -> PathBuf {
        self.staging_dir.join(format!("{}.zip", ordinal))
    }

    /// Bring the installation behind `tool` along `chain` and return the version it reports afterwards.
    ///
    /// All patches are downloaded before the first one is applied. Each applied patch is
    /// removed from staging; on an apply failure the failed patch and every later one stay
    /// staged for inspection.
    pub async fn run(
        &self,
        chain: &UpdateChain,
        catalog: &CatalogClient,
        tool: &dyn PatchTool,
    ) -> Result<Version, UpdateError> {
        if chain.is_empty() {
            tracing::info!("Already at {}, nothing to patch", chain.target());
            return Ok(chain.start());
        }

        check_staging_ready(&self.staging_dir)?;

        let staged = self.download_all(chain, catalog).await?;
        self.apply_all(chain, &staged, tool).await?;

        // All patches are applied here, so a failed version query only warns
        let installed = match tool.installed_version().await {
            Ok(installed) => installed,
            Err(e) => {
                tracing::warn!(
                    "Could not query version after patching, assuming {}: {}",
                    chain.target(),
                    e
                );
                return Ok(chain.target());
            }
        };
        if installed != chain.target() {
            tracing::warn!(
                "Executable reports {} after patching, expected {}",
                installed,
                chain.target()
            );
        } else {
            tracing::info!("Finished patching, executable now at {}", installed);
        }
        Ok(installed)
    }

    async fn download_all(
        &self,
        chain: &UpdateChain,
        catalog: &CatalogClient,
    ) -> Result<Vec<PathBuf>, UpdateError> {
        let total = chain.len();
        let mut staged = Vec::with_capacity(total);

        for (ordinal, edge) in chain.edges().iter().enumerate() {
            tracing::info!("Downloading patch {}/{} ({})", ordinal + 1, total, edge);
            let dest = self.artifact_path(ordinal);

            let result = async {
                let url = catalog.resolve_download_url(edge).await?;
                catalog.download_patch(&url, &dest).await
            }
            .await;

            match result {
                Ok(bytes) => {
                    tracing::debug!("Staged {} ({} bytes)", dest.display(), bytes);
                    staged.push(dest);
                }
                Err(e) => {
                    tracing::error!("Download of patch {}/{} failed: {}", ordinal + 1, total, e);
                    staged.push(dest);
                    discard(&staged);
                    return Err(e);
                }
            }
        }

        Ok(staged)
    }

    async fn apply_all(
        &self,
        chain: &UpdateChain,
        staged: &[PathBuf],
        tool: &dyn PatchTool,
    ) -> Result<(), UpdateError> {
        let total = staged.len();

        for (ordinal, patch) in staged.iter().enumerate() {
            tracing::info!("Patching {}/{}", ordinal + 1, total);

            let output = match tool.apply_update(patch).await {
                Ok(run) if run.success => {
                    discard(std::slice::from_ref(patch));
                    continue;
                }
                Ok(run) => run.output,
                Err(e) => e.to_string(),
            };

            tracing::error!("Patch {} failed:\n{}", patch.display(), output.trim_end());
            return Err(UpdateError::PatchApplyFailed {
                ordinal,
                output,
                installed: chain.version_after(ordinal),
            });
        }

        Ok(())
    }
}

/// Fails unless `dir` exists and holds nothing but hidden entries.
/// Leftovers are reported, never removed.
pub fn check_staging_ready(dir: &Path) -> Result<(), UpdateError> {
    let not_ready = |reason: String| UpdateError::StagingNotReady {
        path: dir.to_path_buf(),
        reason,
    };

    if !dir.is_dir() {
        return Err(not_ready("directory does not exist".to_string()));
    }

    let mut leftovers = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| not_ready(e.to_string()))? {
        let name = entry
            .map_err(|e| not_ready(e.to_string()))?
            .file_name()
            .to_string_lossy()
            .into_owned();
        if !name.starts_with('.') {
            leftovers.push(name);
        }
    }

    if leftovers.is_empty() {
        Ok(())
    } else {
        leftovers.sort();
        Err(not_ready(format!(
            "leftover files from a previous run: {}",
            leftovers.join(", ")
        )))
    }
}

fn discard(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
