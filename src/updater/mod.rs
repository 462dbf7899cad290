// Updater - version resolution and patch chain application for server installations

mod catalog;
mod mods;
mod pipeline;
mod resolver;
mod tool;
mod version;

pub use catalog::{CatalogClient, CatalogEndpoints, Credentials, ModRelease};
pub use mods::{read_enabled_mods, ModError, ModOutcome, ModResult, ModUpdateSummary, ModUpdater};
pub use pipeline::{check_staging_ready, PatchPipeline};
pub use resolver::{resolve_chain, resolve_target, LatestVersions, UpdateChain, UpdateEdge};
pub use tool::{PatchTool, ServerExecutable, ToolRun};
pub use version::{ParseVersionError, Version, VersionLine};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Update catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("No updates published for version line {0}")]
    NoUpdatesForLine(VersionLine),

    #[error("Cannot reach {target}: no update starts at {frontier}")]
    UnreachableTarget { frontier: Version, target: Version },

    #[error("Installed version {installed} is newer than latest known {target}")]
    AheadOfCatalog { installed: Version, target: Version },

    #[error("Staging directory {} is not ready: {reason}", path.display())]
    StagingNotReady { path: PathBuf, reason: String },

    #[error("Patch {ordinal} failed to apply (installation left at {installed}): {output}")]
    PatchApplyFailed {
        ordinal: usize,
        output: String,
        installed: Version,
    },

    #[error("Server executable error: {0}")]
    Tool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::CatalogUnavailable(err.to_string())
    }
}
