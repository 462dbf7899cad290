// Update catalog client - available patches, download links and mod releases

use super::mods::ModError;
use super::resolver::UpdateEdge;
use super::version::{Version, VersionLine};
use super::UpdateError;
use futures_util::stream::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_UPDATER_URL: &str = "https://updater.factorio.com";
pub const DEFAULT_MODS_URL: &str = "https://mods.factorio.com";
pub const DEFAULT_PACKAGE: &str = "core-linux_headless64";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEndpoints {
    pub updater_url: String,
    pub mods_url: String,
    /// Platform key in the catalog, also sent as `package` when resolving links
    pub package: String,
}

impl Default for CatalogEndpoints {
    fn default() -> Self {
        Self {
            updater_url: DEFAULT_UPDATER_URL.to_string(),
            mods_url: DEFAULT_MODS_URL.to_string(),
            package: DEFAULT_PACKAGE.to_string(),
        }
    }
}

/// Latest known release of one mod
#[derive(Debug, Clone, PartialEq)]
pub struct ModRelease {
    pub mod_name: String,
    pub file_name: String,
    /// Registry-relative download path, only meaningful to the registry
    pub download_url: String,
    pub version: Option<Version>,
}

/// Parsed `get-available-versions` payload for one package
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub edges: Vec<UpdateEdge>,
    pub stable: Option<Version>,
}

// One element of a package's catalog array: an update edge or the stable marker
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogEntry {
    Edge { from: Version, to: Version },
    Stable { stable: Version },
}

#[derive(Debug, Deserialize)]
struct ModListResponse {
    results: Vec<ModListEntry>,
}

#[derive(Debug, Deserialize)]
struct ModListEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    releases: Vec<RawRelease>,
}

#[derive(Debug, Deserialize)]
struct RawRelease {
    file_name: String,
    download_url: String,
    #[serde(default)]
    version: Option<String>,
}

pub struct CatalogClient {
    client: reqwest::Client,
    endpoints: CatalogEndpoints,
    credentials: Credentials,
}

impl CatalogClient {
    pub fn new(
        endpoints: CatalogEndpoints,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("factorio-fleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoints,
            credentials,
        })
    }

    pub fn endpoints(&self) -> &CatalogEndpoints {
        &self.endpoints
    }

    /// Fetch every update edge published for the configured package
    pub async fn fetch_catalog(&self) -> Result<Catalog, UpdateError> {
        let url = format!(
            "{}/get-available-versions",
            self.endpoints.updater_url.trim_end_matches('/')
        );
        tracing::debug!("Fetching update catalog from {}", url);

        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_catalog(body, &self.endpoints.package)
    }

    /// Edges leading into `line`, including the one that enters it from an older line
    pub async fn fetch_edges(&self, line: VersionLine) -> Result<Vec<UpdateEdge>, UpdateError> {
        let catalog = self.fetch_catalog().await?;
        let edges: Vec<UpdateEdge> = catalog
            .edges
            .into_iter()
            .filter(|e| e.to.line() == line)
            .collect();
        tracing::debug!("{} update edges on line {}", edges.len(), line);
        Ok(edges)
    }

    /// Resolve the signed download URL of one patch.
    /// The service answers with a JSON array holding exactly one URL string.
    pub async fn resolve_download_url(&self, edge: &UpdateEdge) -> Result<String, UpdateError> {
        let url = format!(
            "{}/get-download-link",
            self.endpoints.updater_url.trim_end_matches('/')
        );
        let from = edge.from.to_string();
        let to = edge.to.to_string();

        let links: Vec<String> = self
            .client
            .get(&url)
            .query(&[
                ("username", self.credentials.username.as_str()),
                ("token", self.credentials.token.as_str()),
                ("apiVersion", "2"),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("package", self.endpoints.package.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match <[String; 1]>::try_from(links) {
            Ok([link]) => Ok(link),
            Err(links) => Err(UpdateError::CatalogUnavailable(format!(
                "expected exactly one download link for {}, got {}",
                edge,
                links.len()
            ))),
        }
    }

    /// Download a resolved patch URL into `dest`, returning the byte count
    pub async fn download_patch(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        stream_to_file(response, dest).await
    }

    /// Look up the newest release of one mod. Every failure collapses to `NotFound`.
    pub async fn fetch_mod_release(&self, mod_name: &str) -> Result<ModRelease, ModError> {
        let url = format!("{}/api/mods", self.endpoints.mods_url.trim_end_matches('/'));
        let not_found = |reason: String| ModError::NotFound {
            name: mod_name.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .query(&[("page_size", "max"), ("namelist", mod_name)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| not_found(e.to_string()))?;

        let list: ModListResponse = response
            .json()
            .await
            .map_err(|e| not_found(e.to_string()))?;

        latest_release(mod_name, list).ok_or_else(|| not_found("no releases published".to_string()))
    }

    /// Download a mod release into `dest`, returning the byte count
    pub async fn download_mod(&self, release: &ModRelease, dest: &Path) -> Result<u64, ModError> {
        let path = if release.download_url.starts_with('/') {
            release.download_url.clone()
        } else {
            format!("/{}", release.download_url)
        };
        let url = format!("{}{}", self.endpoints.mods_url.trim_end_matches('/'), path);
        let failed = |reason: String| ModError::DownloadFailed {
            name: release.mod_name.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .query(&[
                ("username", self.credentials.username.as_str()),
                ("token", self.credentials.token.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        stream_to_file(response, dest)
            .await
            .map_err(|e| failed(e.to_string()))
    }
}

fn parse_catalog(body: serde_json::Value, package: &str) -> Result<Catalog, UpdateError> {
    let mut packages: HashMap<String, serde_json::Value> = serde_json::from_value(body)
        .map_err(|e| UpdateError::CatalogUnavailable(format!("malformed catalog: {}", e)))?;

    let raw = packages.remove(package).ok_or_else(|| {
        UpdateError::CatalogUnavailable(format!("package '{}' missing from catalog", package))
    })?;

    let entries: Vec<CatalogEntry> = serde_json::from_value(raw).map_err(|e| {
        UpdateError::CatalogUnavailable(format!("malformed entries for '{}': {}", package, e))
    })?;

    if !matches!(entries.last(), Some(CatalogEntry::Stable { .. })) {
        tracing::warn!(
            "Catalog for {} does not end with a stable marker; keeping all entries as edges",
            package
        );
    }

    let mut catalog = Catalog::default();
    for entry in entries {
        match entry {
            CatalogEntry::Edge { from, to } => catalog.edges.push(UpdateEdge { from, to }),
            CatalogEntry::Stable { stable } => catalog.stable = Some(stable),
        }
    }
    Ok(catalog)
}

fn latest_release(mod_name: &str, list: ModListResponse) -> Option<ModRelease> {
    let mut results = list.results;
    let index = results
        .iter()
        .position(|r| r.name.as_deref() == Some(mod_name))
        .unwrap_or(0);
    if results.is_empty() {
        return None;
    }
    let releases = results.swap_remove(index).releases;

    let parsed: Option<Vec<Version>> = releases
        .iter()
        .map(|r| r.version.as_deref().and_then(|v| v.parse().ok()))
        .collect();

    // Prefer the highest parsed version; fall back to the registry's ordering
    let chosen = match parsed {
        Some(versions) if !versions.is_empty() => versions
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i),
        _ => {
            tracing::debug!("Releases of {} lack versions, taking the last entry", mod_name);
            releases.len().checked_sub(1)
        }
    }?;

    let release = releases.into_iter().nth(chosen)?;
    Some(ModRelease {
        mod_name: mod_name.to_string(),
        version: release.version.as_deref().and_then(|v| v.parse().ok()),
        file_name: release.file_name,
        download_url: release.download_url,
    })
}

async fn stream_to_file(response: reqwest::Response, dest: &Path) -> Result<u64, UpdateError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    if written == 0 {
        return Err(UpdateError::CatalogUnavailable(format!(
            "empty download for {}",
            dest.display()
        )));
    }
    Ok(written)
}
