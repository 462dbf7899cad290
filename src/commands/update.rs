// Update commands - bring installations and their mods to the latest release

use super::server::{get_server, launch, STOP_TIMEOUT};
use crate::servers::ServerInstance;
use crate::settings::Settings;
use crate::updater::{
    resolve_chain, CatalogClient, LatestVersions, ModUpdateSummary, ModUpdater, PatchPipeline,
    PatchTool, UpdateError, Version,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutableOutcome {
    pub from: Version,
    pub to: Version,
    pub patches: usize,
}

/// Update the installation behind `tool` to the newest release on its version line.
///
/// Skips the catalog entirely when this run already knows the line's target and the
/// installation is at it.
pub async fn update_executable(
    catalog: &CatalogClient,
    latest: &mut LatestVersions,
    pipeline: &PatchPipeline,
    tool: &dyn PatchTool,
) -> Result<ExecutableOutcome, UpdateError> {
    let installed = tool.installed_version().await?;
    let line = installed.line();

    if latest.get(line) == Some(installed) {
        tracing::info!("Already at latest version {}", installed);
        return Ok(ExecutableOutcome {
            from: installed,
            to: installed,
            patches: 0,
        });
    }

    let edges = catalog.fetch_edges(line).await?;
    let target = latest.resolve(installed, &edges)?;
    let chain = resolve_chain(installed, target, &edges)?;
    let reported = pipeline.run(&chain, catalog, tool).await?;

    Ok(ExecutableOutcome {
        from: installed,
        to: reported,
        patches: chain.len(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub server: String,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<ExecutableOutcome>,
    /// Why the executable step left the installation untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mods: Option<ModUpdateSummary>,
    pub restarted: bool,
}

impl UpdateReport {
    fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            finished_at: Utc::now(),
            executable: None,
            executable_skipped: None,
            mods: None,
            restarted: false,
        }
    }

    /// Record the executable step. A line without published updates is reported, not failed.
    fn record_executable(
        &mut self,
        result: Result<ExecutableOutcome, UpdateError>,
    ) -> Result<(), UpdateError> {
        match result {
            Ok(outcome) => self.executable = Some(outcome),
            Err(UpdateError::NoUpdatesForLine(line)) => {
                tracing::warn!("No executable updates published for line {}", line);
                self.executable_skipped = Some(format!("no updates published for line {}", line));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({})",
            self.server,
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        if let Some(exe) = &self.executable {
            if exe.patches == 0 {
                writeln!(f, "  executable: up to date at {}", exe.to)?;
            } else {
                writeln!(
                    f,
                    "  executable: {} -> {} ({} patches)",
                    exe.from, exe.to, exe.patches
                )?;
            }
        }
        if let Some(reason) = &self.executable_skipped {
            writeln!(f, "  executable: {}", reason)?;
        }
        if let Some(mods) = &self.mods {
            writeln!(f, "  mods: {} of {} updated", mods.changed(), mods.mods.len())?;
            for m in &mods.mods {
                writeln!(f, "    {}: {:?}", m.name, m.outcome)?;
            }
        }
        if self.restarted {
            writeln!(f, "  server restarted")?;
        }
        Ok(())
    }
}

/// One CLI invocation's worth of updates, sharing the HTTP client and resolved targets
pub struct UpdateRun {
    settings: Settings,
    catalog: CatalogClient,
    latest: LatestVersions,
    pipeline: PatchPipeline,
}

impl UpdateRun {
    pub fn new(settings: Settings) -> Result<Self, String> {
        let catalog = CatalogClient::new(
            settings.endpoints(),
            settings.credentials(),
            settings.http_timeout(),
        )
        .map_err(|e| e.to_string())?;
        let pipeline = PatchPipeline::new(settings.staging_dir.clone());
        Ok(Self {
            settings,
            catalog,
            latest: LatestVersions::new(),
            pipeline,
        })
    }

    pub fn latest(&self) -> &LatestVersions {
        &self.latest
    }

    pub async fn update_server(&mut self, name: &str) -> Result<UpdateReport, String> {
        let (mut instance, was_running) = self.stop_for_update(name).await?;
        let result = self.update_instance_executable(&instance).await;
        let restarted = self.restart_after(&mut instance, was_running).await;

        let mut report = UpdateReport::new(name);
        report
            .record_executable(result)
            .map_err(|e| e.to_string())?;
        report.restarted = restarted?;
        report.finished_at = Utc::now();
        Ok(report)
    }

    pub async fn update_mods(&mut self, name: &str) -> Result<UpdateReport, String> {
        let (mut instance, was_running) = self.stop_for_update(name).await?;
        let result = ModUpdater::new(&self.catalog, instance.mods_dir())
            .update_installed()
            .await;
        let restarted = self.restart_after(&mut instance, was_running).await;

        let mut report = UpdateReport::new(name);
        report.mods = Some(result.map_err(|e| e.to_string())?);
        report.restarted = restarted?;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Executable then mods, in a single stop/restart window
    pub async fn update_all(&mut self, name: &str) -> Result<UpdateReport, String> {
        let (mut instance, was_running) = self.stop_for_update(name).await?;
        let mut report = UpdateReport::new(name);

        let result = self.update_instance_executable(&instance).await;
        if let Err(e) = report.record_executable(result) {
            // Errors from the restart are logged inside restart_after
            let _ = self.restart_after(&mut instance, was_running).await;
            return Err(e.to_string());
        }

        let mods = ModUpdater::new(&self.catalog, instance.mods_dir())
            .update_installed()
            .await;
        let restarted = self.restart_after(&mut instance, was_running).await;

        report.mods = Some(mods.map_err(|e| e.to_string())?);
        report.restarted = restarted?;
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn update_instance_executable(
        &mut self,
        instance: &ServerInstance,
    ) -> Result<ExecutableOutcome, UpdateError> {
        let tool = instance.executable(&self.settings);
        let outcome =
            update_executable(&self.catalog, &mut self.latest, &self.pipeline, &tool).await?;
        if let Some(target) = self.latest.get(outcome.from.line()) {
            if outcome.to != target {
                tracing::warn!(
                    "{} is at {} after update, latest is {}",
                    instance.name,
                    outcome.to,
                    target
                );
            }
        }
        Ok(outcome)
    }

    async fn stop_for_update(&self, name: &str) -> Result<(ServerInstance, bool), String> {
        let mut instance = get_server(&self.settings, name).await?;
        let was_running = instance
            .stop(STOP_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        Ok((instance, was_running))
    }

    async fn restart_after(
        &self,
        instance: &mut ServerInstance,
        was_running: bool,
    ) -> Result<bool, String> {
        if !was_running {
            return Ok(false);
        }
        match launch(&self.settings, instance).await {
            Ok(port) => {
                tracing::info!("Restarted {} on port {}", instance.name, port);
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Failed to restart {}: {}", instance.name, e);
                Err(format!("Update finished but restart failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::{CatalogEndpoints, Credentials, ModOutcome, ModResult, ToolRun};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedTool {
        version: Mutex<Version>,
    }

    #[async_trait]
    impl PatchTool for FixedTool {
        async fn installed_version(&self) -> Result<Version, UpdateError> {
            Ok(*self.version.lock().unwrap())
        }

        async fn apply_update(&self, _patch: &Path) -> Result<ToolRun, UpdateError> {
            Ok(ToolRun {
                success: false,
                exit_code: Some(1),
                output: "not expected".to_string(),
            })
        }
    }

    fn client(server: &MockServer) -> CatalogClient {
        CatalogClient::new(
            CatalogEndpoints {
                updater_url: server.uri(),
                mods_url: server.uri(),
                package: "core-linux_headless64".to_string(),
            },
            Credentials {
                username: "u".to_string(),
                token: "t".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_up_to_date_skips_patching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-available-versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "core-linux_headless64": [
                    {"from": "1.1.100", "to": "1.1.101"},
                    {"stable": "1.1.101"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = client(&server);
        let staging = tempfile::tempdir().unwrap();
        let pipeline = PatchPipeline::new(staging.path());
        let tool = FixedTool {
            version: Mutex::new("1.1.101".parse().unwrap()),
        };
        let mut latest = LatestVersions::new();

        let first = update_executable(&catalog, &mut latest, &pipeline, &tool)
            .await
            .unwrap();
        assert_eq!(first.patches, 0);
        assert_eq!(first.to, "1.1.101".parse().unwrap());

        // Cached target now matches, so the catalog is not queried again
        let second = update_executable(&catalog, &mut latest, &pipeline, &tool)
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_ahead_of_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-available-versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "core-linux_headless64": [
                    {"from": "1.1.100", "to": "1.1.101"},
                    {"stable": "1.1.101"}
                ]
            })))
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let tool = FixedTool {
            version: Mutex::new("1.1.105".parse().unwrap()),
        };
        let result = update_executable(
            &client(&server),
            &mut LatestVersions::new(),
            &PatchPipeline::new(staging.path()),
            &tool,
        )
        .await;
        assert!(matches!(result, Err(UpdateError::AheadOfCatalog { .. })));
    }

    #[test]
    fn test_report_display_and_json() {
        let mut report = UpdateReport::new("alpha");
        report.executable = Some(ExecutableOutcome {
            from: "1.1.100".parse().unwrap(),
            to: "1.1.102".parse().unwrap(),
            patches: 2,
        });
        report.mods = Some(ModUpdateSummary {
            mods: vec![ModResult {
                name: "Krastorio2".to_string(),
                outcome: ModOutcome::UpToDate {
                    file_name: "Krastorio2_1.3.0.zip".to_string(),
                },
            }],
        });

        let text = report.to_string();
        assert!(text.contains("1.1.100 -> 1.1.102 (2 patches)"));
        assert!(text.contains("0 of 1 updated"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["executable"]["to"], "1.1.102");
        assert_eq!(json["mods"]["mods"][0]["outcome"], "up_to_date");
        assert_eq!(json["restarted"], false);
    }

    #[tokio::test]
    async fn test_line_entered_from_older_line_is_current() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-available-versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "core-linux_headless64": [
                    {"from": "1.0.0", "to": "1.1.0"},
                    {"stable": "1.1.0"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let tool = FixedTool {
            version: Mutex::new("1.1.0".parse().unwrap()),
        };
        let outcome = update_executable(
            &client(&server),
            &mut LatestVersions::new(),
            &PatchPipeline::new(staging.path()),
            &tool,
        )
        .await
        .unwrap();
        assert_eq!(outcome.patches, 0);
        assert_eq!(outcome.to, "1.1.0".parse().unwrap());
    }

    #[test]
    fn test_record_executable_tolerates_missing_line() {
        let mut report = UpdateReport::new("alpha");
        let line = "0.18.47".parse::<Version>().unwrap().line();
        report
            .record_executable(Err(UpdateError::NoUpdatesForLine(line)))
            .unwrap();
        assert!(report.executable.is_none());
        assert_eq!(
            report.executable_skipped.as_deref(),
            Some("no updates published for line 0.18")
        );
        assert!(report.to_string().contains("no updates published for line 0.18"));

        let failed = report.record_executable(Err(UpdateError::Tool("boom".to_string())));
        assert!(matches!(failed, Err(UpdateError::Tool(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_update_server_without_published_line_succeeds() {
        use std::os::unix::fs::PermissionsExt;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-available-versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "core-linux_headless64": [
                    {"from": "1.1.100", "to": "1.1.101"},
                    {"stable": "1.1.101"}
                ]
            })))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("alpha/bin/x64");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join("factorio");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho \"Version: 0.18.47 (build 1, linux64, headless)\"\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&exe).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&exe, perms).unwrap();

        let staging = root.path().join("updates");
        std::fs::create_dir(&staging).unwrap();
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "username": "u",
            "token": "t",
            "serverdir": root.path(),
            "updater_url": server.uri(),
            "mods_url": server.uri(),
            "staging_dir": staging,
        }))
        .unwrap();

        let mut run = UpdateRun::new(settings).unwrap();
        let report = run.update_server("alpha").await.unwrap();
        assert!(report.executable.is_none());
        assert!(report.executable_skipped.is_some());
        assert!(!report.restarted);
    }
}
