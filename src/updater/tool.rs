// Server executable - version probing and patch application through the game binary

use super::version::Version;
use super::UpdateError;
use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of one apply invocation. `output` holds stdout followed by stderr.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// The program that knows an installation's version and applies patches to it
#[async_trait]
pub trait PatchTool: Send + Sync {
    async fn installed_version(&self) -> Result<Version, UpdateError>;

    /// Apply one staged patch. A non-zero exit is reported through `ToolRun`, not `Err`.
    async fn apply_update(&self, patch: &Path) -> Result<ToolRun, UpdateError>;
}

/// A headless server binary (`bin/x64/factorio`)
#[derive(Debug, Clone)]
pub struct ServerExecutable {
    path: PathBuf,
    timeout: Duration,
}

impl ServerExecutable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<I, S>(&self, args: I) -> Result<Output, UpdateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.path);
        command.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(UpdateError::Tool(format!(
                "failed to run {}: {}",
                self.path.display(),
                e
            ))),
            Err(_) => Err(UpdateError::Tool(format!(
                "{} did not finish within {}s",
                self.path.display(),
                self.timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl PatchTool for ServerExecutable {
    async fn installed_version(&self) -> Result<Version, UpdateError> {
        let output = self.run(["--version"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version_output(&stdout).ok_or_else(|| {
            UpdateError::Tool(format!(
                "could not parse version from `{} --version`: {}",
                self.path.display(),
                stdout.trim()
            ))
        })
    }

    async fn apply_update(&self, patch: &Path) -> Result<ToolRun, UpdateError> {
        let output = self
            .run([OsStr::new("--apply-update"), patch.as_os_str()])
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ToolRun {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: text,
        })
    }
}

/// Extract `Version: X.Y.Z` from `--version` output
pub fn parse_version_output(output: &str) -> Option<Version> {
    let re = Regex::new(r"Version: (\d+\.\d+\.\d+)").ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_output() {
        let out = "Version: 1.1.104 (build 60713, linux64, headless)\nBinary version: 64\n";
        assert_eq!(parse_version_output(out), Some(Version::new(1, 1, 104)));
        assert_eq!(parse_version_output("factorio"), None);
    }

    #[cfg(unix)]
    fn fake_binary(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = r#"#!/bin/sh
case "$1" in
  --version) echo "Version: 1.1.100 (build 1, linux64, headless)" ;;
  --apply-update)
    case "$2" in
      *bad*) echo "Patch does not match installed version" >&2; exit 3 ;;
      *) echo "applied $2" ;;
    esac ;;
  *) exit 1 ;;
esac
"#;
        let path = dir.join("factorio");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_version_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let exe = ServerExecutable::new(fake_binary(dir.path()));

        assert_eq!(exe.installed_version().await.unwrap(), Version::new(1, 1, 100));

        let ok = exe.apply_update(Path::new("updates/0.zip")).await.unwrap();
        assert!(ok.success);
        assert!(ok.output.contains("applied updates/0.zip"));

        let failed = exe.apply_update(Path::new("updates/bad.zip")).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.output.contains("does not match"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_tool_error() {
        let exe = ServerExecutable::new("/nonexistent/bin/x64/factorio");
        assert!(matches!(
            exe.installed_version().await,
            Err(UpdateError::Tool(_))
        ));
    }
}
