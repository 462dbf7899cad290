// Server instances - discovery, process state and start/stop of headless installations

use super::settings_template::{
    server_variables, write_server_settings, write_whitelist, SERVER_SETTINGS_FILE,
    WHITELIST_FILE,
};
use super::{PortAllocator, ServerError};
use crate::settings::Settings;
use crate::updater::{PatchTool, ServerExecutable, Version};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, Signal, System};

/// Location of the server binary inside an installation
pub const EXECUTABLE_PATH: &str = "bin/x64/factorio";

/// Log written by the running server, holds the command line it was started with
pub const CURRENT_LOG: &str = "factorio-current.log";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct ServerProcess {
    pub pid: u32,
    pub name: String,
    pub exe: PathBuf,
}

/// Snapshot of the OS process list, reduced to server binaries
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    processes: Vec<ServerProcess>,
}

impl ProcessTable {
    pub fn scan() -> Self {
        let system = System::new_all();
        let processes = system
            .processes()
            .iter()
            .filter(|(_, p)| p.name().contains("factorio"))
            .filter_map(|(pid, p)| {
                Some(ServerProcess {
                    pid: pid.as_u32(),
                    name: p.name().to_string(),
                    exe: p.exe()?.to_path_buf(),
                })
            })
            .collect();
        Self { processes }
    }

    pub fn from_processes(processes: Vec<ServerProcess>) -> Self {
        Self { processes }
    }

    /// PID of the server process running the installation called `name`
    pub fn pid_for(&self, name: &str) -> Option<u32> {
        let needle = format!("/{}/{}", name, EXECUTABLE_PATH);
        self.processes
            .iter()
            .find(|p| p.name.contains("factorio") && p.exe.to_string_lossy().contains(&needle))
            .map(|p| p.pid)
    }

    pub fn is_alive(pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }

    /// Send SIGTERM. Returns false if the process is gone or the signal could not be sent.
    pub fn terminate(pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .and_then(|p| p.kill_with(Signal::Term))
            .unwrap_or(false)
    }
}

/// Names of all installations under `serverdir`, sorted
pub fn discover_servers(serverdir: &Path) -> Result<Vec<String>, ServerError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(serverdir)? {
        let entry = entry?;
        let path = entry.path();
        if path.join(EXECUTABLE_PATH).is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    tracing::debug!("Found {} servers in {:?}", names.len(), serverdir);
    Ok(names)
}

/// First `--port" "N"` in the server log
pub fn parse_port_from_log(log: &str) -> Option<u16> {
    let re = Regex::new(r#"--port" "(\d+)""#).ok()?;
    re.captures(log)?.get(1)?.as_str().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInstance {
    pub name: String,
    pub dir: PathBuf,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub version: Option<Version>,
    pub save_exists: bool,
}

impl ServerInstance {
    /// Gather the current state of the installation `name` under `serverdir`
    pub async fn inspect(
        serverdir: &Path,
        name: &str,
        processes: &ProcessTable,
    ) -> Result<Self, ServerError> {
        let dir = serverdir.join(name);
        if !dir.join(EXECUTABLE_PATH).is_file() {
            return Err(ServerError::NotFound(name.to_string()));
        }

        let pid = processes.pid_for(name);
        let port = match pid {
            Some(_) => std::fs::read_to_string(dir.join(CURRENT_LOG))
                .ok()
                .and_then(|log| parse_port_from_log(&log)),
            None => None,
        };

        let version = match ServerExecutable::new(dir.join(EXECUTABLE_PATH))
            .installed_version()
            .await
        {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::warn!("Could not determine version of {}: {}", name, e);
                None
            }
        };

        Ok(Self {
            name: name.to_string(),
            status: if pid.is_some() {
                ServerStatus::Running
            } else {
                ServerStatus::Stopped
            },
            save_exists: has_save(&dir.join("saves")),
            dir,
            pid,
            port,
            version,
        })
    }

    pub fn executable_path(&self) -> PathBuf {
        self.dir.join(EXECUTABLE_PATH)
    }

    pub fn executable(&self, settings: &Settings) -> ServerExecutable {
        ServerExecutable::new(self.executable_path()).with_timeout(settings.apply_timeout())
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.dir.join("mods")
    }

    pub fn is_running(&self) -> bool {
        self.status == ServerStatus::Running
    }

    /// Launch the server detached and return the port it listens on
    pub fn start(
        &mut self,
        settings: &Settings,
        ports: &mut PortAllocator,
    ) -> Result<u16, ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning(self.name.clone()));
        }

        let saves = self.dir.join("saves");
        if !has_save(&saves) {
            return Err(ServerError::NoSave {
                name: self.name.clone(),
                saves,
            });
        }

        let lock = self.dir.join(".lock");
        if lock.exists() {
            return Err(ServerError::Locked(self.dir.clone()));
        }

        let vars = server_variables(&self.name, settings);
        write_server_settings(&self.dir, &settings.settings_template, &vars)?;
        write_whitelist(&self.dir, &settings.whitelist)?;

        let port = ports
            .allocate_preferring(self.port)
            .ok_or(ServerError::NoFreePort)?;

        tracing::info!("Starting server {} on port {}", self.name, port);
        let child = Command::new(self.executable_path())
            .current_dir(&self.dir)
            .arg("--start-server-load-latest")
            .arg("--port")
            .arg(port.to_string())
            .arg("--server-settings")
            .arg(self.dir.join(SERVER_SETTINGS_FILE))
            .arg("--server-whitelist")
            .arg(self.dir.join(WHITELIST_FILE))
            .arg("--use-server-whitelist")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        tracing::info!("Server {} started with pid {}", self.name, child.id());
        self.pid = Some(child.id());
        self.port = Some(port);
        self.status = ServerStatus::Running;
        Ok(port)
    }

    /// Terminate the server and wait up to `timeout` for it to exit.
    /// Returns Ok(false) if it was not running.
    pub async fn stop(&mut self, timeout: Duration) -> Result<bool, ServerError> {
        let Some(pid) = self.pid else {
            tracing::debug!("Server {} is not running", self.name);
            return Ok(false);
        };

        tracing::info!("Stopping server {} (pid {})", self.name, pid);
        if !ProcessTable::terminate(pid) && ProcessTable::is_alive(pid) {
            tracing::warn!("Failed to signal pid {}", pid);
        }

        if !wait_for_exit(pid, timeout).await {
            return Err(ServerError::StopTimeout {
                name: self.name.clone(),
                pid,
                secs: timeout.as_secs(),
            });
        }

        tracing::info!("Server {} stopped", self.name);
        self.pid = None;
        self.status = ServerStatus::Stopped;
        Ok(true)
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        write!(f, "{:<20} {:<10}", self.name, version)?;
        match (self.pid, self.port) {
            (Some(pid), Some(port)) => write!(f, " running (pid {}, port {})", pid, port)?,
            (Some(pid), None) => write!(f, " running (pid {})", pid)?,
            _ => write!(f, " stopped")?,
        }
        if !self.save_exists {
            write!(f, " [no save]")?;
        }
        Ok(())
    }
}

/// Poll until `pid` is gone. Returns false if it outlived `timeout`.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !ProcessTable::is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

fn has_save(saves: &Path) -> bool {
    std::fs::read_dir(saves)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().extension().is_some_and(|ext| ext == "zip"))
        })
        .unwrap_or(false)
}
