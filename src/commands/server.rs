// Server commands - list, start, stop and restart installations

use crate::servers::{discover_servers, PortAllocator, ProcessTable, ServerInstance};
use crate::settings::Settings;
use std::time::Duration;

/// How long a stopping server gets before the command gives up
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Port allocator seeded with the ports of every running installation
pub fn port_allocator(
    settings: &Settings,
    instances: &[ServerInstance],
) -> PortAllocator {
    let mut ports = PortAllocator::new(settings.port_range());
    for instance in instances.iter().filter(|i| i.is_running()) {
        if let Some(port) = instance.port {
            ports.reserve(port);
        }
    }
    ports
}

pub async fn list_servers(settings: &Settings) -> Result<Vec<ServerInstance>, String> {
    let names = discover_servers(&settings.serverdir)
        .map_err(|e| format!("Failed to read {:?}: {}", settings.serverdir, e))?;
    let processes = ProcessTable::scan();

    let mut instances = Vec::with_capacity(names.len());
    for name in names {
        let instance = ServerInstance::inspect(&settings.serverdir, &name, &processes)
            .await
            .map_err(|e| e.to_string())?;
        instances.push(instance);
    }
    Ok(instances)
}

pub async fn get_server(settings: &Settings, name: &str) -> Result<ServerInstance, String> {
    ServerInstance::inspect(&settings.serverdir, name, &ProcessTable::scan())
        .await
        .map_err(|e| e.to_string())
}

/// Start `instance` on a port no running installation uses
pub async fn launch(settings: &Settings, instance: &mut ServerInstance) -> Result<u16, String> {
    let others = list_servers(settings).await?;
    let mut ports = port_allocator(settings, &others);
    instance
        .start(settings, &mut ports)
        .map_err(|e| e.to_string())
}

pub async fn start_server(settings: &Settings, name: &str) -> Result<ServerInstance, String> {
    let mut instance = get_server(settings, name).await?;
    launch(settings, &mut instance).await?;
    Ok(instance)
}

pub async fn stop_server(settings: &Settings, name: &str) -> Result<ServerInstance, String> {
    let mut instance = get_server(settings, name).await?;
    if !instance.stop(STOP_TIMEOUT).await.map_err(|e| e.to_string())? {
        tracing::info!("Server {} was not running", name);
    }
    Ok(instance)
}

pub async fn restart_server(settings: &Settings, name: &str) -> Result<ServerInstance, String> {
    let mut instance = get_server(settings, name).await?;
    instance
        .stop(STOP_TIMEOUT)
        .await
        .map_err(|e| e.to_string())?;
    launch(settings, &mut instance).await?;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::{ServerStatus, EXECUTABLE_PATH};
    use std::path::PathBuf;

    fn instance(name: &str, status: ServerStatus, port: Option<u16>) -> ServerInstance {
        ServerInstance {
            name: name.to_string(),
            dir: PathBuf::from("/srv").join(name),
            status,
            pid: if status == ServerStatus::Running { Some(1) } else { None },
            port,
            version: None,
            save_exists: true,
        }
    }

    #[test]
    fn test_port_allocator_skips_running_ports() {
        let settings: Settings = serde_json::from_str(
            r#"{"username": "u", "token": "t", "serverdir": "s", "portrange": "34197:34199"}"#,
        )
        .unwrap();
        let instances = vec![
            instance("alpha", ServerStatus::Running, Some(34197)),
            // Stale port from a stopped server does not block anything
            instance("beta", ServerStatus::Stopped, Some(34198)),
        ];

        let mut ports = port_allocator(&settings, &instances);
        assert_eq!(ports.allocate(), Some(34198));
    }

    #[tokio::test]
    async fn test_list_servers() {
        let root = tempfile::tempdir().unwrap();
        for name in ["alpha", "beta"] {
            let dir = root.path().join(name);
            std::fs::create_dir_all(dir.join("bin/x64")).unwrap();
            std::fs::write(dir.join(EXECUTABLE_PATH), "").unwrap();
        }
        let settings: Settings = serde_json::from_str(&format!(
            r#"{{"username": "u", "token": "t", "serverdir": {:?}}}"#,
            root.path().display().to_string()
        ))
        .unwrap();

        let servers = list_servers(&settings).await.unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(servers.iter().all(|s| !s.is_running()));

        assert!(get_server(&settings, "gamma").await.is_err());
    }
}
