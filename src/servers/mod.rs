// Servers - headless installations managed on this host

mod instance;
mod ports;
mod settings_template;

pub use instance::{
    discover_servers, parse_port_from_log, wait_for_exit, ProcessTable, ServerInstance,
    ServerProcess, ServerStatus, CURRENT_LOG, EXECUTABLE_PATH,
};
pub use ports::PortAllocator;
pub use settings_template::{
    render_template, server_variables, write_server_settings, write_whitelist,
    SERVER_SETTINGS_FILE, WHITELIST_FILE,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server '{0}' not found")]
    NotFound(String),

    #[error("Server '{name}' has no save file, provide one in {}", saves.display())]
    NoSave { name: String, saves: PathBuf },

    #[error("Found .lock file in {}, is the server already running?", .0.display())]
    Locked(PathBuf),

    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Could not find an open port")]
    NoFreePort,

    #[error("Server '{name}' (pid {pid}) did not stop within {secs}s")]
    StopTimeout { name: String, pid: u32, secs: u64 },

    #[error("Template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
