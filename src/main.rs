// Factorio Fleet - Main entry point
// Run, stop and update headless Factorio servers from the command line

use clap::{Parser, Subcommand};
use factorio_fleet_lib::commands::{server, update::UpdateRun};
use factorio_fleet_lib::settings::Settings;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Manage a fleet of headless Factorio servers on one host
#[derive(Parser)]
#[command(name = "factorio-fleet", version, about)]
struct Cli {
    /// Path to settings.json
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show every installation with version, state and port
    List,
    /// Start a server on a free port
    Start { name: String },
    /// Stop a running server
    Stop { name: String },
    /// Stop and start a server
    Restart { name: String },
    /// Update the server executable to the latest release on its version line
    Update { name: String },
    /// Update all enabled mods of a server
    UpdateMods { name: String },
    /// Update the executable, then the mods
    UpdateAll { name: String },
}

#[tokio::main]
async fn main() {
    // Keep HTTP client chatter out of the default output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let settings = Settings::load(cli.settings.as_deref()).map_err(|e| e.to_string())?;
    let json = cli.json;

    match cli.command {
        Command::List => {
            let servers = server::list_servers(&settings).await?;
            if json {
                print_json(&servers)
            } else {
                for s in &servers {
                    println!("{}", s);
                }
                Ok(())
            }
        }
        Command::Start { name } => print(&server::start_server(&settings, &name).await?, json),
        Command::Stop { name } => print(&server::stop_server(&settings, &name).await?, json),
        Command::Restart { name } => {
            print(&server::restart_server(&settings, &name).await?, json)
        }
        Command::Update { name } => {
            let mut run = UpdateRun::new(settings)?;
            print(&run.update_server(&name).await?, json)
        }
        Command::UpdateMods { name } => {
            let mut run = UpdateRun::new(settings)?;
            print(&run.update_mods(&name).await?, json)
        }
        Command::UpdateAll { name } => {
            let mut run = UpdateRun::new(settings)?;
            print(&run.update_all(&name).await?, json)
        }
    }
}

fn print<T: Serialize + Display>(value: &T, json: bool) -> Result<(), String> {
    if json {
        print_json(value)
    } else {
        println!("{}", value);
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}
