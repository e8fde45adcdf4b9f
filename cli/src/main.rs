//! opwire-agent: bring your command line programs to a REST API.

mod logging;
mod manifest;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use opwire_core::AgentServer;
use opwire_core::ConfigManager;
use opwire_core::Configuration;
use opwire_core::OsFileSystem;
use opwire_core::ServeOptions;
use tracing::info;

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_INIT_FAILURE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "opwire-agent",
    version,
    about = "Bring your command line programs to Rest API",
    disable_help_flag = true
)]
struct Cli {
    #[arg(long = "help", action = ArgAction::Help, global = true, help = "Print help")]
    help: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the service
    #[command(visible_alias = "start", disable_help_flag = true)]
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Explicit configuration file
    #[arg(short = 'c', long = "config-path", visible_alias = "config")]
    config_path: Option<PathBuf>,

    /// The command string that will be executed directly
    #[arg(short = 'd', long = "direct-command", visible_alias = "default-command")]
    direct_command: Option<String>,

    /// Agent http server host
    #[arg(short = 'h', long = "host", visible_alias = "bind-addr")]
    host: Option<String>,

    /// Agent http server port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Path of static web resources, as `PATH|URL-PREFIX` (repeatable)
    #[arg(short = 's', long = "static-path")]
    static_path: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> i32 {
    let server = match init_server(&args) {
        Ok(server) => server,
        Err(error) => {
            eprintln!("opwire-agent: {error:#}");
            return EXIT_INIT_FAILURE;
        }
    };
    match server.serve().await {
        Ok(()) => EXIT_OK,
        Err(error) => {
            eprintln!("opwire-agent: {error:#}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

fn init_server(args: &ServeArgs) -> anyhow::Result<AgentServer> {
    let manager = ConfigManager::new(Arc::new(OsFileSystem));
    let loaded = manager
        .load(args.config_path.as_deref())
        .context("failed to load the configuration")?;
    let configuration = match loaded {
        Some((configuration, _path)) => configuration,
        None => Configuration::default(),
    };

    logging::init(configuration.logging.as_ref());
    info!("{}", manifest::info_string());

    let options = ServeOptions {
        direct_command: args.direct_command.clone().filter(|c| !c.is_empty()),
        host: args.host.clone(),
        port: args.port,
        static_mounts: parse_static_mappings(&args.static_path),
        edition: manifest::edition(),
    };
    AgentServer::new(configuration, options).context("failed to initialize the agent server")
}

/// Parse repeatable `PATH|URL-PREFIX` mappings; a bare path mounts at `/`.
fn parse_static_mappings(raw: &[String]) -> HashMap<String, PathBuf> {
    let mut mounts = HashMap::new();
    for entry in raw {
        let (path, prefix) = match entry.split_once('|') {
            Some((path, prefix)) if !prefix.is_empty() => (path, prefix),
            _ => (entry.as_str(), "/"),
        };
        if path.is_empty() {
            continue;
        }
        mounts.insert(prefix.to_string(), PathBuf::from(path));
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_mappings_split_on_the_pipe() {
        let mounts = parse_static_mappings(&[
            "/srv/www|/assets".to_string(),
            "/srv/root".to_string(),
        ]);
        assert_eq!(mounts.get("/assets"), Some(&PathBuf::from("/srv/www")));
        assert_eq!(mounts.get("/"), Some(&PathBuf::from("/srv/root")));
    }

    #[test]
    fn empty_entries_are_ignored(){
        assert!(parse_static_mappings(&["|/x".to_string()]).is_empty());
    }
}
