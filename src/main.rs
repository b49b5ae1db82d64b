//! MCP Hub - session-multiplexed MCP gateway

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use mcp_hub::{
    catalog::{Catalog, MemoryCatalog},
    cli::{Cli, Command, KeysCommand},
    config::Config,
    engine::{Services, SessionFactory},
    gateway::Gateway,
    keys::{generate_key, load_key_file, mask_key, save_key_file},
    setup_tracing,
    transport::run_stdio,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keys(cmd)) => match run_keys_command(cmd) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Stdio) => run_stdio_mode(&cli).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host.clone_from(host);
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

fn build_services(config: &Config) -> mcp_hub::Result<Services> {
    let catalog: Arc<dyn Catalog> = match config.catalog.path.as_deref() {
        Some(path) => Arc::new(MemoryCatalog::load(Path::new(path))?),
        None => Arc::new(MemoryCatalog::new()),
    };
    Ok(Services::new(catalog))
}

/// Run the HTTP gateway
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let services = match build_services(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load catalog: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        max_sessions = config.session.max_sessions,
        "Starting MCP Hub"
    );

    if let Err(e) = Gateway::new(config, services).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Serve one session over stdin/stdout
async fn run_stdio_mode(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let services = match build_services(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load catalog: {e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = SessionFactory::new(services, config.session.notification_buffer).create(None);
    match run_stdio(&engine, config.server.max_body_size).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Stdio transport error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run key file management commands
fn run_keys_command(cmd: KeysCommand) -> anyhow::Result<()> {
    match cmd {
        KeysCommand::List { file } => {
            let keys = load_key_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if keys.is_empty() {
                println!("No keys in {}", file.display());
            } else {
                println!("{} key(s) in {}:\n", keys.len(), file.display());
                for (name, key) in &keys {
                    println!("  {name:<20} {}", mask_key(key));
                }
            }
        }

        KeysCommand::Add { name, file } => {
            let mut keys = load_key_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if keys.contains_key(&name) {
                bail!("Key '{name}' already exists in {}", file.display());
            }
            let key = generate_key();
            keys.insert(name.clone(), key.clone());
            save_key_file(&file, &keys)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!("✅ Added key '{name}'\n");
            println!("{key}");
        }

        KeysCommand::Show { name, file } => {
            let keys = load_key_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let Some(key) = keys.get(&name) else {
                bail!("No key named '{name}' in {}", file.display());
            };
            println!("{key}");
        }

        KeysCommand::Remove { name, file } => {
            let mut keys = load_key_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if keys.remove(&name).is_none() {
                bail!("No key named '{name}' in {}", file.display());
            }
            save_key_file(&file, &keys)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!("✅ Removed key '{name}'");
        }
    }
    Ok(())
}
