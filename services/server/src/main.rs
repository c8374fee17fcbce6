//! biscus command line.
//!
//! Usage:
//!   biscus check server <config.yml>
//!   biscus check client <config.yml>
//!   biscus plugins [--json]
//!   biscus simulate <server.yml> [--client <client.yml>]... [--seed <n>] [--history <out.json>]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use biscus_core::client_manager::SimpleClientManager;
use biscus_core::config::{ClientConfig, ServerConfig};
use biscus_core::registry::plugin_manager::{declarations_path, read_declarations};
use biscus_core::registry::{load_plugins, LoadedPlugins};
use biscus_core::server::{LocalTransport, Server};
use biscus_core::session::{build_client, build_server_session, logger_layers, save_parameters};
use biscus_core::{bootstrap_subscriber, init_tracing, PluginCatalog, PluginRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "biscus")]
#[command(version)]
#[command(about = "Federated learning sessions with pluggable components", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Plugin declaration file
    #[arg(long, env = "PYBISCUS_PLUGIN_CONF_PATH")]
    plugins: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfigKind {
    Server,
    Client,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a session config and print it with defaults filled in
    Check {
        kind: ConfigKind,
        path: PathBuf,
    },

    /// List registered components and plugin import failures
    Plugins {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a federated session with in-process clients
    Simulate {
        /// Server config
        server: PathBuf,

        /// Client config; repeat for more clients. Defaults to `server_run.client_configs`
        #[arg(short, long = "client")]
        clients: Vec<PathBuf>,

        /// Seed for client sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Write the round history here as JSON
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

fn load_registry(declarations: &Path) -> (PluginRegistry, LoadedPlugins) {
    let mut catalog = PluginCatalog::new();
    biscus_plugins::install(&mut catalog);
    let loaded = load_plugins(&catalog, &read_declarations(declarations));
    for failure in loaded.failures() {
        warn!(category = %failure.category, module = %failure.module, reason = %failure.reason, "plugin not imported");
    }
    (PluginRegistry::build(&loaded), loaded)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let declarations = cli.plugins.clone().unwrap_or_else(declarations_path);

    match cli.command {
        Commands::Check { kind, path } => tracing::subscriber::with_default(bootstrap_subscriber(), || -> Result<()> {
            let (registry, _) = load_registry(&declarations);
            let rendered = match kind {
                ConfigKind::Server => serde_json::to_string_pretty(&ServerConfig::load(&path, &registry)?)?,
                ConfigKind::Client => serde_json::to_string_pretty(&ClientConfig::load(&path, &registry)?)?,
            };
            println!("{rendered}");
            Ok(())
        }),
        Commands::Plugins { json } => tracing::subscriber::with_default(bootstrap_subscriber(), || -> Result<()> {
            let (registry, loaded) = load_registry(&declarations);
            let listing = registry.listing();
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
                return Ok(());
            }
            for c in &listing {
                println!("{:<22} {:<20} {:<8} {:<20} {}", c.category.as_str(), c.name, c.origin.as_str(), c.alias, c.module);
            }
            for f in loaded.failures() {
                println!("failed: {} {} ({})", f.category, f.module, f.reason);
            }
            Ok(())
        }),
        Commands::Simulate { server, clients, seed, history } => {
            let (registry, config) = tracing::subscriber::with_default(bootstrap_subscriber(), || -> Result<_> {
                let (registry, _) = load_registry(&declarations);
                let config = ServerConfig::load(&server, &registry)?;
                Ok((registry, config))
            })?;
            init_tracing(logger_layers(&registry, &config.server_run.loggers)?)?;
            simulate(&registry, &config, &server, clients, seed, history.as_deref())
        }
    }
}

fn simulate(registry: &PluginRegistry, config: &ServerConfig, server_path: &Path, clients: Vec<PathBuf>, seed: Option<u64>, history_path: Option<&Path>) -> Result<()> {
    let client_paths = if clients.is_empty() {
        let base = server_path.parent().unwrap_or_else(|| Path::new("."));
        config.server_run.client_configs.iter().map(|p| base.join(p)).collect()
    } else {
        clients
    };
    if client_paths.is_empty() { bail!("no client configs: pass --client or set server_run.client_configs"); }

    let session = build_server_session(registry, config)?;
    let manager = seed.map(SimpleClientManager::with_seed).unwrap_or_default();
    let mut transport = LocalTransport::new();
    for path in &client_paths {
        let client_config = ClientConfig::load(path, registry).with_context(|| format!("client config {}", path.display()))?;
        let (proxy, client) = build_client(registry, &client_config)?;
        if !manager.register(proxy.clone()) { bail!("client id `{proxy}` is used by more than one client config"); }
        transport.connect(proxy, client);
    }
    info!(clients = client_paths.len(), rounds = session.num_rounds, "starting simulated session");

    let mut server = Server::new(session.strategy, Box::new(manager), Box::new(transport));
    let history = server.run(session.num_rounds)?;

    if let Some(save) = &config.server_run.save_on_train_end {
        save_parameters(&config.root_dir, &save.file_path, server.parameters())?;
    }
    if let Some(path) = history_path {
        fs::write(path, serde_json::to_vec_pretty(&history)?).with_context(|| format!("writing history to {}", path.display()))?;
    }
    match history.losses_centralized.last() {
        Some((round, loss)) => info!(round, loss, stale_rounds = history.stale_rounds.len(), "session done"),
        None => info!(stale_rounds = history.stale_rounds.len(), "session done"),
    }
    Ok(())
}
