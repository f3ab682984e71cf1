mod config;
mod serve_cmd;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use fabric_core::alerts::AlertManager;
use fabric_core::dashboard::DashboardGenerator;
use fabric_core::metrics::MetricsStore;
use fabric_core::presets;
use fabric_core::registry::ResolverRegistry;
use fabric_db::config::FabricConfig;
use fabric_db::pool;

#[derive(Parser)]
#[command(name = "fabric", about = "Composable task-resolution fabric")]
struct Cli {
    /// Override the data directory (overrides FABRIC_DATA_DIR and the config file)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fabric config file (no database required)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved configuration
    Config,
    /// Run the Monitoring API, seeding the metrics store, alert rules and
    /// registries from the configured data directory
    Serve {
        /// Bind address (overrides the config file's http_bind)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides the config file's api_port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print shell completion script to stdout
    Completions {
        shell: clap_complete::Shell,
    },
}

fn resolve_config(cli: &Cli) -> anyhow::Result<FabricConfig> {
    let mut resolved = config::resolve()?;
    if let Some(dir) = &cli.data_dir {
        resolved.data_dir = dir.into();
    }
    Ok(resolved)
}

async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = FabricConfig::default();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  data_dir = {}", cfg.data_dir.display());
    println!("  http_bind = {}:{}", cfg.http_bind, cfg.api_port);
    println!();
    println!("Next: run `fabric serve` to start the monitoring API.");
    Ok(())
}

fn cmd_config(cfg: &FabricConfig) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(cfg).context("failed to render config")?;
    println!("{rendered}");
    Ok(())
}

async fn cmd_serve(cfg: &FabricConfig, bind: Option<&str>, port: Option<u16>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("failed to create data dir {}", cfg.data_dir.display()))?;

    let db_pool = pool::create_pool(cfg).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    // Resolver implementations are supplied fresh by the embedding process
    // on every startup; only their metadata (notably the `degraded` flag)
    // survives restarts, read lazily on each `register` call.
    let resolver_registry = Arc::new(ResolverRegistry::with_persistence(cfg.registry_dir()));

    let metrics = Arc::new(MetricsStore::new(db_pool.clone(), 1024, Duration::from_secs(2)));
    let alert_rules = presets::load_default_alert_rules();
    let alerts = Arc::new(AlertManager::new(db_pool.clone(), Arc::clone(&metrics), alert_rules));
    let _ticker = Arc::clone(&alerts).spawn_ticker(cfg.collection_interval());

    let dashboards = Arc::new(DashboardGenerator::new());

    let state = serve_cmd::AppState::new(
        resolver_registry,
        metrics,
        alerts,
        dashboards,
        db_pool.clone(),
        cfg.health_interval(),
    );

    let bind = bind.unwrap_or(&cfg.http_bind);
    let port = port.unwrap_or(cfg.api_port);
    let result = serve_cmd::run_serve(state, bind, port).await;
    db_pool.close().await;
    result
}

fn cmd_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { force } => cmd_init(*force).await?,
        Commands::Config => {
            let cfg = resolve_config(&cli)?;
            cmd_config(&cfg)?;
        }
        Commands::Serve { bind, port } => {
            let cfg = resolve_config(&cli)?;
            cmd_serve(&cfg, bind.as_deref(), *port).await?;
        }
        Commands::Completions { shell } => cmd_completions(*shell),
    }

    Ok(())
}
