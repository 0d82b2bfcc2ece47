mod config_commands;
mod index_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "brainproxy", about = "Brainproxy: multi-tenant memory and retrieval proxy for chat completions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to brainproxy.{toml,yaml,json} in ./ or the user config dir).
    #[arg(long, global = true, env = "BRAINPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server (default when no subcommand is provided).
    Serve {
        /// Address to bind to (overrides config value).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config value).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Inspect the local document and memory index.
    Index {
        #[command(subcommand)]
        action: index_commands::IndexAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config_path = cli.config.as_deref();

    match cli.command {
        None => serve(config_path, None, None).await,
        Some(Commands::Serve { bind, port }) => serve(config_path, bind, port).await,
        Some(Commands::Config { action }) => config_commands::handle_config(action, config_path),
        Some(Commands::Index { action }) => {
            let config = brainproxy_config::load_or_discover(config_path)?;
            index_commands::handle_index(action, &config).await
        },
    }
}

async fn serve(
    config_path: Option<&std::path::Path>,
    bind: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "brainproxy starting");

    let mut config = brainproxy_config::load_or_discover(config_path)?;

    // CLI args override config values
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let diagnostics = brainproxy_config::validate::validate(config_path);
    for d in &diagnostics.diagnostics {
        if d.severity == brainproxy_config::Severity::Warning {
            tracing::warn!(path = %d.path, category = d.category, "{}", d.message);
        }
    }
    if diagnostics.has_errors() {
        anyhow::bail!("configuration has errors; run `brainproxy config validate` for details");
    }

    brainproxy_gateway::start_server(&config).await
}
