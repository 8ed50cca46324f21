use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Serve locally-loaded models behind Ollama- and OpenAI-compatible APIs.
#[derive(Parser, Debug)]
#[command(name = "corrald", version, disable_help_flag = true, ignore_errors = true)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short = 'c', long, default_value = "./config.json")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 9000)]
    port: u16,

    /// Address to bind
    #[arg(short = 'h', long, default_value = "0.0.0.0")]
    host: String,

    /// Verbose logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Require a valid bearer token on every request
    #[arg(short = 't', long)]
    require_token: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    corral_server::run(corral_server::ServeOptions {
        config: cli.config,
        host: cli.host,
        port: cli.port,
        require_token: cli.require_token,
    })
    .await
}
