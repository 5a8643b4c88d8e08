use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rkp::config::{SupervisorConfig, load_config};
use rkp::daemon;

#[derive(Parser)]
#[command(name = "rkp")]
#[command(about = "A single-host process supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the supervisor in the foreground until Ctrl-C")]
    Daemon {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: Option<String>,
        #[arg(long, help = "Emit logs as JSON")]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config, json } => {
            init_tracing(json);
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => SupervisorConfig::default(),
            };
            cfg.apply_env_overrides();
            daemon::run(cfg).await
        }
    }
}
