use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twitter_to_kafka::config::resolve_config_path;

#[derive(Parser)]
#[command(name = "twitter-to-kafka")]
#[command(about = "Streams tweets into a Kafka topic with at-least-once delivery", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or reset the delivery checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    Show,
    Reset,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twitter_to_kafka=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            twitter_to_kafka::cli::run::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                twitter_to_kafka::cli::config::init(stdout)?;
            }
        },
        Some(Commands::Checkpoint { action }) => {
            let config_path = config_path.ok_or("config not found; use --config <path>")?;
            match action {
                CheckpointAction::Show => {
                    twitter_to_kafka::cli::checkpoint::show(&config_path).await?
                }
                CheckpointAction::Reset => {
                    twitter_to_kafka::cli::checkpoint::reset(&config_path).await?
                }
            }
        }
    }

    Ok(())
}
