use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feed_sync::{FeedKey, SyncConfig};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod tail;

#[derive(Parser)]
#[command(name = "feed-tail")]
#[command(about = "Follow a realtime feed and post chat messages to it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./feed-sync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Help thread, or a direct conversation with --receiver
    Chat(ChatArgs),

    /// Appointment requests addressed to a doctor
    Appointments(TailArgs),

    /// Health records for a patient
    Monitoring(TailArgs),
}

#[derive(Args)]
struct TailArgs {
    /// Owner of the feed (user, doctor or patient id)
    owner: String,

    /// Bearer token for history requests (overrides the config file)
    #[arg(long)]
    token: Option<String>,

    /// History pages to load up front
    #[arg(long, default_value = "1")]
    pages: u32,
}

#[derive(Args)]
struct ChatArgs {
    #[command(flatten)]
    tail: TailArgs,

    /// Other participant of a direct conversation
    #[arg(long)]
    receiver: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "feed_tail=debug,feed_sync=debug,info"
    } else {
        "feed_tail=info,feed_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (key, args) = match cli.command {
        Commands::Chat(args) => {
            let key = match args.receiver {
                Some(receiver) => FeedKey::direct_chat(&args.tail.owner, receiver),
                None => FeedKey::help_chat(&args.tail.owner),
            };
            (key, args.tail)
        }
        Commands::Appointments(args) => (FeedKey::appointment_requests(&args.owner), args),
        Commands::Monitoring(args) => (FeedKey::monitoring(&args.owner), args),
    };

    tail::run(config, key, args.token, args.pages.max(1)).await
}
