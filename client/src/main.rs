use clap::Parser;
use client::actions::{ActionScript, ActionSettings};
use client::network::Client;
use log::info;
use shared::ReplicationConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Ticks per second
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Replication settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dig a cell every N ticks (0 to disable)
    #[arg(long, default_value = "90")]
    dig_every: u64,

    /// Build a ladder every N ticks (0 to disable)
    #[arg(long, default_value = "150")]
    build_every: u64,

    /// Send a cursor position every N ticks (0 to disable)
    #[arg(long, default_value = "2")]
    cursor_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ReplicationConfig::load(args.config.as_deref())?;
    let tick_duration = Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1)));

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let actions = ActionScript::new(ActionSettings {
        dig_every: args.dig_every,
        build_every: args.build_every,
        cursor_every: args.cursor_every,
        ..ActionSettings::default()
    });
    let mut client = Client::new(&args.server, tick_duration, config, actions).await?;

    client.run().await?;

    Ok(())
}
