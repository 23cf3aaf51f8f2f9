use clap::Parser;
use host::network::Server;
use host::simulation::DemoSimulation;
use log::info;
use shared::ReplicationConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Ticks per second
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "16")]
    max_peers: usize,

    /// Replication settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for the demo simulation
    #[arg(long, default_value = "42")]
    seed: u64,
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
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting host...");
    info!(
        "Tick rate {}Hz, up to {} peers, {} messages per tick",
        args.tick_rate, args.max_peers, config.max_messages_per_poll_host
    );

    let mut server = Server::new(
        &address,
        tick_duration,
        args.max_peers,
        config,
        DemoSimulation::new(args.seed),
    )
    .await?;

    server.run().await?;

    Ok(())
}
