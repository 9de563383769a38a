use clap::Parser;
use client::network::{Client, ClientConfig};
use log::{info, warn};
use shared::{GameCredential, GameKind};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Encoded game credential printed by the server
    #[arg(short, long)]
    credential: String,

    /// Kind of the game the credential belongs to
    #[arg(short, long, default_value = "EXPLORATION")]
    game_kind: GameKind,

    /// Chat line to send once connected
    #[arg(long)]
    say: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "3000", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let credential = GameCredential::decode(&args.credential)?;
    let config = ClientConfig {
        server: args.server,
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        ..ClientConfig::default()
    };

    info!("Starting client for {} in {}", credential.user_id, credential.game_id);
    let client = Client::new(&config, credential, args.game_kind).await?;
    let mut tasks = client.start();

    let accepted = client.connect().await?;
    info!(
        "Joined {} game {} ({} other player(s), {}s played)",
        accepted.game_kind,
        accepted.game_id,
        accepted.players.len(),
        accepted.play_time_ms / 1000
    );

    match client.ping().await {
        Ok(rtt) => info!("Round trip {}ms", rtt.as_millis()),
        Err(e) => warn!("Ping failed: {}", e),
    }

    if let Some(text) = args.say {
        client.say(&text).await?;
    }

    info!("Connected; press Ctrl+C to leave");
    tokio::signal::ctrl_c().await?;

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect was not acknowledged: {}", e);
    }
    tasks.abort();
    Ok(())
}
