use clap::Parser;
use log::{error, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use server::accounts::{GameRecord, MemoryDirectory};
use server::network::{Server, ServerConfig, ServerMessage};
use shared::{GameId, GameKind, UserId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Game ticks per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Interval between resends of unacknowledged messages
    #[arg(long, default_value = "500", value_parser = clap::value_parser!(u64).range(1..))]
    resend_interval_ms: u64,

    /// Seed one game of each kind with this many players and print their credentials
    #[arg(short, long, default_value = "0")]
    demo_players: u64,
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Stores one game per kind and issues credentials for `players` accounts
fn seed_demo(directory: &MemoryDirectory, players: u64) -> Result<(), Box<dyn std::error::Error>> {
    for (index, kind) in GameKind::ALL.iter().enumerate() {
        let game_id = GameId(index as u64 + 1);
        directory.add_game(GameRecord {
            id: game_id,
            name: format!("Demo {}", kind),
            host: UserId(1),
            map: format!("{}.tmx", kind.as_str().to_lowercase()),
            kind: *kind,
            config: json!({ "maxPlayers": players.max(1) }),
        })?;

        for user in 1..=players {
            let credential =
                directory.issue_credential(game_id, UserId(user), &format!("player{}", user), &random_key())?;
            println!(
                "{} {} {}: --game-kind {} --credential {}",
                game_id,
                kind,
                credential.user_id,
                kind,
                credential.encode()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        tick_rate: args.tick_rate,
        resend_interval: Duration::from_millis(args.resend_interval_ms),
        ..ServerConfig::default()
    };

    let directory = Arc::new(MemoryDirectory::new());
    if args.demo_players > 0 {
        seed_demo(&directory, args.demo_players)?;
        info!("Seeded {} demo game(s)", GameKind::ALL.len());
    }

    info!("Starting server on {} at {}Hz", config.address(), config.tick_rate);
    let mut server = Server::new(&config, directory.clone(), directory).await?;
    let shutdown = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    server.run().await?;
    Ok(())
}
