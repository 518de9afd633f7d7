use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bourse_rs::store::{Game, PlayerRef};
use bourse_rs::telemetry;

#[derive(Parser)]
#[command(name = "bourse-rs", about = "Persistent ledger for a multiplayer stock-trading game")]
struct Cli {
    /// Path to the game database; falls back to $BOURSE_DB, then ./game.db
    #[arg(long)]
    data: Option<String>,

    /// Emit machine-readable JSON from the read-only commands
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new empty game
    Create,
    /// Print the invite token for a new player
    Invite { name: String },
    /// Register a new player with a password
    Adduser { name: String, password: String },
    /// Set an existing player's password
    Passwd { name: String, password: String },
    /// Grant or revoke the admin flag
    Admin { name: String, state: String },
    /// Start the market scheduler and keep the game running
    Run {
        /// Administrator account named in the startup banner
        #[arg(long, default_value = "admin")]
        admin: String,
    },
    /// List the stocks currently on the market
    Stocks,
    /// Show the leaderboard
    Leaders,
    /// Show today's market news
    News,
    /// Show the season history
    History,
}

fn data_path(cli: &Cli) -> String {
    cli.data
        .clone()
        .or_else(|| env::var("BOURSE_DB").ok())
        .unwrap_or_else(|| "game.db".to_string())
}

fn open(path: &str) -> Result<Game> {
    Game::open(path).with_context(|| format!("unable to open game {path}"))
}

fn require_player<'g>(game: &'g Game, name: &str) -> Result<PlayerRef<'g>> {
    match game.player(name) {
        Some(p) => Ok(p),
        None => bail!("no such player: {name}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // load .env
    telemetry::init_tracing("info");

    let cli = Cli::parse();
    let path = data_path(&cli);

    match &cli.command {
        Command::Create => {
            Game::create(&path).with_context(|| format!("unable to create game {path}"))?;
            println!("created {path}");
        }
        Command::Invite { name } => {
            let game = open(&path)?;
            if game.has_player(name) {
                bail!("{name} is already part of the game");
            }
            println!("invite token for {name}: {}", game.hash("invite", name));
        }
        Command::Adduser { name, password } => {
            let game = open(&path)?;
            let player = game.new_player(name)?;
            player.set_password(password)?;
            println!("registered {name}");
        }
        Command::Passwd { name, password } => {
            let game = open(&path)?;
            require_player(&game, name)?.set_password(password)?;
        }
        Command::Admin { name, state } => {
            let game = open(&path)?;
            let on = matches!(state.to_lowercase().as_str(), "true" | "1" | "on" | "yes");
            require_player(&game, name)?.set_admin(on)?;
        }
        Command::Run { admin } => {
            telemetry::init_metrics();
            let game = Arc::new(open(&path)?);
            let _scheduler = Arc::clone(&game).run();
            println!("bourse started");
            println!("admin invite token: {}", game.hash("invite", admin));
            tokio::signal::ctrl_c().await?;
            println!("shutting down");
        }
        Command::Stocks => {
            let stocks = open(&path)?.list_stocks();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stocks)?);
            } else {
                for s in stocks {
                    println!("{:12} {}", s.name, s.value);
                }
            }
        }
        Command::Leaders => {
            let leaders = open(&path)?.leaders();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&leaders)?);
            } else {
                for l in leaders {
                    println!("{:20} {}", l.name, l.worth);
                }
            }
        }
        Command::News => {
            for line in open(&path)?.news() {
                println!("{line}");
            }
        }
        Command::History => {
            for line in open(&path)?.history() {
                println!("{line}");
            }
        }
    }
    Ok(())
}
