// tokenmesh CLI
//
// Runs a two-device simulation over the in-memory radio, manages the config
// file, and previews how bodies are chunked.

mod config;
mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokenmesh_core::session::split_payload;
use tokenmesh_core::transport::ble::RadioHub;
use tokenmesh_core::{CoordinatorEvent, Token, TokenMeshNode, TransferState};

const ALICE_ADDRESS: &str = "AA:00:00:00:00:01";
const BOB_ADDRESS: &str = "BB:00:00:00:00:02";

#[derive(Parser)]
#[command(name = "tokenmesh")]
#[command(about = "TokenMesh: proximity token transfer over BLE", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at info level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a token between two simulated devices
    Simulate {
        /// Recipient declines the request
        #[arg(long, conflicts_with = "no_answer")]
        reject: bool,
        /// Recipient never answers (approval timeout)
        #[arg(long)]
        no_answer: bool,
        /// Skip the approval round
        #[arg(long, conflicts_with_all = ["reject", "no_answer"])]
        direct: bool,
        /// Size of the token body in bytes
        #[arg(long, default_value = "64")]
        token_size: usize,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show how a body would be chunked
    Chunk {
        /// Body size in bytes
        #[arg(short, long)]
        size: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the full configuration
    Show,
    /// Print the configuration file location
    Path,
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            reject,
            no_answer,
            direct,
            token_size,
        } => {
            let answer = if direct {
                Answer::Direct
            } else if reject {
                Answer::Reject
            } else if no_answer {
                Answer::Ignore
            } else {
                Answer::Approve
            };
            cmd_simulate(answer, token_size).await
        }
        Commands::Config { action } => cmd_config(action),
        Commands::Chunk { size } => cmd_chunk(size),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Approve,
    Reject,
    Ignore,
    Direct,
}

fn demo_token(size: usize) -> Token {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    let body = serde_json::json!({
        "event": "Concert",
        "seat": "A1",
        "padding": "x".repeat(size.saturating_sub(40)),
    });
    Token::new(hex::encode(id), "ticket", "Concert ticket", body.to_string())
}

fn spawn_printer(node: &TokenMeshNode, label: &'static str) {
    let mut events = node.coordinator().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoordinatorEvent::StateChanged { to, .. } => {
                    let state = match to {
                        TransferState::Completed => to.to_string().green(),
                        TransferState::Failed | TransferState::Rejected => to.to_string().red(),
                        _ => to.to_string().bright_cyan(),
                    };
                    println!("  {:<6} {}", label.bold(), state);
                }
                CoordinatorEvent::ApprovalRequested(request) => {
                    println!(
                        "  {:<6} request from {}: {}",
                        label.bold(),
                        request.sender_name.bright_cyan(),
                        request.token_preview
                    );
                }
                CoordinatorEvent::TokenReceived { token_json, .. } => {
                    println!(
                        "  {:<6} {} received token ({} bytes)",
                        label.bold(),
                        "✓".green(),
                        token_json.len()
                    );
                }
                CoordinatorEvent::TokenSent { token_id, .. } => {
                    println!("  {:<6} {} sent token {}", label.bold(), "✓".green(), token_id);
                }
                CoordinatorEvent::TransferFailed { reason, .. } => {
                    println!("  {:<6} {} {}", label.bold(), "✗".red(), reason);
                }
                CoordinatorEvent::TransferCleanedUp { .. } => {}
            }
        }
    });
}

async fn cmd_simulate(answer: Answer, token_size: usize) -> Result<()> {
    let config = config::Config::load()?;
    let settings = config.mesh.clone();

    println!("{}", "TokenMesh simulation".bold());
    println!();

    let hub = RadioHub::new();
    let alice = TokenMeshNode::new(
        settings.clone(),
        hub.radio(ALICE_ADDRESS, "Alice"),
        Arc::new(demo::DemoIdentity),
        demo::DemoIdentity::random_identity(),
        "Alice",
    )
    .context("Failed to create Alice")?;
    let bob = TokenMeshNode::new(
        settings.clone(),
        hub.radio(BOB_ADDRESS, "Bob"),
        Arc::new(demo::DemoIdentity),
        demo::DemoIdentity::random_identity(),
        "Bob",
    )
    .context("Failed to create Bob")?;

    alice.start().await.context("Failed to start Alice")?;
    bob.start().await.context("Failed to start Bob")?;
    println!("  {} Alice at {}", "✓".green(), ALICE_ADDRESS.bright_cyan());
    println!("  {} Bob at {}", "✓".green(), BOB_ADDRESS.bright_cyan());

    let discovery = async {
        loop {
            if let Some(peer) = alice
                .coordinator()
                .discovered_peers()
                .into_iter()
                .find(|p| p.address == BOB_ADDRESS)
            {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    let bob_peer = tokio::time::timeout(Duration::from_secs(15), discovery)
        .await
        .context("Bob was never discovered")?;
    println!("  {} Discovered {}", "✓".green(), bob_peer.display_name.bright_cyan());
    println!();

    spawn_printer(&alice, "Alice");
    spawn_printer(&bob, "Bob");

    let token = demo_token(token_size);
    println!(
        "{} {} ({} bytes)",
        "Sending".bold(),
        token.preview(),
        token.json_data.len()
    );

    let transfer_id = if answer == Answer::Direct {
        alice
            .coordinator()
            .initiate_direct_transfer(token, BOB_ADDRESS)
            .await?
    } else {
        let id = alice
            .coordinator()
            .initiate_transfer(token, BOB_ADDRESS, &bob_peer.display_name)
            .await?;
        answer_request(&bob, &id, answer, &settings.transfer).await?;
        id
    };

    tracing::info!(transfer_id = %transfer_id, ?answer, "Transfer started");

    let limit = settings.transfer.approval_timeout() + settings.transfer.transfer_timeout();
    let outcome = tokio::time::timeout(limit + Duration::from_secs(5), async {
        loop {
            match alice.coordinator().final_state(&transfer_id) {
                Some(state) if state.is_terminal() => return state,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .context("Transfer did not finish")?;

    // Let the recipient's last messages print
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!();
    match outcome {
        TransferState::Completed => println!("{} Transfer completed", "✓".green()),
        other => println!("{} Transfer ended in {}", "✗".red(), other.to_string().red()),
    }

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

async fn answer_request(
    bob: &TokenMeshNode,
    transfer_id: &str,
    answer: Answer,
    transfer: &tokenmesh_core::TransferConfig,
) -> Result<()> {
    let mut approvals = bob.coordinator().watch_pending_approvals();
    let arrived = async {
        loop {
            if approvals
                .borrow_and_update()
                .iter()
                .any(|r| r.transfer_id == transfer_id)
            {
                return Ok::<(), tokio::sync::watch::error::RecvError>(());
            }
            approvals.changed().await?;
        }
    };
    tokio::time::timeout(transfer.approval_timeout(), arrived)
        .await
        .context("Request never reached Bob")?
        .context("Bob stopped")?;

    match answer {
        Answer::Approve => {
            bob.coordinator().approve_transfer(transfer_id).await;
        }
        Answer::Reject => {
            bob.coordinator().reject_transfer(transfer_id).await;
        }
        Answer::Ignore => {
            println!(
                "  {:<6} {}",
                "Bob".bold(),
                format!(
                    "not answering, waiting {}s for the approval timeout",
                    transfer.approval_timeout().as_secs()
                )
                .dimmed()
            );
        }
        Answer::Direct => {}
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = config::Config::config_file()?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            config::Config::default().save()?;
            println!("{} Wrote {}", "✓".green(), path.display().to_string().bright_cyan());
        }

        ConfigAction::Show => {
            let config = config::Config::load()?;
            let json =
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("{}", json);
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_chunk(size: usize) -> Result<()> {
    let config = config::Config::load()?;
    let chunking = &config.mesh.chunking;

    let body = vec![0u8; size];
    let chunks = split_payload(&body, chunking.max_chunk_size).context("Cannot chunk body")?;

    println!("{}", "Chunk plan".bold());
    println!("  Body:        {} bytes", size);
    println!("  Chunk limit: {} bytes", chunking.max_chunk_size);
    println!("  Chunks:      {}", chunks.len().to_string().bright_cyan());
    if let Some(last) = chunks.last() {
        println!("  Last chunk:  {} bytes", last.len());
    }
    let pacing = chunking.inter_chunk_delay() * chunks.len().saturating_sub(1) as u32;
    println!("  Pacing:      {} ms minimum", pacing.as_millis());
    if size <= config.mesh.transfer.chunk_threshold {
        println!(
            "  {}",
            "Fits in a single message; the coordinator would not chunk it".dimmed()
        );
    }

    Ok(())
}
