//! Kommandozeilen-Client
//!
//! `gift-call start` legt einen Anruf an und gibt die Call-ID aus,
//! `gift-call answer <CALL_ID>` tritt bei. Danach liest der Client Befehle
//! von stdin: `gift <roses|explosion|car>`, `status`, `hangup`/`quit`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gift_call::call_engine::ErrorKind;
use gift_call::config::{ENV_APP_ID, ENV_STORE_PATH};
use gift_call::controller::{CallController, CallObserver, LifecyclePhase};
use gift_call::{CallConfig, CallEngine, GiftBackground, GiftChannelMessage, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "gift-call", version, about = "P2P video calls with animated gifts")]
struct Cli {
    /// JSON-Konfigurationsdatei
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite-Datei, die sich beide Teilnehmer teilen
    #[arg(long, env = ENV_STORE_PATH)]
    store: Option<PathBuf>,

    /// App-ID (Namespace der Call-Records)
    #[arg(long, env = ENV_APP_ID)]
    app_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Neuen Anruf starten
    Start,
    /// Einem Anruf beitreten
    Answer { call_id: String },
}

/// Gibt alle Callbacks auf der Konsole aus
struct ConsoleObserver;

impl CallObserver for ConsoleObserver {
    fn on_status_change(&self, status: &str) {
        println!("[status] {}", status);
    }

    fn on_state_change(&self, phase: LifecyclePhase) {
        tracing::debug!("Phase: {:?}", phase);
    }

    fn on_gift_received(&self, gift: &GiftChannelMessage) {
        println!(
            "[gift] {} ({}, background: {})",
            gift.title,
            gift.video_url,
            gift.background.as_str()
        );
    }

    fn on_gift_channel_ready(&self, ready: bool) {
        if ready {
            println!("[gift] channel ready");
        } else {
            println!("[gift] channel closed");
        }
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        eprintln!("[error] {:?}: {}", kind, message);
    }
}

fn gift_for(name: &str) -> Option<GiftChannelMessage> {
    let (background, title) = match name {
        "roses" => (GiftBackground::Roses, "Roses"),
        "explosion" => (GiftBackground::Explosion, "Explosion"),
        "car" => (GiftBackground::Car, "Sports Car"),
        _ => return None,
    };
    Some(GiftChannelMessage::new(
        format!("/gifts/{}.mp4", name),
        background,
        title,
    ))
}

fn load_config(cli: &Cli) -> anyhow::Result<CallConfig> {
    let config = match &cli.config {
        Some(path) => CallConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => CallConfig::default(),
    };
    let mut config = config.with_env_overrides(|name| std::env::var(name).ok())?;

    if let Some(path) = &cli.store {
        config.store.path = Some(path.clone());
    }
    if let Some(app_id) = cli.app_id.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        config.store.app_id = Some(app_id.to_string());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gift_call::init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store_path = config.store.resolve_path()?;
    let store = SqliteStore::open(
        &store_path,
        config.store.namespace(),
        config.store.poll_interval(),
    )
    .context("Failed to open signaling store")?;

    let engine = CallEngine::with_webrtc(config, Arc::new(store));
    let controller = CallController::new(engine, Arc::new(ConsoleObserver));

    match &cli.command {
        Command::Start => {
            let call_id = controller.start_call().await?;
            println!("Call ID: {}", call_id);
        }
        Command::Answer { call_id } => controller.join_call(call_id).await?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("gift") => match parts.next().and_then(gift_for) {
                Some(gift) => {
                    if controller.send_gift(&gift).await {
                        println!("[gift] sent {}", gift.title);
                    }
                }
                None => println!("usage: gift <roses|explosion|car>"),
            },
            Some("status") => {
                let engine = controller.engine();
                println!(
                    "phase: {:?}, call: {}, gift channel: {}, remote tracks: {}",
                    controller.phase(),
                    engine
                        .call_id()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    if controller.is_gift_channel_ready() { "open" } else { "closed" },
                    engine.remote_tracks().len()
                );
            }
            Some("hangup") | Some("quit") => break,
            Some(other) => println!("unknown command: {}", other),
            None => {}
        }
    }

    controller.hang_up().await;
    Ok(())
}
