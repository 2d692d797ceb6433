//! business-chat - terminal client for the business live chat
//!
//! Lists conversations, opens a live chat with one of them, and manages the
//! locally stored backend URL and token.

mod chat;
mod config;
mod ui;

use anyhow::{Context, Result};
use chat_engine::{ChatEngine, HttpChatApi, WsConnector};
use clap::{Parser, Subcommand};
use colored::Colorize;
use shared::{ChatApi, ChatSession};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "business-chat")]
#[command(about = "Live chat with your customers from the terminal", long_about = None)]
struct Cli {
    /// Backend URL (overrides the config file)
    #[arg(short, long, env = "CHAT_BACKEND_URL")]
    backend_url: Option<String>,

    /// Auth token (overrides the config file)
    #[arg(short, long, env = "CHAT_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List chat sessions, newest activity first
    Sessions {
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Open a live chat with a session
    Chat {
        /// Session ID
        session: Uuid,
    },

    /// Mark every message in a session as read
    Read {
        /// Session ID
        session: Uuid,
    },

    /// Start (or resume) a chat with a business
    Start {
        /// Business (tenant) ID
        tenant: Uuid,
    },

    /// Save the backend URL and token to the config file
    Init {
        /// Backend URL
        #[arg(long)]
        url: String,

        /// Auth token
        #[arg(long)]
        token: Option<String>,
    },

    /// Remove the stored token
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut stored = CliConfig::load()?;

    match cli.command {
        Commands::Init { url, token } => {
            stored.backend_url = Some(config::validate_backend_url(&url)?);
            if token.is_some() {
                stored.auth_token = token;
            }
            stored.save()?;
            ui::print_success(&format!("Saved backend {}", url.bright_white()));
            return Ok(());
        }
        Commands::Logout => {
            if stored.auth_token.take().is_some() {
                stored.save()?;
                ui::print_success("Logged out");
            } else {
                println!("Not logged in");
            }
            return Ok(());
        }
        _ => {}
    }

    let api_config = stored.api_config(cli.backend_url.as_deref(), cli.token.as_deref())?;
    let api = HttpChatApi::new(api_config.clone()).context("Failed to create API client")?;

    match cli.command {
        Commands::Sessions { json } => {
            let mut sessions = api.list_sessions().await?;
            sessions.sort_by(ChatSession::newest_first);
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                ui::print_sessions(&sessions);
            }
        }

        Commands::Read { session } => {
            api.mark_read(session).await?;
            ui::print_success(&format!("Session {} marked read", session));
        }

        Commands::Start { tenant } => {
            let session = api.start_session(tenant).await?;
            ui::print_success(&format!("Chat with {} ready", session.customer_name));
            println!("  ID: {}", session.id.to_string().bright_cyan());
            println!("  Open it with: business-chat chat {}", session.id);
        }

        Commands::Chat { session } => {
            info!("Opening session {} on {}", session, api_config.base_url);
            let connector = Arc::new(WsConnector::new(api_config));
            let (handle, task) = ChatEngine::spawn(stored.engine, Arc::new(api), connector);

            let result = chat::run(&handle, session).await;
            handle.shutdown();
            task.await.context("Chat engine task failed")?;
            result?;
        }

        Commands::Init { .. } | Commands::Logout => {}
    }

    Ok(())
}
