//! Vault Chat - Terminal Front-End for the Knowledge Vault Portal
//!
//! Reads questions from stdin and streams the assistant's answers to stdout.
//! Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Local backend on the default port
//! vault-chat
//!
//! # Remote backend, scoped to one repository
//! vault-chat --api-url https://vault.example.com --repo backend-api
//!
//! # Resume a conversation
//! vault-chat --conversation 6f1c...
//!
//! # Verbose logging
//! RUST_LOG=debug vault-chat
//! ```
//!
//! # Commands
//!
//! - `/cancel`: stop the current answer
//! - `/new`: start a new conversation
//! - `/clear`: clear the transcript
//! - `/repo [name]`: focus on a repository, or on everything
//! - `/status`: show connection capabilities
//! - `/reconnect`: retry the chat connection after it gave up
//! - `/quit`: exit
//!
//! Ctrl-C cancels the current answer; a second Ctrl-C while idle exits.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vault_core::{
    config::{load_config_from_path, ConfigOverrides},
    default_config_path, ChatUpdate, ConnectionCapabilities, PortalSession, ToolStatus,
    TurnOutcome,
};

/// Vault Chat - ask questions about your organization's documentation
#[derive(Parser, Debug)]
#[command(name = "vault-chat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend REST base URL
    #[arg(short = 'a', long, env = "VAULT_API_URL", value_name = "URL")]
    api_url: Option<String>,

    /// Backend WebSocket base URL (derived from the API URL when omitted)
    #[arg(short = 'w', long, env = "VAULT_WS_URL", value_name = "URL")]
    ws_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "VAULT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Conversation to resume (a new one is started when omitted)
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,

    /// Focus the assistant on one repository
    #[arg(short = 'r', long, value_name = "NAME")]
    repo: Option<String>,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "VAULT_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("vault_chat={level},vault_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn print_flush(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{text}");
    let _ = out.flush();
}

/// Render chat updates to the terminal
fn render(update: &ChatUpdate) {
    match update {
        ChatUpdate::ContentDelta { delta, .. } => print_flush(delta),
        ChatUpdate::ToolCallChanged { call, .. } => {
            let marker = match call.status {
                ToolStatus::Pending | ToolStatus::Running => "…",
                ToolStatus::Success => "✓",
                ToolStatus::Error => "✗",
            };
            print_flush(&format!("\n[{marker} {}]\n", call.name));
        }
        ChatUpdate::TurnFinished {
            outcome, message, ..
        } => {
            match outcome {
                TurnOutcome::Failed => {
                    if let Some(message) = message {
                        print_flush(&format!("\n{}", message.content));
                    }
                }
                TurnOutcome::Cancelled => print_flush("\n[cancelled]"),
                TurnOutcome::Completed | TurnOutcome::Ignored => {}
            }
            if let Some(message) = message {
                for doc in &message.document_references {
                    print_flush(&format!("\n  ↳ {}/{}", doc.repo, doc.path));
                }
            }
            print_flush("\n> ");
        }
        ChatUpdate::Cleared => print_flush("[transcript cleared]\n"),
        ChatUpdate::MessageAppended(_) => {}
    }
}

fn describe(caps: &ConnectionCapabilities) -> String {
    let mut line = format!(
        "backend: {:?}, socket: {}, send: {}, browse: {}",
        caps.backend, caps.socket, caps.can_send, caps.can_browse
    );
    if let Some(error) = &caps.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

fn is_running(turn: Option<&JoinHandle<TurnOutcome>>) -> bool {
    turn.is_some_and(|t| !t.is_finished())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.as_deref()).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = &args.api_url {
        overrides = overrides.with_api_url(url.clone());
    }
    if let Some(url) = &args.ws_url {
        overrides = overrides.with_ws_url(url.clone());
    }
    if args.no_reconnect {
        overrides = overrides.without_reconnect();
    }
    overrides.apply(&mut config);
    info!(source = %config.source(), "Configuration loaded");

    let session = PortalSession::new(config).context("Failed to start portal session")?;

    let _chat_view = session.chat().subscribe(render);
    let _status_view = session.connection().subscribe(|caps| {
        eprintln!("[{}]", describe(caps));
    });

    session.start();
    session.set_repository(args.repo.as_deref());
    let conversation = match &args.conversation {
        Some(id) => {
            session.open_conversation(id);
            id.clone()
        }
        None => session.new_chat(),
    };
    eprintln!("conversation {conversation} (type /quit to exit)");
    print_flush("> ");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turn: Option<JoinHandle<TurnOutcome>> = None;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            interrupt = tokio::signal::ctrl_c() => {
                interrupt.context("Failed to listen for Ctrl-C")?;
                if is_running(turn.as_ref()) {
                    session.chat().cancel_generation();
                    continue;
                }
                break;
            }
        };

        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        let (command, rest) = input.split_once(' ').unwrap_or((input, ""));

        match command {
            "" => print_flush("> "),
            "/quit" | "/exit" => break,
            "/cancel" => {
                if !session.chat().cancel_generation() {
                    print_flush("[nothing to cancel]\n> ");
                }
            }
            "/new" => {
                let id = session.new_chat();
                eprintln!("conversation {id}");
                print_flush("> ");
            }
            "/clear" => session.chat().clear_messages(),
            "/repo" => {
                let repo = Some(rest.trim()).filter(|r| !r.is_empty());
                session.set_repository(repo);
                print_flush(&format!("[scope: {}]\n> ", repo.unwrap_or("all repositories")));
            }
            "/reconnect" => {
                let note = if session.reconnect() {
                    "[reconnecting]"
                } else {
                    "[already connected or retrying]"
                };
                print_flush(&format!("{note}\n> "));
            }
            "/status" => {
                print_flush(&format!("[{}]\n> ", describe(&session.capabilities())));
            }
            _ if is_running(turn.as_ref()) => {
                print_flush("[still answering; /cancel to stop]\n");
            }
            _ => {
                if !session.capabilities().can_send {
                    warn!("Sending while the assistant is unavailable; message will be queued");
                }
                let chat = session.chat().clone();
                let content = input.to_string();
                turn = Some(tokio::spawn(async move { chat.send_message(&content).await }));
            }
        }
    }

    if let Some(turn) = turn.take() {
        session.chat().cancel_generation();
        let _ = turn.await;
    }
    session.dispose();
    print_flush("\n");
    Ok(())
}
