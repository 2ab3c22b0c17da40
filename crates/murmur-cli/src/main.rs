//! # murmur
//!
//! Terminal client for forum direct messages.
//!
//! Connects to the forum's WebSocket endpoint with the session cookie from
//! `MURMUR_SESSION_COOKIE`, follows the session through `/user/status`, and
//! reads commands from stdin (`/open <id>`, `/more`, `/list`, ...). Anything
//! that is not a command is sent to the open conversation.

mod input;
mod render;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use murmur_client::{
    spawn_chat_engine, spawn_session_monitor, ChatError, ChatEvent, ChatHandle, ClientConfig,
    HttpDirectory, HttpSessionProvider, LogNotifier,
};
use murmur_net::WsConnector;
use murmur_shared::constants::APP_NAME;
use murmur_shared::UserId;

use crate::input::{parse_line, Input, HELP};
use crate::render::{render_event, render_message, render_summary};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_client=debug,murmur_net=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(
        server = %config.server_url,
        cookie = config.session_cookie.is_some(),
        "Loaded configuration"
    );
    if config.session_cookie.is_none() {
        warn!("MURMUR_SESSION_COOKIE is not set, the server will see no session");
    }

    // -----------------------------------------------------------------------
    // 3. Wire the engine to the server
    // -----------------------------------------------------------------------
    let http = reqwest::Client::new();
    let connector = WsConnector::new(config.ws_url()?, config.session_cookie.clone())?;
    let directory = HttpDirectory::new(
        http.clone(),
        config.users_url()?,
        config.session_cookie.clone(),
    );
    let (chat, engine_task) = spawn_chat_engine(
        connector,
        directory,
        LogNotifier,
        config.connection_config(),
        config.engine_config(),
    );

    let session = HttpSessionProvider::new(
        http,
        config.session_url()?,
        config.session_cookie.clone(),
    );
    let monitor = spawn_session_monitor(session, chat.clone(), config.liveness_interval);
    let printer = tokio::spawn(print_events(chat.subscribe()));

    // -----------------------------------------------------------------------
    // 4. Read commands until EOF, /quit or Ctrl+C
    // -----------------------------------------------------------------------
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut prompt = Prompt::new(chat.clone());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !prompt.handle(parse_line(&line)).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    monitor.abort();
    chat.shutdown().await;
    if let Err(e) = engine_task.await {
        warn!(error = %e, "Chat engine task failed");
    }
    printer.abort();

    Ok(())
}

/// Stdin command state: which conversation plain text goes to.
struct Prompt {
    chat: ChatHandle,
    active: Option<UserId>,
}

impl Prompt {
    fn new(chat: ChatHandle) -> Self {
        Self { chat, active: None }
    }

    /// Run one command. Returns `false` when the user asked to quit.
    async fn handle(&mut self, input: Input) -> anyhow::Result<bool> {
        let result = match input {
            Input::Quit => return Ok(false),
            Input::Empty => Ok(()),
            Input::Invalid(reason) => {
                println!("! {reason}");
                Ok(())
            }
            Input::Open(peer_id) => self.open(peer_id).await,
            Input::Close => {
                self.active = None;
                self.chat.close_conversation().await
            }
            Input::More => match self.active {
                Some(peer_id) => self.chat.load_older(peer_id).await,
                None => {
                    println!("! no conversation open");
                    Ok(())
                }
            },
            Input::List => self.list().await,
            Input::Send(text) => match self.active {
                Some(peer_id) => self.chat.send_message(peer_id, text).await.map(|_| ()),
                None => {
                    println!("! no conversation open, use /open <user id>");
                    Ok(())
                }
            },
        };

        match result {
            Ok(()) => Ok(true),
            Err(ChatError::User(e)) => {
                println!("! {e}");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&mut self, peer_id: UserId) -> Result<(), ChatError> {
        self.chat.open_conversation(peer_id).await?;
        self.active = Some(peer_id);
        for message in self.chat.messages(peer_id).await? {
            println!("{}", render_message(peer_id, &message));
        }
        Ok(())
    }

    async fn list(&self) -> Result<(), ChatError> {
        let conversations = self.chat.conversations().await?;
        if conversations.is_empty() {
            println!("* nobody here yet");
        }
        for summary in &conversations {
            println!("{}", render_summary(summary));
        }
        Ok(())
    }
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render_event(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
