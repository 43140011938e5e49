use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chatsync::api::{ApiError, ChatApi, HttpChatApi};
use chatsync::auth::{EnvToken, StaticToken, TokenProvider};
use chatsync::config::{ChatConfig, ConfigError};
use chatsync::session::{ConnectionStatus, SessionError, SocketSession};
use chatsync::state::{ChatState, ChatStore};
use chatsync::sync::{ChatSync, SyncError};
use chatsync::transport::{TransportError, WsTransport};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("stdin read failed: {0}")]
    Stdin(#[from] std::io::Error),
}

impl CliError {
    /// The backend rejected the bearer token.
    fn is_unauthorized(&self) -> bool {
        match self {
            Self::Api(e) | Self::Sync(SyncError::Api(e)) => e.is_unauthorized(),
            _ => false,
        }
    }
}

/// Pause before the single retry of a transient REST failure.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "chatsync", about = "Terminal chat client over STOMP")]
struct Cli {
    /// Broker base URL; overrides CHAT_WS_URL.
    #[arg(long)]
    ws_url: Option<String>,

    /// REST base URL; overrides CHAT_API_URL.
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token; otherwise read from the variable named by CHAT_AUTH_TOKEN_ENV.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations.
    Conversations,
    /// Start a conversation with a user and open it.
    Start { user_id: String },
    /// Open a conversation: print history and live events, send stdin lines.
    Open { conversation_id: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let result = run(Cli::parse()).await;
    if let Err(e) = &result {
        if e.is_unauthorized() {
            eprintln!("-- token rejected; pass --token or set the variable named by CHAT_AUTH_TOKEN_ENV");
        }
    }
    result
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = ChatConfig::from_env()?;
    if let Some(ws_url) = cli.ws_url {
        config.ws_url = ws_url;
        config.ws_endpoint()?;
    }
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    let tokens: Arc<dyn TokenProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(EnvToken::new(config.token_env.clone())),
    };
    let api = HttpChatApi::new(&config, Arc::clone(&tokens))?;

    match cli.command {
        Command::Conversations => run_conversations(&api).await,
        Command::Start { user_id } => {
            let sync = connect(&config, tokens).await?;
            let id = sync.start_conversation(&api, &user_id).await?;
            eprintln!("opened conversation {id}");
            run_open(&sync, &id).await
        }
        Command::Open { conversation_id } => {
            let sync = connect(&config, tokens).await?;
            if let Err(e) = sync.load_conversations(&api).await {
                tracing::warn!(error = %e, "conversation list unavailable");
            }
            sync.select_conversation(Some(&conversation_id));
            run_open(&sync, &conversation_id).await
        }
    }
}

async fn run_conversations(api: &HttpChatApi) -> Result<(), CliError> {
    let conversations = match api.conversations().await {
        Err(e) if e.retryable() => {
            tracing::warn!(error = %e, "conversation fetch failed; retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            api.conversations().await?
        }
        result => result?,
    };
    for conv in conversations {
        let online = if conv.is_online { "online" } else { "offline" };
        let last = conv.last_message.as_deref().unwrap_or("");
        println!("{}\t{}\t{online}\tunread={}\t{last}", conv.id, conv.counterpart_name, conv.unread_count);
    }
    Ok(())
}

async fn connect(config: &ChatConfig, tokens: Arc<dyn TokenProvider>) -> Result<ChatSync, CliError> {
    let transport = Arc::new(WsTransport::new(config)?);
    let session = SocketSession::new(transport, tokens);
    let sync = ChatSync::new(session, ChatStore::new(), config.history_timeout);
    sync.session().connect(None).await?;
    Ok(sync)
}

/// Print store changes for `conversation_id` and send stdin lines until EOF,
/// `/quit` or Ctrl-C.
async fn run_open(sync: &ChatSync, conversation_id: &str) -> Result<(), CliError> {
    let mut printer = Printer::default();
    let mut changes = sync.store().watch();
    let mut status = sync.session().watch_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("type a message, /typing on|off, or /quit");
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = Arc::clone(&changes.borrow_and_update());
                printer.render(&state, conversation_id);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                match *status.borrow_and_update() {
                    ConnectionStatus::Connected => eprintln!("-- connected"),
                    ConnectionStatus::Connecting => eprintln!("-- connecting"),
                    ConnectionStatus::Disconnected => eprintln!("-- disconnected; retrying"),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(sync, conversation_id, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    sync.select_conversation(None);
    sync.session().disconnect().await;
    Ok(())
}

/// Returns false to quit.
fn handle_line(sync: &ChatSync, conversation_id: &str, line: &str) -> bool {
    let result = match line {
        "" => return true,
        "/quit" => return false,
        "/typing on" => sync.session().set_typing(conversation_id, true).map_err(SyncError::from),
        "/typing off" => sync.session().set_typing(conversation_id, false).map_err(SyncError::from),
        text => sync.send_text(conversation_id, text),
    };
    if let Err(e) = result {
        eprintln!("-- not sent: {e}");
    }
    true
}

#[derive(Default)]
struct Printer {
    printed: HashSet<String>,
    typing: Vec<String>,
    loading: bool,
    online: Option<bool>,
}

impl Printer {
    fn render(&mut self, state: &ChatState, conversation_id: &str) {
        let loading = state.is_loading_messages(conversation_id);
        if loading && !self.loading {
            eprintln!("-- loading history");
        }
        self.loading = loading;

        for msg in state.messages(conversation_id) {
            if self.printed.insert(msg.id.clone()) {
                println!("[{}] {}: {}", msg.created_at, msg.sender_name, msg.preview());
            }
        }

        if let Some(conv) = state.conversation(conversation_id) {
            if self.online != Some(conv.is_online) {
                let presence = if conv.is_online { "online" } else { "offline" };
                eprintln!("-- {} is {presence}", conv.counterpart_name);
                self.online = Some(conv.is_online);
            }
        }

        let typing: Vec<String> = state.typing_users(conversation_id).into_iter().map(ToOwned::to_owned).collect();
        if typing != self.typing {
            if typing.is_empty() {
                eprintln!("-- nobody typing");
            } else {
                eprintln!("-- {} typing", typing.join(", "));
            }
            self.typing = typing;
        }
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
