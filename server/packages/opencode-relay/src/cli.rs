use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use opencode_relay_client::{ClientError, ModelRef, OpenCodeClient};
use opencode_relay_stream::{RelayConfig, SinkError, StreamError, StreamRelay, DEFAULT_BASE_URL};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::access::{parse_id_list, AccessPolicy};
use crate::bot::{default_agents, parse_agents, BotConfig, ChatBot};
use crate::commands::COMMAND_MENU;
use crate::prompt::{run_chat_prompt, ChatPrompt, PromptError, PromptOutcome};
use crate::render;
use crate::store::{default_store_path, SessionStore, StoreError};
use crate::telegram::{TelegramApi, DEFAULT_TELEGRAM_API_URL};

#[derive(Parser, Debug)]
#[command(name = "opencode-relay", bin_name = "opencode-relay")]
#[command(about = "Relay streamed OpenCode responses into Telegram chats", version)]
#[command(arg_required_else_help = true)]
pub struct RelayCli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    #[arg(long, env = "OPENCODE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    opencode_url: String,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true, global = true)]
    telegram_token: Option<String>,

    #[arg(long, env = "TELEGRAM_API_URL", default_value = DEFAULT_TELEGRAM_API_URL, global = true)]
    telegram_api_url: String,

    /// Chat to session mapping; defaults to the user data directory.
    #[arg(long, env = "OPENCODE_RELAY_STORE", global = true)]
    store_path: Option<PathBuf>,

    #[arg(long, default_value_t = 1000, global = true)]
    edit_throttle_ms: u64,

    #[arg(long, default_value_t = 2000, global = true)]
    reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 4000, global = true)]
    max_message_len: usize,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the OpenCode server is reachable and healthy.
    Health,
    /// Send one prompt and stream the response into a chat.
    Prompt(PromptArgs),
    /// Hold the event stream open until interrupted.
    Relay,
    /// Run the Telegram bot until interrupted.
    Bot(BotArgs),
    /// List OpenCode sessions.
    Sessions(SessionsArgs),
    /// Show the last messages of a session.
    History(TargetArgs),
    /// Show the files a session changed.
    Diff(TargetArgs),
    /// Delete a session and unbind any chat using it.
    Delete(TargetArgs),
}

#[derive(Args, Debug)]
pub struct PromptArgs {
    #[arg(long)]
    chat_id: i64,

    /// Session to use instead of the one bound to the chat.
    #[arg(long)]
    session: Option<String>,

    #[arg(long)]
    agent: Option<String>,

    /// Model as `provider/model`.
    #[arg(long)]
    model: Option<String>,

    text: String,
}

#[derive(Args, Debug)]
pub struct BotArgs {
    /// Comma separated chat ids allowed to use the bot; empty allows all.
    #[arg(long, env = "ALLOWED_USERS")]
    allowed_users: Option<String>,

    /// Comma separated chat ids allowed to purge; empty makes everyone admin.
    #[arg(long, env = "ADMIN_USERS")]
    admin_users: Option<String>,

    /// Agents offered by /agent as `name:description,...`.
    #[arg(long, env = "AGENTS")]
    agents: Option<String>,

    #[arg(long, default_value_t = 30)]
    poll_timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Mark the session bound to this chat.
    #[arg(long)]
    chat_id: Option<i64>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    #[arg(long)]
    session: Option<String>,

    /// Use the session bound to this chat.
    #[arg(long)]
    chat_id: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing telegram bot token; pass --telegram-token or set TELEGRAM_BOT_TOKEN")]
    MissingToken,
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid model {0}; expected provider/model")]
    InvalidModel(String),
    #[error("chat {0} has no session")]
    NoSession(i64),
    #[error("opencode error: {0}")]
    Client(#[from] ClientError),
    #[error("telegram error: {0}")]
    Telegram(#[from] SinkError),
    #[error("chat store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Prompt(#[from] PromptError),
    #[error("event stream stopped: {0}")]
    Stream(#[from] StreamError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Settings {
    pub fn relay_config(&self) -> Result<RelayConfig, CliError> {
        let base_url = parse_url(&self.opencode_url)?;
        let mut config = RelayConfig::for_base_url(base_url.as_str());
        config.edit_throttle = Duration::from_millis(self.edit_throttle_ms);
        config.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        config.max_display_chars = self.max_message_len;
        Ok(config)
    }

    fn client(&self) -> Result<OpenCodeClient, CliError> {
        let base_url = parse_url(&self.opencode_url)?;
        Ok(OpenCodeClient::new(base_url.as_str())?)
    }

    fn telegram_api(&self) -> Result<TelegramApi, CliError> {
        let token = self
            .telegram_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(CliError::MissingToken)?;
        let api_url = parse_url(&self.telegram_api_url)?;
        Ok(TelegramApi::with_api_url(token, api_url.as_str())?)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(default_store_path)
    }

    fn store(&self) -> Result<SessionStore, CliError> {
        Ok(SessionStore::open(self.store_path())?)
    }
}

fn parse_url(raw: &str) -> Result<Url, CliError> {
    Url::parse(raw).map_err(|source| CliError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

pub fn parse_model(raw: &str) -> Result<ModelRef, CliError> {
    ModelRef::parse(raw).ok_or_else(|| CliError::InvalidModel(raw.to_string()))
}

pub fn run_opencode_relay() -> Result<(), CliError> {
    let RelayCli { command, settings } = RelayCli::parse();
    init_logging();
    run_command(&command, &settings)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command, settings: &Settings) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        match command {
            Command::Health => run_health(settings).await,
            Command::Prompt(args) => run_prompt_command(settings, args).await,
            Command::Relay => run_relay(settings).await,
            Command::Bot(args) => run_bot(settings, args).await,
            Command::Sessions(args) => run_sessions(settings, args).await,
            Command::History(target) => run_history(settings, target).await,
            Command::Diff(target) => run_diff(settings, target).await,
            Command::Delete(target) => run_delete(settings, target).await,
        }
    })
}

/// Resolves once `signal` reports an interrupt. A listener that fails to
/// install never resolves, so the caller keeps running instead of
/// shutting down at once.
pub async fn wait_for_interrupt<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = signal.await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn run_health(settings: &Settings) -> Result<(), CliError> {
    let client = settings.client()?;
    let health = client.health().await?;
    println!("OpenCode {} at {} is healthy", health.version, client.base_url());
    Ok(())
}

async fn run_prompt_command(settings: &Settings, args: &PromptArgs) -> Result<(), CliError> {
    let model = args.model.as_deref().map(parse_model).transpose()?;
    let client = settings.client()?;
    let store = settings.store()?;
    let api = Arc::new(settings.telegram_api()?);
    let relay = Arc::new(StreamRelay::new(settings.relay_config()?, api.clone()));

    let prompt = ChatPrompt {
        chat_id: args.chat_id,
        text: args.text.clone(),
        session_id: args.session.clone(),
        agent: args.agent.clone(),
        model,
    };
    let shutdown = wait_for_interrupt(tokio::signal::ctrl_c());

    let outcome = run_chat_prompt(&client, relay, api.as_ref(), &store, prompt, shutdown).await?;
    match &outcome {
        PromptOutcome::Completed { .. } => {
            println!("session {}", outcome.session_id());
        }
        PromptOutcome::Interrupted { .. } => {
            println!("session {} (interrupted)", outcome.session_id());
        }
    }
    Ok(())
}

async fn run_relay(settings: &Settings) -> Result<(), CliError> {
    let api = Arc::new(settings.telegram_api()?);
    let relay = Arc::new(StreamRelay::new(settings.relay_config()?, api));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let relay = relay.clone();
        let cancel = cancel.clone();
        async move { relay.run(cancel).await }
    });

    wait_for_interrupt(tokio::signal::ctrl_c()).await;
    tracing::info!("shutting down");
    cancel.cancel();
    match task.await? {
        Ok(()) | Err(StreamError::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl BotArgs {
    fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::new(
            parse_id_list(self.allowed_users.as_deref().unwrap_or_default()),
            parse_id_list(self.admin_users.as_deref().unwrap_or_default()),
        )
    }

    fn bot_config(&self) -> BotConfig {
        let agents = self
            .agents
            .as_deref()
            .map(parse_agents)
            .filter(|agents| !agents.is_empty())
            .unwrap_or_else(default_agents);
        BotConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            agents,
            ..BotConfig::default()
        }
    }
}

async fn run_bot(settings: &Settings, args: &BotArgs) -> Result<(), CliError> {
    let client = settings.client()?;
    let api = Arc::new(settings.telegram_api()?);
    let relay = Arc::new(StreamRelay::new(settings.relay_config()?, api.clone()));
    let store = Arc::new(settings.store()?);
    tracing::info!(path = %settings.store_path().display(), "using chat store");

    match client.health().await {
        Ok(health) => tracing::info!(version = %health.version, "OpenCode server is healthy"),
        Err(err) => tracing::warn!(error = %err, "OpenCode server is not reachable yet"),
    }
    if let Err(err) = api.set_my_commands(COMMAND_MENU).await {
        tracing::warn!(error = %err, "failed to publish bot commands");
    }

    let bot = Arc::new(ChatBot::new(
        client,
        api,
        relay.clone(),
        store,
        args.access_policy(),
        args.bot_config(),
    ));
    let cancel = CancellationToken::new();
    let relay_task = tokio::spawn({
        let relay = relay.clone();
        let cancel = cancel.clone();
        async move { relay.run(cancel).await }
    });
    let bot_task = tokio::spawn({
        let bot = bot.clone();
        let cancel = cancel.clone();
        async move { bot.run(cancel).await }
    });

    wait_for_interrupt(tokio::signal::ctrl_c()).await;
    tracing::info!("shutting down");
    cancel.cancel();
    bot_task.await?;
    match relay_task.await? {
        Ok(()) | Err(StreamError::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn run_sessions(settings: &Settings, args: &SessionsArgs) -> Result<(), CliError> {
    let client = settings.client()?;
    let current = match args.chat_id {
        Some(chat_id) => settings.store()?.session_id(chat_id).await,
        None => None,
    };
    let sessions = client.list_sessions().await?;
    println!("{}", render::session_list(&sessions, current.as_deref()));
    Ok(())
}

/// The session named on the command line, or the one bound to the chat.
pub async fn resolve_session(store: &SessionStore, target: &TargetArgs) -> Result<String, CliError> {
    if let Some(session_id) = &target.session {
        return Ok(session_id.clone());
    }
    let chat_id = target.chat_id.ok_or(CliError::NoSession(0))?;
    store
        .session_id(chat_id)
        .await
        .ok_or(CliError::NoSession(chat_id))
}

async fn run_history(settings: &Settings, target: &TargetArgs) -> Result<(), CliError> {
    let session_id = resolve_session(&settings.store()?, target).await?;
    let messages = settings.client()?.messages(&session_id).await?;
    println!("{}", render::history(&messages));
    Ok(())
}

async fn run_diff(settings: &Settings, target: &TargetArgs) -> Result<(), CliError> {
    let session_id = resolve_session(&settings.store()?, target).await?;
    let diff = settings.client()?.diff(&session_id).await?;
    println!("{}", render::diff(&diff));
    Ok(())
}

async fn run_delete(settings: &Settings, target: &TargetArgs) -> Result<(), CliError> {
    let store = settings.store()?;
    let session_id = resolve_session(&store, target).await?;
    settings.client()?.delete_session(&session_id).await?;
    let unbound = store.forget_session(&session_id).await?;
    println!("deleted session {session_id} ({unbound} chats unbound)");
    Ok(())
}
