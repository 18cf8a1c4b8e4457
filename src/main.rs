//! Chatgate - Entry Point
//!
//! Modes:
//! - Default: console gateway (stdin lines in, replies on stdout)
//! - --discord / -d: poll configured Discord channels

use std::sync::Arc;

use chatgate::channels::{ChannelError, ConsoleTransport, DiscordTransport, IncomingMessage, TransportType};
use chatgate::tokens::format_tokens;
use chatgate::{CompletionProvider, Config, EchoProvider, MessagePipeline, MessageTransport, OpenAiConfig, OpenAiProvider};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let discord_mode = args.iter().any(|a| a == "--discord" || a == "-d");
    let json_logs = args.iter().any(|a| a == "--json-logs");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Chatgate v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: chatgate [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --discord, -d      Poll Discord channels instead of reading stdin");
        println!("  --json-logs        Log JSON to stderr");
        println!("  --help, -h         Show this help");
        println!();
        println!("Environment variables:");
        println!("  CHATGATE_BOT_ID            Bot identity (default: chatgate)");
        println!("  CHATGATE_SYSTEM_PROMPT     System prompt for every completion");
        println!("  OPENAI_API_KEY             OpenAI-compatible key (echo provider if unset)");
        println!("  OPENAI_BASE_URL            API base URL");
        println!("  OPENAI_MODEL               Model name");
        println!("  DISCORD_BOT_TOKEN          Discord bot token");
        println!("  DISCORD_CHANNEL_IDS        Comma-separated channels to poll");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // Console replies own stdout
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let provider = build_provider(&config);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let mode = if discord_mode { TransportType::Discord } else { TransportType::Console };
    info!(
        "Chatgate v{} ({} transport, {} provider)",
        env!("CARGO_PKG_VERSION"),
        mode,
        provider.name()
    );

    match mode {
        TransportType::Discord => run_discord(config, provider, shutdown).await,
        TransportType::Console => run_console(config, provider, shutdown).await,
    }
}

fn build_provider(config: &Config) -> Arc<dyn CompletionProvider> {
    match &config.provider.openai_api_key {
        Some(key) => {
            let mut openai = OpenAiConfig::new(key);
            if let Some(base_url) = &config.provider.openai_base_url {
                openai.base_url = base_url.clone();
            }
            if let Some(model) = &config.provider.openai_model {
                openai.model = model.clone();
            }
            Arc::new(OpenAiProvider::new(openai))
        }
        None => {
            warn!("OPENAI_API_KEY not set - replies come from the echo provider");
            Arc::new(EchoProvider)
        }
    }
}

/// Final traffic snapshot on the way out
fn log_summary(pipeline: &MessagePipeline) {
    let bursts = pipeline.coalescer().stats();
    let velocity = pipeline.velocity().stats();

    info!(
        open_windows = bursts.open_windows,
        pending_messages = bursts.pending_messages,
        channels = velocity.tracked_channels,
        "Shutting down, {} tokens in the current window",
        format_tokens(velocity.tokens_in_window)
    );
    if let Some((channel_id, tokens)) = velocity.busiest_channel {
        info!(channel_id = %channel_id, tokens, "busiest channel");
    }
}

/// Hand a message to the pipeline on its own task
fn dispatch(
    tasks: &mut JoinSet<()>,
    pipeline: &Arc<MessagePipeline>,
    message: IncomingMessage,
    shutdown: &CancellationToken,
) {
    while let Some(result) = tasks.try_join_next() {
        log_join(result);
    }

    let pipeline = pipeline.clone();
    let shutdown = shutdown.clone();
    tasks.spawn(async move {
        let message_id = message.id.clone();
        match pipeline.handle(message, &shutdown).await {
            Ok(outcome) => tracing::debug!(message_id = %message_id, ?outcome, "message handled"),
            Err(e) => error!(message_id = %message_id, error = %e, "message processing failed"),
        }
    });
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "message task failed");
    }
}

/// Wait for in-flight messages; whatever is left at shutdown is reported and aborted
async fn drain(tasks: &mut JoinSet<()>, shutdown: &CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tasks.join_next() => match next {
                Some(result) => log_join(result),
                None => return,
            },
        }
    }

    if !tasks.is_empty() {
        warn!(abandoned = tasks.len(), "in-flight messages abandoned at shutdown");
        tasks.shutdown().await;
    }
}

async fn run_console(
    config: Config,
    provider: Arc<dyn CompletionProvider>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let transport = Arc::new(ConsoleTransport::new(&config.bot_id));
    let pipeline = Arc::new(MessagePipeline::new(
        config,
        transport.clone() as Arc<dyn MessageTransport>,
        provider,
    ));

    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let message = IncomingMessage::text("console", "user", line.trim());
        transport.record_incoming(&message);
        dispatch(&mut tasks, &pipeline, message, &shutdown);
    }

    // stdin closed: let in-flight bursts finish unless shutdown was requested
    drain(&mut tasks, &shutdown).await;

    log_summary(&pipeline);
    Ok(())
}

async fn run_discord(
    config: Config,
    provider: Arc<dyn CompletionProvider>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let transport = Arc::new(DiscordTransport::from_env()?);
    transport.connect().await?;

    let channel_ids = transport.config().channel_ids.clone();
    if channel_ids.is_empty() {
        anyhow::bail!("DISCORD_CHANNEL_IDS not set - nothing to poll");
    }

    let pipeline = Arc::new(MessagePipeline::new(
        config,
        transport.clone() as Arc<dyn MessageTransport>,
        provider,
    ));

    let mut pollers = Vec::new();
    for channel_id in channel_ids {
        let transport = transport.clone();
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        pollers.push(tokio::spawn(async move {
            poll_channel(&transport, &pipeline, &channel_id, &shutdown).await;
        }));
    }

    for poller in pollers {
        poller.await?;
    }

    log_summary(&pipeline);
    Ok(())
}

/// Poll one channel until shutdown, dispatching every new message
async fn poll_channel(
    transport: &DiscordTransport,
    pipeline: &Arc<MessagePipeline>,
    channel_id: &str,
    shutdown: &CancellationToken,
) {
    let interval = transport.config().poll_interval;
    let mut tasks = JoinSet::new();

    // Start from the newest message; the backlog is not replayed
    let mut cursor = match transport.latest_message_id(channel_id).await {
        Ok(id) => id,
        Err(e) => {
            error!(channel_id, error = %e, "cannot read Discord channel");
            return;
        }
    };
    info!(channel_id, "polling Discord channel");

    loop {
        let mut wait = interval;

        match transport.poll_new_messages(channel_id, cursor.as_deref()).await {
            Ok(messages) => {
                for message in messages {
                    cursor = Some(message.id.clone());
                    dispatch(&mut tasks, pipeline, message, shutdown);
                }
            }
            Err(ChannelError::RateLimited(secs)) => {
                warn!(channel_id, retry_after = secs, "Discord rate limit on poll");
                wait = std::time::Duration::from_secs(secs).max(interval);
            }
            Err(e) => warn!(channel_id, error = %e, "Discord poll failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    drain(&mut tasks, shutdown).await;
}
