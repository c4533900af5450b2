//! Chatera CLI - line-oriented chat client.
//!
//! This is the entry point for the `chatera` binary.

mod commands;
mod render;

use anyhow::{bail, Context};
use chatera_client::{ChannelEvent, ChatEngine, ClientConfig, ClientError, EngineEvent, StreamState};
use chatera_core::ConversationId;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use commands::{Command, HELP};
use render::Printer;

/// Chatera CLI - chat with your documents from the terminal.
#[derive(Parser, Debug)]
#[command(name = "chatera")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API base URL.
    #[arg(long, env = "CHATERA_API_URL")]
    api_url: Option<String>,

    /// WebSocket base URL for event channels.
    #[arg(long, env = "CHATERA_WS_URL")]
    ws_url: Option<String>,

    /// Client identifier scoping conversations and documents.
    #[arg(long, env = "CHATERA_CLIENT_ID")]
    client_id: Option<String>,

    /// Offer code blocks on the canvas surface.
    #[arg(long, default_value = "false")]
    canvas: bool,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

impl Args {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(url) = &self.api_url {
            config.api_base_url.clone_from(url);
        }
        if let Some(url) = &self.ws_url {
            config.ws_base_url.clone_from(url);
        }
        if let Some(id) = &self.client_id {
            config.client_id.clone_from(id);
        }
        config.canvas_mode |= self.canvas;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "info,chatera=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut engine = ChatEngine::connect(args.config()).context("failed to build client")?;
    if let Err(e) = engine.refresh_conversations().await {
        eprintln!("could not load conversations: {e}");
    }
    println!("chatera - {} conversations, /help for commands", engine.conversations().len());

    run(&mut engine).await
}

/// Read commands until `/quit`, Ctrl-C or end of input, applying channel events meanwhile.
async fn run(engine: &mut ChatEngine) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match Command::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(usage) => {
                        eprintln!("{usage}");
                        continue;
                    }
                };
                if command == Command::Quit {
                    break;
                }
                if let Err(e) = execute(engine, &mut printer, command).await {
                    eprintln!("error: {e:#}");
                }
            }
            Some(event) = engine.next_event() => report(engine, &event),
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
        }
    }
    Ok(())
}

async fn execute(engine: &mut ChatEngine, printer: &mut Printer, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Send(text) => send(engine, printer, &text).await?,
        Command::List => {
            let current = engine.current_conversation();
            for (n, conversation) in engine.conversations().sorted().into_iter().enumerate() {
                let marker = if Some(&conversation.id) == current { '*' } else { ' ' };
                let pin = if conversation.is_pinned { " [pinned]" } else { "" };
                println!("{marker}{:>3}. {}{pin}  ({})", n + 1, conversation.title, conversation.id);
            }
        }
        Command::Open(target) => {
            let id = conversation_arg(engine, &target)?;
            engine.select_conversation(Some(id)).await?;
            printer.print_log(&engine.store().snapshot())?;
        }
        Command::New => {
            engine.new_conversation().await?;
            printer.reset();
            println!("new conversation");
        }
        Command::Rename(target, title) => {
            let id = conversation_arg(engine, &target)?;
            let renamed = engine.rename_conversation(&id, title).await?;
            println!("renamed to {}", renamed.title);
        }
        Command::Pin(target) => {
            let id = conversation_arg(engine, &target)?;
            let pinned = engine.toggle_pin(&id).await?;
            println!("{}", if pinned { "pinned" } else { "unpinned" });
        }
        Command::Delete(target) => {
            let id = conversation_arg(engine, &target)?;
            engine.delete_conversation(&id).await?;
            println!("deleted {id}");
        }
        Command::Docs => {
            let selected = engine.selected_documents().to_vec();
            for document in engine.list_documents().await? {
                let marker = if selected.contains(&document.id) { '*' } else { ' ' };
                println!("{marker} {}  {}", document.id, document.name);
            }
        }
        Command::Use(doc_ids) => {
            println!("grounding on {} documents", doc_ids.len());
            engine.select_documents(doc_ids);
        }
        Command::Forget(doc_ids) => {
            engine.delete_documents(&doc_ids).await?;
            println!("deleted {} documents", doc_ids.len());
        }
        Command::Upload { stop: true } => engine.stop_tracking_uploads(),
        Command::Upload { stop: false } => {
            let channel = engine.track_uploads();
            println!("upload channel {channel}; pass it to the ingestion service");
        }
        Command::Thinking => {
            let Some(id) = engine
                .store()
                .messages()
                .iter()
                .rev()
                .find(|m| m.is_assistant())
                .map(|m| m.id().clone())
            else {
                bail!("no answer yet");
            };
            if engine.toggle_thinking(&id)? {
                if let Some(answer) = engine.store().messages().iter().find_map(|m| {
                    m.as_assistant().filter(|a| a.id == id)
                }) {
                    for event in &answer.thinking_events {
                        println!("  ~ {event}");
                    }
                }
            } else {
                println!("thinking hidden");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

/// Send a message, printing the answer as it streams. Ctrl-C stops the answer.
async fn send(engine: &mut ChatEngine, printer: &mut Printer, text: &str) -> anyhow::Result<()> {
    let cancel = engine.stream_cancel_token();
    let mut log = engine.subscribe_log();
    let outcome = {
        let sending = engine.send_message(text);
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(sending, interrupt);
        let mut interrupted = false;
        loop {
            tokio::select! {
                outcome = &mut sending => break outcome,
                Ok(()) = log.changed() => {
                    let snapshot = log.borrow_and_update().clone();
                    printer.print_delta(&snapshot)?;
                }
                result = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    if result.is_ok() {
                        cancel.cancel();
                    }
                }
            }
        }
    };
    printer.finish(&engine.store().snapshot())?;

    match outcome {
        Ok(StreamState::Failed) => eprintln!("answer failed"),
        Ok(_) => {}
        Err(ClientError::Cancelled) => eprintln!("answer stopped"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Resolve a 1-based position in `/list` order, or take the argument as an id.
fn conversation_arg(engine: &ChatEngine, arg: &str) -> anyhow::Result<ConversationId> {
    if let Ok(n) = arg.parse::<usize>() {
        let sorted = engine.conversations().sorted();
        if let Some(conversation) = n.checked_sub(1).and_then(|i| sorted.get(i)) {
            return Ok(conversation.id.clone());
        }
    }
    ConversationId::new(arg).context("invalid conversation id")
}

fn report(engine: &ChatEngine, event: &EngineEvent) {
    match event {
        EngineEvent::Conversation(ChannelEvent::TitleUpdate(title)) => {
            println!("(title: {title})");
        }
        EngineEvent::Conversation(ChannelEvent::Status(status)) => {
            tracing::debug!(message = %status.message, "status outside an answer");
        }
        EngineEvent::Upload(ChannelEvent::UploadProgress(progress)) => {
            println!(
                "(upload {}: {} {}% {})",
                progress.filename,
                progress.status,
                progress.percent(),
                progress.message
            );
            if engine.uploads().iter().all(|f| f.status.is_terminal()) {
                println!("(uploads settled)");
            }
        }
        EngineEvent::Conversation(ChannelEvent::StateChanged(state))
        | EngineEvent::Upload(ChannelEvent::StateChanged(state)) => {
            tracing::info!(state = ?state, "channel state");
        }
        EngineEvent::Conversation(ChannelEvent::UploadProgress(_))
        | EngineEvent::Upload(ChannelEvent::Status(_) | ChannelEvent::TitleUpdate(_)) => {}
    }
}
