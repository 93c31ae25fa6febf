//! taskweave - terminal client for asynchronous agent backends
//!
//! Schedules prompts as tasks or flows, follows their event streams, and
//! answers the agent's questions from the terminal.
//!
//! Uses XDG Base Directory specification for file locations:
//! - History cache: $XDG_DATA_HOME/taskweave/history.db
//! - Logs: $XDG_STATE_HOME/taskweave/taskweave.log
//! - Config: $XDG_CONFIG_HOME/taskweave/config.toml

mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskweave_core::event::IdentitySpace;
use taskweave_core::history::restore_start;
use taskweave_core::reconcile::CloseReason;
use taskweave_core::timeline::Block;
use taskweave_core::{
    ApiClient, Config, HistoryStore, SessionSnapshot, SqliteHistory, SubscriptionManager,
    TaskIdentity, Turn,
};

use crate::render::Printer;

#[derive(Parser)]
#[command(name = "taskweave")]
#[command(about = "Follow agent tasks and flows from the terminal")]
#[command(version)]
struct Args {
    /// Config file override
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule a prompt and follow its event stream to completion
    Run {
        /// The prompt to send
        prompt: String,

        /// Schedule a plan-driven flow instead of a direct task
        #[arg(long)]
        flow: bool,

        /// Session to attach to (default: resume the last active session)
        #[arg(long)]
        session: Option<String>,

        /// Start a fresh session even when one could be resumed
        #[arg(long)]
        new_session: bool,

        /// Show the agent's thinking lines as they stream
        #[arg(long)]
        long_thought: bool,
    },

    /// List cached sessions, or show one session's turns
    History {
        /// Show one session's conversation
        #[arg(long)]
        session: Option<String>,

        /// Query the server instead of the local cache
        #[arg(long)]
        remote: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Logging goes to file only; stdout belongs to the transcript
    let _log_guard = taskweave_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    tracing::info!("taskweave starting");

    match args.command {
        Command::Run {
            prompt,
            flow,
            session,
            new_session,
            long_thought,
        } => run(config, prompt, flow, session, new_session, long_thought).await,
        Command::History { session, remote } => history(config, session, remote).await,
    }
}

async fn run(
    mut config: Config,
    prompt: String,
    flow: bool,
    session: Option<String>,
    new_session: bool,
    long_thought: bool,
) -> Result<()> {
    if long_thought {
        config.stream.long_thought = true;
    }

    let store = SqliteHistory::open(&Config::cache_path(), config.history.clone())
        .context("failed to open history cache")?;
    store.evict_stale().context("failed to evict stale sessions")?;

    // Pick the session: explicit flag, then the recent one, then a fresh id
    let (session_id, resumed) = match session {
        Some(id) => (id, true),
        None if new_session => (uuid::Uuid::new_v4().to_string(), false),
        None => match store.last_active()? {
            Some(id) => {
                println!("[resuming session {}]", id);
                (id, true)
            }
            None => (uuid::Uuid::new_v4().to_string(), false),
        },
    };

    let client = ApiClient::new(&config.server)?;

    // Replay the tail of the cached conversation as context
    let snapshot = store.load(&session_id)?;
    let mut chat_history: Vec<taskweave_core::client::HistoryTurn> = Vec::new();
    if let Some(snap) = &snapshot {
        let start = restore_start(&snap.turns);
        chat_history = snap.turns[start..]
            .iter()
            .map(|turn| taskweave_core::client::HistoryTurn {
                role: turn.role.as_str().to_string(),
                content: turn.content.clone(),
            })
            .collect();
        for turn in &snap.turns {
            println!("{}> {}", turn.role.as_str(), turn.content);
        }
        if !snap.turns.is_empty() {
            println!("---");
        }
    } else if resumed {
        // Cache is cold but the session exists; the backend still has it
        match client.session_history(&session_id).await {
            Ok(remote) => {
                for turn in &remote.chat_history {
                    println!("{}> {}", turn.role, turn.content);
                }
                if !remote.chat_history.is_empty() {
                    println!("---");
                }
                chat_history = remote.chat_history;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "remote session history unavailable");
            }
        }
    }

    let space = if flow {
        IdentitySpace::Flow
    } else {
        IdentitySpace::Task
    };

    let identity = client
        .create(space, &prompt, &session_id, &chat_history)
        .await
        .context("failed to schedule the prompt")?;
    tracing::info!(task = %identity, session = %session_id, "scheduled");

    let mut manager = SubscriptionManager::new(config.stream.clone());
    manager.subscribe(&client, identity.clone())?;
    if let Some(state) = manager.state_mut() {
        state.push_user_message(&prompt);
    }

    let mut printer = Printer::new();
    if let Some(state) = manager.state() {
        printer.sync(state);
    }

    let close = follow(&client, &mut manager, &identity, &mut printer).await?;

    // Persist the finished view for restore and context replay
    if let Some(state) = manager.state() {
        let mut snap = snapshot.unwrap_or_else(|| SessionSnapshot::new(&session_id));
        snap.updated_at = chrono::Utc::now();
        snap.identity = Some(identity);
        for block in state.timeline() {
            match block {
                Block::Chat(msg) => snap.turns.push(msg.clone()),
                Block::Flow(phase) => snap.phases.push(phase.clone()),
                Block::Thinking(_) => {}
            }
        }
        store.save(&snap)?;
        store.set_last_active(&session_id)?;
    }

    match close {
        Some(CloseReason::Completed) => println!("[session completed]"),
        Some(CloseReason::Terminated) => println!("[session terminated]"),
        Some(CloseReason::Errored) => println!("[session failed]"),
        None => {}
    }
    Ok(())
}

/// Follow the stream until it closes or the connection is given up on.
async fn follow(
    client: &ApiClient,
    manager: &mut SubscriptionManager,
    identity: &TaskIdentity,
    printer: &mut Printer,
) -> Result<Option<CloseReason>> {
    let mut terminate_requested = false;

    loop {
        tokio::select! {
            turn = manager.next_turn(client) => {
                match turn? {
                    Turn::Updated => {
                        if let Some(state) = manager.state() {
                            printer.sync(state);
                        }
                    }
                    Turn::InteractionPending(_) => {
                        // The question itself is printed as an agent turn by sync().
                        if let Some(state) = manager.state() {
                            printer.sync(state);
                        }
                        let answer = tokio::task::spawn_blocking(|| {
                            dialoguer::Input::<String>::new()
                                .with_prompt("answer")
                                .interact_text()
                        })
                        .await
                        .context("prompt task failed")?
                        .context("failed to read answer")?;

                        client
                            .interact(identity, &answer)
                            .await
                            .context("failed to submit answer")?;
                        if let Some(state) = manager.state_mut() {
                            state.answer_interaction(&answer);
                        }
                    }
                    Turn::Closed(reason) => {
                        if let Some(state) = manager.state() {
                            printer.sync(state);
                        }
                        return Ok(Some(reason));
                    }
                    Turn::ConnectionLost => {
                        if let Some(state) = manager.state() {
                            printer.sync(state);
                        }
                        return Ok(None);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if terminate_requested {
                    // Second interrupt: stop following without waiting
                    eprintln!("[detached; the task may still be running]");
                    return Ok(None);
                }
                terminate_requested = true;
                eprintln!("[terminating, press ctrl-c again to detach]");
                if let Err(e) = client.terminate(identity).await {
                    tracing::warn!(error = %e, "terminate request failed");
                }
            }
        }
    }
}

async fn history(config: Config, session: Option<String>, remote: bool) -> Result<()> {
    if remote {
        let client = ApiClient::new(&config.server)?;

        if let Some(session_id) = session {
            let history = client
                .session_history(&session_id)
                .await
                .context("failed to fetch session history")?;
            if history.chat_history.is_empty() {
                println!("no server history for session {}", session_id);
            }
            for turn in &history.chat_history {
                println!("{}> {}", turn.role, turn.content);
            }
            return Ok(());
        }

        let listing = client
            .aggregate_history()
            .await
            .context("failed to fetch server history")?;

        println!("tasks:");
        for entry in &listing.chat_history {
            println!(
                "  {}  {}  {}",
                entry.id,
                entry.status.as_deref().unwrap_or("-"),
                entry.prompt
            );
        }
        println!("flows:");
        for entry in &listing.flow_history {
            println!(
                "  {}  {}  {}",
                entry.id,
                entry.status.as_deref().unwrap_or("-"),
                entry.prompt
            );
        }
        return Ok(());
    }

    let store = SqliteHistory::open(&Config::cache_path(), config.history.clone())
        .context("failed to open history cache")?;

    match session {
        Some(session_id) => match store.load(&session_id)? {
            Some(snap) => {
                for turn in &snap.turns {
                    println!("{}> {}", turn.role.as_str(), turn.content);
                }
            }
            None => println!("no cached session {}", session_id),
        },
        None => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("no cached sessions");
                return Ok(());
            }
            for summary in sessions {
                println!(
                    "{}  {}  {} turns",
                    summary.session_id,
                    summary.updated_at.format("%Y-%m-%d %H:%M"),
                    summary.turn_count
                );
            }
        }
    }
    Ok(())
}
