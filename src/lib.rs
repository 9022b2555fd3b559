pub mod alias_match;
pub mod chat;
pub mod cli_output;
pub mod config;
pub mod database;
pub mod error;
pub mod logs;
pub mod runner;
pub mod supervisor;
pub mod telemetry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use chat::{ChatMessage, ChatRelay};
use config::AppConfig;
use database::{ConversationStore, Database};
use logs::LogSink;
use runner::CommandRunner;
use supervisor::{ActivationOutcome, LifecycleEvent, Supervisor};

const THREAD_TITLE_CHARS: usize = 48;

#[derive(Parser)]
#[command(name = "inferdesk", version, about = "Supervise a local inference service and chat with its models")]
struct Cli {
    /// Directory holding config.json, logs and the conversation database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Inference CLI to drive instead of the configured one.
    #[arg(long, global = true)]
    cli: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the service and pick the model to use.
    Status,
    /// List available, cached and loaded models.
    Models,
    /// Make sure a model is downloaded, loaded and answering.
    Activate { alias: String },
    /// Unload a model from the service.
    Unload { alias: String },
    /// Stop the service.
    Stop,
    /// Interactive chat; every turn is stored.
    Chat {
        #[arg(long)]
        model: Option<String>,
        /// Continue an existing thread.
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        system: Option<String>,
    },
    /// List stored conversation threads.
    Threads,
    /// Print the messages of one thread.
    History { thread: String },
    /// Print system and accelerator telemetry.
    Telemetry {
        /// Number of snapshots to print.
        #[arg(long, default_value_t = 5)]
        ticks: u32,
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration, optionally writing it back.
    Config {
        #[arg(long)]
        write: bool,
    },
}

pub struct AppState {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub sink: Arc<LogSink>,
    pub relay: Arc<ChatRelay>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(data_dir: PathBuf, cli_override: Option<String>) -> Self {
        let mut config = AppConfig::load(&data_dir);
        if let Some(program) = cli_override {
            config.cli_program = program;
        }
        let sink = Arc::new(LogSink::new(data_dir.join("logs")));
        let relay = Arc::new(ChatRelay::new(config.chat_timeout(), config.max_tokens));
        let runner = Arc::new(CommandRunner::new(config.cli_program.clone()).with_sink(sink.clone()));
        let supervisor = Arc::new(Supervisor::new(runner, relay.clone(), config.clone()).with_sink(sink.clone()));
        Self {
            config,
            data_dir,
            sink,
            relay,
            supervisor,
        }
    }

    fn open_db(&self) -> Result<Database, String> {
        Database::new(&self.data_dir).map_err(|e| e.to_string())
    }
}

/// Cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[shell] interrupt received");
            trigger.cancel();
        }
    });
    cancel
}

fn print_event(event: LifecycleEvent) {
    match event.progress {
        Some(p) => match p.percent_complete {
            Some(pct) => println!("  [{:>3}%] {}", pct, p.label),
            None => println!("         {}", p.label),
        },
        None => println!("{}...", event.message),
    }
}

async fn activate(state: &AppState, alias: &str, cancel: &CancellationToken) -> Result<(), String> {
    let outcome = state.supervisor.ensure_model_ready(alias, cancel, &print_event).await;
    println!("{}", outcome.status_message());
    match outcome {
        ActivationOutcome::Ready { runtime_id, .. } => {
            if let Some(id) = runtime_id {
                println!("runtime id: {}", id);
            }
            Ok(())
        }
        ActivationOutcome::Failed { state: at, error } => Err(format!("failed while {}: {}", at, error)),
        ActivationOutcome::Cancelled => Err("cancelled".to_string()),
    }
}

async fn status(state: &AppState, cancel: &CancellationToken) -> Result<(), String> {
    let found = state.supervisor.discover(cancel).await.map_err(|e| e.to_string())?;
    match &found.endpoint.url {
        Some(url) if found.endpoint.is_running => println!("service: running at {}", url),
        _ => println!("service: not running"),
    }
    println!("available: {}", found.available.join(", "));
    println!(
        "loaded: {}",
        if found.loaded.is_empty() {
            "(none)".to_string()
        } else {
            found.loaded.join(", ")
        }
    );
    if let Some(m) = &found.matched {
        println!("matched: {} ({:?})", m.alias, m.rule);
    }
    println!("selected: {}", found.selected.as_deref().unwrap_or("(none)"));
    Ok(())
}

async fn models(state: &AppState, cancel: &CancellationToken) -> Result<(), String> {
    let sup = &state.supervisor;
    let available = sup.list_available(cancel).await.map_err(|e| e.to_string())?;
    let cached = sup.list_cached(cancel).await.map_err(|e| e.to_string())?;
    let loaded = sup.list_loaded(cancel).await.map_err(|e| e.to_string())?;

    let mut all = available.clone();
    for alias in cached.iter().chain(loaded.iter()) {
        if !all.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
            all.push(alias.clone());
        }
    }
    if all.is_empty() {
        println!("no models reported");
        return Ok(());
    }
    let has = |list: &[String], alias: &str| list.iter().any(|a| a.eq_ignore_ascii_case(alias));
    println!("{:<36} {:<7} {:<7}", "ALIAS", "CACHED", "LOADED");
    for alias in &all {
        println!(
            "{:<36} {:<7} {:<7}",
            alias,
            if has(&cached, alias) { "yes" } else { "" },
            if has(&loaded, alias) { "yes" } else { "" }
        );
    }
    Ok(())
}

fn thread_title(first_message: &str) -> String {
    let line = first_message.lines().next().unwrap_or("").trim();
    let mut title: String = line.chars().take(THREAD_TITLE_CHARS).collect();
    if line.chars().count() > THREAD_TITLE_CHARS {
        title.push('…');
    }
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title
    }
}

async fn chat(
    state: &AppState,
    model: Option<String>,
    thread: Option<String>,
    temperature: Option<f32>,
    system: Option<String>,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let db = state.open_db()?;
    let resumed = match &thread {
        Some(id) => Some(thread_history(&db, id)?),
        None => None,
    };

    let alias = match model {
        Some(m) => m,
        None => state
            .supervisor
            .discover(cancel)
            .await
            .map_err(|e| e.to_string())?
            .selected
            .ok_or("no model available; pass --model")?,
    };
    activate(state, &alias, cancel).await?;

    let mut history: Vec<ChatMessage> = Vec::new();
    if let Some(prompt) = system {
        history.push(ChatMessage::new("system", prompt));
    }
    let (thread_id, mut titled) = match (thread, resumed) {
        (Some(id), Some(previous)) => {
            history.extend(previous);
            (id, true)
        }
        _ => (db.create_thread("New chat").map_err(|e| e.to_string())?, false),
    };
    let temperature = temperature.unwrap_or(state.config.temperature);
    println!("thread {} with {} (empty line or /exit to quit)", thread_id, alias);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            l = lines.next_line() => l.map_err(|e| e.to_string())?,
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() || text == "/exit" {
            break;
        }

        db.add_message(&thread_id, "user", text).map_err(|e| e.to_string())?;
        if !titled {
            db.update_thread_title(&thread_id, &thread_title(text)).map_err(|e| e.to_string())?;
            titled = true;
        }
        history.push(ChatMessage::new("user", text));

        match state
            .relay
            .send_chat(state.supervisor.as_ref(), &alias, &history, temperature, cancel)
            .await
        {
            Ok(reply) => {
                println!("{}\n", reply);
                db.add_message(&thread_id, "assistant", &reply).map_err(|e| e.to_string())?;
                history.push(ChatMessage::new("assistant", reply));
            }
            Err(e) => {
                eprintln!("{}", e);
                state.sink.warn(&format!("[chat] {}", e));
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
        db.touch_thread(&thread_id).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Stored messages of an existing thread, oldest first.
fn thread_history(db: &Database, thread: &str) -> Result<Vec<ChatMessage>, String> {
    if db.get_thread(thread).map_err(|e| e.to_string())?.is_none() {
        return Err(format!("no thread with id {}", thread));
    }
    Ok(db
        .list_messages(thread)
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|m| ChatMessage::new(m.role, m.content))
        .collect())
}

fn threads(state: &AppState) -> Result<(), String> {
    let db = state.open_db()?;
    for t in db.list_threads().map_err(|e| e.to_string())? {
        println!("{}  {}  {}", t.id, t.updated_at, t.title);
    }
    Ok(())
}

fn history(state: &AppState, thread: &str) -> Result<(), String> {
    let db = state.open_db()?;
    if db.get_thread(thread).map_err(|e| e.to_string())?.is_none() {
        return Err(format!("no thread with id {}", thread));
    }
    let messages = db.list_messages(thread).map_err(|e| e.to_string())?;
    if messages.is_empty() {
        return Err(format!("no messages in thread {}", thread));
    }
    for m in messages {
        println!("[{}] {}:\n{}\n", m.created_at, m.role, m.content);
    }
    Ok(())
}

async fn telemetry_feed(state: &AppState, ticks: u32, json: bool, cancel: &CancellationToken) -> Result<(), String> {
    let (mut rx, handle) = telemetry::spawn_aggregator(
        state.config.telemetry.clone(),
        telemetry::platform_samplers(),
        telemetry::platform_adapters(),
        cancel.child_token(),
    );
    for _ in 0..ticks {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => changed.map_err(|e| e.to_string())?,
        }
        let snap = rx.borrow_and_update().clone();
        if json {
            println!("{}", serde_json::to_string(snap.as_ref()).map_err(|e| e.to_string())?);
            continue;
        }
        let disk = snap.disk_percent.map(|d| format!("{:.0}%", d)).unwrap_or_else(|| "-".to_string());
        println!(
            "cpu {:>5.1}%  mem {:>5.1}% ({} / {} MB)  disk {}",
            snap.cpu_percent, snap.memory_percent, snap.memory_used_mb, snap.memory_total_mb, disk
        );
        for a in &snap.accelerators {
            let index = a.adapter_index.map(|i| i.to_string()).unwrap_or_else(|| "?".to_string());
            println!(
                "  {:?}[{}] {:<32} {:>5.1}%  {} / {} MB",
                a.kind, index, a.name, a.utilization_percent, a.mem_used_mb, a.mem_total_mb
            );
        }
    }
    drop(rx);
    handle.abort();
    Ok(())
}

async fn dispatch(state: AppState, command: Commands) -> Result<(), String> {
    let cancel = ctrl_c_token();
    match command {
        Commands::Status => status(&state, &cancel).await,
        Commands::Models => models(&state, &cancel).await,
        Commands::Activate { alias } => activate(&state, &alias, &cancel).await,
        Commands::Unload { alias } => {
            state.supervisor.unload_model(&alias, &cancel).await.map_err(|e| e.to_string())?;
            println!("unloaded {}", alias);
            Ok(())
        }
        Commands::Stop => {
            state.supervisor.stop_service(&cancel).await.map_err(|e| e.to_string())?;
            println!("service stopped");
            Ok(())
        }
        Commands::Chat {
            model,
            thread,
            temperature,
            system,
        } => chat(&state, model, thread, temperature, system, &cancel).await,
        Commands::Threads => threads(&state),
        Commands::History { thread } => history(&state, &thread),
        Commands::Telemetry { ticks, json } => telemetry_feed(&state, ticks, json, &cancel).await,
        Commands::Config { write } => {
            let text = serde_json::to_string_pretty(&state.config).map_err(|e| e.to_string())?;
            println!("{}", text);
            if write {
                state.config.save(&state.data_dir).map_err(|e| e.to_string())?;
                println!("written to {}", state.data_dir.join("config.json").display());
            }
            Ok(())
        }
    }
}

pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    let state = AppState::new(data_dir, cli.cli);
    state.sink.info(&format!("[shell] inferdesk {} started", env!("CARGO_PKG_VERSION")));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(dispatch(state, cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_title() {
        assert_eq!(thread_title("What is Rust?\nmore"), "What is Rust?");
        assert_eq!(thread_title("   "), "New chat");
        let long = "x".repeat(100);
        let title = thread_title(&long);
        assert_eq!(title.chars().count(), THREAD_TITLE_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["inferdesk", "--data-dir", "/tmp/x", "activate", "phi-4-mini"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Commands::Activate { ref alias } if alias == "phi-4-mini"));

        let cli = Cli::try_parse_from(["inferdesk", "telemetry", "--ticks", "2", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Telemetry { ticks: 2, json: true }));
    }

    // ── threads ──

    #[test]
    fn test_thread_history_rejects_unknown_thread() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path()).unwrap();
        let err = thread_history(&db, "not-a-thread").unwrap_err();
        assert_eq!(err, "no thread with id not-a-thread");
        assert!(db.list_threads().unwrap().is_empty());
    }

    #[test]
    fn test_thread_history_resumes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path()).unwrap();
        let id = db.create_thread("Rust").unwrap();
        db.add_message(&id, "user", "What is Rust?").unwrap();
        db.add_message(&id, "assistant", "A systems language.").unwrap();

        let history = thread_history(&db, &id).unwrap();
        assert_eq!(
            history,
            vec![
                ChatMessage::new("user", "What is Rust?"),
                ChatMessage::new("assistant", "A systems language."),
            ]
        );

        let empty = db.create_thread("New chat").unwrap();
        assert!(thread_history(&db, &empty).unwrap().is_empty());
    }

    #[test]
    fn test_app_state_applies_cli_override() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().to_path_buf(), Some("/opt/foundry/bin/foundry".into()));
        assert_eq!(state.config.cli_program, "/opt/foundry/bin/foundry");
        assert!(state.sink.log_dir().starts_with(dir.path()));
        assert_eq!(state.supervisor.active_model(), None);
    }
}
