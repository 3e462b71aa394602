mod client;
mod daemon;
mod market;
mod services;

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jedisos_engine::ChannelAdapter;
use jedisos_envelope::{Channel, Envelope};
use jedisos_packages::PackageManager;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jedisos", version, about = "Personal AI-assistant request-processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit one message (or start an interactive loop) and print the reply.
    Chat {
        /// Send a single message instead of reading an interactive loop from stdin.
        #[arg(long)]
        message: Option<String>,
        #[arg(long, default_value = "cli-user")]
        user_id: String,
        #[arg(long, default_value = "cli-user")]
        user_name: String,
    },
    /// Run the long-lived daemon other local adapters submit turns to.
    Serve,
    /// Check whether a `serve` daemon is reachable.
    Health,
    /// Create the on-disk package directory layout and a default `.env`.
    Init,
    /// Report the running version (no remote update channel in this core).
    Update,
    /// Inspect and manage installed packages.
    Market {
        #[command(subcommand)]
        command: MarketCommands,
    },
}

#[derive(Debug, Subcommand)]
enum MarketCommands {
    List {
        #[arg(long)]
        r#type: Option<String>,
    },
    Search {
        query: String,
        #[arg(long)]
        r#type: Option<String>,
    },
    Info {
        name: String,
    },
    Validate {
        path: PathBuf,
        #[arg(long)]
        allow_shell: bool,
    },
    Install {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Remove {
        name: String,
    },
}

/// For `serve`, logs also go to a daily-rotated file under the state dir so
/// an unattended daemon's history survives past its terminal scrollback;
/// every other subcommand is a short-lived foreground invocation and only
/// needs stdout. Returns the appender guard — it must stay alive for the
/// process lifetime or buffered log lines are lost on drop.
fn init_tracing(daemon: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_env("JEDISOS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    if !daemon {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return None;
    }

    let log_dir = services::state_dir().join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "jedisos.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(non_blocking.and(std::io::stdout))
        .init();
    Some(guard)
}

fn packages_root() -> PathBuf {
    PathBuf::from(std::env::var("JEDISOS_PACKAGES_ROOT").unwrap_or_else(|_| "tools".to_string()))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(matches!(cli.command, Commands::Serve));

    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Chat { message, user_id, user_name } => run_chat(message, user_id, user_name).await,
        Commands::Serve => run_serve().await,
        Commands::Health => run_health().await,
        Commands::Init => run_init(),
        Commands::Update => run_update(),
        Commands::Market { command } => run_market(command),
    }
}

/// Talks to a running `serve` daemon if one is reachable; otherwise builds
/// an in-process engine for this one invocation. Either path exercises the
/// same `ChannelAdapter` contract a platform transport would.
async fn run_chat(message: Option<String>, user_id: String, user_name: String) -> i32 {
    let socket = daemon::socket_path();
    if daemon::is_running(&socket).await {
        return run_chat_via_daemon(&socket, message, &user_id, &user_name).await;
    }

    let engine = match services::build_engine().await {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to start engine: {err:#}");
            return 1;
        }
    };

    match message {
        Some(text) => run_one_shot(&engine, &user_id, &user_name, &text).await,
        None => run_interactive(&engine, &user_id, &user_name).await,
    }
}

async fn run_chat_via_daemon(socket: &std::path::Path, message: Option<String>, user_id: &str, user_name: &str) -> i32 {
    match message {
        Some(text) => match client::submit_turn(socket, user_id, user_name, &text).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error talking to daemon: {err:#}");
                1
            }
        },
        None => {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(err) = client::submit_turn(socket, user_id, user_name, &line).await {
                    eprintln!("error talking to daemon: {err:#}");
                    return 1;
                }
            }
            0
        }
    }
}

async fn run_one_shot(engine: &jedisos_engine::Engine, user_id: &str, user_name: &str, text: &str) -> i32 {
    let envelope = Envelope::new(Channel::Cli, user_id, user_name, text);
    print_stream(engine, envelope).await
}

async fn run_interactive(engine: &jedisos_engine::Engine, user_id: &str, user_name: &str) -> i32 {
    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            print!("> ");
            io::stdout().flush().ok();
            continue;
        }
        let envelope = Envelope::new(Channel::Cli, user_id, user_name, &line);
        let code = print_stream(engine, envelope).await;
        if code != 0 {
            return code;
        }
        print!("> ");
        io::stdout().flush().ok();
    }
    0
}

async fn print_stream(engine: &jedisos_engine::Engine, envelope: Envelope) -> i32 {
    let mut events = engine.submit(envelope);
    let mut code = 0;
    while let Some(event) = events.recv().await {
        use jedisos_agent::BackendEvent;
        match event {
            BackendEvent::Token(text) => {
                print!("{text}");
                io::stdout().flush().ok();
            }
            BackendEvent::ToolCallStart(info) => println!("\n[calling {}]", info.name),
            BackendEvent::ToolCallEnd(info) => println!("[{} -> {}]", info.name, info.output),
            BackendEvent::ForgeRequested { goal } => println!("\n[building a tool for: {goal}]"),
            BackendEvent::Done => println!(),
            BackendEvent::Error(message) => {
                eprintln!("\nerror: {message}");
                code = 1;
            }
        }
    }
    code
}

async fn run_serve() -> i32 {
    let socket = daemon::socket_path();
    match daemon::run(&socket).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("daemon exited: {err:#}");
            1
        }
    }
}

async fn run_health() -> i32 {
    let socket = daemon::socket_path();
    match client::health(&socket).await {
        Ok(true) => {
            println!("ok");
            0
        }
        _ => {
            eprintln!("no daemon reachable at {}", socket.display());
            1
        }
    }
}

fn run_init() -> i32 {
    let root = packages_root();
    for package_type in jedisos_packages::PackageType::all() {
        let dir = root.join(package_type.dir_name());
        if let Err(err) = std::fs::create_dir_all(&dir) {
            eprintln!("failed to create {}: {err}", dir.display());
            return 1;
        }
    }
    let state = services::state_dir();
    if let Err(err) = std::fs::create_dir_all(&state) {
        eprintln!("failed to create {}: {err}", state.display());
        return 1;
    }
    println!("initialized package layout under {}", root.display());
    0
}

fn run_update() -> i32 {
    println!("jedisos {} (no remote update channel configured in this core)", env!("CARGO_PKG_VERSION"));
    0
}

fn run_market(command: MarketCommands) -> i32 {
    let manager = PackageManager::new(packages_root());
    match command {
        MarketCommands::List { r#type } => market::list(&manager, r#type.as_deref()),
        MarketCommands::Search { query, r#type } => market::search(&manager, &query, r#type.as_deref()),
        MarketCommands::Info { name } => market::info(&manager, &name),
        MarketCommands::Validate { path, allow_shell } => market::validate(&path, allow_shell),
        MarketCommands::Install { path, force } => market::install(&manager, &path, force),
        MarketCommands::Remove { name } => market::remove(&manager, &name),
    }
}
