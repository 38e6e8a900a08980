//! Kait CLI entry point.

use std::io::Read;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use kait::advisory::AdviceRequest;
use kait::config::{self, Config};
use kait::error::{exit_codes, KaitError};
use kait::event::EventKind;
use kait::hook::HookRunner;
use kait::runtime::Runtime;

/// Kait - self-improving advisory engine for AI coding agents
#[derive(Parser)]
#[command(name = "kait")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override the data root (defaults to DATA_ROOT or ~/.kait)
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest daemon and pipeline
    Daemon {
        /// Port to bind on loopback
        #[arg(long)]
        port: Option<u16>,
    },

    /// [Internal] Handle one hook invocation (JSON on stdin)
    Hook {
        /// The hook event kind
        #[arg(value_enum)]
        event: HookEvent,
    },

    /// Query the advisory engine directly
    Advise {
        /// Session id
        #[arg(long, default_value = "cli")]
        session_id: String,
        /// Tool about to be invoked
        tool: String,
        /// Tool arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Print daemon status
    Status,

    /// Run one promotion pass immediately
    Promote,
}

/// Hook kinds accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum HookEvent {
    PreTool,
    PostTool,
    PostToolFailure,
    UserPrompt,
}

impl HookEvent {
    fn kind(self) -> EventKind {
        match self {
            HookEvent::PreTool => EventKind::PreTool,
            HookEvent::PostTool => EventKind::PostTool,
            HookEvent::PostToolFailure => EventKind::PostToolFailure,
            HookEvent::UserPrompt => EventKind::UserPrompt,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(data_root) = cli.data_root.or_else(config::data_root) else {
        eprintln!("error: could not determine data root (set DATA_ROOT)");
        return exit(exit_codes::CONFIG);
    };
    let config = Config::load(&data_root);

    let code = match cli.command {
        Commands::Daemon { port } => run_daemon(data_root, config, port),
        Commands::Hook { event } => run_hook(&data_root, &config, event),
        Commands::Advise {
            session_id,
            tool,
            args,
        } => run_advise(data_root, config, session_id, tool, args),
        Commands::Status => run_status(&data_root, &config),
        Commands::Promote => run_promote(data_root, config),
    };
    exit(code)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}

fn run_daemon(data_root: PathBuf, mut config: Config, port: Option<u16>) -> i32 {
    if let Some(port) = port {
        config.ingest.port = port;
    }
    let port = config.ingest.port;

    let runtime = match Runtime::bootstrap(&data_root, config) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => return startup_failure(&err),
    };

    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            eprintln!("error: port {} is already in use", port);
            return exit_codes::PORT_BIND;
        }
        Err(err) => {
            eprintln!("error: failed to bind port {}: {}", port, err);
            return exit_codes::CONFIG;
        }
    };

    match runtime.run_daemon(listener) {
        Ok(()) => exit_codes::CLEAN,
        Err(err) => {
            eprintln!("error: {}", err);
            exit_codes::CONFIG
        }
    }
}

fn startup_failure(err: &KaitError) -> i32 {
    eprintln!("error: {}", err);
    match err {
        KaitError::Storage { .. } => exit_codes::DATA_DIR,
        _ => exit_codes::CONFIG,
    }
}

fn run_hook(data_root: &PathBuf, config: &Config, event: HookEvent) -> i32 {
    let mut stdin_json = String::new();
    if std::io::stdin().read_to_string(&mut stdin_json).is_err() {
        // Fail-open: a broken stdin must not block the agent
        return exit_codes::CLEAN;
    }

    let token = kait::ingest::resolve_token(data_root).ok();
    let base_url = format!("http://127.0.0.1:{}", config.ingest.port);
    let runner = HookRunner::new(base_url, token);

    if let Some(output) = runner.run(event.kind(), &stdin_json) {
        if let Ok(json) = serde_json::to_string(&output) {
            println!("{}", json);
        }
    }
    exit_codes::CLEAN
}

fn run_advise(
    data_root: PathBuf,
    config: Config,
    session_id: String,
    tool: String,
    args: String,
) -> i32 {
    let tool_args: serde_json::Value = match serde_json::from_str(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("error: --args is not valid JSON: {}", err);
            return exit_codes::CONFIG;
        }
    };

    let runtime = match Runtime::bootstrap(&data_root, config) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => return startup_failure(&err),
    };

    let provider = runtime.advice_provider();
    let items = provider.advise_for(&AdviceRequest::new(session_id, tool, tool_args));
    match serde_json::to_string_pretty(&items) {
        Ok(json) => {
            println!("{}", json);
            exit_codes::CLEAN
        }
        Err(err) => {
            eprintln!("error: {}", err);
            exit_codes::CONFIG
        }
    }
}

fn run_status(data_root: &PathBuf, config: &Config) -> i32 {
    let token = kait::ingest::resolve_token(data_root).ok();
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new());

    let mut request = client.get(format!(
        "http://127.0.0.1:{}/status",
        config.ingest.port
    ));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    match request.send().and_then(|r| r.text()) {
        Ok(body) => {
            println!("{}", body);
            exit_codes::CLEAN
        }
        Err(err) => {
            eprintln!("error: daemon unreachable: {}", err);
            exit_codes::CONFIG
        }
    }
}

fn run_promote(data_root: PathBuf, config: Config) -> i32 {
    let runtime = match Runtime::bootstrap(&data_root, config) {
        Ok(runtime) => runtime,
        Err(err) => return startup_failure(&err),
    };

    let promotion = runtime.build_promotion();
    let result = runtime
        .cognitive
        .write()
        .map_err(|_| KaitError::store("cognitive lock poisoned"))
        .and_then(|mut store| promotion.run(&mut store, chrono::Utc::now()));

    match result {
        Ok(records) => {
            println!("{} promotion record(s)", records.len());
            exit_codes::CLEAN
        }
        Err(err) => {
            eprintln!("error: {}", err);
            exit_codes::CONFIG
        }
    }
}
