//! Agent Session - run a coding agent turn from the command line.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent_session::config::{ConfigLoader, PermissionPolicyKind};
use agent_session::session::EventStream;
use agent_session::{Session, SessionConfig, SessionError, SessionEvent};

#[derive(Parser)]
#[command(
    name = "agent-session",
    about = "Drive a coding agent as a typed session",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one turn and stream the agent's reply.
    Run {
        /// The prompt to send.
        prompt: String,
        /// Agent executable (overrides the config file).
        #[arg(long)]
        executable: Option<String>,
        /// Model to request.
        #[arg(short, long)]
        model: Option<String>,
        /// Only allow read-only tools.
        #[arg(long)]
        read_only: bool,
    },
    /// Print the effective configuration.
    Config,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<SessionConfig, SessionError> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    Ok(loader.load()?)
}

async fn run_turn(config: SessionConfig, prompt: String) -> Result<bool, SessionError> {
    let model = config.model.clone();
    let session = Session::spawn(config).await?;
    if model.is_some() {
        if let Err(e) = session.set_model(model).await {
            tracing::warn!(error = %e, "Agent rejected the requested model");
        }
    }
    // The event stream is lossy and only feeds the transcript. The turn
    // outcome comes from `send`.
    let printer = session.take_events().map(|events| tokio::spawn(print_events(events)));

    let outcome = session.send(prompt).await;
    session.stop().await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    println!();

    match outcome {
        Ok(result) => {
            eprintln!(
                "Turn {} finished in {:.1}s, cost ${:.4}",
                result.number,
                result.duration.as_secs_f64(),
                result.cost_usd
            );
            Ok(true)
        }
        Err(SessionError::TurnFailed { number, error }) => {
            eprintln!("Turn {number} failed: {error}");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn print_events(mut events: EventStream) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::TextDelta { delta, .. } => {
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
            SessionEvent::ToolStart { name, .. } => {
                eprintln!("\n[tool] {name}");
            }
            SessionEvent::Error { cause, context } => {
                tracing::warn!(%context, %cause, "Session error");
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            prompt,
            executable,
            model,
            read_only,
        } => {
            if let Some(executable) = executable {
                config.executable = executable;
            }
            if model.is_some() {
                config.model = model;
            }
            if read_only {
                config.permission.policy = PermissionPolicyKind::ReadOnly;
            }
            tracing::info!(
                executable = %config.executable,
                model = ?config.model,
                "Starting agent session"
            );
            match run_turn(config, prompt).await {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}
