#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "hubsync: versioned leaf hub status bundles",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to `<config dir>/hubsync/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store path, overriding `consumer.database_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Apply transport messages to the store",
        long_about = "Read transport messages (one JSON object per line) and route each \
                      through the consumer registry into the store.",
        after_help = "EXAMPLES:\n    # Apply a captured batch\n    hubsync apply messages.jsonl\n\n    # Read from stdin\n    cat messages.jsonl | hubsync apply -"
    )]
    Apply(cmd::apply::ApplyArgs),

    #[command(
        about = "Show stored state",
        after_help = "EXAMPLES:\n    # Per-cluster compliance of every hub\n    hubsync show compliance\n\n    # Applied bundle versions as JSON\n    hubsync show versions --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(about = "Print the resolved configuration")]
    Config,

    #[command(
        about = "Open the store and bring its schema up to date",
        after_help = "EXAMPLES:\n    hubsync migrate --db /var/lib/hubsync/store.sqlite3"
    )]
    Migrate,

    #[command(
        about = "Run a deterministic simulation campaign",
        after_help = "EXAMPLES:\n    # 200 seeds at the minimal aggregation level\n    hubsync sim --seeds 200 --level minimal"
    )]
    Sim(cmd::sim::SimArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HUBSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "hubsync=debug,info"
        } else {
            "hubsync=info,warn"
        })
    });

    let format = env::var("HUBSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mode = cli.output_mode();
    let config = hubsync_core::config::resolve_config(cli.config.as_deref())?;
    let db = cli
        .db
        .clone()
        .unwrap_or_else(|| config.consumer.database_path.clone());

    match &cli.command {
        Commands::Apply(args) => cmd::apply::run(args, &config, &db, mode),
        Commands::Show(args) => cmd::show::run(args, &db, mode),
        Commands::Config => cmd::config::run(&config, mode),
        Commands::Migrate => cmd::config::migrate(&db, mode),
        Commands::Sim(args) => cmd::sim::run(args, mode),
    }
}
