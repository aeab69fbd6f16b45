mod client;
mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use client::DaemonClient;
use commands::{EXIT_DAEMON_UNREACHABLE, EXIT_FAILURE, EXIT_REJECTED};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "latchkey",
    version,
    about = "Time-boxed access codes for a Hubitat-connected smart lock"
)]
struct Cli {
    /// Base URL of the latchkey daemon.
    #[arg(long, default_value = client::DEFAULT_SERVER, global = true)]
    server: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon: reconcile, schedule, and serve the HTTP API.
    Serve {
        /// Path to the TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create a code for a user, active between two local times.
    Create {
        /// Name shown on the lock for this code.
        user: String,
        /// When the code starts working, e.g. "2025-06-14 15:00".
        #[arg(long)]
        enable_at: String,
        /// When the code stops working.
        #[arg(long)]
        expire_at: String,
    },
    /// List codes known to the daemon and present on the lock.
    List,
    /// Revoke a code immediately.
    Delete {
        /// Slot number.
        slot: u16,
    },
    /// Show activations the lock did not confirm.
    Failed,
    /// Show pending activations and expirations.
    Jobs,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LATCHKEY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let json_output = cli.json;
    let connect = || DaemonClient::new(&cli.server);
    let result = match cli.command {
        Commands::Serve { config } => commands::serve::run(config.as_deref()),
        Commands::Create {
            user,
            enable_at,
            expire_at,
        } => connect().and_then(|client| {
            commands::create::run(&client, &user, &enable_at, &expire_at, json_output)
        }),
        Commands::List => connect().and_then(|client| commands::list::run(&client, json_output)),
        Commands::Delete { slot } => {
            connect().and_then(|client| commands::delete::run(&client, slot, json_output))
        }
        Commands::Failed => {
            connect().and_then(|client| commands::failed::run(&client, json_output))
        }
        Commands::Jobs => connect().and_then(|client| commands::jobs::run(&client, json_output)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("rejected:") {
        EXIT_REJECTED
    } else if msg.starts_with("daemon unreachable:") {
        EXIT_DAEMON_UNREACHABLE
    } else {
        EXIT_FAILURE
    }
}
