//! ptykeep: supervise long-lived interactive sessions.
//!
//! Spawns commands on PTYs, keeps a durable record of every session and
//! guards hand-off with passwords, one-time codes and attach tokens.

mod commands;
mod terminal;

use clap::{Parser, Subcommand};
use ptykeep_server::lifecycle::{AccessMode, SessionState};
use ptykeep_server::{KeepConfig, Overrides};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// ptykeep: supervised PTY sessions
#[derive(Parser)]
#[command(name = "ptykeep", version, about = "Supervise, persist and share long-lived PTY sessions")]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session database (overrides [store].path; ":memory:" for a throwaway store)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Default working directory for new sessions (overrides [spawn].workdir)
    #[arg(long, global = true)]
    workdir: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the GC loop until SIGINT/SIGTERM
    Serve {
        /// Sweep interval in seconds (overrides [gc].interval)
        #[arg(long)]
        interval: Option<i64>,
    },

    /// Run one GC sweep and print the counts
    Sweep,

    /// Register a session record without starting a process
    Create {
        /// Tool name
        #[arg(long, default_value = "shell")]
        tool: String,
        /// Owner (defaults to $USER)
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// Command line (defaults to the tool's configured command)
        #[arg(long)]
        command: Option<String>,
        /// Access mode: none, one_time or permanent
        #[arg(long, default_value = "none")]
        access: AccessMode,
        /// Password for the access mode (generated when omitted)
        #[arg(long)]
        password: Option<String>,
        /// Exempt from the detached TTL
        #[arg(long)]
        pin: bool,
    },

    /// List sessions
    List {
        #[arg(long)]
        owner: Option<String>,
        /// running, detached, terminated or archived
        #[arg(long)]
        state: Option<SessionState>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one session
    Show { id: String },

    /// Show a session's event timeline, most recent first
    Events {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Archive terminated sessions now
    Archive {
        #[arg(long)]
        owner: Option<String>,
    },

    /// Mark a session detached
    Detach { id: String },

    /// Mark a session terminated. Only the record changes here; a
    /// `ptykeep run` attached to the session notices and stops its process.
    Terminate {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Pin (or unpin) a session
    Pin {
        id: String,
        /// Remove the pin instead
        #[arg(long)]
        off: bool,
    },

    /// Set a session's access mode; prints the secret once
    Access {
        id: String,
        /// none, one_time or permanent
        mode: AccessMode,
        #[arg(long)]
        password: Option<String>,
    },

    /// Verify a session password (prompts when omitted)
    Verify {
        id: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Issue a single-use attach token
    Token {
        id: String,
        /// Only this caller may redeem the token
        #[arg(long)]
        owner: Option<String>,
        /// Lifetime in seconds (clamped to the configured range)
        #[arg(long)]
        ttl: Option<i64>,
    },

    /// Redeem an attach token
    Redeem {
        token: String,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Spawn a session and attach this terminal (Ctrl+] ends it)
    Run {
        /// Tool name
        #[arg(long, default_value = "shell")]
        tool: String,
        /// Owner (defaults to $USER)
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// Access mode: none, one_time or permanent
        #[arg(long, default_value = "none")]
        access: AccessMode,
        /// Exempt from the detached TTL
        #[arg(long)]
        pin: bool,
        /// Relaunch an existing session record instead of creating one
        #[arg(long, conflicts_with_all = ["tool", "title", "access", "pin", "command"])]
        session: Option<String>,
        /// Command line (defaults to the tool's configured command)
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.log_level, cli.verbose, &cli.command) {
        (Some(level), _, _) => level.clone(),
        (None, true, _) => "ptykeep=debug,ptykeep_server=debug,ptykeep_core=debug".to_string(),
        (None, false, Command::Serve { .. }) => "info".to_string(),
        (None, false, _) => "warn".to_string(),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("ptykeep: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let interval = match &cli.command {
        Command::Serve { interval, .. } => *interval,
        _ => None,
    };
    let overrides = Overrides {
        store_path: cli.db.clone(),
        workdir: cli.workdir.clone(),
        gc_interval: interval,
    };
    let config = KeepConfig::load(cli.config.as_deref(), &overrides)?;
    let binder = Arc::new(config.build()?);
    let json = cli.json;

    match cli.command {
        Command::Serve { .. } => commands::serve::run_serve(binder).await,
        Command::Sweep => commands::serve::run_sweep(&binder, json),
        Command::Create {
            tool,
            owner,
            title,
            command,
            access,
            password,
            pin,
        } => commands::sessions::run_create(
            &binder,
            commands::sessions::CreateArgs {
                tool,
                owner: owner.unwrap_or_else(commands::default_owner),
                title,
                command,
                access,
                password,
                pin,
            },
            json,
        ),
        Command::List {
            owner,
            state,
            limit,
        } => commands::sessions::run_list(&binder, owner, state, limit, json),
        Command::Show { id } => commands::sessions::run_show(&binder, &id, json),
        Command::Events { id, limit } => commands::sessions::run_events(&binder, &id, limit, json),
        Command::Archive { owner } => {
            commands::sessions::run_archive(&binder, owner.as_deref(), json)
        }
        Command::Detach { id } => commands::sessions::run_detach(&binder, &id, json),
        Command::Terminate { id, reason } => {
            commands::sessions::run_terminate(&binder, &id, reason.as_deref(), json)
        }
        Command::Pin { id, off } => commands::sessions::run_pin(&binder, &id, !off, json),
        Command::Access { id, mode, password } => {
            commands::access::run_configure(&binder, &id, mode, password.as_deref(), json)
        }
        Command::Verify { id, password } => {
            commands::access::run_verify(&binder, &id, password, json)
        }
        Command::Token { id, owner, ttl } => {
            commands::access::run_token(&binder, &id, owner.as_deref(), ttl, json)
        }
        Command::Redeem { token, owner } => {
            commands::access::run_redeem(&binder, &token, owner.as_deref(), json)
        }
        Command::Run {
            tool,
            owner,
            title,
            access,
            pin,
            session,
            command,
        } => {
            let target = match session {
                Some(id) => commands::run::Target::Existing(id),
                None => commands::run::Target::New(ptykeep_server::SpawnRequest {
                    owner: owner.unwrap_or_else(commands::default_owner),
                    tool,
                    title,
                    command: (!command.is_empty()).then(|| command.join(" ")),
                    access_mode: access,
                    pinned: pin,
                    ..Default::default()
                }),
            };
            commands::run::run(binder, target).await
        }
    }
}
