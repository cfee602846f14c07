// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agentbroker CLI
//!
//! Operator surface for the session broker: create and drive sessions,
//! inspect stored records, purge expired ones and rebuild lost records from
//! the runtime's conversation logs.

use agentbroker_core::config::{BrokerConfig, LoggingConfig, StorageBackendKind};
use agentbroker_core::{BrokerError, ProcessRuntime, StreamEvent};
use agentbroker_pool::{CreateSessionRequest, SessionBroker};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "agentbroker")]
#[command(author, version, about = "Multi-tenant session broker for agent runtimes", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage backend (overrides config file)
    #[arg(long)]
    backend: Option<StorageBackendKind>,

    /// Owners' sandbox root (overrides config file)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new session
    Create {
        /// Owner id, also the sandbox directory name
        owner: String,

        /// Working directory below the owner root
        #[arg(long)]
        subdir: Option<String>,

        #[arg(long)]
        system_prompt: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        permission_mode: Option<String>,

        /// Comma-separated tool names
        #[arg(long, value_delimiter = ',')]
        allowed_tools: Option<Vec<String>>,

        /// Extra directory below the owner root (repeatable)
        #[arg(long = "add-dir")]
        add_dirs: Vec<String>,

        #[arg(long)]
        max_turns: Option<u32>,

        #[arg(long)]
        max_budget_usd: Option<f64>,

        /// Caller metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Send one message to a session
    Send {
        session_id: String,
        message: String,

        /// Print the response as it arrives
        #[arg(long)]
        stream: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Interactive conversation
    Chat {
        /// Resume this session instead of creating one
        #[arg(long, conflicts_with = "owner")]
        session: Option<String>,

        #[arg(long, required_unless_present = "session")]
        owner: Option<String>,

        #[arg(long)]
        subdir: Option<String>,
    },

    /// List stored sessions
    List {
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show a session's stored metadata
    Show { session_id: String },

    /// Close a session and delete its record
    Close { session_id: String },

    /// Delete every expired record
    Purge,

    /// Rebuild a session record from the runtime's conversation log
    Recover { session_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<BrokerError>() {
                Some(broker_err) => eprintln!("error [{}]: {:#}", broker_err.kind(), e),
                None => eprintln!("error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BrokerConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    if let Some(base_dir) = cli.base_dir {
        config.sandbox.base_dir = base_dir;
    }
    init_tracing(&config.logging, cli.verbose);
    config.validate()?;

    let store = agentbroker_storage::create_store(&config.storage)
        .await
        .map_err(BrokerError::from)?;
    let runtime = Arc::new(ProcessRuntime::new(&config.runtime));
    let broker = SessionBroker::new(config, runtime, store)?;

    let result = dispatch(&broker, cli.command, cli.json).await;
    broker.shutdown().await;
    result
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn dispatch(broker: &SessionBroker, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Create {
            owner,
            subdir,
            system_prompt,
            model,
            permission_mode,
            allowed_tools,
            add_dirs,
            max_turns,
            max_budget_usd,
            metadata,
        } => {
            let metadata = match metadata {
                Some(raw) => serde_json::from_str::<Map<String, Value>>(&raw)
                    .context("--metadata must be a JSON object")?,
                None => Map::new(),
            };
            let request = CreateSessionRequest {
                subdir,
                system_prompt,
                model,
                permission_mode,
                allowed_tools,
                add_dirs,
                max_turns,
                max_budget_usd,
                metadata,
                ..CreateSessionRequest::new(owner)
            };
            let meta = broker.create_session(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&meta)?);
            } else {
                println!("✓ Session created");
                println!("  ID:    {}", meta.session_id);
                println!("  Owner: {}", meta.owner_id);
                println!("  CWD:   {}", meta.cwd.display());
            }
        }

        Commands::Send {
            session_id,
            message,
            stream,
            timeout,
        } => {
            if stream {
                stream_reply(broker, &session_id, &message).await?;
            } else {
                let response = broker
                    .send_message(&session_id, &message, timeout.map(Duration::from_secs))
                    .await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                } else {
                    println!("{}", response.text);
                    for call in &response.tool_calls {
                        eprintln!("[tool] {} {}", call.name, call.input);
                    }
                }
            }
        }

        Commands::Chat { session, owner, subdir } => {
            chat(broker, session, owner, subdir).await?;
        }

        Commands::List { owner } => {
            let ids = broker.list_sessions(owner.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ids)?);
            } else if ids.is_empty() {
                println!("No sessions");
            } else {
                for id in ids {
                    println!("{}", id);
                }
            }
        }

        Commands::Show { session_id } => {
            let meta = broker.get_session(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }

        Commands::Close { session_id } => {
            if !broker.close_session(&session_id).await? {
                return Err(BrokerError::NotFound(session_id).into());
            }
            if !json {
                println!("✓ Session closed");
            }
        }

        Commands::Purge => {
            let purged = broker.purge_expired().await?;
            if json {
                println!("{}", serde_json::json!({ "purged": purged }));
            } else {
                println!("✓ Purged {} expired session(s)", purged);
            }
        }

        Commands::Recover { session_id } => {
            let meta = broker.recover_session(&session_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&meta)?);
            } else {
                println!("✓ Session {} belongs to {}", meta.session_id, meta.owner_id);
                println!("  CWD: {}", meta.cwd.display());
            }
        }
    }
    Ok(())
}

/// Print a streamed reply; an error event becomes the command's error
async fn stream_reply(broker: &SessionBroker, session_id: &str, message: &str) -> Result<()> {
    let mut events = broker.send_message_stream(session_id, message).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TextDelta { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::ToolUse { name, input } => {
                eprintln!("\n[tool] {} {}", name, input);
            }
            StreamEvent::Error { message } => {
                println!();
                bail!("agent reported an error: {}", message);
            }
            StreamEvent::Done => {
                println!();
                return Ok(());
            }
        }
    }
    bail!("stream ended without a result")
}

async fn chat(
    broker: &SessionBroker,
    session: Option<String>,
    owner: Option<String>,
    subdir: Option<String>,
) -> Result<()> {
    let session_id = match (session, owner) {
        (Some(id), _) => {
            broker.resume_session(&id).await?;
            id
        }
        (None, Some(owner)) => {
            let request = CreateSessionRequest {
                subdir,
                ..CreateSessionRequest::new(owner)
            };
            broker.create_session(request).await?.session_id
        }
        (None, None) => bail!("either --session or --owner is required"),
    };
    broker.start_reclaimer();
    println!("Session {} (/exit to quit)", session_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" || line == "/quit" {
            break;
        }
        if let Err(e) = stream_reply(broker, &session_id, line).await {
            eprintln!("error: {:#}", e);
        }
    }
    Ok(())
}
