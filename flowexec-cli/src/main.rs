//! `flowexec` — operational CLI for the flowexec job execution manager.
//!
//! The task-record database and the REST API are external collaborators
//! (see the crate-level docs on `flowexec-orchestration`); this binary does
//! not embed a `TaskStore` implementation and so cannot run the scan loop by
//! itself. What it gives an operator is a thin client against the same
//! `SharedState`/`ControlBus` infrastructure a running manager process uses:
//! inspecting the barrier counters, sending `COMMUNICATE`, and resetting
//! state between maintenance windows.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use flowexec_shared::config::FlowManagerConfig;
use flowexec_shared::control_bus::{CommandExtra, ControlBus, ControlBusProvider, ControlCommand};
use flowexec_shared::error::FlowResult;
use flowexec_shared::logging::{init_tracing, LogFormat};
use flowexec_shared::shared_state::{
    InMemorySharedStateBackend, SharedState, SharedStateBackend, KEY_EXECUTOR_COUNT,
    KEY_SYNC_EXECUTION, KEY_SYNC_SEMAPHORE,
};

#[derive(Debug, Parser)]
#[command(name = "flowexec", version, about = "Operational CLI for the flowexec job execution manager")]
struct Cli {
    /// Directory holding `base.toml` and `<environment>.toml`.
    #[arg(long, global = true, default_value = "config", value_name = "DIR")]
    config_dir: PathBuf,

    /// Overlay file selected on top of `base.toml`.
    #[arg(long, global = true, default_value = "development", env = "FLOWEXEC_ENV")]
    environment: String,

    /// Redis URL backing `SharedState`. Without this flag the CLI falls
    /// back to an in-process backend, which is only useful for smoke-testing
    /// this binary in isolation — it shares no state with a real manager.
    #[arg(long, global = true, env = "FLOWEXEC_REDIS_URL")]
    redis_url: Option<String>,

    /// Postgres URL backing the `pgmq` control bus. Without this flag the
    /// CLI falls back to an in-process queue private to this invocation —
    /// `communicate`/`reset` then only demonstrate the protocol, they do not
    /// reach a real manager's control channel.
    #[arg(long, global = true, env = "FLOWEXEC_DATABASE_URL")]
    database_url: Option<String>,

    /// Emit structured JSON logs instead of the human-readable format.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Control channel name the manager process listens on.
    #[arg(long, global = true, default_value = "flowexec.control")]
    control_channel: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved effective configuration as JSON.
    ConfigShow,
    /// Print the barrier counters (`sync_execution`, `sync_semaphore`,
    /// `executor_count`) currently held in `SharedState`.
    Status,
    /// Send a `COMMUNICATE` command on the control channel, as a running
    /// manager's `communicate()` sender would.
    Communicate {
        /// Block until the barrier drains before returning.
        #[arg(long)]
        sync: bool,
        /// Override the active executor for the triggered scan.
        #[arg(long)]
        executor: Option<String>,
        /// Verbosity forwarded to the scan and, transitively, to any
        /// executor it schedules.
        #[arg(long, default_value_t = 0)]
        verbosity: i32,
    },
    /// Zero every counter and flag and drain the control channel. Does not
    /// wait for in-flight scans; the operator must ensure quiescence first.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    if init_tracing(log_format).is_err() {
        // A subscriber was already installed by the embedding process; not
        // an error condition for this binary.
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "flowexec command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> FlowResult<()> {
    let correlation_id = Uuid::now_v7();
    info!(%correlation_id, command = ?cli.command, "flowexec invoked");

    let config = FlowManagerConfig::load(&cli.config_dir, &cli.environment)?;

    match cli.command {
        Command::ConfigShow => config_show(&config),
        Command::Status => status(&cli, &config).await,
        Command::Communicate {
            sync,
            executor,
            verbosity,
        } => communicate(&cli, &config, sync, executor, verbosity).await,
        Command::Reset => reset(&cli, &config).await,
    }
}

fn config_show(config: &FlowManagerConfig) -> FlowResult<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    println!("{rendered}");
    Ok(())
}

async fn shared_state(cli: &Cli) -> FlowResult<SharedState> {
    let backend: Arc<dyn SharedStateBackend> = match &cli.redis_url {
        Some(url) => Arc::new(
            flowexec_shared::shared_state::RedisSharedStateBackend::connect(url, "flowexec")
                .await?,
        ),
        None => Arc::new(InMemorySharedStateBackend::default()),
    };
    Ok(SharedState::new("flowexec", backend))
}

async fn control_bus(cli: &Cli) -> FlowResult<ControlBus> {
    let provider = match &cli.database_url {
        Some(url) => ControlBusProvider::Postgres(
            flowexec_shared::control_bus::PgmqProvider::connect(url).await?,
        ),
        None => ControlBusProvider::InProcess(Default::default()),
    };
    Ok(ControlBus::new(provider))
}

async fn status(cli: &Cli, _config: &FlowManagerConfig) -> FlowResult<()> {
    let shared_state = shared_state(cli).await?;

    let sync_execution: i64 = shared_state.get(KEY_SYNC_EXECUTION).await?.unwrap_or(0);
    let sync_semaphore: i64 = shared_state.get(KEY_SYNC_SEMAPHORE).await?.unwrap_or(0);
    let executor_count: i64 = shared_state.get(KEY_EXECUTOR_COUNT).await?.unwrap_or(0);

    let rendered = serde_json::to_string_pretty(&json!({
        "sync_execution": sync_execution,
        "sync_semaphore": sync_semaphore,
        "executor_count": executor_count,
        "observed_at": chrono::Utc::now().to_rfc3339(),
    }))?;
    println!("{rendered}");
    Ok(())
}

async fn communicate(
    cli: &Cli,
    _config: &FlowManagerConfig,
    sync: bool,
    executor: Option<String>,
    verbosity: i32,
) -> FlowResult<()> {
    let shared_state = shared_state(cli).await?;
    let control_bus = control_bus(cli).await?;

    shared_state.add(KEY_SYNC_SEMAPHORE, 1).await?;
    control_bus
        .send(
            &cli.control_channel,
            ControlCommand::Communicate {
                settings: serde_json::Map::new(),
                extra: CommandExtra {
                    run_sync: sync,
                    verbosity,
                    executor,
                },
            },
            true,
        )
        .await?;

    println!("sent COMMUNICATE on '{}'", cli.control_channel);

    if sync {
        println!("waiting for the barrier to drain (sync_semaphore == 0)...");
        loop {
            let semaphore: i64 = shared_state.get(KEY_SYNC_SEMAPHORE).await?.unwrap_or(0);
            if semaphore == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        println!("barrier drained");
    }

    Ok(())
}

async fn reset(cli: &Cli, _config: &FlowManagerConfig) -> FlowResult<()> {
    let shared_state = shared_state(cli).await?;
    shared_state.reset().await?;

    let control_bus = control_bus(cli).await?;
    control_bus.drain(&cli.control_channel).await?;

    println!("shared state reset and '{}' drained", cli.control_channel);
    Ok(())
}
