//! # Stride Host
//!
//! Entry point for the stride host process: the general-purpose computer's
//! half of the printer. It plans motion, compresses step schedules, and
//! streams timed commands to one or more MCUs over their serial links.
//!
//! ## Concurrency
//!
//! One control task owns the planner and dispatch; each MCU session gets a
//! dedicated I/O task that owns its transport. Everything communicates
//! over bounded channels, with a single atomic latch for shutdown.

// Use mimalloc for better allocation behavior under the step-generation load
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stride_host::clocksync::HostClock;
use stride_host::config::PrinterConfig;
use stride_host::controller::Controller;
use stride_host::plan::{run_plan, PlanArgs};
use stride_host::session::{self, Session, SessionHandle};
use stride_host::setup;
use stride_host::state::PrinterState;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The stride host process for distributed 3D printer firmware.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host server process.
    Run(RunArgs),
    /// Plan a move list offline and print the solved profiles.
    Plan(PlanArgs),
}

/// Arguments for the `run` command.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "printer.cfg")]
    config: PathBuf,

    /// Log file path; stderr when unset.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn init_tracing(log: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {path:?}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.log.as_ref())?;
            run_server(args).await
        }
        Commands::Plan(args) => {
            init_tracing(None)?;
            run_plan(args)
        }
    }
}

/// Connects one session over whichever transport the config names.
async fn connect_session(
    index: usize,
    config: &PrinterConfig,
    host_clock: HostClock,
    events: mpsc::Sender<session::SessionEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<SessionHandle> {
    let mcu = &config.mcus[index];
    let is_socket = std::fs::metadata(&mcu.serial)
        .map(|m| {
            use std::os::unix::fs::FileTypeExt;
            m.file_type().is_socket()
        })
        .unwrap_or(false);

    info!(mcu = %mcu.name, path = %mcu.serial, socket = is_socket, "connecting");
    if is_socket {
        let stream = UnixStream::connect(&mcu.serial)
            .await
            .with_context(|| format!("failed to connect to {}", mcu.serial))?;
        let session = Session::connect(index, stream, mcu.clock_freq, host_clock)
            .await
            .with_context(|| format!("session start failed on {}", mcu.name))?;
        Ok(session::spawn(session, mcu.name.clone(), events, shutdown))
    } else {
        let stream = tokio_serial::new(&mcu.serial, mcu.baud)
            .open_native_async()
            .with_context(|| format!("failed to open serial port {}", mcu.serial))?;
        let session = Session::connect(index, stream, mcu.clock_freq, host_clock)
            .await
            .with_context(|| format!("session start failed on {}", mcu.name))?;
        Ok(session::spawn(session, mcu.name.clone(), events, shutdown))
    }
}

/// Initializes and runs the server: sessions, controller, shutdown.
async fn run_server(args: RunArgs) -> Result<()> {
    info!("starting stride host");

    // 1. Load configuration and build the printer graph.
    info!(path = ?args.config, "loading configuration");
    let config = PrinterConfig::load(&args.config)?;
    let kinematics = setup::build_kinematics(&config)?;
    let toolhead = setup::build_toolhead(&config)?;
    let config_batches = setup::config_batches(&config);

    // 2. Shared plumbing: status block, shutdown latch, event channel.
    let state = Arc::new(Mutex::new(PrinterState::new()));
    let shutdown = Arc::new(AtomicBool::new(false));
    let host_clock = HostClock::new();
    let (events_tx, events_rx) = mpsc::channel(256);

    // 3. Connect and spawn every MCU session.
    let mut sessions = Vec::new();
    for index in 0..config.mcus.len() {
        let handle = connect_session(
            index,
            &config,
            host_clock,
            events_tx.clone(),
            shutdown.clone(),
        )
        .await?;
        sessions.push(handle);
    }
    drop(events_tx);

    // 4. The control task.
    let (controller, handle) = Controller::new(
        toolhead,
        kinematics,
        sessions.clone(),
        events_rx,
        host_clock,
        state.clone(),
        shutdown.clone(),
        config_batches,
    );
    let controller_task = tokio::spawn(controller.run());
    info!("controller started");

    // 5. Run until interrupted or a fatal error latches shutdown.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            handle.flush().await;
        }
        _ = controller_task => {
            info!("controller stopped");
        }
    }

    // 6. Quiesce: latch, close sessions, give workers a moment to flush.
    shutdown.store(true, Ordering::SeqCst);
    for session in &sessions {
        session.close().await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Some(fatal) = &state.lock().fatal {
        anyhow::bail!("host halted: {}", fatal.cause);
    }
    Ok(())
}
