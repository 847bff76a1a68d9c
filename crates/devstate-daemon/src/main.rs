//! `devstated` – device lifecycle daemon
//!
//! 1. Reads `/etc/devstate/devstated.toml` (or `--config`) and applies the
//!    `DEVSTATE_*` / `BOOTSTATE` environment overrides.
//! 2. Installs the tracing subscriber.
//! 3. Starts the hardware watchdog thread.
//! 4. Binds the client socket and loads the configured modules; the first one
//!    must load or the daemon exits with status 1.
//! 5. Runs the event loop until termination (Ctrl-C / SIGTERM) or until a
//!    module requests exit.

mod config;
mod event_loop;
mod logging;
mod modules;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use devstate_kernel::{Wake, WatchdogHandle};
use devstate_middleware::{Bus, SocketHub, SocketServer};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::event_loop::LoopInputs;
use crate::logging::LoggingModule;

#[derive(Parser, Debug)]
#[command(name = "devstated", version, about = "Device lifecycle daemon")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Module to load first; the daemon refuses to start without it.
    #[arg(short = 'p', long)]
    startup_module: Option<String>,

    /// Syslog-style log verbosity, 3 (errors) to 7 (debug).
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(0..=8))]
    verbosity: Option<u32>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!(error = format!("{e:#}"), "devstated failed");
            eprintln!("devstated: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut cfg = config::load_from(&args.config)?;
    config::apply_process_env(&mut cfg);
    if let Some(name) = &args.startup_module {
        cfg.set_startup_module(name);
    }

    let log_control = logging::init(args.verbosity.or(cfg.verbosity))?;
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "devstated starting");

    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();

    let terminate = wake_tx.clone();
    ctrlc::set_handler(move || {
        let _ = terminate.send(Wake::Terminate);
    })
    .context("installing the termination handler")?;

    let watchdog = WatchdogHandle::spawn(&cfg.watchdog, wake_tx).context("starting the watchdog thread")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")?;

    let code = runtime.block_on(async {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut server = SocketServer::bind(&cfg.socket_path, events_tx)
            .with_context(|| format!("binding {}", cfg.socket_path.display()))?;

        let mut bus = Bus::new(SocketHub::new());
        let kicker = watchdog.kicker();
        modules::load_all(&mut bus, &cfg, Some(&kicker))?;
        if let Err(e) = bus.load_module(Box::new(LoggingModule::with_control(log_control)), 0) {
            warn!(error = %e, "logging module not loaded");
        }
        bus.drain();

        let code = event_loop::run(
            &mut bus,
            LoopInputs {
                server: &mut server,
                events: &mut events_rx,
                wake: &mut wake_rx,
                watchdog: Some(&watchdog),
            },
        )
        .await;

        bus.unload_all();
        Ok::<i32, anyhow::Error>(code)
    })?;

    watchdog.stop();
    info!(code, "devstated exiting");
    Ok(code)
}
