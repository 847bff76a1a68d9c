//! Hardware watchdog kicker and main-loop liveness check.
//!
//! A dedicated [`std::thread`] kicks the hardware watchdog device every
//! period and then sends a [`Wake::Heartbeat`] into the event loop. Each
//! heartbeat counts as un-acknowledged until the loop calls
//! [`WatchdogHandle::pong`]. Once the number of un-acknowledged heartbeats
//! reaches the configured bound the main loop is considered frozen and the
//! freeze action runs. The default action aborts the process.
//!
//! [`HwwdModule`] is the bus side: it turns `HwwdKick` messages into an
//! immediate kick and counts `Heartbeat`s for diagnostics.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use devstate_middleware::{Binding, Context, Endpoint, Module};
use devstate_types::{Message, MessageKind};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Wake-ups delivered from other threads into the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The watchdog thread kicked and expects a pong.
    Heartbeat,
    /// Termination was requested (signal or similar).
    Terminate,
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Hardware watchdog device, e.g. `/dev/watchdog`. `None` disables kicking
    /// but keeps the heartbeat running.
    pub device: Option<PathBuf>,
    pub period_secs: u64,
    /// Un-acknowledged heartbeats tolerated before the loop counts as frozen.
    pub max_unanswered: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            device: None,
            period_secs: 12,
            max_unanswered: 5,
        }
    }
}

impl WatchdogConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Liveness bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Liveness of the event loop as seen by the watchdog thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopHealth {
    Alive,
    Frozen,
}

/// Counts heartbeats sent versus acknowledged.
///
/// Shared between the watchdog thread (which pings) and the event loop
/// (which pongs).
#[derive(Debug)]
pub struct HeartbeatMonitor {
    unanswered: AtomicU32,
    max_unanswered: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_unanswered: u32) -> Self {
        Self {
            unanswered: AtomicU32::new(0),
            max_unanswered: max_unanswered.max(1),
        }
    }

    /// Record one heartbeat sent and report the resulting health.
    pub fn ping(&self) -> LoopHealth {
        let count = self.unanswered.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.max_unanswered {
            LoopHealth::Frozen
        } else {
            LoopHealth::Alive
        }
    }

    /// Acknowledge one heartbeat.
    pub fn pong(&self) {
        let _ = self
            .unanswered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn unanswered(&self) -> u32 {
        self.unanswered.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> LoopHealth {
        if self.unanswered() >= self.max_unanswered {
            LoopHealth::Frozen
        } else {
            LoopHealth::Alive
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kicker thread
// ────────────────────────────────────────────────────────────────────────────

enum Command {
    KickNow,
    Stop,
}

/// Cloneable request channel into the watchdog thread.
#[derive(Clone)]
pub struct Kicker {
    commands: std_mpsc::Sender<Command>,
}

impl Kicker {
    /// Ask for an immediate kick. Returns `false` once the thread is gone.
    pub fn kick_now(&self) -> bool {
        self.commands.send(Command::KickNow).is_ok()
    }
}

pub type FreezeAction = Box<dyn Fn() + Send + 'static>;

/// Owner side of the running watchdog thread.
pub struct WatchdogHandle {
    kicker: Kicker,
    monitor: Arc<HeartbeatMonitor>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Start the thread with the default freeze action, [`std::process::abort`].
    pub fn spawn(config: &WatchdogConfig, wake: mpsc::UnboundedSender<Wake>) -> std::io::Result<Self> {
        Self::spawn_with_action(config, wake, Box::new(|| std::process::abort()))
    }

    pub fn spawn_with_action(
        config: &WatchdogConfig,
        wake: mpsc::UnboundedSender<Wake>,
        on_freeze: FreezeAction,
    ) -> std::io::Result<Self> {
        let device = match &config.device {
            Some(path) => Some(HardwareWatchdog::open(path)?),
            None => None,
        };
        let monitor = Arc::new(HeartbeatMonitor::new(config.max_unanswered));
        let (tx, rx) = std_mpsc::channel();
        let period = config.period();

        let thread_monitor = Arc::clone(&monitor);
        let thread = std::thread::Builder::new()
            .name("devstate-watchdog".to_string())
            .spawn(move || kicker_loop(device, period, rx, wake, thread_monitor, on_freeze))?;

        info!(period_secs = period.as_secs(), max_unanswered = config.max_unanswered, "watchdog started");
        Ok(Self {
            kicker: Kicker { commands: tx },
            monitor,
            thread: Some(thread),
        })
    }

    pub fn kicker(&self) -> Kicker {
        self.kicker.clone()
    }

    /// Acknowledge one heartbeat from the event loop.
    pub fn pong(&self) {
        self.monitor.pong();
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.kicker.commands.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct HardwareWatchdog {
    path: PathBuf,
    file: File,
}

impl HardwareWatchdog {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        info!(device = %path.display(), "hardware watchdog opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn kick(&mut self) {
        if let Err(e) = self.file.write_all(b"k").and_then(|_| self.file.flush()) {
            error!(device = %self.path.display(), error = %e, "watchdog kick failed");
        }
    }
}

fn kicker_loop(
    mut device: Option<HardwareWatchdog>,
    period: Duration,
    commands: std_mpsc::Receiver<Command>,
    wake: mpsc::UnboundedSender<Wake>,
    monitor: Arc<HeartbeatMonitor>,
    on_freeze: FreezeAction,
) {
    let mut deadline = Instant::now() + period;
    loop {
        // Explicit kicks never push the periodic heartbeat back.
        match commands.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Command::KickNow) => {
                trace!("explicit kick");
                if let Some(dev) = device.as_mut() {
                    dev.kick();
                }
                continue;
            }
            Ok(Command::Stop) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                debug!("watchdog thread stopping");
                return;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }
        deadline = Instant::now() + period;

        if let Some(dev) = device.as_mut() {
            dev.kick();
        }
        // Count before sending so a pong can never precede its ping.
        if monitor.ping() == LoopHealth::Frozen {
            error!(unanswered = monitor.unanswered(), "main loop frozen");
            on_freeze();
            return;
        }
        if wake.send(Wake::Heartbeat).is_err() {
            debug!("event loop gone, watchdog thread stopping");
            return;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus module
// ────────────────────────────────────────────────────────────────────────────

/// Kicks the hardware watchdog on request and tracks heartbeats.
pub struct HwwdModule {
    kicker: Option<Kicker>,
    heartbeats: u64,
}

impl HwwdModule {
    pub fn new(kicker: Option<Kicker>) -> Self {
        Self {
            kicker,
            heartbeats: 0,
        }
    }
}

impl Module for HwwdModule {
    fn name(&self) -> &str {
        "hwwd"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        vec![
            Binding::of(MessageKind::HwwdKick),
            Binding::of(MessageKind::Heartbeat),
        ]
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, _from: &Endpoint, msg: &Message) {
        match msg {
            Message::HwwdKick => match &self.kicker {
                Some(kicker) if kicker.kick_now() => trace!("kick requested"),
                Some(_) => warn!("kick requested but the watchdog thread is gone"),
                None => trace!("kick requested without a watchdog"),
            },
            Message::Heartbeat => {
                self.heartbeats += 1;
                trace!(count = self.heartbeats, "heartbeat");
            }
            _ => {}
        }
    }
}
