//! Reboot loop detection.
//!
//! Every start rewrites a small startup-info file holding the time of the
//! start and how many starts in a row came quickly after each other:
//!
//! ```text
//! <unix seconds> <count>
//! ```
//!
//! A start less than `window_secs` after the previous one increments the
//! count; a slower one resets it to zero. Once the count exceeds
//! `max_reboots` the module asks the state machine to enter malf.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use devstate_middleware::{Binding, Context, Endpoint, Module};
use devstate_types::{DevStateError, MalfReason, Message};
use serde::Deserialize;
use tracing::{debug, error};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebootLoopConfig {
    pub startup_file: PathBuf,
    pub window_secs: u64,
    pub max_reboots: u32,
}

impl Default for RebootLoopConfig {
    fn default() -> Self {
        Self {
            startup_file: PathBuf::from("/var/lib/devstate/startup_info"),
            window_secs: 120,
            max_reboots: 5,
        }
    }
}

/// Contents of the startup-info file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupInfo {
    pub started_at: u64,
    pub count: u32,
}

impl StartupInfo {
    fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.split_whitespace();
        let started_at = fields.next()?.parse().ok()?;
        let count = fields.next()?.parse().ok()?;
        Some(Self { started_at, count })
    }
}

fn read_startup_info(path: &Path) -> Option<StartupInfo> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no startup info");
            return None;
        }
    };
    let info = StartupInfo::parse(&raw);
    if info.is_none() {
        debug!(path = %path.display(), "startup info unparsable");
    }
    info
}

/// Writes through a `.tmp` sibling and renames so a crash never leaves a
/// truncated file behind.
fn write_startup_info(path: &Path, info: StartupInfo) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = std::fs::File::create(&tmp)?;
    write!(file, "{} {}", info.started_at, info.count)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct RebootLoopModule {
    config: RebootLoopConfig,
    clock: Box<dyn Fn() -> u64>,
}

impl RebootLoopModule {
    pub fn new(config: RebootLoopConfig) -> Self {
        Self::with_clock(config, unix_now)
    }

    /// `clock` returns the wall time in unix seconds.
    pub fn with_clock(config: RebootLoopConfig, clock: impl Fn() -> u64 + 'static) -> Self {
        Self {
            config,
            clock: Box::new(clock),
        }
    }

    /// Records this start and reports whether it completes a reboot loop.
    fn record_start(&self) -> bool {
        let now = (self.clock)();
        let path = &self.config.startup_file;

        let mut count = 0;
        let mut in_loop = false;
        if let Some(last) = read_startup_info(path) {
            match now.checked_sub(last.started_at) {
                Some(elapsed) if elapsed < self.config.window_secs => {
                    count = last.count.saturating_add(1);
                    in_loop = count > self.config.max_reboots;
                    debug!(elapsed, count, "quick restart");
                }
                _ => debug!(window = self.config.window_secs, "slow restart; count reset"),
            }
        }

        if let Err(e) = write_startup_info(path, StartupInfo { started_at: now, count }) {
            debug!(path = %path.display(), error = %e, "startup info not written");
        }
        in_loop
    }
}

impl Module for RebootLoopModule {
    fn name(&self) -> &str {
        "rebootloop"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        Vec::new()
    }

    fn init(&mut self, ctx: &mut Context<'_>) -> Result<(), DevStateError> {
        if self.record_start() {
            error!(max = self.config.max_reboots, "reboot loop detected; entering malf");
            ctx.broadcast_internally(Message::EnterMalf {
                reason: MalfReason::Hardware,
                component: "unknown".to_string(),
                details: "too many reboots".to_string(),
            });
        }
        Ok(())
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, _from: &Endpoint, _msg: &Message) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstate_middleware::{Bus, RecordingOutbound};
    use devstate_types::MessageKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct MalfLog(Rc<RefCell<Vec<Message>>>);

    impl Module for MalfLog {
        fn name(&self) -> &str {
            "malf-log"
        }
        fn message_handlers(&self) -> Vec<Binding> {
            vec![Binding::of(MessageKind::EnterMalf)]
        }
        fn handle(&mut self, _ctx: &mut Context<'_>, _from: &Endpoint, msg: &Message) {
            self.0.borrow_mut().push(msg.clone());
        }
    }

    fn start_at(
        dir: &tempfile::TempDir,
        now: u64,
    ) -> Result<(Vec<Message>, String), Box<dyn std::error::Error>> {
        let config = RebootLoopConfig {
            startup_file: dir.path().join("startup_info"),
            ..RebootLoopConfig::default()
        };
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Bus::new(RecordingOutbound::new());
        bus.load_module(Box::new(MalfLog(Rc::clone(&log))), 0)?;
        bus.load_module(Box::new(RebootLoopModule::with_clock(config.clone(), move || now)), 0)?;
        bus.drain();

        let written = std::fs::read_to_string(&config.startup_file)?;
        let seen = log.borrow().clone();
        Ok((seen, written))
    }

    #[test]
    fn first_start_writes_a_zero_count() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let (malf, written) = start_at(&dir, 1_000)?;
        assert!(malf.is_empty());
        assert_eq!(written, "1000 0");
        Ok(())
    }

    #[test]
    fn quick_restarts_below_the_limit_only_count() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("startup_info"), "1000 4")?;

        let (malf, written) = start_at(&dir, 1_050)?;
        assert!(malf.is_empty());
        assert_eq!(written, "1050 5");
        Ok(())
    }

    #[test]
    fn too_many_quick_restarts_enter_malf() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("startup_info"), "1000 5")?;

        let (malf, written) = start_at(&dir, 1_119)?;
        assert_eq!(
            malf,
            vec![Message::EnterMalf {
                reason: MalfReason::Hardware,
                component: "unknown".to_string(),
                details: "too many reboots".to_string(),
            }]
        );
        assert_eq!(written, "1119 6");
        Ok(())
    }

    #[test]
    fn a_slow_restart_resets_the_count() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("startup_info"), "1000 9")?;

        let (malf, written) = start_at(&dir, 1_120)?;
        assert!(malf.is_empty());
        assert_eq!(written, "1120 0");
        Ok(())
    }

    #[test]
    fn clock_going_backwards_resets_the_count() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("startup_info"), "5000 9")?;

        let (malf, written) = start_at(&dir, 1_000)?;
        assert!(malf.is_empty());
        assert_eq!(written, "1000 0");
        Ok(())
    }

    #[test]
    fn garbage_file_is_replaced() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("startup_info"), "not a timestamp")?;

        let (malf, written) = start_at(&dir, 42)?;
        assert!(malf.is_empty());
        assert_eq!(written, "42 0");
        Ok(())
    }
}
