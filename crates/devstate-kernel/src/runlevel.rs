//! Runlevel collaborator: turns `ChangeRunlevel` and `Shutdown` messages into
//! system actions.
//!
//! Every action is a helper process spawned without waiting. The module polls
//! the helper from a short timer so the dispatch thread never blocks.
//!
//! | Request | First action | On failure |
//! |---|---|---|
//! | `ChangeRunlevel { n }` | `telinit n` | one retry after 2 s, then give up |
//! | `Shutdown { n }` | `telinit n` | one retry after 2 s, then escalate |
//!
//! Escalation syncs filesystems, remounts removable (`mmcblk`) storage
//! read-only, then runs `poweroff` (shutdown, malf) or `reboot`. That helper
//! gets one retry after 3 s; if it fails again the daemon is asked to exit
//! with failure.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use devstate_middleware::{Binding, Context, Endpoint, Module, TimerId};
use devstate_types::{Message, MessageKind, Runlevel};
use serde::Deserialize;
use tracing::{error, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunlevelConfig {
    pub telinit_path: PathBuf,
    pub poweroff_path: PathBuf,
    pub reboot_path: PathBuf,
    pub mount_path: PathBuf,
    pub mounts_file: PathBuf,
    pub poll_interval_ms: u64,
    pub telinit_retry_secs: u64,
    pub power_retry_secs: u64,
}

impl Default for RunlevelConfig {
    fn default() -> Self {
        Self {
            telinit_path: PathBuf::from("/sbin/telinit"),
            poweroff_path: PathBuf::from("/sbin/poweroff"),
            reboot_path: PathBuf::from("/sbin/reboot"),
            mount_path: PathBuf::from("/bin/mount"),
            mounts_file: PathBuf::from("/proc/mounts"),
            poll_interval_ms: 100,
            telinit_retry_secs: 2,
            power_retry_secs: 3,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// System boundary
// ────────────────────────────────────────────────────────────────────────────

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn new(program: impl AsRef<Path>, args: &[&str]) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A running helper.
pub trait HelperProcess {
    /// `Some(success)` once the helper has exited, `None` while it runs.
    fn try_wait(&mut self) -> io::Result<Option<bool>>;

    /// Stop the helper if it still runs and reap it.
    fn terminate(&mut self) -> io::Result<()>;
}

impl HelperProcess for Child {
    fn try_wait(&mut self) -> io::Result<Option<bool>> {
        Ok(Child::try_wait(self)?.map(|status| status.success()))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if Child::try_wait(self)?.is_none() {
            self.kill()?;
        }
        self.wait().map(|_| ())
    }
}

/// A mounted filesystem as listed in the mounts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
}

/// Side effects the runlevel module needs from the host.
pub trait SystemControl {
    fn spawn(&mut self, command: &HelperCommand) -> io::Result<Box<dyn HelperProcess>>;

    /// Flush filesystem buffers.
    fn sync_filesystems(&mut self);

    /// Mounted removable storage that should be remounted read-only before a
    /// forced power-off.
    fn removable_mounts(&mut self) -> Vec<MountEntry>;
}

/// [`SystemControl`] backed by the real host.
#[derive(Debug, Clone)]
pub struct HostSystem {
    mounts_file: PathBuf,
}

impl HostSystem {
    pub fn new(mounts_file: impl AsRef<Path>) -> Self {
        Self {
            mounts_file: mounts_file.as_ref().to_path_buf(),
        }
    }
}

impl SystemControl for HostSystem {
    fn spawn(&mut self, command: &HelperCommand) -> io::Result<Box<dyn HelperProcess>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(Box::new(child))
    }

    fn sync_filesystems(&mut self) {
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
    }

    fn removable_mounts(&mut self) -> Vec<MountEntry> {
        match std::fs::read_to_string(&self.mounts_file) {
            Ok(table) => parse_removable_mounts(&table),
            Err(e) => {
                warn!(file = %self.mounts_file.display(), error = %e, "cannot read mounts, leaving storage as is");
                Vec::new()
            }
        }
    }
}

/// Entries of a `/proc/mounts`-style table whose device is an MMC block device.
pub fn parse_removable_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter(|line| line.contains("mmcblk"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
            })
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Jobs
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `telinit <runlevel>`; `escalate` is set for shutdown requests.
    Telinit { escalate: bool },
    /// Remounting removable storage read-only, one mount at a time.
    Remount { index: usize },
    /// `poweroff` or `reboot`.
    Power,
}

struct Job {
    runlevel: Runlevel,
    phase: Phase,
    attempt: u8,
    mounts: Vec<MountEntry>,
    child: Option<Box<dyn HelperProcess>>,
    timer: Option<TimerId>,
}

pub struct RunlevelModule {
    config: RunlevelConfig,
    system: Box<dyn SystemControl>,
    job: Option<Job>,
    /// Helpers assumed successful while still running; reaped once they exit.
    orphans: Vec<Box<dyn HelperProcess>>,
}

impl RunlevelModule {
    pub fn new(config: RunlevelConfig, system: Box<dyn SystemControl>) -> Self {
        Self {
            config,
            system,
            job: None,
            orphans: Vec::new(),
        }
    }

    /// Runlevel module acting on the real host.
    pub fn host(config: RunlevelConfig) -> Self {
        let system = HostSystem::new(&config.mounts_file);
        Self::new(config, Box::new(system))
    }

    fn begin(&mut self, ctx: &mut Context<'_>, runlevel: Runlevel, escalate: bool) {
        if let Some(mut old) = self.job.take() {
            if let Some(timer) = old.timer {
                ctx.cancel_timer(timer);
            }
            if let Some(mut child) = old.child.take() {
                if let Err(e) = child.terminate() {
                    warn!(error = %e, "cannot stop superseded helper");
                }
            }
            warn!(old = %old.runlevel, new = %runlevel, "superseding unfinished runlevel request");
        }
        self.job = Some(Job {
            runlevel,
            phase: Phase::Telinit { escalate },
            attempt: 0,
            mounts: Vec::new(),
            child: None,
            timer: None,
        });
        self.run_current(ctx);
    }

    fn command_for(&self, job: &Job) -> HelperCommand {
        match job.phase {
            Phase::Telinit { .. } => {
                let level = job.runlevel.as_raw().to_string();
                HelperCommand::new(&self.config.telinit_path, &[&level])
            }
            Phase::Remount { index } => {
                let entry = &job.mounts[index];
                HelperCommand::new(
                    &self.config.mount_path,
                    &[&entry.device, &entry.mount_point, "-o", "remount,ro"],
                )
            }
            Phase::Power => match job.runlevel {
                Runlevel::Reboot => HelperCommand::new(&self.config.reboot_path, &[]),
                _ => HelperCommand::new(&self.config.poweroff_path, &[]),
            },
        }
    }

    /// Spawn the helper of the current phase and start polling it.
    fn run_current(&mut self, ctx: &mut Context<'_>) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        let command = self.command_for(job);
        info!(%command, "issuing");

        match self.system.spawn(&command) {
            Ok(child) => {
                let poll = Duration::from_millis(self.config.poll_interval_ms);
                match ctx.start_timer(poll) {
                    Ok(id) => {
                        if let Some(job) = self.job.as_mut() {
                            job.child = Some(child);
                            job.timer = Some(id);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, %command, "cannot poll helper, assuming success");
                        self.orphans.push(child);
                        self.job = None;
                    }
                }
            }
            Err(e) => {
                warn!(%command, error = %e, "spawn failed");
                self.finished(ctx, false);
            }
        }
    }

    fn poll(&mut self, ctx: &mut Context<'_>) {
        let status = match self.job.as_mut().and_then(|j| j.child.as_mut()) {
            Some(child) => child.try_wait(),
            None => return,
        };
        match status {
            Ok(Some(success)) => {
                if let Some(job) = self.job.as_mut() {
                    job.child = None;
                }
                self.finished(ctx, success);
            }
            Ok(None) => {
                let poll = Duration::from_millis(self.config.poll_interval_ms);
                match ctx.start_timer(poll) {
                    Ok(id) => {
                        if let Some(job) = self.job.as_mut() {
                            job.timer = Some(id);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "cannot keep polling helper, assuming success");
                        if let Some(child) = self.job.take().and_then(|job| job.child) {
                            self.orphans.push(child);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot query helper status");
                if let Some(job) = self.job.as_mut() {
                    job.child = None;
                }
                self.finished(ctx, false);
            }
        }
    }

    /// Advance the job after the current helper ended.
    fn finished(&mut self, ctx: &mut Context<'_>, success: bool) {
        let Some(mut job) = self.job.take() else {
            return;
        };

        match (job.phase, success) {
            (Phase::Telinit { .. }, true) => {
                info!(runlevel = %job.runlevel, "runlevel change issued");
            }
            (Phase::Power, true) => {
                info!(runlevel = %job.runlevel, "power-off/reboot issued");
            }
            (Phase::Remount { index }, ok) => {
                if ok {
                    info!(mount = %job.mounts[index].mount_point, "remounted read-only");
                } else {
                    warn!(mount = %job.mounts[index].mount_point, "read-only remount failed");
                }
                job.phase = if index + 1 < job.mounts.len() {
                    Phase::Remount { index: index + 1 }
                } else {
                    Phase::Power
                };
                job.attempt = 0;
                self.job = Some(job);
                self.run_current(ctx);
            }
            (Phase::Telinit { .. }, false) | (Phase::Power, false) if job.attempt == 0 => {
                let delay = match job.phase {
                    Phase::Power => Duration::from_secs(self.config.power_retry_secs),
                    _ => Duration::from_secs(self.config.telinit_retry_secs),
                };
                warn!(runlevel = %job.runlevel, retry_in_secs = delay.as_secs(), "helper failed, retrying");
                job.attempt = 1;
                match ctx.start_timer(delay) {
                    Ok(id) => {
                        job.timer = Some(id);
                        self.job = Some(job);
                    }
                    Err(e) => {
                        warn!(error = %e, "no timer for the retry, retrying now");
                        self.job = Some(job);
                        self.run_current(ctx);
                    }
                }
            }
            (Phase::Telinit { escalate: true }, false) => {
                error!(runlevel = %job.runlevel, "runlevel change failed, forcing shutdown");
                self.system.sync_filesystems();
                job.mounts = self.system.removable_mounts();
                job.phase = if job.mounts.is_empty() {
                    Phase::Power
                } else {
                    Phase::Remount { index: 0 }
                };
                job.attempt = 0;
                self.job = Some(job);
                self.run_current(ctx);
            }
            (Phase::Telinit { escalate: false }, false) => {
                error!(runlevel = %job.runlevel, "runlevel change failed twice, giving up");
            }
            (Phase::Power, false) => {
                error!(runlevel = %job.runlevel, "power-off/reboot failed twice, exiting");
                ctx.request_exit(1);
            }
        }
    }

    fn reap_orphans(&mut self) {
        self.orphans.retain_mut(|child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(error = %e, "cannot query orphaned helper, forgetting it");
                false
            }
        });
    }

    fn on_timer(&mut self, ctx: &mut Context<'_>, raw: u64) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        if !job.timer.is_some_and(|t| t.matches(raw)) {
            return;
        }
        job.timer = None;
        if job.child.is_some() {
            self.poll(ctx);
        } else {
            self.run_current(ctx);
        }
    }
}

impl Module for RunlevelModule {
    fn name(&self) -> &str {
        "runlevel"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        vec![
            Binding::of(MessageKind::ChangeRunlevel),
            Binding::of(MessageKind::Shutdown),
            Binding::of(MessageKind::TimerExpired),
        ]
    }

    fn handle(&mut self, ctx: &mut Context<'_>, _from: &Endpoint, msg: &Message) {
        self.reap_orphans();
        match msg {
            Message::ChangeRunlevel { runlevel } => {
                info!(runlevel = %runlevel, "runlevel change requested");
                self.begin(ctx, *runlevel, false);
            }
            Message::Shutdown { runlevel } => {
                if !matches!(runlevel, Runlevel::Shutdown | Runlevel::Reboot | Runlevel::Malf) {
                    warn!(runlevel = %runlevel, "shutdown to a non-terminal runlevel ignored");
                    return;
                }
                info!(runlevel = %runlevel, "shutdown requested");
                self.begin(ctx, *runlevel, true);
            }
            Message::TimerExpired { timer } => self.on_timer(ctx, *timer),
            _ => {}
        }
    }
}
