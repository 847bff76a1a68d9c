//! [`StateModule`] – the device state machine.
//!
//! The module keeps a set of input flags ([`StateFlags`]) fed by messages
//! from collaborators and clients, and after every relevant change recomputes
//! the device state with [`select_state`]. A change of state is announced
//! with `StateChangeInd` (preceded by `SaveDataInd` when going down) and the
//! actual runlevel switch is handed to the runlevel module after a delay:
//!
//! | Transition | Delay before handing off |
//! |---|---|
//! | not-set → any | none, no runlevel switch |
//! | → shutdown / reboot | shutdown grace (2 s), then `Shutdown` |
//! | user ⇄ actdead | debounce: 2 s if the departing state acknowledged its switch, 45 s otherwise; an acknowledgement ends it early |
//! | → malf | 120 s, then `Shutdown`, unless R&D mode is on |
//!
//! At most one such delayed transition is pending at any time. Starting a new
//! one cancels the old one. An ongoing emergency call suspends it and freezes
//! the state.
//!
//! Every handoff is preceded by an internal `HwwdKick` so the hardware
//! watchdog has a full period ahead of the runlevel switch.

use std::path::PathBuf;
use std::time::Duration;

use devstate_middleware::{Binding, Context, Endpoint, Module, TimerId};
use devstate_types::{DevStateError, DeviceState, Message, MessageKind};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::battery::{BatteryGauge, DEFAULT_BATTERY_PATH, FileBatteryGauge};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Boot mode as reported by the bootloader (`BOOTSTATE`).
    pub boot_mode: Option<String>,
    /// R&D mode keeps a malfunctioning device running for inspection.
    pub rd_mode: bool,
    pub shutdown_grace_secs: u64,
    pub charger_disconnect_secs: u64,
    pub thermal_shutdown_secs: u64,
    pub malf_shutdown_secs: u64,
    pub short_debounce_secs: u64,
    pub long_debounce_secs: u64,
    /// Battery level at or below which actdead → user is refused.
    pub min_battery_percent: u8,
    pub battery_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            boot_mode: None,
            rd_mode: false,
            shutdown_grace_secs: 2,
            charger_disconnect_secs: 3,
            thermal_shutdown_secs: 8,
            malf_shutdown_secs: 120,
            short_debounce_secs: 2,
            long_debounce_secs: 45,
            min_battery_percent: 3,
            battery_path: PathBuf::from(DEFAULT_BATTERY_PATH),
        }
    }
}

/// How the device was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    User,
    ActDead,
    Shutdown,
    Boot,
    Test,
    Local,
    Malf,
}

impl BootMode {
    /// Unknown or missing modes map to [`BootMode::Malf`].
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("USER") => Self::User,
            Some("ACT_DEAD") => Self::ActDead,
            Some("SHUTDOWN") => Self::Shutdown,
            Some("BOOT") => Self::Boot,
            Some("TEST") => Self::Test,
            Some("LOCAL") => Self::Local,
            _ => Self::Malf,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and selection
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargerState {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// Every input the state selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub emergency_call: bool,
    pub battery_empty: bool,
    pub overheated: bool,
    pub malf: bool,
    pub test: bool,
    pub local: bool,
    pub actdead_requested: bool,
    pub shutdown_requested: bool,
    pub reboot_requested: bool,
    pub alarm_set: bool,
    pub charger: ChargerState,
    pub usb_mounted_to_pc: bool,
    /// Init scripts finished switching into user.
    pub user_switch_done: bool,
    /// Init scripts finished switching into actdead.
    pub actdead_switch_done: bool,
}

impl StateFlags {
    pub fn from_boot_mode(mode: BootMode) -> Self {
        let mut flags = Self::default();
        match mode {
            BootMode::User => {}
            // Charger still unknown, so the request resolves to actdead.
            BootMode::ActDead => flags.shutdown_requested = true,
            BootMode::Shutdown => {
                flags.shutdown_requested = true;
                flags.charger = ChargerState::Disconnected;
            }
            BootMode::Boot => flags.reboot_requested = true,
            BootMode::Test => flags.test = true,
            BootMode::Local => flags.local = true,
            BootMode::Malf => flags.malf = true,
        }
        flags
    }
}

/// Pick the state the device should be in, in strict precedence order.
pub fn select_state(flags: &StateFlags, current: DeviceState) -> DeviceState {
    if flags.emergency_call {
        return current;
    }
    if flags.battery_empty || flags.overheated {
        return DeviceState::Shutdown;
    }
    if flags.malf {
        return DeviceState::Malf;
    }
    if flags.test {
        return DeviceState::Test;
    }
    if flags.local {
        return DeviceState::Local;
    }
    if flags.actdead_requested {
        return DeviceState::Actdead;
    }
    if flags.shutdown_requested || flags.reboot_requested {
        if flags.shutdown_requested && flags.charger == ChargerState::Disconnected && !flags.alarm_set {
            return DeviceState::Shutdown;
        }
        if flags.reboot_requested {
            return DeviceState::Reboot;
        }
        return DeviceState::Actdead;
    }
    DeviceState::User
}

// ────────────────────────────────────────────────────────────────────────────
// Delayed transitions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayedAction {
    /// Hand the current state's runlevel to the shutdown path.
    Shutdown,
    /// Switch runlevel to `to` once `departing` is done or the debounce ends.
    SwitchRunlevel { to: DeviceState, departing: DeviceState },
}

#[derive(Debug, Clone, Copy)]
struct Delayed {
    timer: TimerId,
    action: DelayedAction,
    delay: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Module
// ────────────────────────────────────────────────────────────────────────────

pub struct StateModule {
    config: StateConfig,
    gauge: Box<dyn BatteryGauge>,
    flags: StateFlags,
    current: DeviceState,
    delayed: Option<Delayed>,
    /// Delayed transition put on hold by an emergency call.
    suspended: Option<(DelayedAction, Duration)>,
    charger_timer: Option<TimerId>,
    overheat_timer: Option<TimerId>,
    /// Request flags a power-up cleared, restored if the power-up is refused.
    powerup_cleared: Option<(bool, bool)>,
}

impl StateModule {
    pub fn new(config: StateConfig, gauge: Box<dyn BatteryGauge>) -> Self {
        Self {
            config,
            gauge,
            flags: StateFlags::default(),
            current: DeviceState::NotSet,
            delayed: None,
            suspended: None,
            charger_timer: None,
            overheat_timer: None,
            powerup_cleared: None,
        }
    }

    /// State module reading the battery level from the configured file.
    pub fn from_config(config: StateConfig) -> Self {
        let gauge = FileBatteryGauge::new(&config.battery_path);
        Self::new(config, Box::new(gauge))
    }

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    // -----------------------------------------------------------------------
    // Recompute
    // -----------------------------------------------------------------------

    fn recompute(&mut self, ctx: &mut Context<'_>) {
        let next = select_state(&self.flags, self.current);
        if next == self.current {
            return;
        }
        if !self.current.can_transition_to(next) {
            warn!(from = %self.current, to = %next, "transition not allowed, ignored");
            return;
        }
        info!(from = %self.current, to = %next, "state change request");

        match next {
            DeviceState::Shutdown | DeviceState::Reboot => {
                self.enter(ctx, next);
                self.arm_delayed(ctx, DelayedAction::Shutdown, Self::secs(self.config.shutdown_grace_secs));
            }
            DeviceState::User | DeviceState::Actdead if self.current != DeviceState::NotSet => {
                if next == DeviceState::User {
                    if let Err(reason) = self.powerup_allowed() {
                        self.refuse_powerup(ctx, reason);
                        return;
                    }
                }
                let departing = self.current;
                let acknowledged = match departing {
                    DeviceState::User => self.flags.user_switch_done,
                    DeviceState::Actdead => self.flags.actdead_switch_done,
                    _ => false,
                };
                let delay = if acknowledged {
                    Self::secs(self.config.short_debounce_secs)
                } else {
                    Self::secs(self.config.long_debounce_secs)
                };
                self.enter(ctx, next);
                self.arm_delayed(ctx, DelayedAction::SwitchRunlevel { to: next, departing }, delay);
            }
            DeviceState::Malf => {
                self.enter(ctx, next);
                if self.config.rd_mode {
                    warn!("R&D mode enabled, not shutting down");
                } else {
                    self.arm_delayed(ctx, DelayedAction::Shutdown, Self::secs(self.config.malf_shutdown_secs));
                }
            }
            _ => self.enter(ctx, next),
        }
    }

    /// Announce and record `state`.
    fn enter(&mut self, ctx: &mut Context<'_>, state: DeviceState) {
        if matches!(state, DeviceState::Shutdown | DeviceState::Actdead | DeviceState::Reboot) {
            debug!("sending SaveDataInd");
            ctx.broadcast(Message::SaveDataInd);
        }
        ctx.broadcast(Message::StateChangeInd { state });
        match state {
            DeviceState::User => self.flags.user_switch_done = false,
            DeviceState::Actdead => self.flags.actdead_switch_done = false,
            _ => {}
        }
        info!(state = %state, "new state");
        self.current = state;
    }

    fn powerup_allowed(&self) -> Result<(), String> {
        if self.flags.usb_mounted_to_pc {
            return Err("mass storage is mounted to a host".to_string());
        }
        match self.gauge.charge_percentage() {
            Ok(level) if level <= self.config.min_battery_percent => Err(format!(
                "battery level {level}% not above {}%",
                self.config.min_battery_percent
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "battery level unknown, assuming sufficient");
                Ok(())
            }
        }
    }

    fn refuse_powerup(&mut self, ctx: &mut Context<'_>, reason: String) {
        warn!(%reason, "power-up refused");
        match self.powerup_cleared.take() {
            Some((shutdown, actdead)) => {
                self.flags.shutdown_requested = shutdown;
                self.flags.actdead_requested = actdead;
            }
            // Nothing to reinstate; hold actdead until asked again.
            None => self.flags.actdead_requested = true,
        }
        ctx.broadcast(Message::StateReqDeniedInd {
            state: DeviceState::User,
            reason,
        });
    }

    // -----------------------------------------------------------------------
    // Delayed transitions
    // -----------------------------------------------------------------------

    fn arm_delayed(&mut self, ctx: &mut Context<'_>, action: DelayedAction, delay: Duration) {
        self.cancel_delayed(ctx);
        self.suspended = None;
        match ctx.start_timer(delay) {
            Ok(timer) => {
                info!(?action, delay_secs = delay.as_secs(), "delayed transition armed");
                self.delayed = Some(Delayed { timer, action, delay });
            }
            Err(e) => {
                error!(error = %e, ?action, "cannot create timer, acting now");
                self.run_delayed(ctx, action);
            }
        }
    }

    fn cancel_delayed(&mut self, ctx: &mut Context<'_>) -> Option<Delayed> {
        let delayed = self.delayed.take()?;
        ctx.cancel_timer(delayed.timer);
        info!(action = ?delayed.action, "delayed transition stopped");
        Some(delayed)
    }

    fn run_delayed(&mut self, ctx: &mut Context<'_>, action: DelayedAction) {
        ctx.broadcast_internally(Message::HwwdKick);
        match action {
            DelayedAction::Shutdown => {
                let runlevel = self.current.runlevel();
                info!(%runlevel, state = %self.current, "handing off to shutdown");
                ctx.broadcast_internally(Message::Shutdown { runlevel });
            }
            DelayedAction::SwitchRunlevel { to, .. } => {
                let runlevel = to.runlevel();
                info!(%runlevel, state = %to, "changing runlevel");
                ctx.broadcast_internally(Message::ChangeRunlevel { runlevel });
            }
        }
    }

    fn still_relevant(&self, action: DelayedAction) -> bool {
        match action {
            DelayedAction::Shutdown => matches!(
                self.current,
                DeviceState::Shutdown | DeviceState::Reboot | DeviceState::Malf
            ),
            DelayedAction::SwitchRunlevel { to, .. } => self.current == to,
        }
    }

    // -----------------------------------------------------------------------
    // Input timers
    // -----------------------------------------------------------------------

    fn on_timer(&mut self, ctx: &mut Context<'_>, raw: u64) {
        if let Some(delayed) = self.delayed.filter(|d| d.timer.matches(raw)) {
            self.delayed = None;
            self.run_delayed(ctx, delayed.action);
        } else if self.charger_timer.is_some_and(|t| t.matches(raw)) {
            self.charger_timer = None;
            self.charger_disconnected(ctx);
        } else if self.overheat_timer.is_some_and(|t| t.matches(raw)) {
            self.overheat_timer = None;
            self.overheated(ctx);
        }
    }

    fn charger_disconnected(&mut self, ctx: &mut Context<'_>) {
        info!("charger disconnect confirmed");
        self.flags.charger = ChargerState::Disconnected;
        self.recompute(ctx);
    }

    fn overheated(&mut self, ctx: &mut Context<'_>) {
        error!("thermal shutdown");
        self.flags.overheated = true;
        self.recompute(ctx);
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn set_charger(&mut self, ctx: &mut Context<'_>, connected: bool) {
        debug!(connected, "charger state received");
        let new = if connected {
            ChargerState::Connected
        } else {
            ChargerState::Disconnected
        };

        if let Some(timer) = self.charger_timer.take() {
            ctx.cancel_timer(timer);
            debug!("charger disconnect timer stopped");
            // The last we heard, the charger had just been disconnected.
            self.flags.charger = ChargerState::Disconnected;
        }

        if self.current == DeviceState::Actdead
            && new == ChargerState::Disconnected
            && self.flags.charger != ChargerState::Unknown
        {
            match ctx.start_timer(Self::secs(self.config.charger_disconnect_secs)) {
                Ok(timer) => {
                    debug!(secs = self.config.charger_disconnect_secs, "charger disconnect grace started");
                    self.charger_timer = Some(timer);
                }
                Err(e) => {
                    error!(error = %e, "cannot create timer, disconnecting now");
                    self.charger_disconnected(ctx);
                }
            }
        } else {
            self.flags.charger = new;
            self.recompute(ctx);
        }
    }

    fn set_thermal(&mut self, ctx: &mut Context<'_>, overheated: bool) {
        warn!(overheated, "thermal state received");
        if overheated {
            if self.overheat_timer.is_some() {
                return;
            }
            ctx.broadcast(Message::ThermalShutdownInd);
            match ctx.start_timer(Self::secs(self.config.thermal_shutdown_secs)) {
                Ok(timer) => {
                    error!(secs = self.config.thermal_shutdown_secs, "thermal shutdown pending");
                    self.overheat_timer = Some(timer);
                }
                Err(e) => {
                    error!(error = %e, "cannot create timer, overheating now");
                    self.overheated(ctx);
                }
            }
        } else {
            if let Some(timer) = self.overheat_timer.take() {
                ctx.cancel_timer(timer);
                warn!("thermal shutdown timer stopped");
            }
            self.flags.overheated = false;
            self.recompute(ctx);
        }
    }

    fn set_emergency_call(&mut self, ctx: &mut Context<'_>, ongoing: bool) {
        warn!(ongoing, "emergency call state received");
        self.flags.emergency_call = ongoing;
        if ongoing {
            if let Some(delayed) = self.cancel_delayed(ctx) {
                self.suspended = Some((delayed.action, delayed.delay));
            }
            return;
        }

        self.recompute(ctx);
        if self.delayed.is_none() {
            if let Some((action, delay)) = self.suspended.take() {
                if self.still_relevant(action) {
                    info!(?action, "resuming delayed transition after emergency call");
                    self.arm_delayed(ctx, action, delay);
                }
            }
        }
    }

    fn powerup(&mut self, ctx: &mut Context<'_>) {
        info!("power-up request received");
        self.powerup_cleared = Some((self.flags.shutdown_requested, self.flags.actdead_requested));
        self.flags.shutdown_requested = false;
        self.flags.actdead_requested = false;
        self.recompute(ctx);
        self.powerup_cleared = None;
    }

    fn telinit(&mut self, ctx: &mut Context<'_>, target: &str) {
        info!(%target, "telinit request received");
        match target {
            "SHUTDOWN" => {
                self.flags.shutdown_requested = true;
                self.recompute(ctx);
            }
            "REBOOT" => {
                self.flags.reboot_requested = true;
                self.recompute(ctx);
            }
            "USER" => self.powerup(ctx),
            "ACTDEAD" => {
                self.flags.actdead_requested = true;
                self.recompute(ctx);
            }
            other => warn!(target = %other, "unknown telinit target"),
        }
    }

    fn switch_done(&mut self, ctx: &mut Context<'_>, state: DeviceState) {
        debug!(%state, "runlevel switch done");
        match state {
            DeviceState::User => self.flags.user_switch_done = true,
            DeviceState::Actdead => self.flags.actdead_switch_done = true,
            _ => return,
        }
        let pending = self.delayed.filter(|d| {
            matches!(d.action, DelayedAction::SwitchRunlevel { departing, .. } if departing == state)
        });
        if let Some(delayed) = pending {
            self.cancel_delayed(ctx);
            self.run_delayed(ctx, delayed.action);
        }
    }
}

impl Module for StateModule {
    fn name(&self) -> &str {
        "state"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        [
            MessageKind::StateQuery,
            MessageKind::ShutdownReq,
            MessageKind::PowerupReq,
            MessageKind::RebootReq,
            MessageKind::SetAlarmState,
            MessageKind::SetChargerState,
            MessageKind::SetThermalState,
            MessageKind::SetEmergencyCallState,
            MessageKind::SetBatteryState,
            MessageKind::SetUsbState,
            MessageKind::Telinit,
            MessageKind::RunlevelSwitchDone,
            MessageKind::EnterMalf,
            MessageKind::TimerExpired,
        ]
        .into_iter()
        .map(Binding::of)
        .collect()
    }

    fn init(&mut self, ctx: &mut Context<'_>) -> Result<(), DevStateError> {
        let mode = BootMode::parse(self.config.boot_mode.as_deref());
        match &self.config.boot_mode {
            Some(raw) => info!(boot_mode = %raw, ?mode, "boot mode"),
            None => warn!("no boot mode given, assuming malfunction"),
        }
        self.flags = StateFlags::from_boot_mode(mode);
        self.recompute(ctx);
        info!(state = %self.current, "startup state");
        Ok(())
    }

    fn fini(&mut self, ctx: &mut Context<'_>) {
        self.cancel_delayed(ctx);
        debug!("state module unloaded");
    }

    fn handle(&mut self, ctx: &mut Context<'_>, from: &Endpoint, msg: &Message) {
        match msg {
            Message::StateQuery => {
                debug!(state = %self.current, %from, "state query");
                ctx.send(from, Message::StateChangeInd { state: self.current });
            }
            Message::ShutdownReq => {
                info!(%from, "shutdown request received");
                self.flags.shutdown_requested = true;
                self.recompute(ctx);
            }
            Message::PowerupReq => self.powerup(ctx),
            Message::RebootReq => {
                info!(%from, "reboot request received");
                self.flags.reboot_requested = true;
                self.recompute(ctx);
            }
            Message::SetAlarmState { alarm_set } => {
                debug!(alarm_set, "alarm state received");
                self.flags.alarm_set = *alarm_set;
                self.recompute(ctx);
            }
            Message::SetChargerState { connected } => self.set_charger(ctx, *connected),
            Message::SetThermalState { overheated } => self.set_thermal(ctx, *overheated),
            Message::SetEmergencyCallState { ongoing } => self.set_emergency_call(ctx, *ongoing),
            Message::SetBatteryState { empty } => {
                warn!(empty, "battery state received");
                self.flags.battery_empty = *empty;
                self.recompute(ctx);
            }
            Message::SetUsbState { mounted_to_pc } => {
                debug!(mounted_to_pc, "usb state received");
                self.flags.usb_mounted_to_pc = *mounted_to_pc;
            }
            Message::Telinit { target } => self.telinit(ctx, target),
            Message::RunlevelSwitchDone { state } => self.switch_done(ctx, *state),
            Message::EnterMalf {
                reason,
                component,
                details,
            } => {
                error!(?reason, %component, %details, "malfunction reported");
                self.flags.malf = true;
                self.recompute(ctx);
            }
            Message::TimerExpired { timer } => self.on_timer(ctx, *timer),
            _ => {}
        }
    }
}
