//! `devstate-kernel` – Device lifecycle modules
//!
//! The modules the daemon loads on top of the message bus. None of them
//! touch sockets; everything they know arrives as a message and everything
//! they do leaves as one, a timer, or a helper process.
//!
//! # Modules
//!
//! - [`state_machine`] – [`StateModule`][state_machine::StateModule]:
//!   selects the device state from its inputs in strict precedence order,
//!   announces changes and hands the runlevel switch over after a debounce.
//! - [`runlevel`] – [`RunlevelModule`][runlevel::RunlevelModule]:
//!   performs `ChangeRunlevel` and `Shutdown` by running the init helpers,
//!   retrying once and escalating to a forced power-off.
//! - [`watchdog`] – [`WatchdogHandle`][watchdog::WatchdogHandle] and
//!   [`HwwdModule`][watchdog::HwwdModule]: a kicker thread for the hardware
//!   watchdog that also checks the event loop is still answering heartbeats.
//! - [`rebootloop`] – [`RebootLoopModule`][rebootloop::RebootLoopModule]:
//!   counts quick successive starts and enters malf on a reboot loop.
//! - [`version`] – [`VersionModule`][version::VersionModule]: answers
//!   version queries.
//! - [`battery`] – [`BatteryGauge`][battery::BatteryGauge]: the charge level
//!   source consulted before leaving actdead.

pub mod battery;
pub mod rebootloop;
pub mod runlevel;
pub mod state_machine;
pub mod version;
pub mod watchdog;

pub use battery::{BatteryError, BatteryGauge, FileBatteryGauge, NoBatteryGauge};
pub use rebootloop::{RebootLoopConfig, RebootLoopModule};
pub use runlevel::{HostSystem, RunlevelConfig, RunlevelModule, SystemControl};
pub use state_machine::{BootMode, ChargerState, StateConfig, StateFlags, StateModule, select_state};
pub use version::VersionModule;
pub use watchdog::{HwwdModule, Kicker, LoopHealth, Wake, WatchdogConfig, WatchdogHandle};
