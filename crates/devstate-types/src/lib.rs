//! `devstate-types` – shared vocabulary of the device-state daemon.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! the fixed [`Message`] catalogue exchanged over the bus and the socket, the
//! [`DeviceState`] the daemon arbitrates, the [`Runlevel`] each state maps to,
//! and the workspace-wide [`DevStateError`].

pub mod message;

pub use message::{CloseReason, MalfReason, Message, MessageKind, HEADER_SIZE, MAX_LINE_SIZE};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-visible power state of the device.
///
/// Discriminants match the numeric values carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceState {
    NotSet = -1,
    Shutdown = 0,
    User = 2,
    Actdead = 5,
    Reboot = 6,
    Test = 7,
    Malf = 8,
    Boot = 9,
    Local = 10,
}

impl DeviceState {
    /// Decode a wire value. Unknown values yield `None`.
    pub fn from_raw(value: i32) -> Option<Self> {
        Some(match value {
            -1 => Self::NotSet,
            0 => Self::Shutdown,
            2 => Self::User,
            5 => Self::Actdead,
            6 => Self::Reboot,
            7 => Self::Test,
            8 => Self::Malf,
            9 => Self::Boot,
            10 => Self::Local,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Upper-case name used in logs and by the init-script side.
    pub fn name(self) -> &'static str {
        match self {
            Self::NotSet => "NOT_SET",
            Self::Shutdown => "SHUTDOWN",
            Self::User => "USER",
            Self::Actdead => "ACTDEAD",
            Self::Reboot => "REBOOT",
            Self::Test => "TEST",
            Self::Malf => "MALF",
            Self::Boot => "BOOT",
            Self::Local => "LOCAL",
        }
    }

    /// `true` once the process is committed to going down.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Reboot)
    }

    /// Whether the directed state graph has an edge `self → next`.
    ///
    /// * `NOT_SET` may enter any start state.
    /// * `USER` and `ACTDEAD` switch between each other.
    /// * Every non-terminal state may go to `SHUTDOWN`, `REBOOT` or `MALF`.
    /// * `SHUTDOWN` and `REBOOT` are final.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        if self == next || self.is_terminal() || next == Self::NotSet {
            return false;
        }
        match next {
            Self::Shutdown | Self::Reboot | Self::Malf => true,
            Self::Boot | Self::Test | Self::Local => self == Self::NotSet,
            Self::User => matches!(self, Self::NotSet | Self::Actdead),
            Self::Actdead => matches!(self, Self::NotSet | Self::User),
            Self::NotSet => false,
        }
    }

    /// The legacy init runlevel this state maps onto.
    pub fn runlevel(self) -> Runlevel {
        match self {
            Self::Shutdown => Runlevel::Shutdown,
            Self::User => Runlevel::User,
            Self::Test => Runlevel::Test,
            Self::Actdead => Runlevel::Actdead,
            Self::Reboot => Runlevel::Reboot,
            Self::NotSet | Self::Boot | Self::Local | Self::Malf => Runlevel::Malf,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Init-system runlevels the device states map onto 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Runlevel {
    Shutdown = 0,
    User = 2,
    Test = 3,
    Actdead = 5,
    Reboot = 6,
    Malf = 8,
}

impl Runlevel {
    pub fn from_raw(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Shutdown,
            2 => Self::User,
            3 => Self::Test,
            5 => Self::Actdead,
            6 => Self::Reboot,
            8 => Self::Malf,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for Runlevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Credentials of a socket peer, captured once at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    /// Placeholder used when the kernel refuses to report credentials.
    pub const UNKNOWN: PeerCredentials = PeerCredentials {
        pid: 0,
        uid: u32::MAX,
        gid: u32::MAX,
    };
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
pub enum DevStateError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type 0x{0:08x}")]
    UnknownType(u32),

    #[error("Module {module} failed to initialise: {details}")]
    ModuleInit { module: String, details: String },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
