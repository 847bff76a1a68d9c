//! Battery charge level source for the actdead → user guard.
//!
//! The state machine never reads sensors on its own; it asks a
//! [`BatteryGauge`] when it needs the current charge. A gauge that cannot
//! answer is treated by the caller as "level sufficient".

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default location of the charge-percentage value published by the battery
/// tracker.
pub const DEFAULT_BATTERY_PATH: &str = "/run/state/namespaces/Battery/ChargePercentage";

#[derive(Error, Debug)]
pub enum BatteryError {
    #[error("battery gauge unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("battery gauge value {0:?} is not a percentage")]
    Parse(String),

    #[error("no battery gauge configured")]
    Unavailable,
}

pub trait BatteryGauge {
    /// Current charge in percent, `0..=100`.
    fn charge_percentage(&self) -> Result<u8, BatteryError>;
}

/// Reads a decimal percentage from a file, e.g. a sysfs/state node.
#[derive(Debug, Clone)]
pub struct FileBatteryGauge {
    path: PathBuf,
}

impl FileBatteryGauge {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileBatteryGauge {
    fn default() -> Self {
        Self::new(DEFAULT_BATTERY_PATH)
    }
}

impl BatteryGauge for FileBatteryGauge {
    fn charge_percentage(&self) -> Result<u8, BatteryError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let trimmed = raw.trim();
        match trimmed.parse::<u8>() {
            Ok(level) if level <= 100 => Ok(level),
            _ => Err(BatteryError::Parse(trimmed.to_string())),
        }
    }
}

/// A gauge that never answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBatteryGauge;

impl BatteryGauge for NoBatteryGauge {
    fn charge_percentage(&self) -> Result<u8, BatteryError> {
        Err(BatteryError::Unavailable)
    }
}
