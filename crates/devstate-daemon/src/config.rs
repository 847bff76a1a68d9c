//! Daemon configuration – reads `/etc/devstate/devstated.toml`.
//!
//! Every field has a default, so a missing file or a missing section is not
//! an error. Environment overrides are applied on top of the file.

use std::fs;
use std::path::{Path, PathBuf};

use devstate_kernel::{RebootLoopConfig, RunlevelConfig, StateConfig, WatchdogConfig};
use devstate_middleware::DEFAULT_SOCKET_PATH;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/devstate/devstated.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Modules to load, in order. The first one is mandatory.
    pub modules: Vec<String>,
    /// Initial syslog-style verbosity (3..7).
    pub verbosity: Option<u32>,
    pub state: StateConfig,
    pub runlevel: RunlevelConfig,
    pub watchdog: WatchdogConfig,
    pub rebootloop: RebootLoopConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            modules: ["state", "rebootloop", "runlevel", "hwwd", "version"]
                .into_iter()
                .map(String::from)
                .collect(),
            verbosity: None,
            state: StateConfig::default(),
            runlevel: RunlevelConfig::default(),
            watchdog: WatchdogConfig::default(),
            rebootloop: RebootLoopConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Put `name` first in the module list, dropping any later duplicate.
    pub fn set_startup_module(&mut self, name: &str) {
        self.modules.retain(|m| m != name);
        self.modules.insert(0, name.to_string());
    }
}

/// Load the config from `path`. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply environment overrides to `cfg`, reading variables via `lookup`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DEVSTATE_SOCKFILE` | `socket_path` |
/// | `BOOTSTATE` | `state.boot_mode` |
/// | `DEVSTATE_WATCHDOG_DEVICE` | `watchdog.device` (empty disables) |
/// | `DEVSTATE_RD_MODE` | `state.rd_mode` |
/// | `DEVSTATE_REBOOTLOOP_FILE` | `rebootloop.startup_file` |
/// | `DEVSTATE_REBOOTLOOP_TIME` | `rebootloop.window_secs` |
pub fn apply_env_overrides(cfg: &mut DaemonConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("DEVSTATE_SOCKFILE") {
        cfg.socket_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("BOOTSTATE") {
        cfg.state.boot_mode = Some(v);
    }
    if let Some(v) = lookup("DEVSTATE_WATCHDOG_DEVICE") {
        cfg.watchdog.device = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
    }
    if let Some(v) = lookup("DEVSTATE_RD_MODE") {
        match parse_flag(&v) {
            Some(on) => cfg.state.rd_mode = on,
            None => warn!(value = %v, "ignoring unrecognised DEVSTATE_RD_MODE"),
        }
    }
    if let Some(v) = lookup("DEVSTATE_REBOOTLOOP_FILE") {
        cfg.rebootloop.startup_file = PathBuf::from(v);
    }
    if let Some(v) = lookup("DEVSTATE_REBOOTLOOP_TIME") {
        match v.trim().parse() {
            Ok(secs) => cfg.rebootloop.window_secs = secs,
            Err(_) => warn!(value = %v, "ignoring non-numeric DEVSTATE_REBOOTLOOP_TIME"),
        }
    }
}

/// Apply overrides from the process environment.
pub fn apply_process_env(cfg: &mut DaemonConfig) {
    apply_env_overrides(cfg, |key| std::env::var(key).ok());
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_gives_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = load_from(&dir.path().join("devstated.toml"))?;
        assert_eq!(cfg.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(cfg.modules, vec!["state", "rebootloop", "runlevel", "hwwd", "version"]);
        assert_eq!(cfg.state.shutdown_grace_secs, 2);
        assert_eq!(cfg.rebootloop.window_secs, 120);
        assert_eq!(cfg.rebootloop.max_reboots, 5);
        assert_eq!(cfg.watchdog.max_unanswered, 5);
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("devstated.toml");
        fs::write(
            &path,
            r#"
socket_path = "/run/devstate.sock"
modules = ["state", "version"]

[state]
long_debounce_secs = 30
rd_mode = true

[watchdog]
device = "/dev/watchdog"
"#,
        )?;

        let cfg = load_from(&path)?;
        assert_eq!(cfg.socket_path, PathBuf::from("/run/devstate.sock"));
        assert_eq!(cfg.modules, vec!["state", "version"]);
        assert_eq!(cfg.state.long_debounce_secs, 30);
        assert_eq!(cfg.state.short_debounce_secs, 2);
        assert!(cfg.state.rd_mode);
        assert_eq!(cfg.watchdog.device, Some(PathBuf::from("/dev/watchdog")));
        assert_eq!(cfg.watchdog.period_secs, 12);
        assert_eq!(cfg.runlevel.telinit_retry_secs, 2);
        assert_eq!(cfg.rebootloop.startup_file, PathBuf::from("/var/lib/devstate/startup_info"));
        Ok(())
    }

    #[test]
    fn malformed_file_is_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("devstated.toml");
        fs::write(&path, "modules = 7")?;
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = DaemonConfig::default();
        apply_env_overrides(
            &mut cfg,
            env(&[
                ("DEVSTATE_SOCKFILE", "/tmp/other.sock"),
                ("BOOTSTATE", "ACT_DEAD"),
                ("DEVSTATE_WATCHDOG_DEVICE", "/dev/watchdog0"),
                ("DEVSTATE_RD_MODE", "yes"),
            ]),
        );
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(cfg.state.boot_mode.as_deref(), Some("ACT_DEAD"));
        assert_eq!(cfg.watchdog.device, Some(PathBuf::from("/dev/watchdog0")));
        assert!(cfg.state.rd_mode);
    }

    #[test]
    fn invalid_rd_mode_is_ignored_and_empty_device_disables() {
        let mut cfg = DaemonConfig::default();
        cfg.watchdog.device = Some(PathBuf::from("/dev/watchdog"));
        apply_env_overrides(
            &mut cfg,
            env(&[("DEVSTATE_RD_MODE", "maybe"), ("DEVSTATE_WATCHDOG_DEVICE", "")]),
        );
        assert!(!cfg.state.rd_mode);
        assert_eq!(cfg.watchdog.device, None);
    }

    #[test]
    fn reboot_loop_overrides_apply() {
        let mut cfg = DaemonConfig::default();
        apply_env_overrides(
            &mut cfg,
            env(&[
                ("DEVSTATE_REBOOTLOOP_FILE", "/tmp/startup_info"),
                ("DEVSTATE_REBOOTLOOP_TIME", "30"),
            ]),
        );
        assert_eq!(cfg.rebootloop.startup_file, PathBuf::from("/tmp/startup_info"));
        assert_eq!(cfg.rebootloop.window_secs, 30);

        apply_env_overrides(&mut cfg, env(&[("DEVSTATE_REBOOTLOOP_TIME", "soon")]));
        assert_eq!(cfg.rebootloop.window_secs, 30);
    }

    #[test]
    fn startup_module_moves_to_front() {
        let mut cfg = DaemonConfig::default();
        cfg.set_startup_module("version");
        assert_eq!(cfg.modules, vec!["version", "state", "rebootloop", "runlevel", "hwwd"]);
    }
}
