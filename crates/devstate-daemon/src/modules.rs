//! Module catalogue: configured names → constructed modules.

use devstate_kernel::{HwwdModule, Kicker, RebootLoopModule, RunlevelModule, StateModule, VersionModule};
use devstate_middleware::{Bus, BusError, Module, ModuleId, Outbound};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;

/// Names [`build`] understands.
pub const KNOWN_MODULES: &[&str] = &["state", "rebootloop", "runlevel", "hwwd", "version"];

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("no modules configured")]
    NoModules,

    #[error("startup module {0:?} is unknown")]
    UnknownStartupModule(String),

    #[error("startup module {name:?} failed to load: {source}")]
    StartupModule {
        name: String,
        #[source]
        source: BusError,
    },
}

pub fn build(name: &str, config: &DaemonConfig, kicker: Option<&Kicker>) -> Option<Box<dyn Module>> {
    let module: Box<dyn Module> = match name {
        "state" => Box::new(StateModule::from_config(config.state.clone())),
        "rebootloop" => Box::new(RebootLoopModule::new(config.rebootloop.clone())),
        "runlevel" => Box::new(RunlevelModule::host(config.runlevel.clone())),
        "hwwd" => Box::new(HwwdModule::new(kicker.cloned())),
        "version" => Box::new(VersionModule::new()),
        _ => return None,
    };
    Some(module)
}

/// Load every configured module in order.
///
/// The first module is mandatory: if it is unknown or fails to load, startup
/// fails. Any later failure is logged and that module is skipped.
pub fn load_all<O: Outbound>(
    bus: &mut Bus<O>,
    config: &DaemonConfig,
    kicker: Option<&Kicker>,
) -> Result<Vec<ModuleId>, StartupError> {
    let (startup, rest) = config.modules.split_first().ok_or(StartupError::NoModules)?;

    let module = build(startup, config, kicker).ok_or_else(|| StartupError::UnknownStartupModule(startup.clone()))?;
    let first = bus.load_module(module, 0).map_err(|source| {
        error!(module = %startup, error = %source, "startup module failed");
        StartupError::StartupModule {
            name: startup.clone(),
            source,
        }
    })?;
    info!(module = %startup, "startup module loaded");

    let mut loaded = vec![first];
    for name in rest {
        let Some(module) = build(name, config, kicker) else {
            warn!(module = %name, known = ?KNOWN_MODULES, "unknown module, skipped");
            continue;
        };
        match bus.load_module(module, 0) {
            Ok(id) => loaded.push(id),
            Err(e) => warn!(module = %name, error = %e, "module failed to load, skipped"),
        }
    }
    Ok(loaded)
}
