//! `tracing` subscriber setup for `devstated`.
//!
//! Call [`init`] once at process startup. The filter sits behind a `reload`
//! layer so clients can change verbosity at runtime through
//! `SetLoggingVerbosity`, handled by [`LoggingModule`].
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter, used when no verbosity is given. |
//! | `DEVSTATE_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |

use devstate_middleware::{Binding, Context, Endpoint, Module};
use devstate_types::{Message, MessageKind};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("failed to install the tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),

    #[error("failed to reload the log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Map a syslog priority (3 = err .. 7 = debug) to a filter directive.
pub fn verbosity_directive(verbosity: u32) -> &'static str {
    match verbosity {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        7 => "debug",
        _ => "trace",
    }
}

/// Runtime control over the installed filter.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    pub fn set_verbosity(&self, verbosity: u32) -> Result<(), LoggingError> {
        self.handle.reload(EnvFilter::new(verbosity_directive(verbosity)))?;
        Ok(())
    }
}

/// Install the global subscriber.
///
/// `verbosity` wins over `RUST_LOG`; with neither, the level is `info`.
pub fn init(verbosity: Option<u32>) -> Result<LogControl, LoggingError> {
    let env_filter = match verbosity {
        Some(v) => EnvFilter::new(verbosity_directive(v)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let (filter, handle) = reload::Layer::new(env_filter);
    let use_json = std::env::var("DEVSTATE_LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?;
    }

    Ok(LogControl { handle })
}

// ────────────────────────────────────────────────────────────────────────────
// Bus module
// ────────────────────────────────────────────────────────────────────────────

pub type VerbositySetter = Box<dyn FnMut(u32) -> Result<(), LoggingError>>;

/// Applies `SetLoggingVerbosity` requests.
pub struct LoggingModule {
    set_verbosity: VerbositySetter,
}

impl LoggingModule {
    pub fn new(set_verbosity: VerbositySetter) -> Self {
        Self { set_verbosity }
    }

    pub fn with_control(control: LogControl) -> Self {
        Self::new(Box::new(move |v| control.set_verbosity(v)))
    }
}

impl Module for LoggingModule {
    fn name(&self) -> &str {
        "logging"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        vec![Binding::of(MessageKind::SetLoggingVerbosity)]
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, from: &Endpoint, msg: &Message) {
        if let Message::SetLoggingVerbosity { verbosity } = msg {
            match (self.set_verbosity)(*verbosity) {
                Ok(()) => info!(%from, verbosity, level = verbosity_directive(*verbosity), "log verbosity changed"),
                Err(e) => warn!(%from, error = %e, "log verbosity unchanged"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstate_middleware::{Bus, NullOutbound};
    use devstate_types::PeerCredentials;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn syslog_levels_map_to_directives() {
        assert_eq!(verbosity_directive(0), "error");
        assert_eq!(verbosity_directive(3), "error");
        assert_eq!(verbosity_directive(4), "warn");
        assert_eq!(verbosity_directive(5), "info");
        assert_eq!(verbosity_directive(6), "info");
        assert_eq!(verbosity_directive(7), "debug");
        assert_eq!(verbosity_directive(9), "trace");
    }

    #[test]
    fn module_applies_requested_verbosity() -> Result<(), Box<dyn std::error::Error>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut bus = Bus::new(NullOutbound);
        bus.load_module(
            Box::new(LoggingModule::new(Box::new(move |v| {
                sink.borrow_mut().push(v);
                Ok(())
            }))),
            0,
        )?;

        let client = Endpoint::Connection {
            id: 3,
            credentials: PeerCredentials::UNKNOWN,
        };
        bus.enqueue(client, None, Message::SetLoggingVerbosity { verbosity: 7 }.into())?;
        bus.drain();

        assert_eq!(*seen.borrow(), vec![7]);
        Ok(())
    }
}
