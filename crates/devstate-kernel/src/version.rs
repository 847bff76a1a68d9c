//! Answers `GetVersion` with the daemon version.

use devstate_middleware::{Binding, Context, Endpoint, Module};
use devstate_types::{Message, MessageKind};
use tracing::debug;

pub struct VersionModule {
    version: String,
}

impl VersionModule {
    pub fn new() -> Self {
        Self::with_version(env!("CARGO_PKG_VERSION"))
    }

    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for VersionModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for VersionModule {
    fn name(&self) -> &str {
        "version"
    }

    fn message_handlers(&self) -> Vec<Binding> {
        vec![Binding::of(MessageKind::GetVersion)]
    }

    fn handle(&mut self, ctx: &mut Context<'_>, from: &Endpoint, msg: &Message) {
        if let Message::GetVersion = msg {
            debug!(%from, version = %self.version, "version query");
            ctx.send(
                from,
                Message::DaemonVersion {
                    version: self.version.clone(),
                },
            );
        }
    }
}
