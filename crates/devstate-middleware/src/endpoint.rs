//! Message senders and recipients.
//!
//! An [`Endpoint`] is either a module inside the daemon (or the daemon core
//! itself) or a client connected over the socket.

use devstate_types::PeerCredentials;

use crate::registry::ModuleId;

/// Per-connection identifier assigned by the socket hub.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A loaded module, or the daemon core when `None`.
    Module(Option<ModuleId>),
    /// A socket client, with the credentials captured when it connected.
    Connection {
        id: ConnectionId,
        credentials: PeerCredentials,
    },
}

impl Endpoint {
    /// The daemon core, used as sender for `Idle` and similar bookkeeping.
    pub const DAEMON: Endpoint = Endpoint::Module(None);

    pub fn module(id: ModuleId) -> Self {
        Self::Module(Some(id))
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self, Self::Module(None))
    }

    pub fn module_id(&self) -> Option<ModuleId> {
        match self {
            Self::Module(id) => *id,
            Self::Connection { .. } => None,
        }
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connection { id, .. } => Some(*id),
            Self::Module(_) => None,
        }
    }

    /// `true` iff both name the same module or the same connection.
    ///
    /// Credentials are not compared; a connection is identified by its id.
    pub fn same(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Self::Module(a), Self::Module(b)) => a == b,
            (Self::Connection { id: a, .. }, Self::Connection { id: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Module(None) => f.write_str("daemon"),
            Self::Module(Some(id)) => write!(f, "module {id}"),
            Self::Connection { id, credentials } => {
                write!(f, "client {id} (pid {})", credentials.pid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: ConnectionId, pid: i32) -> Endpoint {
        Endpoint::Connection {
            id,
            credentials: PeerCredentials { pid, uid: 0, gid: 0 },
        }
    }

    #[test]
    fn daemon_is_daemon() {
        assert!(Endpoint::DAEMON.is_daemon());
        assert!(!client(1, 1).is_daemon());
        assert!(Endpoint::DAEMON.same(&Endpoint::Module(None)));
    }

    #[test]
    fn connections_compare_by_id() {
        assert!(client(7, 100).same(&client(7, 200)));
        assert!(!client(7, 100).same(&client(8, 100)));
        assert!(!client(7, 100).same(&Endpoint::DAEMON));
    }

    #[test]
    fn connection_keeps_captured_credentials() {
        let ep = client(3, 4242);
        assert!(matches!(ep, Endpoint::Connection { credentials, .. } if credentials.pid == 4242));
        assert_eq!(ep.connection_id(), Some(3));
        assert_eq!(ep.module_id(), None);
        assert_eq!(ep.to_string(), "client 3 (pid 4242)");
        assert_eq!(Endpoint::DAEMON.connection_id(), None);
    }
}
