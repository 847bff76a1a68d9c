//! `devstate-middleware` – the message bus.
//!
//! Routes messages between the daemon's modules and its socket clients
//! without caring about what the messages mean.
//!
//! # Modules
//!
//! - [`handler`] – [`HandlerTable`]: sorted `(type, size) → module` routes.
//! - [`registry`] – [`Module`] trait and the generational [`ModuleRegistry`].
//! - [`endpoint`] – [`Endpoint`]: who sent a message, who receives a reply.
//! - [`bus`] – [`Bus`]: the FIFO queue, the dispatcher and the per-callback
//!   [`Context`].
//! - [`timers`] – bus-owned one-shot timers.
//! - [`codec`] – async frame reader/writer for the socket wire format.
//! - [`socket`] – Unix socket server and the [`SocketHub`] outbound side.

pub mod bus;
pub mod codec;
pub mod endpoint;
pub mod handler;
pub mod registry;
pub mod socket;
pub mod timers;

pub use bus::{Bus, BusError, Context, NullOutbound, Outbound, Payload, QueuedMessage, RecordingOutbound};
pub use endpoint::{ConnectionId, Endpoint};
pub use handler::{Handler, HandlerTable};
pub use registry::{Binding, Module, ModuleId, ModuleRegistry};
pub use socket::{DEFAULT_SOCKET_PATH, SocketEvent, SocketHub, SocketServer};
pub use timers::{TimerError, TimerId, Timers};
