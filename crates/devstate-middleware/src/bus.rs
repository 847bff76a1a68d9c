//! In-process message bus: queue, dispatcher and module lifecycle.
//!
//! The [`Bus`] owns everything a dispatch pass touches:
//!
//! | Field | Purpose |
//! |---|---|
//! | [`HandlerTable`] | sorted `(type, size) → module` routes |
//! | [`ModuleRegistry`] | loaded modules, addressed by [`ModuleId`] |
//! | queue | FIFO of [`QueuedMessage`]s awaiting dispatch |
//! | [`Timers`] | pending one-shot timers |
//! | [`Outbound`] | the socket side, for broadcasts and replies to clients |
//!
//! Handlers never touch the bus directly. Each callback receives a
//! [`Context`] scoped to the module being called, through which it can queue
//! messages, reply, arm timers and request process exit. A message queued from
//! inside a handler is appended to the same queue and handled within the same
//! [`Bus::drain`] call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use devstate_types::{DevStateError, HEADER_SIZE, Message, MessageKind};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{ConnectionId, Endpoint};
use crate::handler::{Handler, HandlerTable};
use crate::registry::{Module, ModuleId, ModuleRegistry};
use crate::timers::{TimerError, TimerId, Timers};

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Message declares {size} bytes, less than the 12-byte header")]
    Undersized { size: u32 },

    #[error("No module with id {0}")]
    UnknownModule(ModuleId),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Module(#[from] DevStateError),
}

// ────────────────────────────────────────────────────────────────────────────
// Queue entries
// ────────────────────────────────────────────────────────────────────────────

/// A message together with the size it declared.
///
/// Locally built messages declare their canonical size. Messages read off the
/// socket keep whatever size the peer declared, so a peer speaking a larger
/// layout of a known type reaches no handler instead of a wrong one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub message: Message,
    pub declared_size: u32,
}

impl Payload {
    pub fn new(message: Message) -> Self {
        let declared_size = message.declared_size();
        Self {
            message,
            declared_size,
        }
    }

    pub fn with_declared_size(message: Message, declared_size: u32) -> Self {
        Self {
            message,
            declared_size,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

impl From<Message> for Payload {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub from: Endpoint,
    /// `None` delivers to every matching handler.
    pub to: Option<ModuleId>,
    pub payload: Payload,
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound side
// ────────────────────────────────────────────────────────────────────────────

/// Where messages leave the process.
///
/// Implemented by the socket hub in production and by recorders in tests.
pub trait Outbound {
    /// Write `msg` to every connected client.
    fn broadcast(&mut self, msg: &Message);

    /// Write `msg` to one client. Unknown ids are ignored.
    fn send(&mut self, connection: ConnectionId, msg: &Message);
}

/// An [`Outbound`] with no clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutbound;

impl Outbound for NullOutbound {
    fn broadcast(&mut self, _msg: &Message) {}
    fn send(&mut self, _connection: ConnectionId, _msg: &Message) {}
}

/// An [`Outbound`] that keeps everything it is handed.
#[derive(Debug, Default, Clone)]
pub struct RecordingOutbound {
    pub broadcasts: Vec<Message>,
    pub sent: Vec<(ConnectionId, Message)>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.broadcasts.clear();
        self.sent.clear();
    }
}

impl Outbound for RecordingOutbound {
    fn broadcast(&mut self, msg: &Message) {
        self.broadcasts.push(msg.clone());
    }

    fn send(&mut self, connection: ConnectionId, msg: &Message) {
        self.sent.push((connection, msg.clone()));
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handler context
// ────────────────────────────────────────────────────────────────────────────

/// Everything a module may do while one of its callbacks runs.
///
/// The context identifies the module as the "currently handling" one, so
/// everything it queues is sent from that module.
pub struct Context<'a> {
    module: Option<ModuleId>,
    queue: &'a mut VecDeque<QueuedMessage>,
    timers: &'a mut Timers,
    outbound: &'a mut dyn Outbound,
    exit_code: &'a mut Option<i32>,
    now: Instant,
}

impl<'a> Context<'a> {
    pub fn module_id(&self) -> Option<ModuleId> {
        self.module
    }

    pub fn as_endpoint(&self) -> Endpoint {
        Endpoint::Module(self.module)
    }

    /// The bus clock at the start of this dispatch.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue `msg` for every interested module and, unless the type is
    /// process-internal, write it to every socket client.
    pub fn broadcast(&mut self, msg: Message) {
        if !msg.kind().is_internal() {
            self.outbound.broadcast(&msg);
        }
        self.broadcast_internally(msg);
    }

    /// Queue `msg` for every interested module only.
    pub fn broadcast_internally(&mut self, msg: Message) {
        self.push(None, msg);
    }

    /// Deliver `msg` to a single recipient.
    ///
    /// A module recipient gets it through the queue. A socket client gets it
    /// written directly. The daemon core has no handlers, so messages to it
    /// are logged and dropped.
    pub fn send(&mut self, to: &Endpoint, msg: Message) {
        match to {
            Endpoint::Module(Some(id)) => self.push(Some(*id), msg),
            Endpoint::Connection { id, .. } => self.outbound.send(*id, &msg),
            Endpoint::Module(None) => {
                debug!(kind = ?msg.kind(), "message addressed to the daemon core dropped");
            }
        }
    }

    /// Arm a one-shot timer that fires `delay` from now.
    ///
    /// # Errors
    ///
    /// [`TimerError::Exhausted`] when every timer slot is taken.
    pub fn start_timer(&mut self, delay: Duration) -> Result<TimerId, TimerError> {
        let owner = self.module.ok_or(TimerError::NoOwner)?;
        self.timers.start(owner, self.now + delay)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Ask the event loop to exit with `code` once the current drain ends.
    pub fn request_exit(&mut self, code: i32) {
        info!(code, "exit requested");
        *self.exit_code = Some(code);
    }

    fn push(&mut self, to: Option<ModuleId>, message: Message) {
        self.queue.push_back(QueuedMessage {
            from: Endpoint::Module(self.module),
            to,
            payload: Payload::new(message),
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus
// ────────────────────────────────────────────────────────────────────────────

pub struct Bus<O: Outbound> {
    handlers: HandlerTable,
    registry: ModuleRegistry,
    queue: VecDeque<QueuedMessage>,
    timers: Timers,
    outbound: O,
    exit_code: Option<i32>,
    now: Instant,
}

impl<O: Outbound> Bus<O> {
    pub fn new(outbound: O) -> Self {
        Self {
            handlers: HandlerTable::new(),
            registry: ModuleRegistry::new(),
            queue: VecDeque::new(),
            timers: Timers::new(),
            outbound,
            exit_code: None,
            now: Instant::now(),
        }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut O {
        &mut self.outbound
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Exit code requested by a module, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    // -----------------------------------------------------------------------
    // Handler table
    // -----------------------------------------------------------------------

    /// Route messages of `kind` declaring exactly `size` bytes to `owner`.
    pub fn register_handler(&mut self, kind: MessageKind, size: u32, owner: ModuleId) -> Result<(), BusError> {
        let priority = self
            .registry
            .priority(owner)
            .ok_or(BusError::UnknownModule(owner))?;
        self.handlers.register(Handler {
            kind,
            size,
            owner,
            priority,
        })
    }

    pub fn unregister_all(&mut self, owner: ModuleId) -> usize {
        self.handlers.unregister_all(owner)
    }

    // -----------------------------------------------------------------------
    // Module lifecycle
    // -----------------------------------------------------------------------

    /// Insert `module`, register its bindings and run its `init`.
    ///
    /// Any failure rolls the load back completely before the error is
    /// returned.
    pub fn load_module(&mut self, module: Box<dyn Module>, priority: i32) -> Result<ModuleId, BusError> {
        let name = module.name().to_string();
        let bindings = module.message_handlers();
        let id = self.registry.insert(module, priority)?;

        for binding in bindings {
            if let Err(e) = self.register_handler(binding.kind, binding.size, id) {
                self.rollback(id);
                return Err(e);
            }
        }

        let now = self.now;
        let result = match self.registry.get_mut(id) {
            Some(module) => {
                let mut ctx = Context {
                    module: Some(id),
                    queue: &mut self.queue,
                    timers: &mut self.timers,
                    outbound: &mut self.outbound,
                    exit_code: &mut self.exit_code,
                    now,
                };
                module.init(&mut ctx)
            }
            None => Ok(()),
        };

        if let Err(e) = result {
            warn!(module = %name, error = %e, "module init failed");
            self.rollback(id);
            return Err(BusError::Module(e));
        }

        info!(module = %name, %id, priority, "module loaded");
        Ok(id)
    }

    /// Run `fini`, then drop the module's handlers, timers and queued input.
    ///
    /// Returns `false` when `id` does not name a loaded module.
    pub fn unload_module(&mut self, id: ModuleId) -> bool {
        let now = self.now;
        let Some(module) = self.registry.get_mut(id) else {
            return false;
        };
        let name = module.name().to_string();
        let mut ctx = Context {
            module: Some(id),
            queue: &mut self.queue,
            timers: &mut self.timers,
            outbound: &mut self.outbound,
            exit_code: &mut self.exit_code,
            now,
        };
        module.fini(&mut ctx);

        self.rollback(id);
        info!(module = %name, %id, "module unloaded");
        true
    }

    /// Unload every module, most recently loaded first.
    pub fn unload_all(&mut self) {
        let mut ids = self.registry.ids();
        ids.reverse();
        for id in ids {
            self.unload_module(id);
        }
    }

    fn rollback(&mut self, id: ModuleId) {
        self.handlers.unregister_all(id);
        self.timers.cancel_owned_by(id);
        self.queue.retain(|m| m.to != Some(id));
        self.registry.remove(id);
    }

    // -----------------------------------------------------------------------
    // Queue and dispatch
    // -----------------------------------------------------------------------

    /// Append a message to the queue.
    ///
    /// # Errors
    ///
    /// [`BusError::Undersized`] when the payload declares less than a header.
    pub fn enqueue(&mut self, from: Endpoint, to: Option<ModuleId>, payload: Payload) -> Result<(), BusError> {
        if payload.declared_size < HEADER_SIZE {
            return Err(BusError::Undersized {
                size: payload.declared_size,
            });
        }
        self.queue
            .try_reserve(1)
            .map_err(|e| BusError::OutOfMemory(format!("message queue: {e}")))?;
        self.queue.push_back(QueuedMessage { from, to, payload });
        Ok(())
    }

    /// Dispatch queued messages until the queue is empty, then dispatch one
    /// `Idle` from the daemon core.
    pub fn drain(&mut self) {
        while let Some(queued) = self.queue.pop_front() {
            self.dispatch_one(&queued);
        }
        self.dispatch_one(&QueuedMessage {
            from: Endpoint::DAEMON,
            to: None,
            payload: Payload::new(Message::Idle),
        });
    }

    /// Deliver one message to every matching handler, in table order.
    ///
    /// A handler matches when its type equals the message type, its declared
    /// size equals the payload's declared size, and (for addressed messages)
    /// its owner is the recipient. Returns how many handlers ran.
    pub fn dispatch_one(&mut self, queued: &QueuedMessage) -> usize {
        let kind = queued.payload.kind();
        let now = self.now;
        let mut delivered = 0;

        for handler in self.handlers.matching(kind) {
            if queued.to.is_some_and(|to| to != handler.owner) {
                continue;
            }
            if handler.size != queued.payload.declared_size {
                trace!(?kind, expected = handler.size, got = queued.payload.declared_size, "size mismatch");
                continue;
            }
            let Some(module) = self.registry.get_mut(handler.owner) else {
                continue;
            };
            let mut ctx = Context {
                module: Some(handler.owner),
                queue: &mut self.queue,
                timers: &mut self.timers,
                outbound: &mut self.outbound,
                exit_code: &mut self.exit_code,
                now,
            };
            module.handle(&mut ctx, &queued.from, &queued.payload.message);
            delivered += 1;
        }

        if delivered == 0 && kind != MessageKind::Idle {
            trace!(?kind, from = %queued.from, "no handler");
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Advance the bus clock to `now` and queue an expiry for every due timer.
    ///
    /// The clock never moves backwards. Returns the number of timers fired.
    pub fn fire_due_timers(&mut self, now: Instant) -> usize {
        if now > self.now {
            self.now = now;
        }
        let due = self.timers.take_due(self.now);
        let fired = due.len();
        for (timer, owner) in due {
            self.queue.push_back(QueuedMessage {
                from: Endpoint::module(owner),
                to: Some(owner),
                payload: Payload::new(Message::TimerExpired {
                    timer: timer.as_raw(),
                }),
            });
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Binding;
    use devstate_types::PeerCredentials;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(String, Endpoint, Message)>>>;

    /// Records every message it handles; optionally reacts.
    struct Recorder {
        name: &'static str,
        kinds: Vec<MessageKind>,
        log: Log,
        on_powerup_broadcast: Option<Message>,
        on_powerup_send: Option<(ModuleId, Message)>,
        fail_init: bool,
        arm_timer: Option<Duration>,
    }

    impl Recorder {
        fn new(name: &'static str, kinds: &[MessageKind], log: &Log) -> Self {
            Self {
                name,
                kinds: kinds.to_vec(),
                log: Rc::clone(log),
                on_powerup_broadcast: None,
                on_powerup_send: None,
                fail_init: false,
                arm_timer: None,
            }
        }
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn message_handlers(&self) -> Vec<Binding> {
            self.kinds.iter().copied().map(Binding::of).collect()
        }

        fn init(&mut self, ctx: &mut Context<'_>) -> Result<(), DevStateError> {
            if let Some(delay) = self.arm_timer {
                ctx.start_timer(delay)
                    .map_err(|e| DevStateError::Transport(e.to_string()))?;
            }
            if self.fail_init {
                return Err(DevStateError::ModuleInit {
                    module: self.name.to_string(),
                    details: "refused".to_string(),
                });
            }
            Ok(())
        }

        fn handle(&mut self, ctx: &mut Context<'_>, from: &Endpoint, msg: &Message) {
            self.log.borrow_mut().push((self.name.to_string(), *from, msg.clone()));
            if let (Message::PowerupReq, Some(reply)) = (msg, self.on_powerup_broadcast.clone()) {
                ctx.broadcast(reply);
            }
            if let (Message::PowerupReq, Some((to, reply))) = (msg, self.on_powerup_send.clone()) {
                ctx.send(&Endpoint::module(to), reply);
            }
            if let Message::StateQuery = msg {
                ctx.send(from, Message::StateChangeInd {
                    state: devstate_types::DeviceState::User,
                });
            }
        }
    }

    fn names(log: &Log) -> Vec<String> {
        log.borrow().iter().map(|(n, _, _)| n.clone()).collect()
    }

    fn client(id: ConnectionId) -> Endpoint {
        Endpoint::Connection {
            id,
            credentials: PeerCredentials::UNKNOWN,
        }
    }

    #[test]
    fn higher_priority_runs_first() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        bus.load_module(Box::new(Recorder::new("low", &[MessageKind::ShutdownReq], &log)), 0)?;
        bus.load_module(Box::new(Recorder::new("high", &[MessageKind::ShutdownReq], &log)), 10)?;

        bus.enqueue(Endpoint::DAEMON, None, Message::ShutdownReq.into())?;
        bus.drain();
        assert_eq!(names(&log), vec!["high", "low"]);
        Ok(())
    }

    #[test]
    fn addressed_message_reaches_only_recipient() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        let a = bus.load_module(Box::new(Recorder::new("a", &[MessageKind::RebootReq], &log)), 0)?;
        bus.load_module(Box::new(Recorder::new("b", &[MessageKind::RebootReq], &log)), 0)?;

        bus.enqueue(Endpoint::DAEMON, Some(a), Message::RebootReq.into())?;
        bus.drain();
        assert_eq!(names(&log), vec!["a"]);
        Ok(())
    }

    #[test]
    fn size_mismatch_is_never_delivered() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        bus.load_module(Box::new(Recorder::new("a", &[MessageKind::SetChargerState], &log)), 0)?;

        let msg = Message::SetChargerState { connected: true };
        bus.enqueue(Endpoint::DAEMON, None, Payload::with_declared_size(msg.clone(), 20))?;
        bus.drain();
        assert!(log.borrow().is_empty());

        bus.enqueue(Endpoint::DAEMON, None, msg.into())?;
        bus.drain();
        assert_eq!(log.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn undersized_enqueue_is_rejected() {
        let mut bus = Bus::new(NullOutbound);
        let result = bus.enqueue(
            Endpoint::DAEMON,
            None,
            Payload::with_declared_size(Message::PowerupReq, 8),
        );
        assert!(matches!(result, Err(BusError::Undersized { size: 8 })));
        assert!(!bus.has_pending());
    }

    #[test]
    fn drain_handles_cascade_then_one_idle() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(RecordingOutbound::new());
        let mut first = Recorder::new("first", &[MessageKind::PowerupReq], &log);
        first.on_powerup_broadcast = Some(Message::SaveDataInd);
        bus.load_module(Box::new(first), 0)?;
        bus.load_module(
            Box::new(Recorder::new("watcher", &[MessageKind::SaveDataInd, MessageKind::Idle], &log)),
            0,
        )?;

        bus.enqueue(client(1), None, Message::PowerupReq.into())?;
        bus.drain();

        let handled: Vec<Message> = log.borrow().iter().map(|(_, _, m)| m.clone()).collect();
        assert_eq!(
            handled,
            vec![Message::PowerupReq, Message::SaveDataInd, Message::Idle]
        );
        assert_eq!(bus.outbound().broadcasts, vec![Message::SaveDataInd]);
        assert!(!bus.has_pending());
        Ok(())
    }

    #[test]
    fn handler_output_is_sent_from_the_handling_module() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(RecordingOutbound::new());
        let b = bus.load_module(
            Box::new(Recorder::new(
                "b",
                &[MessageKind::SaveDataInd, MessageKind::RebootReq, MessageKind::Idle],
                &log,
            )),
            0,
        )?;
        let mut a = Recorder::new("a", &[MessageKind::PowerupReq], &log);
        a.on_powerup_broadcast = Some(Message::SaveDataInd);
        a.on_powerup_send = Some((b, Message::RebootReq));
        let a = bus.load_module(Box::new(a), 0)?;

        bus.enqueue(client(7), None, Message::PowerupReq.into())?;
        bus.drain();

        assert_eq!(
            *log.borrow(),
            vec![
                ("a".to_string(), client(7), Message::PowerupReq),
                ("b".to_string(), Endpoint::module(a), Message::SaveDataInd),
                ("b".to_string(), Endpoint::module(a), Message::RebootReq),
                ("b".to_string(), Endpoint::DAEMON, Message::Idle),
            ]
        );
        Ok(())
    }

    #[test]
    fn timer_expiry_comes_from_its_owner() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        let mut owner = Recorder::new("owner", &[MessageKind::TimerExpired], &log);
        owner.arm_timer = Some(Duration::from_secs(1));
        let owner = bus.load_module(Box::new(owner), 0)?;

        let later = bus.now() + Duration::from_secs(1);
        bus.fire_due_timers(later);
        bus.drain();
        assert!(matches!(
            log.borrow().as_slice(),
            [(_, from, Message::TimerExpired { .. })] if *from == Endpoint::module(owner)
        ));
        Ok(())
    }

    #[test]
    fn reply_to_connection_goes_outbound() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(RecordingOutbound::new());
        bus.load_module(Box::new(Recorder::new("q", &[MessageKind::StateQuery], &log)), 0)?;

        bus.enqueue(client(42), None, Message::StateQuery.into())?;
        bus.drain();
        assert_eq!(bus.outbound().sent.len(), 1);
        assert_eq!(bus.outbound().sent[0].0, 42);
        assert!(bus.outbound().broadcasts.is_empty());
        Ok(())
    }

    #[test]
    fn failed_init_rolls_back() {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        let mut recorder = Recorder::new("broken", &[MessageKind::PowerupReq], &log);
        recorder.fail_init = true;
        recorder.arm_timer = Some(Duration::from_secs(1));

        assert!(bus.load_module(Box::new(recorder), 0).is_err());
        assert!(bus.handlers().is_empty());
        assert!(bus.registry().is_empty());
        assert_eq!(bus.pending_timers(), 0);
    }

    #[test]
    fn unload_removes_handlers_and_timers() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        let mut a = Recorder::new("a", &[MessageKind::PowerupReq, MessageKind::TimerExpired], &log);
        a.arm_timer = Some(Duration::from_secs(1));
        let a = bus.load_module(Box::new(a), 0)?;
        bus.load_module(Box::new(Recorder::new("b", &[MessageKind::PowerupReq], &log)), 0)?;
        assert_eq!(bus.pending_timers(), 1);

        assert!(bus.unload_module(a));
        assert!(!bus.unload_module(a));
        assert_eq!(bus.handlers().len(), 1);
        assert_eq!(bus.pending_timers(), 0);
        Ok(())
    }

    #[test]
    fn timer_expiry_is_addressed_to_owner() -> Result<(), Box<dyn std::error::Error>> {
        let log: Log = Rc::default();
        let mut bus = Bus::new(NullOutbound);
        let mut owner = Recorder::new("owner", &[MessageKind::TimerExpired], &log);
        owner.arm_timer = Some(Duration::from_secs(2));
        bus.load_module(Box::new(owner), 0)?;
        bus.load_module(Box::new(Recorder::new("other", &[MessageKind::TimerExpired], &log)), 0)?;

        let start = bus.now();
        assert_eq!(bus.fire_due_timers(start + Duration::from_secs(1)), 0);
        assert_eq!(bus.fire_due_timers(start + Duration::from_secs(2)), 1);
        bus.drain();
        assert_eq!(names(&log), vec!["owner"]);
        Ok(())
    }

    #[test]
    fn internal_broadcast_stays_inside() {
        let mut queue = VecDeque::new();
        let mut timers = Timers::new();
        let mut out = RecordingOutbound::new();
        let mut exit = None;
        let mut ctx = Context {
            module: None,
            queue: &mut queue,
            timers: &mut timers,
            outbound: &mut out,
            exit_code: &mut exit,
            now: Instant::now(),
        };
        ctx.broadcast(Message::HwwdKick);
        ctx.broadcast(Message::ThermalShutdownInd);
        ctx.request_exit(1);
        assert!(ctx.start_timer(Duration::from_secs(1)).is_err());

        assert_eq!(queue.len(), 2);
        assert_eq!(out.broadcasts, vec![Message::ThermalShutdownInd]);
        assert_eq!(exit, Some(1));
    }
}
