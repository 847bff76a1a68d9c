//! The single-threaded main loop.
//!
//! Each wake-up (a socket event, a new client, a watchdog heartbeat, or a due
//! timer) is turned into queued messages. Then due timers fire and the bus
//! drains. The loop ends on termination or when a module requests exit.

use std::time::Duration;

use devstate_kernel::{Wake, WatchdogHandle};
use devstate_middleware::{Bus, Endpoint, Payload, SocketEvent, SocketHub, SocketServer};
use devstate_types::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sources feeding the loop.
pub struct LoopInputs<'a> {
    pub server: &'a mut SocketServer,
    pub events: &'a mut mpsc::UnboundedReceiver<SocketEvent>,
    pub wake: &'a mut mpsc::UnboundedReceiver<Wake>,
    pub watchdog: Option<&'a WatchdogHandle>,
}

/// Run until termination. Returns the process exit code.
pub async fn run(bus: &mut Bus<SocketHub>, inputs: LoopInputs<'_>) -> i32 {
    let LoopInputs {
        server,
        events,
        wake,
        watchdog,
    } = inputs;

    info!(socket = %server.path().display(), "entering main loop");
    loop {
        let sleep_target = bus
            .next_deadline()
            .map(Instant::from_std)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok((id, writer)) => {
                    debug!(connection = id, "client connected");
                    bus.outbound_mut().attach(id, writer);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(event) = events.recv() => on_socket_event(bus, event),
            Some(w) = wake.recv() => match w {
                Wake::Heartbeat => {
                    if let Some(watchdog) = watchdog {
                        watchdog.pong();
                    }
                    enqueue(bus, Endpoint::DAEMON, Message::Heartbeat.into());
                }
                Wake::Terminate => {
                    info!("termination requested");
                    return 0;
                }
            },
            _ = tokio::time::sleep_until(sleep_target) => {}
            _ = std::future::ready(()), if bus.has_pending() => {}
        }

        bus.fire_due_timers(std::time::Instant::now());
        bus.drain();
        if let Some(code) = bus.exit_code() {
            info!(code, "exit requested");
            return code;
        }
    }
}

fn on_socket_event(bus: &mut Bus<SocketHub>, event: SocketEvent) {
    match event {
        SocketEvent::Received { from, payload } => enqueue(bus, from, payload),
        SocketEvent::Closed { from, reason } => {
            debug!(%from, ?reason, "client disconnected");
            enqueue(bus, from, Message::Close { reason }.into());
            // Handlers may still address the peer while processing its close.
            bus.fire_due_timers(std::time::Instant::now());
            bus.drain();
            if let Some(id) = from.connection_id() {
                bus.outbound_mut().detach(id);
            }
        }
    }
}

fn enqueue(bus: &mut Bus<SocketHub>, from: Endpoint, payload: Payload) {
    if let Err(e) = bus.enqueue(from, None, payload) {
        warn!(error = %e, "message dropped");
    }
}
