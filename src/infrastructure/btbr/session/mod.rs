//! Device Sessions
//!
//! A session drives the radio through one activity (inquiry, paging, ...).
//! It owns the dispatcher's handler slot for its whole life and runs on its
//! own thread, consuming a private queue fed by the receive thread.
//!
//! ```text
//!  rx thread ──► handler slot ──► unbounded queue ──► session thread
//!                                                       │
//!                               SessionHandler::handle_* ◄┘
//! ```

pub mod discoverable;
pub mod inquiry;
pub mod monitor;
pub mod paging;

use crate::domain::models::{DeviceState, SessionEvent, StateReason};
use crate::infrastructure::btbr::codec::{AclPacket, FhsPacket, RxPacket, RxPayload};
use crate::infrastructure::btbr::dispatcher::{CommandError, DeviceEvent, Dispatcher};
use crate::infrastructure::btbr::protocol::llid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome of a state-change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    /// Session is now ready for packets
    Ready,
    /// Terminal state, the session ends
    Done,
}

/// What the session's handlers can reach
pub struct SessionContext {
    dispatcher: Dispatcher,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionContext {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Publish to the subscriber, if any
    pub fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Per-activity policy
pub trait SessionHandler: Send + 'static {
    fn name(&self) -> &'static str;

    /// Issue the command that puts the device in this session's mode
    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError>;

    fn handle_state(
        &mut self,
        ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow;

    fn handle_fhs(&mut self, _ctx: &mut SessionContext, _pkt: &RxPacket, fhs: &FhsPacket) {
        info!("RX FHS: {}", fhs);
    }

    fn handle_lmp(&mut self, _ctx: &mut SessionContext, _pkt: &RxPacket, acl: &AclPacket) {
        info!("RX LMP: {}", acl);
    }

    fn handle_l2cap(&mut self, _ctx: &mut SessionContext, _pkt: &RxPacket, acl: &AclPacket) {
        info!("RX L2CAP: {}", acl);
    }

    /// Packet whose CRC the device could not check
    ///
    /// Returning an ACL payload routes it like a good packet.
    fn handle_raw(&mut self, ctx: &mut SessionContext, pkt: &RxPacket) -> Option<AclPacket> {
        debug!("Dropping unvalidated packet on channel {}", pkt.channel);
        ctx.emit(SessionEvent::BadCrc {
            clkn: pkt.clkn,
            channel: pkt.channel,
        });
        None
    }

    /// Whether stopping must wait for a ready session to finish
    fn defers_stop(&self) -> bool {
        false
    }
}

/// Uniform control over simple and composite sessions
pub trait SessionControl: Send {
    fn name(&self) -> &'static str;
    fn is_done(&self) -> bool;
    /// False while stopping would interrupt a live LMP transaction
    fn stop_allowed(&self) -> bool;
    /// Stop and wait for the session to end
    fn stop(&mut self);
}

enum SessionMessage {
    Device(DeviceEvent),
    Shutdown,
}

struct SessionStatus {
    ready: AtomicBool,
    defers_stop: bool,
    done: Mutex<bool>,
    done_cond: Condvar,
}

impl SessionStatus {
    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_done(&self) {
        *self.done.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.done_cond.notify_all();
    }

    /// True if done within `timeout`
    fn wait_done(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = self
            .done_cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }

    fn stop_allowed(&self) -> bool {
        !self.defers_stop || self.is_done() || !self.ready.load(Ordering::SeqCst)
    }
}

/// Running session
pub struct SessionHandle {
    name: &'static str,
    dispatcher: Dispatcher,
    status: Arc<SessionStatus>,
    queue: mpsc::UnboundedSender<SessionMessage>,
    thread: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl SessionHandle {
    /// Take the dispatcher's handler slot and start `handler` on its own thread
    ///
    /// Panics if another session still holds the slot.
    pub fn spawn<H: SessionHandler>(
        dispatcher: Dispatcher,
        handler: H,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
        stop_grace: Duration,
    ) -> std::io::Result<Self> {
        let name = handler.name();
        let (queue, rx) = mpsc::unbounded_channel();
        let status = Arc::new(SessionStatus {
            ready: AtomicBool::new(false),
            defers_stop: handler.defers_stop(),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
        });

        let feed = queue.clone();
        let token = dispatcher.register_handler(move |event| {
            let _ = feed.send(SessionMessage::Device(event));
        });

        let ctx = SessionContext {
            dispatcher: dispatcher.clone(),
            events,
        };
        let thread_status = Arc::clone(&status);
        let spawned = thread::Builder::new()
            .name(format!("btbr-{}", name))
            .spawn(move || {
                let mut ctx = ctx;
                run_session(handler, &mut ctx, rx, &thread_status);
                ctx.dispatcher.unregister_handler(token);
                thread_status.mark_done();
                ctx.emit(SessionEvent::Finished { session: name });
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                dispatcher.unregister_handler(token);
                return Err(e);
            }
        };
        info!("Started {}", name);

        Ok(Self {
            name,
            dispatcher,
            status,
            queue,
            thread: Some(thread),
            stop_grace,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.status.ready.load(Ordering::SeqCst)
    }

    /// Block until the session ends on its own
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} thread panicked", self.name);
            }
        }
    }
}

impl SessionControl for SessionHandle {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_done(&self) -> bool {
        self.status.is_done()
    }

    fn stop_allowed(&self) -> bool {
        self.status.stop_allowed()
    }

    /// Idle the device and wait for it to report STANDBY; a session whose
    /// device stays silent past the grace period is shut down regardless
    fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        if !self.status.is_done() {
            if let Err(e) = self.dispatcher.send_idle_cmd() {
                warn!("Failed to idle device for {}: {}", self.name, e);
            }
            if !self.status.wait_done(self.stop_grace) {
                warn!("{} did not reach STANDBY, shutting it down", self.name);
                let _ = self.queue.send(SessionMessage::Shutdown);
            }
        }
        self.join();
        info!("{} stopped", self.name);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_session<H: SessionHandler>(
    mut handler: H,
    ctx: &mut SessionContext,
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    status: &SessionStatus,
) {
    let name = handler.name();
    if let Err(e) = handler.start(ctx) {
        error!("{} failed to start: {}", name, e);
        return;
    }

    while let Some(message) = rx.blocking_recv() {
        let event = match message {
            SessionMessage::Device(event) => event,
            SessionMessage::Shutdown => break,
        };

        match event {
            DeviceEvent::State { state, reason } => {
                ctx.emit(SessionEvent::StateChanged {
                    session: name,
                    state,
                    reason: reason.code,
                    lt_addr: reason.lt_addr,
                });
                match handler.handle_state(ctx, state, reason) {
                    SessionFlow::Continue => {}
                    SessionFlow::Ready => status.ready.store(true, Ordering::SeqCst),
                    SessionFlow::Done => break,
                }
            }
            DeviceEvent::Rx(pkt) => {
                if !status.ready.load(Ordering::SeqCst) {
                    warn!("{} not ready for packet\n{}", name, pkt);
                    continue;
                }
                handle_packet(&mut handler, ctx, &pkt);
            }
        }
    }
    debug!("{} done", name);
}

fn handle_packet<H: SessionHandler>(handler: &mut H, ctx: &mut SessionContext, pkt: &RxPacket) {
    if pkt.is_raw() {
        if let Some(acl) = handler.handle_raw(ctx, pkt) {
            route_acl(handler, ctx, pkt, &acl);
        }
        return;
    }
    match &pkt.payload {
        RxPayload::Fhs(fhs) => handler.handle_fhs(ctx, pkt, fhs),
        RxPayload::Acl(acl) => route_acl(handler, ctx, pkt, acl),
        RxPayload::Empty => debug!("{}", pkt.bb_hdr),
    }
}

fn route_acl<H: SessionHandler>(handler: &mut H, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
    if acl.llid == llid::LMP {
        handler.handle_lmp(ctx, pkt, acl);
    } else {
        handler.handle_l2cap(ctx, pkt, acl);
    }
}

/// Log a state that does not belong to the session's sequence
pub(crate) fn log_unexpected_state(name: &str, state: DeviceState, reason: StateReason) {
    if state != DeviceState::Standby {
        warn!(
            "{}: Invalid state {} (reason {}, lt_addr {})",
            name, state, reason.code, reason.lt_addr
        );
    }
}
