//! Command/Event Dispatcher
//!
//! Owns the receive thread and the single handler slot. Every complete
//! message from the device is classified by opcode and handed to the
//! registered handler; commands are encoded here and written under one
//! send lock so multi-transfer messages never interleave.

use crate::domain::models::{BdAddr, DeviceState, EirEntry, StateReason};
use crate::domain::settings::DeviceSettings;
use crate::infrastructure::btbr::codec::{encode_eir, AclPacket, BbFlags, BbHdr, CodecError, RxPacket};
use crate::infrastructure::btbr::framing::{chunk, Frame, FramingError, Reassembler};
use crate::infrastructure::btbr::protocol::{llid, Opcode, MAX_DEBUG_MESSAGE, USB_TRANSFER_SIZE};
use crate::infrastructure::btbr::transport::{TransportError, UsbTransport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("failed to start rx thread: {0}")]
    RxThread(#[from] std::io::Error),
}

/// Classified device-to-host message
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    State {
        state: DeviceState,
        reason: StateReason,
    },
    Rx(Box<RxPacket>),
}

pub type EventHandler = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Proof of registration, required to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerToken(u64);

struct Inner {
    transport: Arc<dyn UsbTransport>,
    settings: DeviceSettings,
    send_lock: Mutex<()>,
    handler: Mutex<Option<(HandlerToken, EventHandler)>>,
    next_token: AtomicU64,
    running: AtomicBool,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to one connected radio
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn UsbTransport>, settings: DeviceSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                send_lock: Mutex::new(()),
                handler: Mutex::new(None),
                next_token: AtomicU64::new(1),
                running: AtomicBool::new(false),
                rx_thread: Mutex::new(None),
            }),
        }
    }

    /// Start the receive thread, put the device in idle and let it settle
    pub fn connect(&self) -> Result<(), CommandError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Already connected");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("btbr-rx".to_string())
            .spawn(move || rx_loop(inner))
            .inspect_err(|_| self.inner.running.store(false, Ordering::SeqCst))?;
        *lock(&self.inner.rx_thread) = Some(handle);
        info!("USB connected");

        if let Err(e) = self.send_idle_cmd() {
            self.stop_rx_thread();
            return Err(e);
        }
        thread::sleep(self.inner.settings.settle());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Idle the device and stop the receive thread
    pub fn close(&self) {
        if !self.is_connected() {
            warn!("Not connected");
            return;
        }
        if let Err(e) = self.send_idle_cmd() {
            warn!("Failed to idle device on close: {}", e);
        }
        self.stop_rx_thread();
        info!("USB closed");
    }

    fn stop_rx_thread(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.rx_thread).take() {
            if handle.join().is_err() {
                error!("Rx thread panicked");
            }
        }
    }

    /// Install the single event handler
    ///
    /// Panics if a handler is already registered.
    pub fn register_handler<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let mut slot = lock(&self.inner.handler);
        assert!(slot.is_none(), "an event handler is already registered");
        let token = HandlerToken(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        *slot = Some((token, Arc::new(handler)));
        token
    }

    /// Remove the handler installed with `token`
    ///
    /// Panics if `token` does not belong to the current handler.
    pub fn unregister_handler(&self, token: HandlerToken) {
        let mut slot = lock(&self.inner.handler);
        match slot.as_ref() {
            Some((current, _)) if *current == token => *slot = None,
            _ => panic!("unregistering {:?}, which is not the current handler", token),
        }
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.inner.handler).is_some()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub fn send_cmd(&self, opcode: Opcode, payload: &[u8]) -> Result<(), CommandError> {
        let transfers = chunk(&opcode.frame(payload))?;
        let timeout = self.inner.settings.write_timeout();

        let _guard = lock(&self.inner.send_lock);
        for transfer in &transfers {
            debug_assert!(transfer.len() <= USB_TRANSFER_SIZE);
            self.inner.transport.write_bulk(transfer, timeout)?;
        }
        Ok(())
    }

    pub fn send_debug_cmd(&self, message: &[u8]) -> Result<(), CommandError> {
        let end = message.len().min(MAX_DEBUG_MESSAGE);
        self.send_cmd(Opcode::Debug, &message[..end])
    }

    pub fn send_idle_cmd(&self) -> Result<(), CommandError> {
        info!("Send idle");
        self.send_cmd(Opcode::Idle, &[])
    }

    pub fn send_reset_cmd(&self) -> Result<(), CommandError> {
        info!("Send reset");
        self.send_cmd(Opcode::Reset, &[])
    }

    pub fn send_set_freq_off_cmd(&self, offset: u8) -> Result<(), CommandError> {
        self.send_cmd(Opcode::SetFreqOffset, &[offset])
    }

    pub fn send_set_max_ac_errors_cmd(&self, max_errors: u8) -> Result<(), CommandError> {
        self.send_cmd(Opcode::SetMaxAcErrors, &[max_errors])
    }

    pub fn send_set_bdaddr_cmd(&self, bdaddr: BdAddr) -> Result<(), CommandError> {
        self.send_cmd(Opcode::SetBdaddr, &bdaddr.0.to_le_bytes())
    }

    pub fn send_inquiry_cmd(&self) -> Result<(), CommandError> {
        self.send_cmd(Opcode::Inquiry, &[])
    }

    pub fn send_inquiry_scan_cmd(&self) -> Result<(), CommandError> {
        self.send_cmd(Opcode::InquiryScan, &[])
    }

    pub fn send_paging_cmd(&self, bdaddr: BdAddr) -> Result<(), CommandError> {
        self.send_cmd(Opcode::Paging, &bdaddr.0.to_le_bytes())
    }

    pub fn send_page_scan_cmd(&self) -> Result<(), CommandError> {
        self.send_cmd(Opcode::PageScan, &[])
    }

    pub fn send_monitor_cmd(&self, bdaddr: BdAddr) -> Result<(), CommandError> {
        self.send_cmd(Opcode::Monitor, &bdaddr.0.to_le_bytes())
    }

    /// Transmit `data` on the ACL link `lt_addr`
    pub fn send_acl_cmd(
        &self,
        lt_addr: u8,
        llid: u8,
        flow: bool,
        data: &[u8],
    ) -> Result<(), CommandError> {
        let acl = AclPacket::new(llid, flow, data.to_vec())?;
        let bb_hdr = BbHdr::new(lt_addr, acl.packet_type, BbFlags::empty());
        debug!("send bb {}, acl: {}", bb_hdr, acl);

        let mut payload = bb_hdr.pack().to_vec();
        payload.extend_from_slice(&acl.pack());
        self.send_cmd(Opcode::TxAcl, &payload)
    }

    /// Set the extended inquiry response answered while inquiry-scanning
    pub fn send_set_eir_cmd(&self, entries: &[EirEntry]) -> Result<(), CommandError> {
        let acl = AclPacket::new(llid::L2CAP_START, true, encode_eir(entries))?;
        let bb_hdr = BbHdr::new(0, acl.packet_type, BbFlags::empty());
        debug!("Set eir {}, acl: {}", bb_hdr, acl);

        let mut payload = bb_hdr.pack().to_vec();
        payload.extend_from_slice(&acl.pack());
        self.send_cmd(Opcode::SetEir, &payload)
    }

    pub fn send_set_afh_cmd(&self, instant: u32, mode: u8, map: &[u8; 10]) -> Result<(), CommandError> {
        let mut payload = instant.to_le_bytes().to_vec();
        payload.push(mode);
        payload.extend_from_slice(map);
        debug!("send set afh: instant={} mode={}", instant, mode);
        self.send_cmd(Opcode::SetAfh, &payload)
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, message: &[u8]) {
        handle_message(&self.inner, message);
    }
}

fn rx_loop(inner: Arc<Inner>) {
    let mut buf = [0u8; USB_TRANSFER_SIZE];
    let mut reassembler = Reassembler::new();
    let timeout = inner.settings.read_timeout();
    info!("Rx thread started");

    while inner.running.load(Ordering::SeqCst) {
        let n = match inner.transport.read_bulk(&mut buf, timeout) {
            Ok(n) => n,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Disconnected) => {
                error!("Device disconnected, stopping rx thread");
                inner.running.store(false, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!("Bulk read failed: {}", e);
                thread::sleep(timeout);
                continue;
            }
        };

        match reassembler.push(&buf[..n]) {
            Ok(Some(Frame::Message(message))) => handle_message(&inner, &message),
            Ok(Some(Frame::Console(line))) => info!(target: "btbr::firmware", "{}", line),
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed transfer: {}", e),
        }
    }
    debug!("Rx thread stopped");
}

fn handle_message(inner: &Inner, message: &[u8]) {
    if message.len() < 4 {
        warn!("Message too short for an opcode ({} bytes)", message.len());
        return;
    }
    let value = u32::from_le_bytes([message[0], message[1], message[2], message[3]]);
    let body = &message[4..];

    let event = match Opcode::from_value(value) {
        Some(Opcode::Debug) => {
            let end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            info!(target: "btbr::console", "{}", String::from_utf8_lossy(&body[..end]));
            return;
        }
        Some(Opcode::StateResponse) => {
            if body.len() < 2 {
                warn!("State response truncated ({} bytes)", body.len());
                return;
            }
            DeviceEvent::State {
                state: DeviceState::from_raw(body[0]),
                reason: StateReason::from_raw(body[1]),
            }
        }
        Some(Opcode::RxPacket) => match RxPacket::decode(body) {
            Ok(pkt) => DeviceEvent::Rx(Box::new(pkt)),
            Err(e) => {
                warn!("Dropping rx packet: {}", e);
                return;
            }
        },
        _ => {
            warn!("No handler for message opcode {}", value);
            return;
        }
    };

    // Clone out of the slot so the handler may issue commands
    let handler = lock(&inner.handler).as_ref().map(|(_, h)| Arc::clone(h));
    match handler {
        Some(handler) => handler(event),
        None => handle_default(event),
    }
}

fn handle_default(event: DeviceEvent) {
    match event {
        DeviceEvent::State { state, reason } => {
            info!(
                "state={} reason={} lt_addr={}",
                state, reason.code, reason.lt_addr
            );
        }
        DeviceEvent::Rx(pkt) => debug!("No session for packet {}", pkt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ReasonCode;
    use crate::infrastructure::btbr::codec::RxFlags;
    use crate::infrastructure::btbr::protocol::PacketType;
    use crate::infrastructure::btbr::transport::MockTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_settings() -> DeviceSettings {
        DeviceSettings {
            read_timeout_ms: 5,
            settle_ms: 0,
            ..DeviceSettings::default()
        }
    }

    fn setup() -> (Arc<MockTransport>, Dispatcher) {
        let mock = Arc::new(MockTransport::new());
        let dispatcher = Dispatcher::new(mock.clone(), test_settings());
        (mock, dispatcher)
    }

    #[test]
    fn test_connect_sends_idle_and_close_stops() {
        let (mock, dispatcher) = setup();
        dispatcher.connect().unwrap();
        assert!(dispatcher.is_connected());
        dispatcher.close();
        assert!(!dispatcher.is_connected());

        assert_eq!(
            mock.written_messages(),
            vec![vec![21, 0, 0, 0], vec![21, 0, 0, 0]]
        );
    }

    #[test]
    fn test_failed_connect_stops_rx_thread() {
        let (mock, dispatcher) = setup();
        mock.disconnect();
        assert!(dispatcher.connect().is_err());
        assert!(!dispatcher.is_connected());
        assert!(lock(&dispatcher.inner.rx_thread).is_none());
    }

    #[test]
    fn test_state_event_reaches_handler() {
        let (mock, dispatcher) = setup();
        let (tx, rx) = mpsc::channel();
        let token = dispatcher.register_handler(move |ev| {
            let _ = tx.send(ev);
        });
        dispatcher.connect().unwrap();

        mock.push_transfer(b"Pboot\0\0".to_vec());
        mock.push_event(Opcode::StateResponse, &[3, 0x40]);

        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            ev,
            DeviceEvent::State {
                state: DeviceState::Connected,
                reason: StateReason {
                    code: ReasonCode::Success,
                    lt_addr: 2
                }
            }
        );

        dispatcher.close();
        dispatcher.unregister_handler(token);
        assert!(!dispatcher.has_handler());
    }

    #[test]
    fn test_rx_event_decoded_and_bad_message_skipped() {
        let (_mock, dispatcher) = setup();
        let (tx, rx) = mpsc::channel();
        dispatcher.register_handler(move |ev| {
            let _ = tx.send(ev);
        });

        let mut body = 7u32.to_le_bytes().to_vec();
        body.extend_from_slice(&[5, RxFlags::HAS_PKT.bits(), 2, 0]);
        body.extend_from_slice(&BbHdr::new(1, PacketType::Dm1, BbFlags::empty()).pack());
        body.extend_from_slice(&[(1 << 3) | llid::LMP, 0x4e]);

        // Declared size disagrees, dropped
        let mut bad = body.clone();
        bad.push(0);
        dispatcher.dispatch(&Opcode::RxPacket.frame(&bad));
        dispatcher.dispatch(&Opcode::RxPacket.frame(&body));
        dispatcher.dispatch(&[1, 2]);
        dispatcher.dispatch(&Opcode::Debug.frame(b"hi\0"));

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            DeviceEvent::Rx(pkt) => {
                assert_eq!(pkt.clkn, 7);
                assert_eq!(pkt.channel, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_register_panics() {
        let (_mock, dispatcher) = setup();
        dispatcher.register_handler(|_| {});
        dispatcher.register_handler(|_| {});
    }

    #[test]
    #[should_panic(expected = "not the current handler")]
    fn test_unregister_wrong_token_panics() {
        let (_mock, dispatcher) = setup();
        let first = dispatcher.register_handler(|_| {});
        dispatcher.unregister_handler(first);
        let _second = dispatcher.register_handler(|_| {});
        dispatcher.unregister_handler(first);
    }

    #[test]
    fn test_register_unregister_alternate() {
        let (_mock, dispatcher) = setup();
        for _ in 0..3 {
            let token = dispatcher.register_handler(|_| {});
            assert!(dispatcher.has_handler());
            dispatcher.unregister_handler(token);
            assert!(!dispatcher.has_handler());
        }
    }

    #[test]
    fn test_command_encodings() {
        let (mock, dispatcher) = setup();
        let addr = BdAddr(0x0011_2233_4455);

        dispatcher.send_set_freq_off_cmd(0x21).unwrap();
        dispatcher.send_paging_cmd(addr).unwrap();
        dispatcher.send_set_afh_cmd(0x100, 1, &[0xff; 10]).unwrap();
        dispatcher.send_acl_cmd(2, llid::LMP, true, &[0x4e, 0x01]).unwrap();
        dispatcher.send_debug_cmd(&[b'x'; 300]).unwrap();

        let msgs = mock.written_messages();
        assert_eq!(msgs[0], vec![22, 0, 0, 0, 0x21]);
        assert_eq!(
            msgs[1],
            vec![25, 0, 0, 0, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0, 0]
        );

        let mut afh = vec![31, 0, 0, 0, 0x00, 0x01, 0, 0, 1];
        afh.extend_from_slice(&[0xff; 10]);
        assert_eq!(msgs[2], afh);

        assert_eq!(
            msgs[3],
            vec![27, 0, 0, 0, 2, PacketType::Dm1 as u8, 0, 0, (2 << 3) | (1 << 2) | llid::LMP, 0x4e, 0x01]
        );

        assert_eq!(msgs[4].len(), 4 + MAX_DEBUG_MESSAGE);
    }

    #[test]
    fn test_set_eir_uses_lt_addr_zero() {
        let (mock, dispatcher) = setup();
        let entries = vec![EirEntry {
            tag: 9,
            data: b"ab".to_vec(),
        }];
        dispatcher.send_set_eir_cmd(&entries).unwrap();

        let msg = &mock.written_messages()[0];
        assert_eq!(&msg[..4], &[30, 0, 0, 0]);
        assert_eq!(msg[4], 0);
        assert_eq!(msg[5], PacketType::Dm1 as u8);
        assert_eq!(msg[8], (4 << 3) | (1 << 2) | llid::L2CAP_START);
        assert_eq!(&msg[9..], &[3, 9, b'a', b'b']);
    }

    #[test]
    fn test_large_acl_spans_transfers_atomically() {
        let (mock, dispatcher) = setup();
        dispatcher.send_acl_cmd(1, llid::L2CAP_START, true, &[0xaa; 200]).unwrap();
        let transfers = mock.written_transfers();
        assert_eq!(transfers[0][0], b'S');
        assert!(transfers[1..].iter().all(|t| t[0] == b'C'));
        assert_eq!(mock.written_messages().len(), 1);
    }
}
