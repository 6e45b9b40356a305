//! USB Transport
//!
//! Bulk IN/OUT pipe abstraction with a libusb implementation for the real
//! radio and an in-memory mock for tests.

use crate::domain::settings::DeviceSettings;
use crate::infrastructure::btbr::framing::{chunk, Frame, Reassembler};
use crate::infrastructure::btbr::protocol::Opcode;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("no device {vendor_id:04x}:{product_id:04x} found")]
    NotFound { vendor_id: u16, product_id: u16 },
    #[error("device disconnected")]
    Disconnected,
    #[error("USB error: {0}")]
    Usb(rusb::Error),
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => Self::Timeout,
            rusb::Error::NoDevice => Self::Disconnected,
            other => Self::Usb(other),
        }
    }
}

/// Bulk pipe pair to the radio
///
/// A read returns at most one transfer.
pub trait UsbTransport: Send + Sync {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;
}

/// libusb-backed transport
pub struct RusbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl RusbTransport {
    pub fn open(settings: &DeviceSettings) -> Result<Self, TransportError> {
        let mut handle = rusb::open_device_with_vid_pid(settings.vendor_id, settings.product_id)
            .ok_or(TransportError::NotFound {
                vendor_id: settings.vendor_id,
                product_id: settings.product_id,
            })?;

        // Not supported on every platform
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            tracing::debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle.claim_interface(settings.interface)?;

        tracing::info!(
            "Opened {:04x}:{:04x} (in 0x{:02x}, out 0x{:02x})",
            settings.vendor_id,
            settings.product_id,
            settings.endpoint_in,
            settings.endpoint_out
        );

        Ok(Self {
            handle,
            interface: settings.interface,
            endpoint_in: settings.endpoint_in,
            endpoint_out: settings.endpoint_out,
        })
    }
}

impl UsbTransport for RusbTransport {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.read_bulk(self.endpoint_in, buf, timeout)?)
    }

    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.write_bulk(self.endpoint_out, data, timeout)?)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            tracing::debug!("Failed to release interface {}: {}", self.interface, e);
        }
    }
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    disconnected: bool,
}

/// In-memory transport: queued inbound transfers, recorded outbound ones
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    cond: Condvar,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one raw inbound transfer
    pub fn push_transfer(&self, transfer: Vec<u8>) {
        let mut state = self.lock();
        state.inbound.push_back(transfer);
        self.cond.notify_all();
    }

    /// Queue a complete message, chunked the way the device would send it
    pub fn push_message(&self, message: &[u8]) {
        let transfers = chunk(message).unwrap_or_default();
        let mut state = self.lock();
        state.inbound.extend(transfers);
        self.cond.notify_all();
    }

    pub fn push_event(&self, opcode: Opcode, body: &[u8]) {
        self.push_message(&opcode.frame(body));
    }

    /// Make every further read and write fail as if unplugged
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnected = true;
        self.cond.notify_all();
    }

    pub fn written_transfers(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Outbound transfers joined back into messages
    pub fn written_messages(&self) -> Vec<Vec<u8>> {
        join_messages(&self.lock().written)
    }

    /// Block until at least `count` messages were written or `timeout` passes
    pub fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let messages = join_messages(&state.written);
            let now = Instant::now();
            if messages.len() >= count || now >= deadline {
                return messages;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn join_messages(transfers: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut reassembler = Reassembler::new();
    transfers
        .iter()
        .filter_map(|t| match reassembler.push(t) {
            Ok(Some(Frame::Message(m))) => Some(m),
            _ => None,
        })
        .collect()
}

impl UsbTransport for MockTransport {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.disconnected {
                return Err(TransportError::Disconnected);
            }
            if let Some(transfer) = state.inbound.pop_front() {
                let n = transfer.len().min(buf.len());
                buf[..n].copy_from_slice(&transfer[..n]);
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn write_bulk(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.written.push(data.to_vec());
        self.cond.notify_all();
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_read_times_out_when_empty() {
        let mock = MockTransport::new();
        let mut buf = [0u8; 64];
        assert!(matches!(
            mock.read_bulk(&mut buf, Duration::from_millis(10)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_mock_delivers_chunked_message() {
        let mock = MockTransport::new();
        mock.push_message(&[0x55; 70]);
        let mut buf = [0u8; 64];
        assert_eq!(mock.read_bulk(&mut buf, Duration::from_millis(10)).unwrap(), 64);
        assert_eq!(buf[0], b'S');
        assert_eq!(mock.read_bulk(&mut buf, Duration::from_millis(10)).unwrap(), 11);
        assert_eq!(buf[0], b'C');
    }

    #[test]
    fn test_mock_records_writes() {
        let mock = MockTransport::new();
        for t in chunk(&Opcode::Idle.frame(&[])).unwrap() {
            mock.write_bulk(&t, Duration::from_millis(10)).unwrap();
        }
        assert_eq!(mock.written_messages(), vec![vec![21, 0, 0, 0]]);
        assert_eq!(mock.wait_for_messages(1, Duration::from_millis(1)).len(), 1);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        let mut buf = [0u8; 64];
        assert!(matches!(
            mock.read_bulk(&mut buf, Duration::from_millis(10)),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            mock.write_bulk(&[1], Duration::from_millis(10)),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_rusb_timeout_maps_to_timeout() {
        assert!(matches!(
            TransportError::from(rusb::Error::Timeout),
            TransportError::Timeout
        ));
        assert!(matches!(
            TransportError::from(rusb::Error::Pipe),
            TransportError::Usb(rusb::Error::Pipe)
        ));
    }
}
