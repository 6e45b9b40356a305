//! USB Message Framing
//!
//! Messages travel over bulk transfers of at most 64 bytes. The first
//! transfer carries `'S'`, a reserved byte and the u16 LE total length;
//! the rest of the message follows in `'C'` transfers. `'P'` transfers are
//! standalone console lines and may appear between the pieces of a message.

use crate::infrastructure::btbr::protocol::{
    CONTINUATION_HEADER_LEN, START_HEADER_LEN, TAG_CONTINUATION, TAG_PRINT, TAG_START,
    USB_TRANSFER_SIZE,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("message of {0} bytes does not fit the 16-bit length field")]
    MessageTooLarge(usize),
    #[error("empty transfer")]
    EmptyTransfer,
    #[error("start transfer too short ({0} bytes)")]
    TruncatedStart(usize),
    #[error("transfer of {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("continuation without a message in progress")]
    UnexpectedContinuation,
    #[error("unknown transfer tag 0x{0:02x}")]
    UnknownTag(u8),
}

/// A complete unit recovered from the transfer stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    Console(String),
}

/// Split `message` into the transfers that carry it
pub fn chunk(message: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
    let total = u16::try_from(message.len()).map_err(|_| FramingError::MessageTooLarge(message.len()))?;

    let first_len = message.len().min(USB_TRANSFER_SIZE - START_HEADER_LEN);
    let mut first = Vec::with_capacity(START_HEADER_LEN + first_len);
    first.push(TAG_START);
    first.push(0);
    first.extend_from_slice(&total.to_le_bytes());
    first.extend_from_slice(&message[..first_len]);

    let mut transfers = vec![first];
    for piece in message[first_len..].chunks(USB_TRANSFER_SIZE - CONTINUATION_HEADER_LEN) {
        let mut transfer = Vec::with_capacity(CONTINUATION_HEADER_LEN + piece.len());
        transfer.push(TAG_CONTINUATION);
        transfer.extend_from_slice(piece);
        transfers.push(transfer);
    }
    Ok(transfers)
}

#[derive(Debug)]
struct Partial {
    expected: usize,
    buf: Vec<u8>,
}

/// Incremental reassembly of received transfers
///
/// Any error discards the message in progress; the next `'S'` transfer
/// starts over.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    pub fn push(&mut self, transfer: &[u8]) -> Result<Option<Frame>, FramingError> {
        let Some(&tag) = transfer.first() else {
            return Err(FramingError::EmptyTransfer);
        };

        match tag {
            TAG_PRINT => {
                let line = &transfer[1..];
                let end = line.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Ok(Some(Frame::Console(
                    String::from_utf8_lossy(&line[..end]).into_owned(),
                )))
            }
            TAG_START => {
                self.partial = None;
                if transfer.len() < START_HEADER_LEN {
                    return Err(FramingError::TruncatedStart(transfer.len()));
                }
                let size = u16::from_le_bytes([transfer[2], transfer[3]]) as usize;
                let expected = USB_TRANSFER_SIZE.min(START_HEADER_LEN + size);
                if transfer.len() != expected {
                    return Err(FramingError::LengthMismatch {
                        expected,
                        actual: transfer.len(),
                    });
                }
                let partial = Partial {
                    expected: size,
                    buf: transfer[START_HEADER_LEN..].to_vec(),
                };
                Ok(self.complete_or_store(partial))
            }
            TAG_CONTINUATION => {
                let mut partial = self
                    .partial
                    .take()
                    .ok_or(FramingError::UnexpectedContinuation)?;
                let remaining = partial.expected - partial.buf.len();
                let expected = USB_TRANSFER_SIZE.min(CONTINUATION_HEADER_LEN + remaining);
                if transfer.len() != expected {
                    return Err(FramingError::LengthMismatch {
                        expected,
                        actual: transfer.len(),
                    });
                }
                partial.buf.extend_from_slice(&transfer[CONTINUATION_HEADER_LEN..]);
                Ok(self.complete_or_store(partial))
            }
            other => Err(FramingError::UnknownTag(other)),
        }
    }

    fn complete_or_store(&mut self, partial: Partial) -> Option<Frame> {
        if partial.buf.len() >= partial.expected {
            Some(Frame::Message(partial.buf))
        } else {
            self.partial = Some(partial);
            None
        }
    }
}
