//! Ubertooth BR/EDR Host
//!
//! Drives the btbr firmware over its USB bulk pipe.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Sessions                           │
//! │  inquiry │ inquiry-scan │ paging │ page-scan │ monitor   │
//! │               discoverable (composite)                   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ handler slot / commands
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Dispatcher                          │
//! │  (rx thread, message classification, command encoding)   │
//! └──────────┬──────────────────────────────┬───────────────┘
//!            │                              │
//!            ▼                              ▼
//! ┌───────────────────┐          ┌────────────────────┐
//! │  Framing          │          │  Codec             │
//! │ - 64-byte chunks  │          │ - BBHdr / ACL / FHS│
//! │ - reassembly      │          │ - CRC-16, EIR      │
//! └─────────┬─────────┘          └────────────────────┘
//!           ▼
//! ┌───────────────────┐
//! │  Transport (USB)  │
//! └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Opcodes, packet types and wire constants
//! - [`codec`] - Baseband packet encoding and decoding
//! - [`framing`] - USB transfer chunking and message reassembly
//! - [`transport`] - Bulk transport over rusb, plus an in-memory mock
//! - [`dispatcher`] - Receive loop and device commands
//! - [`lmp`] - Link Manager Protocol engine
//! - [`session`] - Device sessions

pub mod codec;
pub mod dispatcher;
pub mod framing;
pub mod lmp;
pub mod protocol;
pub mod session;
pub mod transport;

pub use dispatcher::Dispatcher;
