//! Baseband Packet Codec
//!
//! Pure encode/decode of the structures exchanged with the radio: the
//! baseband header, ACL payloads, FHS packets, EIR field lists, and the
//! received-packet envelope. Also hosts the payload CRC-16 used to
//! re-validate packets the device could not check itself.

use crate::domain::models::{BdAddr, EirEntry};
use crate::infrastructure::btbr::protocol::{acl_type_find, acl_type_for_size, PacketType};
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("baseband header needs 4 bytes, got {0}")]
    MalformedHeader(usize),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("rx envelope truncated ({0} bytes)")]
    TruncatedEnvelope(usize),
    #[error("rx envelope declares {declared} data bytes but carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("FHS payload must be 18 bytes, got {0}")]
    BadFhsLength(usize),
    #[error("payload of {0} bytes does not fit any ACL packet type")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// CRC-16
// ---------------------------------------------------------------------------

/// CCITT polynomial x^16 + x^12 + x^5 + 1, bit-reversed
const CRC_POLY: u16 = 0x8408;

/// Trailing CRC bytes of every ACL payload
pub const CRC_LEN: usize = 2;

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_reverse_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut v = i as u8;
        let mut r = 0u8;
        let mut bit = 0;
        while bit < 8 {
            r = (r << 1) | (v & 1);
            v >>= 1;
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_crc_table();
static REVERSE_TABLE: [u8; 256] = build_reverse_table();

/// Full 8-bit bit reversal
pub fn reverse_bits(byte: u8) -> u8 {
    REVERSE_TABLE[byte as usize]
}

/// Initial CRC register for a link whose master has the given UAP
pub fn crc_seed(uap: u8) -> u16 {
    (reverse_bits(uap) as u16) << 8
}

/// Table-driven CRC-16 over `data`, starting from register `seed`
pub fn crc16(data: &[u8], seed: u16) -> u16 {
    data.iter().fold(seed, |crc, &b| {
        (crc >> 8) ^ CRC_TABLE[((b as u16 ^ crc) & 0xff) as usize]
    })
}

// ---------------------------------------------------------------------------
// Baseband header
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BbFlags: u8 {
        const FLOW = 1 << 0;
        const ARQN = 1 << 1;
        const SEQN = 1 << 2;
    }
}

/// Baseband packet header as exchanged with the firmware (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbHdr {
    pub lt_addr: u8,
    /// Raw baseband type, see [`PacketType`]
    pub packet_type: u8,
    pub flags: BbFlags,
    /// Header error check, advisory only
    pub hec: u8,
}

impl BbHdr {
    pub const SIZE: usize = 4;

    pub fn new(lt_addr: u8, packet_type: PacketType, flags: BbFlags) -> Self {
        Self {
            lt_addr,
            packet_type: packet_type as u8,
            flags,
            hec: 0,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::SIZE {
            return Err(CodecError::MalformedHeader(bytes.len()));
        }
        Ok(Self {
            lt_addr: bytes[0],
            packet_type: bytes[1],
            flags: BbFlags::from_bits_retain(bytes[2]),
            hec: bytes[3],
        })
    }

    pub fn pack(&self) -> [u8; 4] {
        [self.lt_addr, self.packet_type, self.flags.bits(), self.hec]
    }

    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_raw(self.packet_type)
    }

    /// Flags as letters: F(low), A(RQN), S(EQN)
    pub fn flag_str(&self) -> String {
        let mut s = String::new();
        if self.flags.contains(BbFlags::FLOW) {
            s.push('F');
        }
        if self.flags.contains(BbFlags::ARQN) {
            s.push('A');
        }
        if self.flags.contains(BbFlags::SEQN) {
            s.push('S');
        }
        s
    }
}

impl fmt::Display for BbHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(t) => write!(
                f,
                "BBHdr(lt_addr={}, type={}, flags={})",
                self.lt_addr,
                t.name(),
                self.flag_str()
            ),
            None => write!(
                f,
                "BBHdr(lt_addr={}, type={}, flags={})",
                self.lt_addr,
                self.packet_type,
                self.flag_str()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ACL
// ---------------------------------------------------------------------------

/// ACL payload: payload header fields, user data and the resolved packet type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub llid: u8,
    pub flow: bool,
    pub data: Vec<u8>,
    pub packet_type: PacketType,
    pub header_len: usize,
    pub max_payload: usize,
    /// Length declared in the payload header
    pub declared_len: usize,
    /// Payload exactly as received: header, data and trailing CRC
    pub raw_data: Vec<u8>,
    /// Wire length implied by the declared size: header + data + CRC
    pub raw_size: usize,
}

impl AclPacket {
    /// Build an outgoing packet, choosing the smallest type that fits `data`
    pub fn new(llid: u8, flow: bool, data: Vec<u8>) -> Result<Self, CodecError> {
        let info = acl_type_for_size(data.len()).ok_or(CodecError::PayloadTooLarge(data.len()))?;
        Ok(Self {
            llid,
            flow,
            declared_len: data.len(),
            raw_size: info.header_len + data.len() + CRC_LEN,
            raw_data: Vec::new(),
            data,
            packet_type: info.packet_type,
            header_len: info.header_len,
            max_payload: info.max_payload,
        })
    }

    /// Decode the payload of a packet of baseband type `raw_type`
    ///
    /// A payload shorter than the type's header is treated as an empty packet.
    pub fn decode(raw_type: u8, bytes: &[u8]) -> Result<Self, CodecError> {
        let info = acl_type_find(raw_type).ok_or(CodecError::UnknownPacketType(raw_type))?;
        let hlen = info.header_len;

        let hdr: u16 = if bytes.len() < hlen {
            0
        } else if hlen == 1 {
            bytes[0] as u16
        } else {
            u16::from_le_bytes([bytes[0], bytes[1]])
        };
        let declared_len = ((hdr >> 3) & 0x3ff) as usize;
        let data = bytes.get(hlen..).map(<[u8]>::to_vec).unwrap_or_default();

        Ok(Self {
            llid: (hdr & 3) as u8,
            flow: (hdr >> 2) & 1 != 0,
            data,
            packet_type: info.packet_type,
            header_len: hlen,
            max_payload: info.max_payload,
            declared_len,
            raw_data: bytes.to_vec(),
            raw_size: hlen + declared_len + CRC_LEN,
        })
    }

    /// Payload header followed by the data
    pub fn pack(&self) -> Vec<u8> {
        let hdr = ((self.data.len() as u16) << 3) | ((self.flow as u16) << 2) | (self.llid as u16 & 3);
        let mut out = Vec::with_capacity(self.header_len + self.data.len());
        if self.header_len == 1 {
            out.push(hdr as u8);
        } else {
            out.extend_from_slice(&hdr.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Check the trailing CRC of the raw payload against the link's UAP
    ///
    /// Returns the user data on a match.
    pub fn validate_raw(&self, uap: u8) -> Option<Vec<u8>> {
        if self.raw_size > self.raw_data.len() || self.declared_len > self.max_payload {
            return None;
        }
        let crc_at = self.raw_size - CRC_LEN;
        let expected = u16::from_le_bytes([self.raw_data[crc_at], self.raw_data[crc_at + 1]]);
        if crc16(&self.raw_data[..crc_at], crc_seed(uap)) != expected {
            return None;
        }
        Some(self.raw_data[self.header_len..crc_at].to_vec())
    }
}

impl fmt::Display for AclPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let llid = crate::infrastructure::btbr::protocol::llid::name(self.llid)
            .map(str::to_string)
            .unwrap_or_else(|| self.llid.to_string());
        write!(
            f,
            "ACL(llid={}, flow={}, len={}): {}",
            llid,
            self.flow as u8,
            self.data.len(),
            hex(&self.data)
        )
    }
}

// ---------------------------------------------------------------------------
// FHS
// ---------------------------------------------------------------------------

pub const FHS_PAYLOAD_LEN: usize = 18;

/// Frequency Hop Synchronization payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FhsPacket {
    /// 34-bit parity word
    pub parity: u64,
    pub bdaddr: BdAddr,
    /// 24-bit class of device
    pub class_of_device: u32,
    pub lt_addr: u8,
    /// Bits 27..2 of the sender's native clock, a 26-bit field (max 0x3ffffff)
    pub clk27_2: u32,
    pub page_scan_mode: u8,
}

impl FhsPacket {
    pub fn decode(d: &[u8; FHS_PAYLOAD_LEN]) -> Self {
        let b = |i: usize| d[i] as u64;

        let parity = 0x3_ffff_ffff & (b(0) | b(1) << 8 | b(2) << 16 | b(3) << 24 | (b(4) & 3) << 32);
        let lap = (b(4) >> 2) | b(5) << 6 | b(6) << 14 | (b(7) & 3) << 22;
        let uap = b(8);
        let nap = b(9) | b(10) << 8;
        let class_of_device = (b(11) | b(12) << 8 | b(13) << 16) as u32;
        let lt_addr = d[14] & 7;
        let clk27_2 = ((b(14) >> 3) | b(15) << 5 | b(16) << 13 | (b(17) & 0x1f) << 21) as u32;

        Self {
            parity,
            bdaddr: BdAddr(lap | uap << 24 | nap << 32),
            class_of_device,
            lt_addr,
            clk27_2,
            page_scan_mode: d[17] >> 5,
        }
    }

    pub fn pack(&self) -> [u8; FHS_PAYLOAD_LEN] {
        let lap = self.bdaddr.lap();
        let nap = self.bdaddr.nap();
        let clk = self.clk27_2;
        let mut d = [0u8; FHS_PAYLOAD_LEN];

        d[..4].copy_from_slice(&(self.parity as u32).to_le_bytes());
        d[4] = ((self.parity >> 32) & 3) as u8 | ((lap & 0x3f) << 2) as u8;
        d[5] = (lap >> 6) as u8;
        d[6] = (lap >> 14) as u8;
        d[7] = ((lap >> 22) & 3) as u8;
        d[8] = self.bdaddr.uap();
        d[9..11].copy_from_slice(&nap.to_le_bytes());
        d[11..14].copy_from_slice(&self.class_of_device.to_le_bytes()[..3]);
        d[14] = (self.lt_addr & 7) | ((clk & 0x1f) << 3) as u8;
        d[15] = (clk >> 5) as u8;
        d[16] = (clk >> 13) as u8;
        d[17] = ((clk >> 21) & 0x1f) as u8 | (self.page_scan_mode << 5);
        d
    }
}

impl fmt::Display for FhsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FHS: bdaddr={} parity={:x} cls={:06x} ltaddr={} clk={:x}",
            self.bdaddr, self.parity, self.class_of_device, self.lt_addr, self.clk27_2
        )
    }
}

// ---------------------------------------------------------------------------
// EIR
// ---------------------------------------------------------------------------

pub mod eir_tag {
    pub const FLAGS: u8 = 1;
    pub const INCOMPLETE_U16_LIST: u8 = 2;
    pub const COMPLETE_U16_LIST: u8 = 3;
    pub const INCOMPLETE_U32_LIST: u8 = 4;
    pub const COMPLETE_U32_LIST: u8 = 5;
    pub const INCOMPLETE_U128_LIST: u8 = 6;
    pub const COMPLETE_U128_LIST: u8 = 7;
    pub const SHORTENED_LOCAL_NAME: u8 = 8;
    pub const COMPLETE_LOCAL_NAME: u8 = 9;

    pub fn name(tag: u8) -> Option<&'static str> {
        Some(match tag {
            FLAGS => "FLAGS",
            INCOMPLETE_U16_LIST => "INCOMPLETE_U16_LIST",
            COMPLETE_U16_LIST => "COMPLETE_U16_LIST",
            INCOMPLETE_U32_LIST => "INCOMPLETE_U32_LIST",
            COMPLETE_U32_LIST => "COMPLETE_U32_LIST",
            INCOMPLETE_U128_LIST => "INCOMPLETE_U128_LIST",
            COMPLETE_U128_LIST => "COMPLETE_U128_LIST",
            SHORTENED_LOCAL_NAME => "SHORTENED_LOCAL_NAME",
            COMPLETE_LOCAL_NAME => "COMPLETE_LOCAL_NAME",
            _ => return None,
        })
    }
}

/// Decode a length-prefixed EIR field list
///
/// Stops at the first entry whose declared length overruns the buffer and
/// reports `false` along with the entries decoded so far. A zero length byte
/// ends the significant part.
pub fn decode_eir(bytes: &[u8]) -> (Vec<EirEntry>, bool) {
    let mut entries = Vec::new();
    let mut rest = bytes;

    while let Some(&len) = rest.first() {
        if len == 0 {
            break;
        }
        let len = len as usize;
        if rest.len() < 1 + len {
            return (entries, false);
        }
        entries.push(EirEntry {
            tag: rest[1],
            data: rest[2..1 + len].to_vec(),
        });
        rest = &rest[1 + len..];
    }
    (entries, true)
}

pub fn encode_eir(entries: &[EirEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.push((entry.data.len() + 1) as u8);
        out.push(entry.tag);
        out.extend_from_slice(&entry.data);
    }
    out
}

/// Field list advertising a local name, shortened when it would not fit one entry
pub fn eir_for_local_name(name: &str) -> Vec<EirEntry> {
    const MAX_FIELD_DATA: usize = 254;
    let bytes = name.as_bytes();
    if bytes.len() > MAX_FIELD_DATA {
        vec![EirEntry {
            tag: eir_tag::SHORTENED_LOCAL_NAME,
            data: bytes[..MAX_FIELD_DATA].to_vec(),
        }]
    } else {
        vec![EirEntry {
            tag: eir_tag::COMPLETE_LOCAL_NAME,
            data: bytes.to_vec(),
        }]
    }
}

pub fn eir_to_string(entries: &[EirEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let name = eir_tag::name(e.tag)
                .map(str::to_string)
                .unwrap_or_else(|| format!("0x{:x}", e.tag));
            let value = match e.tag {
                eir_tag::SHORTENED_LOCAL_NAME | eir_tag::COMPLETE_LOCAL_NAME => {
                    format!("'{}'", String::from_utf8_lossy(&e.data))
                }
                _ => e.data.iter().map(|b| format!("{:02x}", b)).collect(),
            };
            format!("{}: {}", name, value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Rx envelope
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxFlags: u8 {
        const HAS_PKT = 1 << 0;
        const HAS_HDR = 1 << 1;
        const HAS_CRC = 1 << 2;
        const GOOD_CRC = 1 << 3;
    }
}

/// Type-dependent payload of a received packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxPayload {
    /// NULL / POLL carry nothing
    Empty,
    Fhs(FhsPacket),
    Acl(AclPacket),
}

/// Baseband receive event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Native clock sampled at start of rx
    pub clkn: u32,
    pub channel: u8,
    pub flags: RxFlags,
    pub bb_hdr: BbHdr,
    pub payload: RxPayload,
}

impl RxPacket {
    /// clkn u32, chan u8, flags u8, data_size u16, BBHdr
    pub const HEADER_LEN: usize = 8 + BbHdr::SIZE;

    pub fn decode(msg: &[u8]) -> Result<Self, CodecError> {
        if msg.len() < Self::HEADER_LEN {
            return Err(CodecError::TruncatedEnvelope(msg.len()));
        }
        let clkn = u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]);
        let channel = msg[4];
        let flags = RxFlags::from_bits_retain(msg[5]);
        let declared = u16::from_le_bytes([msg[6], msg[7]]) as usize;
        let bb_hdr = BbHdr::decode(&msg[8..Self::HEADER_LEN])?;
        let data = &msg[Self::HEADER_LEN..];

        if declared != data.len() {
            return Err(CodecError::SizeMismatch {
                declared,
                actual: data.len(),
            });
        }

        let payload = match bb_hdr.kind() {
            Some(PacketType::Null) | Some(PacketType::Poll) => RxPayload::Empty,
            Some(PacketType::Fhs) => {
                let fhs: &[u8; FHS_PAYLOAD_LEN] = data
                    .try_into()
                    .map_err(|_| CodecError::BadFhsLength(data.len()))?;
                RxPayload::Fhs(FhsPacket::decode(fhs))
            }
            _ => RxPayload::Acl(AclPacket::decode(bb_hdr.packet_type, data)?),
        };

        Ok(Self {
            clkn,
            channel,
            flags,
            bb_hdr,
            payload,
        })
    }

    /// Inverse of [`RxPacket::decode`], as the firmware would emit it
    pub fn pack(&self) -> Vec<u8> {
        let data = match &self.payload {
            RxPayload::Empty => Vec::new(),
            RxPayload::Fhs(fhs) => fhs.pack().to_vec(),
            RxPayload::Acl(acl) if !acl.raw_data.is_empty() => acl.raw_data.clone(),
            RxPayload::Acl(acl) => acl.pack(),
        };
        let mut out = Vec::with_capacity(Self::HEADER_LEN + data.len());
        out.extend_from_slice(&self.clkn.to_le_bytes());
        out.push(self.channel);
        out.push(self.flags.bits());
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.bb_hdr.pack());
        out.extend_from_slice(&data);
        out
    }

    /// The device flagged a CRC-protected payload but could not validate it
    pub fn is_raw(&self) -> bool {
        self.flags.contains(RxFlags::HAS_CRC) && !self.flags.contains(RxFlags::GOOD_CRC)
    }
}

impl fmt::Display for RxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RX(clkn={}, chan={}):\n  {}", self.clkn, self.channel, self.bb_hdr)?;
        match &self.payload {
            RxPayload::Empty => Ok(()),
            RxPayload::Fhs(fhs) => write!(f, "\n    {}", fhs),
            RxPayload::Acl(acl) => write!(f, "\n    {}", acl),
        }
    }
}

/// Space separated hex bytes
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Multi-line dump with offsets, 16 bytes per row
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, row)| format!("{:04x}: {}", i * 16, hex(row)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::btbr::protocol::llid;
    use proptest::prelude::*;

    /// Bit-serial reference of the same CRC
    fn crc16_reference(data: &[u8], seed: u16) -> u16 {
        let mut crc = seed;
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC_POLY
                } else {
                    crc >> 1
                };
            }
        }
        crc
    }

    #[test]
    fn test_reverse_bits_values() {
        assert_eq!(reverse_bits(0x01), 0x80);
        assert_eq!(reverse_bits(0x0f), 0xf0);
        assert_eq!(reverse_bits(0x47), 0xe2);
        for x in 0..=255u8 {
            assert_eq!(reverse_bits(x), x.reverse_bits());
            assert_eq!(reverse_bits(reverse_bits(x)), x);
        }
    }

    #[test]
    fn test_crc_seed_uses_reversed_uap() {
        assert_eq!(crc_seed(0x00), 0x0000);
        assert_eq!(crc_seed(0x01), 0x8000);
        assert_eq!(crc_seed(0x47), 0xe200);
    }

    #[test]
    fn test_crc16_empty_is_seed() {
        assert_eq!(crc16(&[], 0x1234), 0x1234);
    }

    proptest! {
        #[test]
        fn prop_crc16_matches_reference(data in proptest::collection::vec(any::<u8>(), 0..400), seed in any::<u16>()) {
            prop_assert_eq!(crc16(&data, seed), crc16_reference(&data, seed));
            prop_assert_eq!(crc16(&data, seed), crc16(&data, seed));
        }

        #[test]
        fn prop_reverse_bits_is_involution(x in any::<u8>()) {
            prop_assert_eq!(reverse_bits(reverse_bits(x)), x);
        }
    }

    #[test]
    fn test_bbhdr_decode_and_display() {
        let hdr = BbHdr::decode(&[2, 3, 0x05, 0x9a]).unwrap();
        assert_eq!(hdr.lt_addr, 2);
        assert_eq!(hdr.kind(), Some(PacketType::Dm1));
        assert_eq!(hdr.flag_str(), "FS");
        assert_eq!(hdr.hec, 0x9a);
        assert_eq!(hdr.pack(), [2, 3, 0x05, 0x9a]);
        assert_eq!(hdr.to_string(), "BBHdr(lt_addr=2, type=DM1, flags=FS)");

        assert_eq!(BbHdr::decode(&[1, 2, 3]), Err(CodecError::MalformedHeader(3)));
    }

    #[test]
    fn test_acl_decode_one_byte_header() {
        // len=3, flow=1, llid=LMP
        let hdr = (3 << 3) | (1 << 2) | llid::LMP;
        let acl = AclPacket::decode(PacketType::Dm1 as u8, &[hdr, 0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(acl.llid, llid::LMP);
        assert!(acl.flow);
        assert_eq!(acl.declared_len, 3);
        assert_eq!(acl.data, vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(acl.header_len, 1);
        assert_eq!(acl.raw_size, 1 + 3 + CRC_LEN);
    }

    #[test]
    fn test_acl_decode_two_byte_header() {
        let payload = vec![0x11; 100];
        let hdr: u16 = (100 << 3) | llid::L2CAP_START as u16;
        let mut bytes = hdr.to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);

        let acl = AclPacket::decode(PacketType::Dh3 as u8, &bytes).unwrap();
        assert_eq!(acl.llid, llid::L2CAP_START);
        assert!(!acl.flow);
        assert_eq!(acl.declared_len, 100);
        assert_eq!(acl.data, payload);
        assert_eq!(acl.header_len, 2);
    }

    #[test]
    fn test_acl_decode_short_input_is_empty_packet() {
        let acl = AclPacket::decode(PacketType::Dm3 as u8, &[0x42]).unwrap();
        assert_eq!(acl.llid, 0);
        assert!(!acl.flow);
        assert_eq!(acl.declared_len, 0);
        assert!(acl.data.is_empty());

        let acl = AclPacket::decode(PacketType::Dh1 as u8, &[]).unwrap();
        assert!(acl.data.is_empty());
    }

    #[test]
    fn test_acl_decode_unknown_type() {
        assert_eq!(
            AclPacket::decode(5, &[0, 0]),
            Err(CodecError::UnknownPacketType(5))
        );
    }

    #[test]
    fn test_acl_pack_picks_type_for_size() {
        let acl = AclPacket::new(llid::LMP, true, vec![0; 17]).unwrap();
        assert_eq!(acl.packet_type, PacketType::Dm1);
        let packed = acl.pack();
        assert_eq!(packed[0], (17 << 3) | (1 << 2) | llid::LMP);
        assert_eq!(packed.len(), 18);

        let acl = AclPacket::new(llid::L2CAP_START, false, vec![0; 200]).unwrap();
        assert_eq!(acl.packet_type, PacketType::Dm5);
        let packed = acl.pack();
        assert_eq!(u16::from_le_bytes([packed[0], packed[1]]), (200 << 3) | 2);

        assert_eq!(
            AclPacket::new(llid::LMP, true, vec![0; 340]),
            Err(CodecError::PayloadTooLarge(340))
        );
    }

    fn raw_payload(uap: u8, llid: u8, data: &[u8], max: usize) -> Vec<u8> {
        let mut raw = vec![((data.len() as u8) << 3) | (1 << 2) | llid];
        raw.extend_from_slice(data);
        let crc = crc16(&raw, crc_seed(uap));
        raw.extend_from_slice(&crc.to_le_bytes());
        // raw receptions carry the type's full payload capacity
        raw.resize(max, 0x55);
        raw
    }

    #[test]
    fn test_validate_raw_accepts_matching_crc() {
        let data = [0x4e, 0x01, 0x02, 0x03];
        let raw = raw_payload(0x47, llid::LMP, &data, 1 + 17 + CRC_LEN);
        let acl = AclPacket::decode(PacketType::Dm1 as u8, &raw).unwrap();
        assert_eq!(acl.validate_raw(0x47), Some(data.to_vec()));
        assert_eq!(acl.validate_raw(0x46), None);
    }

    #[test]
    fn test_validate_raw_rejects_overrun() {
        // Declares 17 bytes but carries 4
        let acl = AclPacket::decode(PacketType::Dm1 as u8, &[(17 << 3) | 3, 1, 2, 3, 4]).unwrap();
        assert_eq!(acl.validate_raw(0), None);
    }

    fn sample_fhs() -> FhsPacket {
        FhsPacket {
            parity: 0x2_5a5a_a5a5,
            bdaddr: BdAddr(0x1234_56_abcdef),
            class_of_device: 0x5a020c,
            lt_addr: 5,
            clk27_2: 0x2b3_c4d5,
            page_scan_mode: 2,
        }
    }

    #[test]
    fn test_fhs_decode_fields() {
        let fhs = sample_fhs();
        let decoded = FhsPacket::decode(&fhs.pack());
        assert_eq!(decoded, fhs);
        assert_eq!(decoded.bdaddr.uap(), 0x56);
        assert_eq!(decoded.bdaddr.lap(), 0xabcdef);
        assert_eq!(decoded.bdaddr.nap(), 0x1234);
    }

    #[test]
    fn test_fhs_clock_field_edge() {
        // All 26 clock bits set, neighbouring lt_addr and page scan mode cleared
        let mut bytes = [0u8; FHS_PAYLOAD_LEN];
        bytes[14] = 0xf8;
        bytes[15] = 0xff;
        bytes[16] = 0xff;
        bytes[17] = 0x1f;
        let fhs = FhsPacket::decode(&bytes);
        assert_eq!(fhs.clk27_2, 0x3ff_ffff);
        assert_eq!(fhs.lt_addr, 0);
        assert_eq!(fhs.page_scan_mode, 0);

        // Page scan mode bits must not leak into the clock
        bytes[17] = 0xff;
        bytes[14] = 0xff;
        let fhs = FhsPacket::decode(&bytes);
        assert_eq!(fhs.clk27_2, 0x3ff_ffff);
        assert_eq!(fhs.lt_addr, 7);
        assert_eq!(fhs.page_scan_mode, 7);
    }

    #[test]
    fn test_eir_decode() {
        let (entries, ok) = decode_eir(b"\x02\x01\x06");
        assert!(ok);
        assert_eq!(
            entries,
            vec![EirEntry {
                tag: 1,
                data: vec![0x06]
            }]
        );

        let (entries, ok) = decode_eir(b"\x05\x01\x06");
        assert!(!ok);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_eir_decode_keeps_prefix_before_malformed_entry() {
        let (entries, ok) = decode_eir(b"\x02\x01\x06\x04\x09ab");
        assert!(!ok);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_eir_padding_terminates() {
        let mut bytes = encode_eir(&eir_for_local_name("ubtbr"));
        bytes.resize(240, 0);
        let (entries, ok) = decode_eir(&bytes);
        assert!(ok);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, eir_tag::COMPLETE_LOCAL_NAME);
        assert_eq!(entries[0].data, b"ubtbr");
        assert_eq!(eir_to_string(&entries), "COMPLETE_LOCAL_NAME: 'ubtbr'");
    }

    fn envelope(packet_type: PacketType, flags: RxFlags, data: &[u8]) -> Vec<u8> {
        let mut msg = 0x1234u32.to_le_bytes().to_vec();
        msg.push(39);
        msg.push(flags.bits());
        msg.extend_from_slice(&(data.len() as u16).to_le_bytes());
        msg.extend_from_slice(&BbHdr::new(1, packet_type, BbFlags::ARQN).pack());
        msg.extend_from_slice(data);
        msg
    }

    #[test]
    fn test_rx_packet_decode_acl() {
        let msg = envelope(
            PacketType::Dm1,
            RxFlags::HAS_PKT | RxFlags::HAS_HDR | RxFlags::HAS_CRC | RxFlags::GOOD_CRC,
            &[(2 << 3) | llid::L2CAP_START, 0xde, 0xad],
        );
        let pkt = RxPacket::decode(&msg).unwrap();
        assert_eq!(pkt.clkn, 0x1234);
        assert_eq!(pkt.channel, 39);
        assert!(!pkt.is_raw());
        match &pkt.payload {
            RxPayload::Acl(acl) => assert_eq!(acl.data, vec![0xde, 0xad]),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(pkt.pack(), msg);
    }

    #[test]
    fn test_rx_packet_decode_fhs_and_empty() {
        let fhs = sample_fhs();
        let pkt = RxPacket::decode(&envelope(PacketType::Fhs, RxFlags::HAS_PKT, &fhs.pack())).unwrap();
        assert_eq!(pkt.payload, RxPayload::Fhs(fhs));

        let pkt = RxPacket::decode(&envelope(PacketType::Poll, RxFlags::HAS_PKT, &[])).unwrap();
        assert_eq!(pkt.payload, RxPayload::Empty);

        assert_eq!(
            RxPacket::decode(&envelope(PacketType::Fhs, RxFlags::HAS_PKT, &[0; 10])),
            Err(CodecError::BadFhsLength(10))
        );
    }

    #[test]
    fn test_rx_packet_decode_faults() {
        assert_eq!(RxPacket::decode(&[0; 5]), Err(CodecError::TruncatedEnvelope(5)));

        let mut msg = envelope(PacketType::Dm1, RxFlags::HAS_PKT, &[0x08, 0x01]);
        msg.push(0);
        assert_eq!(
            RxPacket::decode(&msg),
            Err(CodecError::SizeMismatch {
                declared: 2,
                actual: 3
            })
        );

        let mut msg = envelope(PacketType::Dm1, RxFlags::HAS_PKT, &[]);
        msg[9] = 7;
        assert_eq!(RxPacket::decode(&msg), Err(CodecError::UnknownPacketType(7)));
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(hex(&[0x01, 0xab]), "01 ab");
        let dump = hex_dump(&[0u8; 20]);
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.starts_with("0000: 00"));
        assert!(dump.lines().nth(1).unwrap().starts_with("0010: "));
    }
}
