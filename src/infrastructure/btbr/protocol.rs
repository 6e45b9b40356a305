//! BTBR Control Protocol
//!
//! Wire constants shared by the host and the radio firmware: message
//! opcodes, USB framing tags and the baseband packet-type table.

/// Maximum size of a single USB bulk transfer
pub const USB_TRANSFER_SIZE: usize = 64;

/// Framing tag of the first transfer of a message
pub const TAG_START: u8 = b'S';
/// Framing tag of a continuation transfer
pub const TAG_CONTINUATION: u8 = b'C';
/// Unframed console line printed by the firmware
pub const TAG_PRINT: u8 = b'P';

/// `'S'`, reserved byte, u16 LE total length
pub const START_HEADER_LEN: usize = 4;
pub const CONTINUATION_HEADER_LEN: usize = 1;

/// Debug messages carried through the passthrough command are truncated to this size
pub const MAX_DEBUG_MESSAGE: usize = 256;

/// Message opcodes (leading u32 little-endian of every framed message)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Console text, both directions
    Debug,
    // Host -> device
    Reset,
    Idle,
    SetFreqOffset,
    SetBdaddr,
    Inquiry,
    Paging,
    TxTest,
    TxAcl,
    InquiryScan,
    PageScan,
    SetEir,
    SetAfh,
    Monitor,
    SetMaxAcErrors,
    // Device -> host
    RxPacket,
    StateResponse,
}

impl Opcode {
    pub fn value(&self) -> u32 {
        match self {
            Self::Debug => 0,
            Self::Reset => 20,
            Self::Idle => 21,
            Self::SetFreqOffset => 22,
            Self::SetBdaddr => 23,
            Self::Inquiry => 24,
            Self::Paging => 25,
            Self::TxTest => 26,
            Self::TxAcl => 27,
            Self::InquiryScan => 28,
            Self::PageScan => 29,
            Self::SetEir => 30,
            Self::SetAfh => 31,
            Self::Monitor => 32,
            Self::SetMaxAcErrors => 33,
            Self::RxPacket => 40,
            Self::StateResponse => 41,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Debug,
            20 => Self::Reset,
            21 => Self::Idle,
            22 => Self::SetFreqOffset,
            23 => Self::SetBdaddr,
            24 => Self::Inquiry,
            25 => Self::Paging,
            26 => Self::TxTest,
            27 => Self::TxAcl,
            28 => Self::InquiryScan,
            29 => Self::PageScan,
            30 => Self::SetEir,
            31 => Self::SetAfh,
            32 => Self::Monitor,
            33 => Self::SetMaxAcErrors,
            40 => Self::RxPacket,
            41 => Self::StateResponse,
            _ => return None,
        })
    }

    /// Prefix `payload` with this opcode
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(4 + payload.len());
        msg.extend_from_slice(&self.value().to_le_bytes());
        msg.extend_from_slice(payload);
        msg
    }
}

/// Logical link identifiers of the ACL payload header
pub mod llid {
    pub const L2CAP_CONTINUATION: u8 = 1;
    pub const L2CAP_START: u8 = 2;
    pub const LMP: u8 = 3;

    pub fn name(llid: u8) -> Option<&'static str> {
        match llid {
            L2CAP_CONTINUATION => Some("L2CAP_CONT"),
            L2CAP_START => Some("L2CAP_START"),
            LMP => Some("LMP"),
            _ => None,
        }
    }
}

/// Baseband packet types used on ACL links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Null = 0,
    Poll = 1,
    Fhs = 2,
    Dm1 = 3,
    Dh1 = 4,
    Dm3 = 10,
    Dh3 = 11,
    Dm5 = 14,
    Dh5 = 15,
}

impl PacketType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Null,
            1 => Self::Poll,
            2 => Self::Fhs,
            3 => Self::Dm1,
            4 => Self::Dh1,
            10 => Self::Dm3,
            11 => Self::Dh3,
            14 => Self::Dm5,
            15 => Self::Dh5,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Poll => "POLL",
            Self::Fhs => "FHS",
            Self::Dm1 => "DM1",
            Self::Dh1 => "DH1",
            Self::Dm3 => "DM3",
            Self::Dh3 => "DH3",
            Self::Dm5 => "DM5",
            Self::Dh5 => "DH5",
        }
    }
}

/// One row of the ACL packet-type table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclTypeInfo {
    pub packet_type: PacketType,
    /// Payload header length (1 or 2 bytes)
    pub header_len: usize,
    /// Maximum user payload
    pub max_payload: usize,
    pub fec23: bool,
}

const fn acl_type(
    packet_type: PacketType,
    header_len: usize,
    max_payload: usize,
    fec23: bool,
) -> AclTypeInfo {
    AclTypeInfo {
        packet_type,
        header_len,
        max_payload,
        fec23,
    }
}

/// ACL packet types, ascending by payload capacity
pub const ACL_TYPE_TABLE: [AclTypeInfo; 6] = [
    acl_type(PacketType::Dm1, 1, 17, true),
    acl_type(PacketType::Dh1, 1, 27, false),
    acl_type(PacketType::Dm3, 2, 121, true),
    acl_type(PacketType::Dh3, 2, 183, false),
    acl_type(PacketType::Dm5, 2, 224, true),
    acl_type(PacketType::Dh5, 2, 339, false),
];

/// Largest ACL payload any table entry can carry
pub const MAX_ACL_PAYLOAD: usize = 339;

/// Table entry for a baseband type, if it carries an ACL payload
pub fn acl_type_find(raw_type: u8) -> Option<&'static AclTypeInfo> {
    ACL_TYPE_TABLE
        .iter()
        .find(|t| t.packet_type as u8 == raw_type)
}

/// First (smallest) table entry able to carry `size` payload bytes
pub fn acl_type_for_size(size: usize) -> Option<&'static AclTypeInfo> {
    ACL_TYPE_TABLE.iter().find(|t| t.max_payload >= size)
}
