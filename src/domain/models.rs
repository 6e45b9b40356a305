use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device-level state reported by the firmware in state-change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Standby,
    Inquiry,
    Page,
    Connected,
    /// Legacy transmit test state
    Test,
    InquiryScan,
    PageScan,
    Unknown(u8),
}

impl DeviceState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Standby,
            1 => Self::Inquiry,
            2 => Self::Page,
            3 => Self::Connected,
            4 => Self::Test,
            5 => Self::InquiryScan,
            6 => Self::PageScan,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            Self::Standby => 0,
            Self::Inquiry => 1,
            Self::Page => 2,
            Self::Connected => 3,
            Self::Test => 4,
            Self::InquiryScan => 5,
            Self::PageScan => 6,
            Self::Unknown(raw) => *raw,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standby => write!(f, "STANDBY"),
            Self::Inquiry => write!(f, "INQUIRY"),
            Self::Page => write!(f, "PAGE"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Test => write!(f, "TEST"),
            Self::InquiryScan => write!(f, "INQUIRY_SCAN"),
            Self::PageScan => write!(f, "PAGE_SCAN"),
            Self::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// Reason code carried in the low 5 bits of a state-change reason byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Success,
    Timeout,
    /// Device entered CONNECTED but the slave did not answer yet
    Paged,
    Other(u8),
}

impl ReasonCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::Timeout,
            2 => Self::Paged,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Paged => write!(f, "PAGED"),
            Self::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Decoded reason byte: `lt_addr << 5 | code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReason {
    pub code: ReasonCode,
    /// Link-transport address assigned on CONNECTED
    pub lt_addr: u8,
}

impl StateReason {
    pub fn from_raw(raw: u8) -> Self {
        Self {
            code: ReasonCode::from_raw(raw & 0x1f),
            lt_addr: raw >> 5,
        }
    }
}

/// 48-bit Bluetooth device address, `lap | uap << 24 | nap << 32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub u64);

impl BdAddr {
    pub fn lap(&self) -> u32 {
        (self.0 & 0xff_ffff) as u32
    }

    pub fn uap(&self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    pub fn nap(&self) -> u16 {
        ((self.0 >> 32) & 0xffff) as u16
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for BdAddr {
    type Err = anyhow::Error;

    /// Accepts `aa:bb:cc:dd:ee:ff` (most significant byte first) or a bare hex number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = if s.contains(':') {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() != 6 {
                return Err(anyhow::anyhow!("Invalid address format: {}", s));
            }
            parts.iter().try_fold(0u64, |acc, p| {
                u8::from_str_radix(p, 16)
                    .map(|b| (acc << 8) | b as u64)
                    .map_err(|e| anyhow::anyhow!("Invalid address byte '{}': {}", p, e))
            })?
        } else {
            u64::from_str_radix(s.trim_start_matches("0x"), 16)?
        };
        if value >> 48 != 0 {
            return Err(anyhow::anyhow!("Address does not fit in 48 bits: {}", s));
        }
        Ok(Self(value))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which side of a followed link transmitted a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSide {
    Master,
    Slave,
}

impl LinkSide {
    /// Slave transmissions land in odd slots, i.e. with bit 1 of clkn set
    pub fn from_clkn(clkn: u32) -> Self {
        if clkn & 2 != 0 {
            Self::Slave
        } else {
            Self::Master
        }
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

/// One decoded EIR entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EirEntry {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// Summary of what a master LMP engine learned from its peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteSummary {
    pub name: Option<String>,
    pub features: Option<Vec<u8>>,
    pub features_ext: Option<Vec<u8>>,
    pub version: Option<Vec<u8>>,
    pub enc_key_size_mask: Option<Vec<u8>>,
}

/// Events published by sessions to presentation collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session: &'static str,
        state: DeviceState,
        reason: ReasonCode,
        lt_addr: u8,
    },
    Connected {
        session: &'static str,
        lt_addr: u8,
    },
    InquiryResult {
        clkn: u32,
        channel: u8,
        entries: Vec<EirEntry>,
        well_formed: bool,
    },
    FhsReceived {
        clkn: u32,
        side: LinkSide,
        bdaddr: BdAddr,
        class_of_device: u32,
        lt_addr: u8,
        clk27_2: u32,
    },
    LmpReceived {
        clkn: u32,
        side: LinkSide,
        pdu: Vec<u8>,
    },
    L2capReceived {
        clkn: u32,
        llid: u8,
        data: Vec<u8>,
    },
    BadCrc {
        clkn: u32,
        channel: u8,
    },
    SetupComplete {
        remote: Option<RemoteSummary>,
    },
    Finished {
        session: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_byte_carries_lt_addr() {
        let reason = StateReason::from_raw(0x40);
        assert_eq!(reason.lt_addr, 2);
        assert_eq!(reason.code, ReasonCode::Success);

        let reason = StateReason::from_raw(0x22);
        assert_eq!(reason.lt_addr, 1);
        assert_eq!(reason.code, ReasonCode::Paged);
    }

    #[test]
    fn test_state_raw_values() {
        for raw in 0..=7u8 {
            assert_eq!(DeviceState::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(DeviceState::from_raw(6), DeviceState::PageScan);
    }

    #[test]
    fn test_bdaddr_parse_and_display() {
        let addr: BdAddr = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(addr.0, 0x0011_2233_4455);
        assert_eq!(addr.lap(), 0x33_4455);
        assert_eq!(addr.uap(), 0x22);
        assert_eq!(addr.nap(), 0x0011);
        assert_eq!(addr.to_string(), "00:11:22:33:44:55");

        let bare: BdAddr = "0x112233445566".parse().unwrap();
        assert_eq!(bare.0, 0x1122_3344_5566);
        assert!("11:22:33".parse::<BdAddr>().is_err());
        assert!("1122334455667788".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_link_side_from_clkn() {
        assert_eq!(LinkSide::from_clkn(0x100), LinkSide::Master);
        assert_eq!(LinkSide::from_clkn(0x102), LinkSide::Slave);
    }
}
