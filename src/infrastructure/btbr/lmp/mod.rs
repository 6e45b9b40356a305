//! Link Manager Protocol Engine
//!
//! One engine per established link, in master or slave role. Incoming PDUs
//! are dispatched through a per-role table keyed by (state, opcode); the
//! selected handler answers the peer through the session's [`LmpLink`].
//!
//! ```text
//!  session rx ──► LmpEngine::receive ──► transition(role, state, opcode)
//!                                             │
//!                                   handler(engine, link, pdu)
//!                                             │
//!                      LmpLink::send_lmp ◄────┘ (ACL, llid = LMP)
//! ```

pub mod master;
pub mod opcodes;
pub mod slave;

use crate::domain::models::RemoteSummary;
use crate::infrastructure::btbr::codec::hex;
use crate::infrastructure::btbr::dispatcher::CommandError;
use opcodes::{ext, EXT_OPCODE};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Every PDU is zero-padded to this length before transmission
pub const PDU_LEN: usize = 17;

/// Largest name fragment carried by one name response
pub const NAME_FRAGMENT_LEN: usize = 14;

/// Supported features page 0: 3-slot and 5-slot packets, no AFH
pub const FEATURES: [u8; 8] = [0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x19, 0x00];

const VERSION_NUMBER: u8 = 1;
const COMPANY_ID_NONE: u16 = 0xffff;
const SUB_VERSION: u16 = 2020;

#[derive(Debug, Error)]
pub enum LmpError {
    #[error("empty LMP PDU")]
    EmptyPdu,
    #[error("escape opcode without an extended opcode")]
    MissingExtendedOpcode,
    #[error("{opcode} payload truncated: need {needed} bytes, got {got}")]
    Truncated {
        opcode: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("LMP payload of {0} bytes does not fit a PDU")]
    PduTooLarge(usize),
    #[error(transparent)]
    Transport(#[from] CommandError),
}

/// Outbound side of the link an engine runs on
pub trait LmpLink {
    /// Transmit a padded PDU as an ACL packet with llid LMP
    fn send_lmp(&mut self, pdu: &[u8]) -> Result<(), CommandError>;
    /// Program the device's hop set for an AFH change
    fn set_afh(&mut self, instant: u32, mode: u8, map: &[u8; 10]) -> Result<(), CommandError>;
    /// Link setup finished; master role passes what it learned about the peer
    fn setup_complete(&mut self, remote: Option<RemoteSummary>);
    /// Peer detached, the owning session should end
    fn detach(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmpRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmpState {
    /// Master: collecting peer information before requesting the connection
    Establishing,
    /// Slave: waiting for the master to set up the connection
    Listening,
    /// Setup complete exchanged
    Established,
    /// Peer detached, every PDU is ignored
    Detached,
}

impl fmt::Display for LmpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Establishing => write!(f, "establishing"),
            Self::Listening => write!(f, "listening"),
            Self::Established => write!(f, "established"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

/// Parsed PDU; `opcode` has `EXT_OPCODE` set for escaped opcodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmpPdu {
    pub tid: u8,
    pub opcode: u16,
    pub data: Vec<u8>,
}

impl LmpPdu {
    pub fn parse(pdu: &[u8]) -> Result<Self, LmpError> {
        let first = *pdu.first().ok_or(LmpError::EmptyPdu)?;
        let tid = first & 1;
        let opcode = first >> 1;

        if opcode == opcodes::ESCAPE_4 {
            let ext = *pdu.get(1).ok_or(LmpError::MissingExtendedOpcode)?;
            Ok(Self {
                tid,
                opcode: EXT_OPCODE | ext as u16,
                data: pdu[2..].to_vec(),
            })
        } else {
            Ok(Self {
                tid,
                opcode: opcode as u16,
                data: pdu[1..].to_vec(),
            })
        }
    }

    pub fn name(&self) -> &'static str {
        opcodes::name(self.opcode).unwrap_or("LMP_UNKNOWN")
    }

    /// First `n` payload bytes, or a truncation error naming the opcode
    pub fn require(&self, n: usize) -> Result<&[u8], LmpError> {
        self.data.get(..n).ok_or(LmpError::Truncated {
            opcode: self.name(),
            needed: n,
            got: self.data.len(),
        })
    }
}

/// `opcode << 1 | tid` followed by `data`, zero-padded to [`PDU_LEN`]
pub fn pack_lmp(opcode: u8, data: &[u8], tid: u8) -> Result<Vec<u8>, LmpError> {
    if 1 + data.len() > PDU_LEN {
        return Err(LmpError::PduTooLarge(data.len()));
    }
    let mut pdu = Vec::with_capacity(PDU_LEN);
    pdu.push((opcode << 1) | (tid & 1));
    pdu.extend_from_slice(data);
    pdu.resize(PDU_LEN, 0);
    Ok(pdu)
}

/// `(tid N) OPCODE_NAME | hex`
pub fn pdu_to_string(pdu: &[u8]) -> String {
    match LmpPdu::parse(pdu) {
        Ok(parsed) => format!(
            "(tid {}) {:<40} | {}",
            parsed.tid,
            opcodes::name(parsed.opcode).unwrap_or("None"),
            hex(pdu)
        ),
        Err(_) => format!("(malformed) | {}", hex(pdu)),
    }
}

pub(crate) type Handler = fn(&mut LmpEngine, &mut dyn LmpLink, &LmpPdu) -> Result<Option<LmpState>, LmpError>;

/// Table entry: handler plus optional fixed next state
///
/// A state returned by the handler takes precedence over `next`.
#[derive(Clone, Copy)]
pub(crate) struct Transition {
    pub handler: Handler,
    pub next: Option<LmpState>,
}

impl Transition {
    pub const fn on(handler: Handler) -> Self {
        Self {
            handler,
            next: None,
        }
    }

    pub const fn then(self, next: LmpState) -> Self {
        Self {
            handler: self.handler,
            next: Some(next),
        }
    }
}

/// What the master has collected from its peer so far
#[derive(Debug, Clone, Default)]
pub struct RemoteInfo {
    pub features: Option<Vec<u8>>,
    pub features_ext: Option<Vec<u8>>,
    pub version: Option<Vec<u8>>,
    pub io_capability: Option<Vec<u8>>,
    pub name: Option<Vec<u8>>,
    pub enc_key_size_mask: Option<Vec<u8>>,
    /// Name fragments received so far
    pub(crate) name_buf: Vec<u8>,
    pub(crate) connection_requested: bool,
}

impl RemoteInfo {
    pub fn summary(&self) -> RemoteSummary {
        RemoteSummary {
            name: self
                .name
                .as_ref()
                .map(|n| String::from_utf8_lossy(n).into_owned()),
            features: self.features.clone(),
            features_ext: self.features_ext.clone(),
            version: self.version.clone(),
            enc_key_size_mask: self.enc_key_size_mask.clone(),
        }
    }
}

pub struct LmpEngine {
    role: LmpRole,
    state: LmpState,
    clkn: u32,
    device_name: Vec<u8>,
    remote: RemoteInfo,
    started: Instant,
}

impl LmpEngine {
    pub fn new(role: LmpRole, device_name: &str) -> Self {
        let state = match role {
            LmpRole::Master => LmpState::Establishing,
            LmpRole::Slave => LmpState::Listening,
        };
        Self {
            role,
            state,
            clkn: 0,
            device_name: device_name.as_bytes().to_vec(),
            remote: RemoteInfo::default(),
            started: Instant::now(),
        }
    }

    pub fn role(&self) -> LmpRole {
        self.role
    }

    pub fn state(&self) -> LmpState {
        self.state
    }

    /// Native clock of the last received PDU
    pub fn clkn(&self) -> u32 {
        self.clkn
    }

    pub fn remote(&self) -> &RemoteInfo {
        &self.remote
    }

    /// Begin the exchange; the master immediately starts collecting peer info
    pub fn start(&mut self, link: &mut dyn LmpLink) -> Result<(), LmpError> {
        match self.role {
            LmpRole::Master => master::send_info_req(self, link),
            LmpRole::Slave => Ok(()),
        }
    }

    /// Feed one received PDU
    ///
    /// Returns `Ok(false)` when the opcode has no entry in the current state.
    pub fn receive(
        &mut self,
        clkn: u32,
        pdu: &[u8],
        link: &mut dyn LmpLink,
    ) -> Result<bool, LmpError> {
        self.clkn = clkn;
        let parsed = LmpPdu::parse(pdu)?;
        info!(
            "{}|{:.2} sec | <<< lmp_rx (state={}): {}",
            clkn,
            self.elapsed(),
            self.state,
            pdu_to_string(pdu)
        );

        let transition = match self.role {
            LmpRole::Master => master::transition(self.state, parsed.opcode),
            LmpRole::Slave => slave::transition(self.state, parsed.opcode),
        };
        let Some(transition) = transition else {
            warn!("Unhandled opcode 0x{:x} in state {}", parsed.opcode, self.state);
            return Ok(false);
        };

        let next = (transition.handler)(self, link, &parsed)?
            .or(transition.next)
            .unwrap_or(self.state);
        self.set_state(next);
        Ok(true)
    }

    fn set_state(&mut self, state: LmpState) {
        if state != self.state {
            info!(
                "{:.2} sec | Switch state {} -> {}",
                self.elapsed(),
                self.state,
                state
            );
            self.state = state;
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    // -----------------------------------------------------------------------
    // Senders
    // -----------------------------------------------------------------------

    pub(crate) fn lmp_send(
        &self,
        link: &mut dyn LmpLink,
        opcode: u8,
        data: &[u8],
    ) -> Result<(), LmpError> {
        let pdu = pack_lmp(opcode, data, 0)?;
        info!(
            "{:.2} sec | >>> lmp_tx (state={}): {}",
            self.elapsed(),
            self.state,
            pdu_to_string(&pdu)
        );
        link.send_lmp(&pdu)?;
        Ok(())
    }

    pub(crate) fn send_name_req(&self, link: &mut dyn LmpLink, offset: u8) -> Result<(), LmpError> {
        self.lmp_send(link, opcodes::NAME_REQ, &[offset])
    }

    pub(crate) fn send_accepted(&self, link: &mut dyn LmpLink, opcode: u16) -> Result<(), LmpError> {
        self.lmp_send(link, opcodes::ACCEPTED, &[opcode as u8])
    }

    pub(crate) fn send_version(&self, link: &mut dyn LmpLink, is_req: bool) -> Result<(), LmpError> {
        let op = if is_req {
            opcodes::VERSION_REQ
        } else {
            opcodes::VERSION_RES
        };
        let mut data = vec![VERSION_NUMBER];
        data.extend_from_slice(&COMPANY_ID_NONE.to_le_bytes());
        data.extend_from_slice(&SUB_VERSION.to_le_bytes());
        self.lmp_send(link, op, &data)
    }

    pub(crate) fn send_features(&self, link: &mut dyn LmpLink, is_req: bool) -> Result<(), LmpError> {
        let op = if is_req {
            opcodes::FEATURES_REQ
        } else {
            opcodes::FEATURES_RES
        };
        self.lmp_send(link, op, &FEATURES)
    }

    /// Extended features page `num`; no extended feature is supported
    pub(crate) fn send_features_ext(
        &self,
        link: &mut dyn LmpLink,
        is_req: bool,
        num: u8,
    ) -> Result<(), LmpError> {
        let ext_op = if is_req {
            ext::FEATURES_REQ_EXT
        } else {
            ext::FEATURES_RES_EXT
        };
        let mut data = vec![ext_op, num, num];
        data.resize(11, 0);
        self.lmp_send(link, opcodes::ESCAPE_4, &data)
    }

    /// NoInputNoOutput, no OOB data, general bonding
    pub(crate) fn send_io_capability(&self, link: &mut dyn LmpLink, is_req: bool) -> Result<(), LmpError> {
        let ext_op = if is_req {
            ext::IO_CAPABILITY_REQ
        } else {
            ext::IO_CAPABILITY_RES
        };
        self.lmp_send(link, opcodes::ESCAPE_4, &[ext_op, 0x01, 0x00, 0x03])
    }
}

// ---------------------------------------------------------------------------
// Handlers shared by both roles
// ---------------------------------------------------------------------------

pub(crate) fn handle_name_req(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    let offset = pdu.require(1)?[0];
    let name = &engine.device_name;
    let start = (offset as usize).min(name.len());
    let end = (start + NAME_FRAGMENT_LEN).min(name.len());

    let mut data = vec![offset, name.len() as u8];
    data.extend_from_slice(&name[start..end]);
    engine.lmp_send(link, opcodes::NAME_RES, &data)?;
    Ok(None)
}

pub(crate) fn handle_features_req(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    _pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    debug!("handle_features_req");
    engine.send_features(link, false)?;
    Ok(None)
}

pub(crate) fn handle_features_req_ext(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    let num = pdu.require(1)?[0];
    debug!("handle_features_req_ext page {}", num);
    engine.send_features_ext(link, false, num)?;
    Ok(None)
}

pub(crate) fn handle_version_req(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    _pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    debug!("handle_version_req");
    engine.send_version(link, false)?;
    Ok(None)
}

pub(crate) fn handle_io_capability_req(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    _pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    debug!("handle_io_capability_req");
    engine.send_io_capability(link, false)?;
    Ok(None)
}

pub(crate) fn handle_detach(
    _engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    info!("Peer detached (reason 0x{:02x})", pdu.data.first().copied().unwrap_or(0));
    link.detach();
    Ok(Some(LmpState::Detached))
}

/// Peer requests either role answers in any live state
pub(crate) fn peer_request(opcode: u16) -> Option<Transition> {
    const FEATURES_REQ_EXT: u16 = EXT_OPCODE | ext::FEATURES_REQ_EXT as u16;
    const IO_CAPABILITY_REQ: u16 = EXT_OPCODE | ext::IO_CAPABILITY_REQ as u16;

    let handler: Handler = match opcode {
        op if op == opcodes::NAME_REQ as u16 => handle_name_req,
        op if op == opcodes::FEATURES_REQ as u16 => handle_features_req,
        op if op == opcodes::VERSION_REQ as u16 => handle_version_req,
        op if op == opcodes::DETACH as u16 => handle_detach,
        FEATURES_REQ_EXT => handle_features_req_ext,
        IO_CAPABILITY_REQ => handle_io_capability_req,
        _ => return None,
    };
    Some(Transition::on(handler))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_parse_base_and_extended() {
        let parsed = LmpPdu::parse(&[(opcodes::NAME_REQ << 1) | 1, 0x05]).unwrap();
        assert_eq!(parsed.tid, 1);
        assert_eq!(parsed.opcode, opcodes::NAME_REQ as u16);
        assert_eq!(parsed.data, vec![0x05]);

        let parsed = LmpPdu::parse(&[opcodes::ESCAPE_4 << 1, ext::FEATURES_REQ_EXT, 1]).unwrap();
        assert_eq!(parsed.opcode, EXT_OPCODE | ext::FEATURES_REQ_EXT as u16);
        assert_eq!(parsed.data, vec![1]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(LmpPdu::parse(&[]), Err(LmpError::EmptyPdu)));
        assert!(matches!(
            LmpPdu::parse(&[opcodes::ESCAPE_4 << 1]),
            Err(LmpError::MissingExtendedOpcode)
        ));
    }

    #[test]
    fn test_pack_pads_to_pdu_len() {
        let pdu = pack_lmp(opcodes::SETUP_COMPLETE, &[], 0).unwrap();
        assert_eq!(pdu.len(), PDU_LEN);
        assert_eq!(pdu[0], 49 << 1);
        assert!(pdu[1..].iter().all(|&b| b == 0));

        assert!(pack_lmp(opcodes::SETUP_COMPLETE, &[0; 16], 1).is_ok());
        assert!(matches!(
            pack_lmp(opcodes::SETUP_COMPLETE, &[0; 17], 0),
            Err(LmpError::PduTooLarge(17))
        ));
    }

    #[test]
    fn test_pdu_to_string() {
        let s = pdu_to_string(&[(opcodes::DETACH << 1) | 1, 0x13]);
        assert!(s.starts_with("(tid 1) LMP_DETACH"));
        assert!(s.ends_with("| 0f 13"));

        let s = pdu_to_string(&ext_pdu(ext::IO_CAPABILITY_RES, &[1, 0, 3]));
        assert!(s.contains("LMP_IO_CAPABILITY_RES"));
        assert!(pdu_to_string(&[]).starts_with("(malformed)"));
    }

    #[test]
    fn test_shared_requests_answered_by_both_roles() {
        for role in [LmpRole::Master, LmpRole::Slave] {
            let mut engine = LmpEngine::new(role, "Ubertooth");
            let mut link = RecordingLink::default();

            assert!(engine.receive(0, &pdu(opcodes::VERSION_REQ, &[]), &mut link).unwrap());
            let res = link.last();
            assert_eq!(res.opcode, opcodes::VERSION_RES as u16);
            assert_eq!(&res.data[..5], &[1, 0xff, 0xff, 0xe4, 0x07]);

            engine.receive(0, &pdu(opcodes::FEATURES_REQ, &FEATURES), &mut link).unwrap();
            let res = link.last();
            assert_eq!(res.opcode, opcodes::FEATURES_RES as u16);
            assert_eq!(&res.data[..8], &FEATURES);

            engine.receive(0, &ext_pdu(ext::FEATURES_REQ_EXT, &[1, 1]), &mut link).unwrap();
            let res = link.last();
            assert_eq!(res.opcode, EXT_OPCODE | ext::FEATURES_RES_EXT as u16);
            assert_eq!(&res.data[..2], &[1, 1]);
            assert!(res.data[2..].iter().all(|&b| b == 0));

            engine.receive(0, &ext_pdu(ext::IO_CAPABILITY_REQ, &[1, 0, 3]), &mut link).unwrap();
            let res = link.last();
            assert_eq!(res.opcode, EXT_OPCODE | ext::IO_CAPABILITY_RES as u16);
            assert_eq!(&res.data[..3], &[1, 0, 3]);
        }
    }

    #[test]
    fn test_name_req_long_name_fragment() {
        let name = "Ubertooth One BR/EDR";
        let mut engine = LmpEngine::new(LmpRole::Slave, name);
        let mut link = RecordingLink::default();

        engine.receive(0, &pdu(opcodes::NAME_REQ, &[0]), &mut link).unwrap();
        let res = link.last();
        assert_eq!(res.opcode, opcodes::NAME_RES as u16);
        assert_eq!(res.data[0], 0);
        assert_eq!(res.data[1] as usize, name.len());
        assert_eq!(&res.data[2..16], &name.as_bytes()[..14]);

        engine.receive(0, &pdu(opcodes::NAME_REQ, &[14]), &mut link).unwrap();
        let res = link.last();
        assert_eq!(res.data[0], 14);
        assert_eq!(&res.data[2..8], &name.as_bytes()[14..]);
        assert_eq!(engine.state(), LmpState::Listening);
    }

    #[test]
    fn test_name_req_offset_past_end() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "abc");
        let mut link = RecordingLink::default();
        engine.receive(0, &pdu(opcodes::NAME_REQ, &[200]), &mut link).unwrap();
        let res = link.last();
        assert_eq!(&res.data[..2], &[200, 3]);
        assert!(res.data[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncated_request_is_error() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "abc");
        let mut link = RecordingLink::default();
        let err = engine
            .receive(0, &[opcodes::NAME_REQ << 1], &mut link)
            .unwrap_err();
        assert!(matches!(err, LmpError::Truncated { needed: 1, got: 0, .. }));
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_unhandled_opcode_is_ignored() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "abc");
        let mut link = RecordingLink::default();
        let handled = engine
            .receive(42, &pdu(opcodes::SNIFF_REQ, &[0; 9]), &mut link)
            .unwrap();
        assert!(!handled);
        assert_eq!(engine.state(), LmpState::Listening);
        assert_eq!(engine.clkn(), 42);
        assert!(link.sent.is_empty());
    }

    #[test]
    fn test_detach_ends_link() {
        let mut engine = LmpEngine::new(LmpRole::Master, "abc");
        let mut link = RecordingLink::default();
        engine.receive(0, &pdu(opcodes::DETACH, &[0x13]), &mut link).unwrap();
        assert!(link.detached);
        assert_eq!(engine.state(), LmpState::Detached);

        // Nothing is answered once detached
        let handled = engine.receive(0, &pdu(opcodes::VERSION_REQ, &[]), &mut link).unwrap();
        assert!(!handled);
        assert!(link.sent.is_empty());
    }
}
