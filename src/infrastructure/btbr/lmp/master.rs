//! Master role: collect the peer's capabilities, then request the connection

use super::opcodes::{self, ext, EXT_OPCODE};
use super::{peer_request, LmpEngine, LmpError, LmpLink, LmpPdu, LmpState, Transition, NAME_FRAGMENT_LEN};
use crate::infrastructure::btbr::codec::hex;
use tracing::{debug, info, warn};

const FEATURES_RES_EXT: u16 = EXT_OPCODE | ext::FEATURES_RES_EXT as u16;
const IO_CAPABILITY_RES: u16 = EXT_OPCODE | ext::IO_CAPABILITY_RES as u16;

pub(crate) fn transition(state: LmpState, opcode: u16) -> Option<Transition> {
    match state {
        LmpState::Establishing => establishing(opcode).or_else(|| connected(opcode)),
        LmpState::Established => connected(opcode),
        LmpState::Listening | LmpState::Detached => None,
    }
}

fn establishing(opcode: u16) -> Option<Transition> {
    const FEATURES_RES: u16 = opcodes::FEATURES_RES as u16;
    const VERSION_RES: u16 = opcodes::VERSION_RES as u16;
    const NAME_RES: u16 = opcodes::NAME_RES as u16;
    const ENC_KEY_SIZE_MASK_RES: u16 = opcodes::ENCRYPTION_KEY_SIZE_MASK_RES as u16;
    const SETUP_COMPLETE: u16 = opcodes::SETUP_COMPLETE as u16;

    Some(match opcode {
        FEATURES_RES | FEATURES_RES_EXT | VERSION_RES | IO_CAPABILITY_RES | NAME_RES
        | ENC_KEY_SIZE_MASK_RES => Transition::on(handle_info_res),
        SETUP_COMPLETE => Transition::on(handle_setup_complete).then(LmpState::Established),
        _ => return None,
    })
}

/// Handled for the whole life of the link
fn connected(opcode: u16) -> Option<Transition> {
    const SLOT_OFFSET: u16 = opcodes::SLOT_OFFSET as u16;
    const SWITCH_REQ: u16 = opcodes::SWITCH_REQ as u16;
    const ACCEPTED: u16 = opcodes::ACCEPTED as u16;
    const NOT_ACCEPTED: u16 = opcodes::NOT_ACCEPTED as u16;

    match opcode {
        SLOT_OFFSET => Some(Transition::on(handle_slot_offset)),
        SWITCH_REQ => Some(Transition::on(handle_switch_req)),
        ACCEPTED => Some(Transition::on(handle_accepted)),
        NOT_ACCEPTED => Some(Transition::on(handle_not_accepted)),
        _ => peer_request(opcode),
    }
}

/// Request the next missing piece of peer information, or the connection
/// once everything is known
pub(crate) fn send_info_req(engine: &mut LmpEngine, link: &mut dyn LmpLink) -> Result<(), LmpError> {
    let remote = engine.remote();
    if remote.features.is_none() {
        return engine.send_features(link, true);
    }
    if remote.features_ext.is_none() {
        return engine.send_features_ext(link, true, 1);
    }
    if remote.version.is_none() {
        return engine.send_version(link, true);
    }
    if remote.name.is_none() {
        let offset = remote.name_buf.len() as u8;
        return engine.send_name_req(link, offset);
    }
    if remote.enc_key_size_mask.is_none() {
        return engine.lmp_send(link, opcodes::ENCRYPTION_KEY_SIZE_MASK_REQ, &[]);
    }
    if !remote.connection_requested {
        engine.remote.connection_requested = true;
        return engine.lmp_send(link, opcodes::HOST_CONNECTION_REQ, &[]);
    }
    Ok(())
}

fn handle_info_res(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    const FEATURES_RES: u16 = opcodes::FEATURES_RES as u16;
    const VERSION_RES: u16 = opcodes::VERSION_RES as u16;
    const NAME_RES: u16 = opcodes::NAME_RES as u16;
    const ENC_KEY_SIZE_MASK_RES: u16 = opcodes::ENCRYPTION_KEY_SIZE_MASK_RES as u16;

    let remote = &mut engine.remote;
    match pdu.opcode {
        FEATURES_RES => remote.features = Some(pdu.data.clone()),
        FEATURES_RES_EXT => remote.features_ext = Some(pdu.data.clone()),
        VERSION_RES => remote.version = Some(pdu.data.clone()),
        IO_CAPABILITY_RES => remote.io_capability = Some(pdu.data.clone()),
        ENC_KEY_SIZE_MASK_RES => remote.enc_key_size_mask = Some(pdu.data.clone()),
        NAME_RES => {
            let header = pdu.require(2)?;
            let (offset, total) = (header[0] as usize, header[1] as usize);
            let fragment = &pdu.data[2..];
            // A fragment at the wrong offset ends the exchange with what we have
            let misplaced = offset != remote.name_buf.len();
            if misplaced {
                warn!("Name fragment at {} while expecting {}", offset, remote.name_buf.len());
            } else {
                let wanted = total.saturating_sub(remote.name_buf.len()).min(NAME_FRAGMENT_LEN);
                remote
                    .name_buf
                    .extend_from_slice(&fragment[..wanted.min(fragment.len())]);
            }

            if misplaced || remote.name_buf.len() >= total || fragment.is_empty() {
                info!("Remote name: {}", String::from_utf8_lossy(&remote.name_buf));
                remote.name = Some(std::mem::take(&mut remote.name_buf));
            }
        }
        _ => {}
    }
    send_info_req(engine, link)?;
    Ok(None)
}

fn handle_slot_offset(
    _engine: &mut LmpEngine,
    _link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    let data = pdu.require(8)?;
    let offset = u16::from_le_bytes([data[0], data[1]]);
    let bdaddr: Vec<u8> = data[2..8].iter().rev().copied().collect();
    info!("slot_offset from {}: {}usec", hex(&bdaddr).replace(' ', ""), offset);
    Ok(None)
}

fn handle_switch_req(
    engine: &mut LmpEngine,
    _link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    let data = pdu.require(4)?;
    let instant = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    info!(
        "switch req: instant: {} (in {} ticks)",
        instant,
        ((instant as i64) << 1) - engine.clkn() as i64
    );
    Ok(None)
}

fn handle_accepted(
    _engine: &mut LmpEngine,
    _link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    debug!("Accepted: {:?}", pdu.data.first().and_then(|&op| opcodes::name(op as u16)));
    Ok(None)
}

fn handle_not_accepted(
    _engine: &mut LmpEngine,
    _link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    debug!(
        "Not accepted: {:?} reason {:?}",
        pdu.data.first().and_then(|&op| opcodes::name(op as u16)),
        pdu.data.get(1)
    );
    Ok(None)
}

fn handle_setup_complete(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    _pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    engine.lmp_send(link, opcodes::SETUP_COMPLETE, &[0u8; 16])?;
    link.setup_complete(Some(engine.remote().summary()));
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{LmpRole, FEATURES};
    use super::*;

    fn name_res(offset: u8, total: u8, fragment: &[u8]) -> Vec<u8> {
        let mut data = vec![offset, total];
        data.extend_from_slice(fragment);
        pdu(opcodes::NAME_RES, &data)
    }

    #[test]
    fn test_info_requests_follow_fixed_order() {
        let mut engine = LmpEngine::new(LmpRole::Master, "Ubertooth");
        let mut link = RecordingLink::default();

        engine.start(&mut link).unwrap();
        assert_eq!(link.last().opcode, opcodes::FEATURES_REQ as u16);

        engine.receive(0, &pdu(opcodes::FEATURES_RES, &FEATURES), &mut link).unwrap();
        let req = link.last();
        assert_eq!(req.opcode, EXT_OPCODE | ext::FEATURES_REQ_EXT as u16);
        assert_eq!(&req.data[..2], &[1, 1]);

        engine.receive(0, &ext_pdu(ext::FEATURES_RES_EXT, &[1, 1, 0, 0]), &mut link).unwrap();
        assert_eq!(link.last().opcode, opcodes::VERSION_REQ as u16);

        engine.receive(0, &pdu(opcodes::VERSION_RES, &[9, 0x0f, 0, 0x10, 0]), &mut link).unwrap();
        let req = link.last();
        assert_eq!(req.opcode, opcodes::NAME_REQ as u16);
        assert_eq!(req.data[0], 0);

        engine.receive(0, &name_res(0, 5, b"phone"), &mut link).unwrap();
        assert_eq!(link.last().opcode, opcodes::ENCRYPTION_KEY_SIZE_MASK_REQ as u16);

        engine.receive(0, &pdu(opcodes::ENCRYPTION_KEY_SIZE_MASK_RES, &[0xff, 0xff]), &mut link).unwrap();
        assert_eq!(link.last().opcode, opcodes::HOST_CONNECTION_REQ as u16);

        // Host connection is requested once
        let before = link.sent.len();
        engine.receive(0, &ext_pdu(ext::IO_CAPABILITY_RES, &[1, 0, 3]), &mut link).unwrap();
        assert_eq!(link.sent.len(), before);

        assert_eq!(engine.state(), LmpState::Establishing);
        let remote = engine.remote();
        assert_eq!(remote.name.as_deref(), Some(&b"phone"[..]));
        assert_eq!(&remote.features.as_ref().unwrap()[..8], &FEATURES);
    }

    #[test]
    fn test_long_name_collected_across_fragments() {
        let mut engine = LmpEngine::new(LmpRole::Master, "Ubertooth");
        let mut link = RecordingLink::default();
        engine.remote.features = Some(vec![]);
        engine.remote.features_ext = Some(vec![]);
        engine.remote.version = Some(vec![]);

        let name = b"A rather long device";
        engine.receive(0, &name_res(0, name.len() as u8, &name[..14]), &mut link).unwrap();
        let req = link.last();
        assert_eq!(req.opcode, opcodes::NAME_REQ as u16);
        assert_eq!(req.data[0], 14);
        assert!(engine.remote().name.is_none());

        // The PDU padding after the name must not leak into it
        engine.receive(0, &name_res(14, name.len() as u8, &name[14..]), &mut link).unwrap();
        assert_eq!(engine.remote().name.as_deref(), Some(&name[..]));
        assert_eq!(link.last().opcode, opcodes::ENCRYPTION_KEY_SIZE_MASK_REQ as u16);
    }

    #[test]
    fn test_misplaced_name_fragment_ends_name_exchange() {
        let mut engine = LmpEngine::new(LmpRole::Master, "Ubertooth");
        let mut link = RecordingLink::default();
        engine.remote.features = Some(vec![]);
        engine.remote.features_ext = Some(vec![]);
        engine.remote.version = Some(vec![]);

        let name = b"A rather long device";
        engine.receive(0, &name_res(0, name.len() as u8, &name[..14]), &mut link).unwrap();
        assert_eq!(link.last().data[0], 14);

        // Peer answers the offset 14 request from the start again
        engine.receive(0, &name_res(0, name.len() as u8, &name[..14]), &mut link).unwrap();
        assert_eq!(engine.remote().name.as_deref(), Some(&name[..14]));
        assert_eq!(link.last().opcode, opcodes::ENCRYPTION_KEY_SIZE_MASK_REQ as u16);
        let name_reqs = link
            .opcodes()
            .into_iter()
            .filter(|&op| op == opcodes::NAME_REQ as u16)
            .count();
        assert_eq!(name_reqs, 1);
    }

    #[test]
    fn test_setup_complete_replies_and_notifies() {
        let mut engine = LmpEngine::new(LmpRole::Master, "Ubertooth");
        let mut link = RecordingLink::default();
        engine.remote.name = Some(b"phone".to_vec());

        assert!(engine.receive(0, &pdu(opcodes::SETUP_COMPLETE, &[]), &mut link).unwrap());
        let res = link.last();
        assert_eq!(res.opcode, opcodes::SETUP_COMPLETE as u16);
        assert_eq!(res.data, vec![0u8; 16]);
        assert_eq!(engine.state(), LmpState::Established);

        assert_eq!(link.setup.len(), 1);
        let summary = link.setup[0].clone().unwrap();
        assert_eq!(summary.name.as_deref(), Some("phone"));

        // A repeated setup complete is not answered again
        assert!(!engine.receive(0, &pdu(opcodes::SETUP_COMPLETE, &[]), &mut link).unwrap());
        assert_eq!(link.setup.len(), 1);
    }

    #[test]
    fn test_informational_pdus_do_not_answer() {
        let mut engine = LmpEngine::new(LmpRole::Master, "Ubertooth");
        let mut link = RecordingLink::default();

        let mut slot = 625u16.to_le_bytes().to_vec();
        slot.extend_from_slice(&[0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
        assert!(engine.receive(0, &pdu(opcodes::SLOT_OFFSET, &slot), &mut link).unwrap());
        assert!(engine.receive(100, &pdu(opcodes::SWITCH_REQ, &1000u32.to_le_bytes()), &mut link).unwrap());
        assert!(engine.receive(0, &pdu(opcodes::ACCEPTED, &[opcodes::HOST_CONNECTION_REQ]), &mut link).unwrap());
        assert!(engine.receive(0, &pdu(opcodes::NOT_ACCEPTED, &[opcodes::SWITCH_REQ, 0x06]), &mut link).unwrap());
        assert!(link.sent.is_empty());
        assert_eq!(engine.state(), LmpState::Establishing);
    }
}
