//! Slave role: answer the master until it completes connection setup

use super::opcodes;
use super::{peer_request, LmpEngine, LmpError, LmpLink, LmpPdu, LmpState, Transition};
use tracing::info;

pub(crate) fn transition(state: LmpState, opcode: u16) -> Option<Transition> {
    const HOST_CONNECTION_REQ: u16 = opcodes::HOST_CONNECTION_REQ as u16;
    const SETUP_COMPLETE: u16 = opcodes::SETUP_COMPLETE as u16;
    const SET_AFH: u16 = opcodes::SET_AFH as u16;

    match (state, opcode) {
        (LmpState::Listening, HOST_CONNECTION_REQ) => Some(Transition::on(handle_host_connection_req)),
        (LmpState::Listening, SETUP_COMPLETE) => {
            Some(Transition::on(handle_setup_complete).then(LmpState::Established))
        }
        (LmpState::Listening | LmpState::Established, SET_AFH) => Some(Transition::on(handle_set_afh)),
        (LmpState::Listening | LmpState::Established, _) => peer_request(opcode),
        _ => None,
    }
}

fn handle_host_connection_req(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    engine.send_accepted(link, pdu.opcode)?;
    Ok(None)
}

fn handle_setup_complete(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    _pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    engine.lmp_send(link, opcodes::SETUP_COMPLETE, &[])?;
    link.setup_complete(None);
    Ok(None)
}

/// Accept the new hop set and program it at the same instant
fn handle_set_afh(
    engine: &mut LmpEngine,
    link: &mut dyn LmpLink,
    pdu: &LmpPdu,
) -> Result<Option<LmpState>, LmpError> {
    let data = pdu.require(15)?;
    let instant = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mode = data[4];
    let mut map = [0u8; 10];
    map.copy_from_slice(&data[5..15]);

    info!(
        "AFH req: instant={}, (cur {}), mode={}",
        instant << 1,
        engine.clkn(),
        mode
    );
    engine.send_accepted(link, pdu.opcode)?;
    link.set_afh(instant << 1, mode, &map)?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::LmpRole;
    use super::*;

    #[test]
    fn test_name_request_keeps_listening() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "Ubertooth");
        let mut link = RecordingLink::default();

        assert!(engine.receive(0, &pdu(opcodes::NAME_REQ, &[0]), &mut link).unwrap());
        let res = link.last();
        assert_eq!(res.opcode, opcodes::NAME_RES as u16);
        assert_eq!(&res.data[..2], &[0, 9]);
        assert_eq!(&res.data[2..11], b"Ubertooth");
        assert_eq!(engine.state(), LmpState::Listening);
    }

    #[test]
    fn test_host_connection_accepted() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "Ubertooth");
        let mut link = RecordingLink::default();

        engine.receive(0, &pdu(opcodes::HOST_CONNECTION_REQ, &[]), &mut link).unwrap();
        let res = link.last();
        assert_eq!(res.opcode, opcodes::ACCEPTED as u16);
        assert_eq!(res.data[0], opcodes::HOST_CONNECTION_REQ);
    }

    #[test]
    fn test_setup_complete_moves_to_established() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "Ubertooth");
        let mut link = RecordingLink::default();

        engine.receive(0, &pdu(opcodes::SETUP_COMPLETE, &[]), &mut link).unwrap();
        assert_eq!(link.last().opcode, opcodes::SETUP_COMPLETE as u16);
        assert_eq!(link.setup, vec![None]);
        assert_eq!(engine.state(), LmpState::Established);

        // Still answers requests afterwards
        assert!(engine.receive(0, &pdu(opcodes::FEATURES_REQ, &[]), &mut link).unwrap());
        assert!(!engine.receive(0, &pdu(opcodes::HOST_CONNECTION_REQ, &[]), &mut link).unwrap());
    }

    #[test]
    fn test_set_afh_accepted_and_forwarded() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "Ubertooth");
        let mut link = RecordingLink::default();

        let map = [0xff, 0xff, 0xff, 0x0f, 0, 0, 0xf0, 0xff, 0xff, 0x7f];
        let mut data = 0x1000u32.to_le_bytes().to_vec();
        data.push(1);
        data.extend_from_slice(&map);
        engine.receive(0x1f00, &pdu(opcodes::SET_AFH, &data), &mut link).unwrap();

        let res = link.last();
        assert_eq!(res.opcode, opcodes::ACCEPTED as u16);
        assert_eq!(res.data[0], opcodes::SET_AFH);
        assert_eq!(link.afh, vec![(0x2000, 1, map)]);
    }

    #[test]
    fn test_detach_stops_session() {
        let mut engine = LmpEngine::new(LmpRole::Slave, "Ubertooth");
        let mut link = RecordingLink::default();
        engine.receive(0, &pdu(opcodes::DETACH, &[0x13]), &mut link).unwrap();
        assert!(link.detached);
        assert!(link.sent.is_empty());
    }
}
