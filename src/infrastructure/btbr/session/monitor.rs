//! Passive monitor of a link between two other devices
//!
//! The device cannot always check CRCs of observed packets, so raw packets
//! are re-validated here with the UAP learned from the first FHS.

use super::{log_unexpected_state, SessionContext, SessionFlow, SessionHandler};
use crate::domain::models::{BdAddr, DeviceState, LinkSide, SessionEvent, StateReason};
use crate::infrastructure::btbr::codec::{hex_dump, AclPacket, FhsPacket, RxPacket, RxPayload};
use crate::infrastructure::btbr::dispatcher::CommandError;
use crate::infrastructure::btbr::lmp::{opcodes, pdu_to_string, LmpError, LmpPdu};
use tracing::{debug, info, warn};

pub struct Monitor {
    bdaddr: BdAddr,
    /// CRC seed source, unknown until an FHS is seen
    uap: Option<u8>,
}

impl Monitor {
    pub fn new(bdaddr: BdAddr) -> Self {
        Self { bdaddr, uap: None }
    }

    /// Follow the observed hop set change
    fn follow_afh(&self, ctx: &SessionContext, pkt: &RxPacket, pdu: &LmpPdu) -> Result<(), LmpError> {
        let data = pdu.require(15)?;
        let instant = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) << 1;
        let mode = data[4];
        let mut map = [0u8; 10];
        map.copy_from_slice(&data[5..15]);

        ctx.dispatcher().send_set_afh_cmd(instant, mode, &map)?;
        info!("AFH req: instant={}, (cur {}), mode={}", instant, pkt.clkn, mode);
        Ok(())
    }
}

impl SessionHandler for Monitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError> {
        info!("Monitoring {}", self.bdaddr);
        ctx.dispatcher().send_monitor_cmd(self.bdaddr)
    }

    fn handle_state(
        &mut self,
        _ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow {
        match state {
            DeviceState::PageScan => {
                info!("Monitor started");
                SessionFlow::Ready
            }
            DeviceState::Connected => {
                info!("Connection status {}", reason.code);
                SessionFlow::Ready
            }
            _ => {
                log_unexpected_state(self.name(), state, reason);
                info!("Monitor done");
                SessionFlow::Done
            }
        }
    }

    fn handle_fhs(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, fhs: &FhsPacket) {
        let side = LinkSide::from_clkn(pkt.clkn);
        info!("RX FHS ({}:{:7x}): {}", side, pkt.clkn, fhs);
        self.uap = Some(fhs.bdaddr.uap());
        ctx.emit(SessionEvent::FhsReceived {
            clkn: pkt.clkn,
            side,
            bdaddr: fhs.bdaddr,
            class_of_device: fhs.class_of_device,
            lt_addr: fhs.lt_addr,
            clk27_2: fhs.clk27_2,
        });
    }

    fn handle_lmp(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        let pdu = &acl.data;
        if pdu.is_empty() {
            return;
        }
        if let Ok(parsed) = LmpPdu::parse(pdu) {
            if parsed.opcode == opcodes::SET_AFH as u16 {
                if let Err(e) = self.follow_afh(ctx, pkt, &parsed) {
                    warn!("Cannot follow AFH change: {}", e);
                }
            }
        }

        let side = LinkSide::from_clkn(pkt.clkn);
        info!(
            "RX LMP ({}:{:7x}): {} | {}",
            side,
            pkt.clkn,
            pkt.bb_hdr,
            pdu_to_string(pdu)
        );
        ctx.emit(SessionEvent::LmpReceived {
            clkn: pkt.clkn,
            side,
            pdu: pdu.clone(),
        });
    }

    fn handle_l2cap(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        info!("RX L2CAP ({}:{:7x}): {}", LinkSide::from_clkn(pkt.clkn), pkt.clkn, pkt);
        ctx.emit(SessionEvent::L2capReceived {
            clkn: pkt.clkn,
            llid: acl.llid,
            data: acl.data.clone(),
        });
    }

    fn handle_raw(&mut self, ctx: &mut SessionContext, pkt: &RxPacket) -> Option<AclPacket> {
        let Some(uap) = self.uap else {
            debug!("No UAP yet, dropping raw packet at clkn {}", pkt.clkn);
            return None;
        };
        let RxPayload::Acl(acl) = &pkt.payload else {
            debug!("Dropping raw non-ACL packet: {}", pkt.bb_hdr);
            return None;
        };

        match acl.validate_raw(uap) {
            Some(data) => Some(AclPacket {
                data,
                ..acl.clone()
            }),
            None => {
                warn!(
                    "Bad CRC at clkn {} (ch {}): {}\n{}",
                    pkt.clkn,
                    pkt.channel,
                    pkt.bb_hdr,
                    hex_dump(&acl.raw_data)
                );
                ctx.emit(SessionEvent::BadCrc {
                    clkn: pkt.clkn,
                    channel: pkt.channel,
                });
                None
            }
        }
    }
}
