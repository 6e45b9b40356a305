//! Inquiry sessions: discover devices, or answer inquiries with an optional EIR

use super::{log_unexpected_state, SessionContext, SessionFlow, SessionHandler};
use crate::domain::models::{DeviceState, EirEntry, SessionEvent, StateReason};
use crate::infrastructure::btbr::codec::{decode_eir, eir_to_string, AclPacket, RxPacket};
use crate::infrastructure::btbr::dispatcher::CommandError;
use tracing::{info, warn};

/// Discover nearby devices and report their extended inquiry responses
#[derive(Debug, Default)]
pub struct Inquiry;

impl Inquiry {
    pub fn new() -> Self {
        Self
    }
}

impl SessionHandler for Inquiry {
    fn name(&self) -> &'static str {
        "inquiry"
    }

    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError> {
        ctx.dispatcher().send_inquiry_cmd()
    }

    fn handle_state(
        &mut self,
        _ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow {
        if state == DeviceState::Inquiry {
            info!("Inquiry state Ready");
            return SessionFlow::Ready;
        }
        log_unexpected_state(self.name(), state, reason);
        info!("Inquiry done");
        SessionFlow::Done
    }

    fn handle_l2cap(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        let (entries, well_formed) = decode_eir(&acl.data);
        if !well_formed {
            warn!("Malformed EIR from channel {}, keeping {} entries", pkt.channel, entries.len());
        }
        info!("{}\n{}", acl, eir_to_string(&entries));
        ctx.emit(SessionEvent::InquiryResult {
            clkn: pkt.clkn,
            channel: pkt.channel,
            entries,
            well_formed,
        });
    }
}

/// Answer inquiries, optionally with an extended inquiry response
#[derive(Debug, Default)]
pub struct InquiryScan {
    eir: Option<Vec<EirEntry>>,
}

impl InquiryScan {
    pub fn new(eir: Option<Vec<EirEntry>>) -> Self {
        Self { eir }
    }
}

impl SessionHandler for InquiryScan {
    fn name(&self) -> &'static str {
        "inquiry-scan"
    }

    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError> {
        if let Some(eir) = &self.eir {
            ctx.dispatcher().send_set_eir_cmd(eir)?;
        }
        ctx.dispatcher().send_inquiry_scan_cmd()
    }

    fn handle_state(
        &mut self,
        _ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow {
        if state == DeviceState::InquiryScan {
            info!("Inquiry Scan state Ready");
            return SessionFlow::Ready;
        }
        log_unexpected_state(self.name(), state, reason);
        info!("Inquiry scan done");
        SessionFlow::Done
    }
}
