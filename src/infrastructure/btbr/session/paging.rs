//! Connection sessions: paging (we are master) and page scan (we are slave)
//!
//! Both become ready when the device reports CONNECTED with SUCCESS; the
//! LMP engine for the link is created at that point and lives until the
//! session ends.

use super::{log_unexpected_state, SessionContext, SessionFlow, SessionHandler};
use crate::domain::models::{
    BdAddr, DeviceState, LinkSide, ReasonCode, RemoteSummary, SessionEvent, StateReason,
};
use crate::infrastructure::btbr::codec::{AclPacket, RxPacket};
use crate::infrastructure::btbr::dispatcher::CommandError;
use crate::infrastructure::btbr::lmp::{LmpEngine, LmpLink, LmpRole};
use crate::infrastructure::btbr::protocol::llid;
use tracing::{info, warn};

/// [`LmpLink`] over the session's ACL transport
pub struct AclLink<'a> {
    ctx: &'a SessionContext,
    lt_addr: u8,
}

impl<'a> AclLink<'a> {
    pub fn new(ctx: &'a SessionContext, lt_addr: u8) -> Self {
        Self { ctx, lt_addr }
    }
}

impl LmpLink for AclLink<'_> {
    fn send_lmp(&mut self, pdu: &[u8]) -> Result<(), CommandError> {
        self.ctx
            .dispatcher()
            .send_acl_cmd(self.lt_addr, llid::LMP, true, pdu)
    }

    fn set_afh(&mut self, instant: u32, mode: u8, map: &[u8; 10]) -> Result<(), CommandError> {
        self.ctx.dispatcher().send_set_afh_cmd(instant, mode, map)
    }

    fn setup_complete(&mut self, remote: Option<RemoteSummary>) {
        info!("LMP setup complete");
        self.ctx.emit(SessionEvent::SetupComplete { remote });
    }

    fn detach(&mut self) {
        if let Err(e) = self.ctx.dispatcher().send_idle_cmd() {
            warn!("Failed to idle after detach: {}", e);
        }
    }
}

/// Link state shared by both connection sessions
struct Connection {
    role: LmpRole,
    device_name: String,
    lt_addr: Option<u8>,
    lmp: Option<LmpEngine>,
}

impl Connection {
    fn new(role: LmpRole, device_name: String) -> Self {
        Self {
            role,
            device_name,
            lt_addr: None,
            lmp: None,
        }
    }

    /// CONNECTED reported: bring up the LMP engine on the assigned lt_addr
    fn on_connected(&mut self, ctx: &mut SessionContext, session: &'static str, reason: StateReason) -> SessionFlow {
        if reason.code != ReasonCode::Success {
            info!("Connection status {}", reason.code);
            return SessionFlow::Continue;
        }
        assert!(reason.lt_addr != 0, "connection established without an lt_addr");

        let lt_addr = reason.lt_addr;
        info!("Connection ready, lt_addr={}", lt_addr);
        ctx.emit(SessionEvent::Connected { session, lt_addr });

        let mut engine = LmpEngine::new(self.role, &self.device_name);
        if let Err(e) = engine.start(&mut AclLink::new(ctx, lt_addr)) {
            warn!("LMP start failed: {}", e);
        }
        self.lt_addr = Some(lt_addr);
        self.lmp = Some(engine);
        SessionFlow::Ready
    }

    fn on_lmp(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        ctx.emit(SessionEvent::LmpReceived {
            clkn: pkt.clkn,
            side: LinkSide::from_clkn(pkt.clkn),
            pdu: acl.data.clone(),
        });
        let (Some(engine), Some(lt_addr)) = (self.lmp.as_mut(), self.lt_addr) else {
            return;
        };
        if let Err(e) = engine.receive(pkt.clkn, &acl.data, &mut AclLink::new(ctx, lt_addr)) {
            warn!("LMP receive failed: {}", e);
        }
    }
}

fn on_l2cap(ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
    info!("RX L2CAP: {}", acl);
    ctx.emit(SessionEvent::L2capReceived {
        clkn: pkt.clkn,
        llid: acl.llid,
        data: acl.data.clone(),
    });
}

/// Page a device and run the master side of link setup
pub struct Paging {
    bdaddr: BdAddr,
    conn: Connection,
}

impl Paging {
    pub fn new(bdaddr: BdAddr, device_name: impl Into<String>) -> Self {
        Self {
            bdaddr,
            conn: Connection::new(LmpRole::Master, device_name.into()),
        }
    }
}

impl SessionHandler for Paging {
    fn name(&self) -> &'static str {
        "paging"
    }

    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError> {
        info!("Paging {}", self.bdaddr);
        ctx.dispatcher().send_paging_cmd(self.bdaddr)
    }

    fn handle_state(
        &mut self,
        ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow {
        match state {
            DeviceState::Page => {
                info!("Paging started");
                SessionFlow::Continue
            }
            DeviceState::Connected => self.conn.on_connected(ctx, self.name(), reason),
            _ => {
                log_unexpected_state(self.name(), state, reason);
                info!("Paging done");
                SessionFlow::Done
            }
        }
    }

    fn handle_lmp(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        self.conn.on_lmp(ctx, pkt, acl);
    }

    fn handle_l2cap(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        on_l2cap(ctx, pkt, acl);
    }

    fn defers_stop(&self) -> bool {
        true
    }
}

/// Wait to be paged and run the slave side of link setup
pub struct PageScan {
    conn: Connection,
}

impl PageScan {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(LmpRole::Slave, device_name.into()),
        }
    }
}

impl SessionHandler for PageScan {
    fn name(&self) -> &'static str {
        "page-scan"
    }

    fn start(&mut self, ctx: &mut SessionContext) -> Result<(), CommandError> {
        ctx.dispatcher().send_page_scan_cmd()
    }

    fn handle_state(
        &mut self,
        ctx: &mut SessionContext,
        state: DeviceState,
        reason: StateReason,
    ) -> SessionFlow {
        match state {
            DeviceState::PageScan => {
                info!("Page Scan state Ready");
                SessionFlow::Continue
            }
            DeviceState::Connected => self.conn.on_connected(ctx, self.name(), reason),
            _ => {
                log_unexpected_state(self.name(), state, reason);
                info!("Page scan done");
                SessionFlow::Done
            }
        }
    }

    fn handle_lmp(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        self.conn.on_lmp(ctx, pkt, acl);
    }

    fn handle_l2cap(&mut self, ctx: &mut SessionContext, pkt: &RxPacket, acl: &AclPacket) {
        on_l2cap(ctx, pkt, acl);
    }

    fn defers_stop(&self) -> bool {
        true
    }
}
