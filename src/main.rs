use anyhow::{Context, Result};
use btbr_host::domain::models::{BdAddr, SessionEvent};
use btbr_host::domain::settings::{Settings, SettingsService};
use btbr_host::infrastructure::btbr::codec::eir_for_local_name;
use btbr_host::infrastructure::btbr::session::discoverable::Discoverable;
use btbr_host::infrastructure::btbr::session::inquiry::{Inquiry, InquiryScan};
use btbr_host::infrastructure::btbr::session::monitor::Monitor;
use btbr_host::infrastructure::btbr::session::paging::{PageScan, Paging};
use btbr_host::infrastructure::btbr::session::{SessionControl, SessionHandle, SessionHandler};
use btbr_host::infrastructure::btbr::transport::RusbTransport;
use btbr_host::infrastructure::btbr::Dispatcher;
use btbr_host::infrastructure::logging::init_logger;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// How long to keep reading console output after a debug message
const DEBUG_REPLY_WAIT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "btbr", version, about = "Ubertooth BR/EDR host")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file (default: <config dir>/btbr/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local device address, aa:bb:cc:dd:ee:ff
    #[arg(long, global = true)]
    bdaddr: Option<BdAddr>,

    /// Radio frequency offset
    #[arg(long = "freq-off", global = true)]
    freq_off: Option<u8>,

    /// Access code errors tolerated by the correlator
    #[arg(long = "max-ac-errors", global = true)]
    max_ac_errors: Option<u8>,

    /// Local name for LMP name requests and the inquiry response
    #[arg(long, global = true)]
    name: Option<String>,

    /// Log level or tracing directives
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    /// Print session events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover nearby devices
    Inquiry,
    /// Answer inquiries
    InquiryScan,
    /// Connect to a device as master
    Page { bdaddr: BdAddr },
    /// Accept a connection as slave
    PageScan,
    /// Alternate inquiry scan and page scan
    Discoverable,
    /// Follow a link between a master and `bdaddr`
    Monitor { bdaddr: BdAddr },
    /// Send a console message to the firmware
    Debug { message: String },
    /// Reset the device
    Reset,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(bdaddr) = self.bdaddr {
            settings.local_bdaddr = Some(bdaddr);
        }
        if let Some(offset) = self.freq_off {
            settings.freq_offset = Some(offset);
        }
        if let Some(max_errors) = self.max_ac_errors {
            settings.max_ac_errors = Some(max_errors);
        }
        if let Some(name) = &self.name {
            settings.device_name = name.clone();
            settings.eir_name = Some(name.clone());
        }
        if let Some(level) = &self.log_level {
            settings.log_settings.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    cli.apply(settings_service.get_mut());
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Settings from {}", settings_service.path().display());

    let transport = RusbTransport::open(&settings.device).context("Failed to open Ubertooth")?;
    let dispatcher = Dispatcher::new(Arc::new(transport), settings.device.clone());
    dispatcher.connect().context("Failed to start receive thread")?;

    let result = run(cli.command, cli.json, &dispatcher, &settings).await;

    let closing = dispatcher.clone();
    tokio::task::spawn_blocking(move || closing.close()).await?;
    result
}

/// Push the local identity and radio tuning to the device
fn configure(dispatcher: &Dispatcher, settings: &Settings) -> Result<()> {
    if let Some(bdaddr) = settings.local_bdaddr {
        info!("Set bdaddr {}", bdaddr);
        dispatcher.send_set_bdaddr_cmd(bdaddr)?;
    }
    if let Some(offset) = settings.freq_offset {
        dispatcher.send_set_freq_off_cmd(offset)?;
    }
    if let Some(max_errors) = settings.max_ac_errors {
        dispatcher.send_set_max_ac_errors_cmd(max_errors)?;
    }
    Ok(())
}

async fn run(command: Command, json: bool, dispatcher: &Dispatcher, settings: &Settings) -> Result<()> {
    configure(dispatcher, settings)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let eir = settings.eir_name.as_deref().map(eir_for_local_name);
    let name = settings.device_name.clone();
    let grace = settings.stop_grace();

    let session: Box<dyn SessionControl> = match command {
        Command::Inquiry => spawn(dispatcher, Inquiry::new(), events_tx, grace)?,
        Command::InquiryScan => spawn(dispatcher, InquiryScan::new(eir), events_tx, grace)?,
        Command::Page { bdaddr } => spawn(dispatcher, Paging::new(bdaddr, name), events_tx, grace)?,
        Command::PageScan => spawn(dispatcher, PageScan::new(name), events_tx, grace)?,
        Command::Monitor { bdaddr } => spawn(dispatcher, Monitor::new(bdaddr), events_tx, grace)?,
        Command::Discoverable => Box::new(
            Discoverable::new(dispatcher.clone(), eir, name, settings.discoverable.clone(), grace)
                .with_events(events_tx)
                .spawn()?,
        ),
        Command::Debug { message } => {
            dispatcher.send_debug_cmd(message.as_bytes())?;
            tokio::time::sleep(DEBUG_REPLY_WAIT).await;
            return Ok(());
        }
        Command::Reset => {
            dispatcher.send_reset_cmd()?;
            return Ok(());
        }
    };

    watch(session, events_rx, json).await
}

fn spawn<H: SessionHandler>(
    dispatcher: &Dispatcher,
    handler: H,
    events: mpsc::UnboundedSender<SessionEvent>,
    stop_grace: Duration,
) -> Result<Box<dyn SessionControl>> {
    let name = handler.name();
    let handle = SessionHandle::spawn(dispatcher.clone(), handler, Some(events), stop_grace)
        .with_context(|| format!("Failed to start {}", name))?;
    Ok(Box::new(handle))
}

/// Relay events until the session finishes or Ctrl-C, then stop it
async fn watch(
    mut session: Box<dyn SessionControl>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    json: bool,
) -> Result<()> {
    let name = session.name();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping {}", name);
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => error!("Failed to serialize event: {}", e),
                    }
                }
                if event == (SessionEvent::Finished { session: name }) {
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || session.stop()).await?;
    Ok(())
}
