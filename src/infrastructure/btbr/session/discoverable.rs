//! Discoverable composite session
//!
//! Alternates inquiry scan and page scan on a fixed duty cycle. A page scan
//! that has connected is only stopped once its link allows it.

use super::inquiry::InquiryScan;
use super::paging::PageScan;
use super::{SessionControl, SessionHandle, SessionHandler};
use crate::domain::models::{EirEntry, SessionEvent};
use crate::domain::settings::DiscoverableSettings;
use crate::infrastructure::btbr::dispatcher::Dispatcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Stop request that can be waited on with a timeout
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn set(&self) {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `timeout` unless stopped first; true if stopped
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

pub struct Discoverable {
    dispatcher: Dispatcher,
    eir: Option<Vec<EirEntry>>,
    device_name: String,
    settings: DiscoverableSettings,
    stop_grace: Duration,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Discoverable {
    pub fn new(
        dispatcher: Dispatcher,
        eir: Option<Vec<EirEntry>>,
        device_name: impl Into<String>,
        settings: DiscoverableSettings,
        stop_grace: Duration,
    ) -> Self {
        Self {
            dispatcher,
            eir,
            device_name: device_name.into(),
            settings,
            stop_grace,
            events: None,
        }
    }

    /// Forward the events of every inner session to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn spawn(self) -> std::io::Result<DiscoverableHandle> {
        let signal = Arc::new(StopSignal::default());
        let done = Arc::new(AtomicBool::new(false));

        let thread_signal = Arc::clone(&signal);
        let thread_done = Arc::clone(&done);
        let thread = thread::Builder::new()
            .name("btbr-discoverable".to_string())
            .spawn(move || {
                let events = self.events.clone();
                self.run(&thread_signal);
                thread_done.store(true, Ordering::SeqCst);
                if let Some(events) = events {
                    let _ = events.send(SessionEvent::Finished {
                        session: "discoverable",
                    });
                }
            })?;
        info!("Started discoverable");

        Ok(DiscoverableHandle {
            signal,
            done,
            thread: Some(thread),
        })
    }

    fn run(&self, signal: &StopSignal) {
        while !signal.is_set() {
            if !self.run_once(signal) {
                break;
            }
        }
        info!("Discoverable stopped");
    }

    /// One duty cycle; false if an inner session could not be started
    fn run_once(&self, signal: &StopSignal) -> bool {
        let Some(mut scan) = self.start(InquiryScan::new(self.eir.clone())) else {
            return false;
        };
        signal.wait(Duration::from_millis(self.settings.inquiry_scan_dwell_ms));
        scan.stop();
        if signal.is_set() {
            return true;
        }

        let Some(mut page) = self.start(PageScan::new(self.device_name.as_str())) else {
            return false;
        };
        signal.wait(Duration::from_millis(self.settings.page_scan_dwell_ms));
        // A running connection is left to complete
        while !page.stop_allowed() && !signal.is_set() {
            signal.wait(Duration::from_millis(self.settings.stop_poll_ms));
        }
        page.stop();
        true
    }

    fn start<H: SessionHandler>(&self, handler: H) -> Option<SessionHandle> {
        let name = handler.name();
        info!("Starting {}", name);
        SessionHandle::spawn(self.dispatcher.clone(), handler, self.events.clone(), self.stop_grace)
            .map_err(|e| error!("Failed to start {}: {}", name, e))
            .ok()
    }
}

/// Running discoverable session
pub struct DiscoverableHandle {
    signal: Arc<StopSignal>,
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SessionControl for DiscoverableHandle {
    fn name(&self) -> &'static str {
        "discoverable"
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Inner page scans defer their own stop
    fn stop_allowed(&self) -> bool {
        true
    }

    fn stop(&mut self) {
        self.signal.set();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("discoverable thread panicked");
            }
        }
    }
}

impl Drop for DiscoverableHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
