use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harmoniq_plugin_db::xml::descriptors_from_xml;
use harmoniq_plugin_db::{
    CustomScanner, FormatBackend, PluginDescription, ScanError, ShutdownSignal,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::channel::{ChannelListener, WorkerLauncher, WorkerLink};
use crate::policy::{ScanPolicy, SCAN_MODE_KEY};
use crate::protocol::ScanRequest;
use crate::settings::{SettingsStore, Subscription};

/// How often a blocked [`ScanCoordinator::probe`] rechecks the shutdown
/// signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PendingResponse {
    got_response: bool,
    document: Option<Vec<u8>>,
    connection_lost: bool,
    /// Identifies the live worker; callbacks from older workers are ignored.
    generation: u64,
}

#[derive(Debug, Default)]
struct SharedState {
    pending: Mutex<PendingResponse>,
    ready: Condvar,
}

struct ResponseListener {
    shared: Arc<SharedState>,
    generation: u64,
}

impl ChannelListener for ResponseListener {
    fn on_message(&self, message: Vec<u8>) {
        let mut pending = self.shared.pending.lock();
        if pending.generation != self.generation {
            return;
        }
        pending.document = Some(message);
        pending.got_response = true;
        self.shared.ready.notify_one();
    }

    fn on_connection_lost(&self) {
        let mut pending = self.shared.pending.lock();
        if pending.generation != self.generation {
            return;
        }
        pending.document = None;
        pending.got_response = true;
        pending.connection_lost = true;
        self.shared.ready.notify_one();
    }
}

/// How a worker is let go. Only an idle worker at the end of a batch or on
/// a policy switch gets the chance to exit on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Graceful,
    Kill,
}

enum Wake {
    Shutdown,
    ConnectionLost,
    Response(Option<Vec<u8>>),
}

/// Probes plugin files either directly or inside a sandboxed worker process,
/// following the scan policy stored in the settings.
///
/// At most one worker is alive at a time. Any anomaly (lost connection,
/// failed send, policy switching to in-process, end of a scan batch) drops
/// it, and the next out-of-process probe launches a fresh one.
pub struct ScanCoordinator {
    launcher: Box<dyn WorkerLauncher>,
    worker: Option<Box<dyn WorkerLink>>,
    shared: Arc<SharedState>,
    scan_in_process: Arc<AtomicBool>,
    shutdown: ShutdownSignal,
    _settings_subscription: Subscription,
}

impl ScanCoordinator {
    pub fn new(
        settings: &Arc<SettingsStore>,
        launcher: Box<dyn WorkerLauncher>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let scan_in_process = Arc::new(AtomicBool::new(true));
        apply_policy(settings, &scan_in_process);

        let flag = Arc::clone(&scan_in_process);
        let subscription = settings.subscribe(move |settings| apply_policy(settings, &flag));

        Self {
            launcher,
            worker: None,
            shared: Arc::new(SharedState::default()),
            scan_in_process,
            shutdown,
            _settings_subscription: subscription,
        }
    }

    pub fn policy(&self) -> ScanPolicy {
        if self.scan_in_process.load(Ordering::SeqCst) {
            ScanPolicy::InProcess
        } else {
            ScanPolicy::OutOfProcess
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Lists the plugins found at `locator` using `format`.
    ///
    /// Shutdown while waiting on the worker is reported as an empty success
    /// so the surrounding scan can wind down. Errors mean this one file
    /// failed; the worker has been discarded and the next call starts over.
    pub fn probe(
        &mut self,
        format: &dyn FormatBackend,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ScanError> {
        if format.name().is_empty() || locator.is_empty() {
            return Err(ScanError::InvalidRequest(locator.to_string()));
        }

        if self.policy().is_in_process() {
            self.release_worker(Release::Graceful);
            return Ok(probe_in_process(format, locator));
        }

        self.probe_out_of_process(format, locator)
    }

    fn probe_out_of_process(
        &mut self,
        format: &dyn FormatBackend,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ScanError> {
        let message = match ScanRequest::new(format.name(), locator).encode() {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, locator, "failed to encode scan request");
                return Err(ScanError::InvalidRequest(locator.to_string()));
            }
        };

        if self.shutdown.is_requested() {
            self.release_worker(Release::Kill);
            return Ok(Vec::new());
        }
        self.ensure_worker()?;

        {
            let mut pending = self.shared.pending.lock();
            pending.got_response = false;
            pending.document = None;
        }

        let sent = self
            .worker
            .as_ref()
            .map(|worker| worker.send(&message))
            .unwrap_or(false);
        if !sent {
            warn!(locator, "scan worker unreachable, discarding it");
            self.release_worker(Release::Kill);
            return Err(ScanError::SendFailed);
        }

        match self.wait_for_response() {
            Wake::Shutdown => {
                debug!(locator, "shutdown requested while waiting for scan worker");
                self.release_worker(Release::Kill);
                Ok(Vec::new())
            }
            Wake::ConnectionLost => {
                warn!(locator, "scan worker lost while probing");
                self.release_worker(Release::Kill);
                Err(ScanError::ConnectionLost)
            }
            Wake::Response(document) => Ok(parse_response(document, locator)),
        }
    }

    fn wait_for_response(&self) -> Wake {
        let mut pending = self.shared.pending.lock();
        while !pending.got_response && !self.shutdown.is_requested() {
            self.shared.ready.wait_for(&mut pending, POLL_INTERVAL);
        }
        if self.shutdown.is_requested() {
            Wake::Shutdown
        } else if pending.connection_lost {
            Wake::ConnectionLost
        } else {
            Wake::Response(pending.document.take())
        }
    }

    fn ensure_worker(&mut self) -> Result<(), ScanError> {
        if self.worker.is_some() {
            let lost = self.shared.pending.lock().connection_lost;
            let disconnected = self
                .worker
                .as_ref()
                .map(|worker| !worker.is_connected())
                .unwrap_or(true);
            if !lost && !disconnected {
                return Ok(());
            }
            debug!("scan worker went away while idle");
            self.release_worker(Release::Kill);
        }

        let generation = {
            let mut pending = self.shared.pending.lock();
            pending.got_response = false;
            pending.document = None;
            pending.connection_lost = false;
            pending.generation
        };
        let listener = Arc::new(ResponseListener {
            shared: Arc::clone(&self.shared),
            generation,
        });
        let worker = self.launcher.launch(listener).map_err(|err| {
            warn!(%err, "failed to launch scan worker");
            ScanError::Launch(err)
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn release_worker(&mut self, release: Release) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        // Retire the generation first so the dying worker's callbacks are
        // ignored, and never hold the lock while the worker is dropped.
        self.shared.pending.lock().generation += 1;
        if release == Release::Kill {
            worker.terminate();
        }
        drop(worker);
        debug!(?release, "scan worker released");
    }
}

impl CustomScanner for ScanCoordinator {
    fn find_types_for(
        &mut self,
        format: &dyn FormatBackend,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ScanError> {
        self.probe(format, locator)
    }

    fn scan_finished(&mut self) {
        self.release_worker(Release::Graceful);
    }
}

impl std::fmt::Debug for ScanCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCoordinator")
            .field("policy", &self.policy())
            .field("has_worker", &self.has_worker())
            .finish()
    }
}

fn apply_policy(settings: &SettingsStore, scan_in_process: &AtomicBool) {
    let policy = ScanPolicy::from_setting(settings.int_value(SCAN_MODE_KEY, 0));
    scan_in_process.store(policy.is_in_process(), Ordering::SeqCst);
    debug!(%policy, "plugin scan policy updated");
}

fn probe_in_process(format: &dyn FormatBackend, locator: &str) -> Vec<PluginDescription> {
    match format.enumerate_descriptors(locator) {
        Ok(found) => found,
        Err(err) => {
            warn!(%err, locator, format = format.name(), "in-process probe failed");
            Vec::new()
        }
    }
}

fn parse_response(document: Option<Vec<u8>>, locator: &str) -> Vec<PluginDescription> {
    let Some(document) = document else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&document);
    match descriptors_from_xml(&text) {
        Ok(found) => found,
        Err(err) => {
            warn!(%err, locator, "scan worker sent an unreadable response");
            Vec::new()
        }
    }
}
