use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use harmoniq_plugin_db::xml::descriptors_to_xml;
use harmoniq_plugin_db::{
    CustomScanner, FormatBackend, KnownPluginList, PluginDescription, ProbeError, ScanError,
    ShutdownSignal,
};
use harmoniq_plugin_scanner::{
    ChannelListener, ScanCoordinator, ScanPolicy, ScanRequest, SettingsStore, WorkerLauncher,
    WorkerLink, SCAN_MODE_KEY,
};
use parking_lot::Mutex;

/// What the scripted worker does with the next request it receives.
enum Reply {
    Document(String),
    ConnectionLost,
    Silence,
    RefuseSend,
}

#[derive(Default)]
struct MockState {
    spawned: AtomicUsize,
    dropped: AtomicUsize,
    terminated: AtomicUsize,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ScanRequest>>,
    listener: Mutex<Option<Arc<dyn ChannelListener>>>,
}

impl MockState {
    fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Simulates the current worker dying between requests.
    fn kill_current(&self) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.on_connection_lost();
        }
    }
}

struct MockLauncher {
    state: Arc<MockState>,
}

impl WorkerLauncher for MockLauncher {
    fn launch(&mut self, listener: Arc<dyn ChannelListener>) -> io::Result<Box<dyn WorkerLink>> {
        self.state.spawned.fetch_add(1, Ordering::SeqCst);
        *self.state.listener.lock() = Some(Arc::clone(&listener));
        Ok(Box::new(MockWorker {
            state: Arc::clone(&self.state),
            listener,
            alive: AtomicBool::new(true),
        }))
    }
}

struct MockWorker {
    state: Arc<MockState>,
    listener: Arc<dyn ChannelListener>,
    alive: AtomicBool,
}

impl WorkerLink for MockWorker {
    fn send(&self, message: &[u8]) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        self.state
            .requests
            .lock()
            .push(ScanRequest::decode(message).expect("valid request"));
        let reply = self.state.replies.lock().pop_front().unwrap_or(Reply::Silence);
        let listener = Arc::clone(&self.listener);
        match reply {
            Reply::Document(document) => {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    listener.on_message(document.into_bytes());
                });
            }
            Reply::ConnectionLost => {
                self.alive.store(false, Ordering::SeqCst);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    listener.on_connection_lost();
                });
            }
            Reply::Silence => {}
            Reply::RefuseSend => {
                self.alive.store(false, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.state.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct LocalBackend {
    calls: AtomicUsize,
}

impl FormatBackend for LocalBackend {
    fn name(&self) -> &str {
        "VST"
    }

    fn enumerate_descriptors(
        &self,
        locator: &str,
    ) -> Result<Vec<PluginDescription>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![PluginDescription::new("Local", "VST", locator)])
    }
}

fn backend() -> LocalBackend {
    LocalBackend {
        calls: AtomicUsize::new(0),
    }
}

fn document(names: &[&str]) -> String {
    let descriptions: Vec<_> = names
        .iter()
        .map(|name| PluginDescription::new(*name, "VST", format!("/{name}.vst")))
        .collect();
    descriptors_to_xml(&descriptions).unwrap()
}

fn coordinator(policy: ScanPolicy) -> (ScanCoordinator, Arc<MockState>, Arc<SettingsStore>, ShutdownSignal) {
    let settings = SettingsStore::in_memory();
    settings
        .set_value(SCAN_MODE_KEY, policy.as_setting())
        .unwrap();
    let state = Arc::new(MockState::default());
    let shutdown = ShutdownSignal::new();
    let coordinator = ScanCoordinator::new(
        &settings,
        Box::new(MockLauncher {
            state: Arc::clone(&state),
        }),
        shutdown.clone(),
    );
    (coordinator, state, settings, shutdown)
}

#[test]
fn in_process_policy_never_launches_a_worker() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::InProcess);
    let local = backend();
    for locator in ["/a.vst", "/b.vst", "/c.vst"] {
        let found = coordinator.probe(&local, locator).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_or_identifier, locator);
    }
    assert_eq!(state.spawned(), 0);
    assert_eq!(local.calls.load(Ordering::SeqCst), 3);
    assert!(!coordinator.has_worker());
}

#[test]
fn worker_lifecycle_across_connection_loss() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    let local = backend();

    state.push(Reply::Document(document(&["One", "Two"])));
    let found = coordinator.probe(&local, "/a").unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(state.spawned(), 1);

    state.push(Reply::ConnectionLost);
    let err = coordinator.probe(&local, "/b").unwrap_err();
    assert!(matches!(err, ScanError::ConnectionLost));
    assert_eq!(state.spawned(), 1);
    assert_eq!(state.dropped(), 1);
    assert_eq!(state.terminated(), 1);
    assert!(!coordinator.has_worker());

    state.push(Reply::Document(document(&["Three"])));
    let found = coordinator.probe(&local, "/c").unwrap();
    assert_eq!(found[0].name, "Three");
    assert_eq!(state.spawned(), 2);

    let requests = state.requests.lock();
    let locators: Vec<_> = requests.iter().map(|r| r.locator.as_str()).collect();
    assert_eq!(locators, vec!["/a", "/b", "/c"]);
    assert!(requests.iter().all(|r| r.format_name == "VST"));
    assert_eq!(local.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn malformed_descriptors_are_dropped() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    let response = r#"<PLUGINS>
        <PLUGIN name="A" format="VST" file="/a.vst"/>
        <PLUGIN format="VST" file="/missing-name.vst"/>
        <PLUGIN name="B" format="VST" file="/b.vst"/>
        <SOMETHING name="C" format="VST" file="/c.vst"/>
        <PLUGIN name="D" format="VST" file="/d.vst" numInputs="-1"/>
        <PLUGIN name="E" format="VST" file="/e.vst"/>
    </PLUGINS>"#;
    state.push(Reply::Document(response.to_string()));
    let found = coordinator.probe(&backend(), "/bundle").unwrap();
    let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "E"]);
}

#[test]
fn empty_response_is_success() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Document("<PLUGINS/>".into()));
    assert!(coordinator.probe(&backend(), "/empty").unwrap().is_empty());
    assert!(coordinator.has_worker());
}

#[test]
fn send_failure_discards_worker_without_waiting() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::RefuseSend);
    let started = Instant::now();
    let err = coordinator.probe(&backend(), "/a").unwrap_err();
    assert!(matches!(err, ScanError::SendFailed));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!coordinator.has_worker());

    state.push(Reply::Document(document(&["A"])));
    assert_eq!(coordinator.probe(&backend(), "/a").unwrap().len(), 1);
    assert_eq!(state.spawned(), 2);
}

#[test]
fn shutdown_while_waiting_returns_empty_success_promptly() {
    let (mut coordinator, state, _settings, shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Silence);

    let signalled_at = Arc::new(Mutex::new(None));
    let signaller = {
        let shutdown = shutdown.clone();
        let signalled_at = Arc::clone(&signalled_at);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            *signalled_at.lock() = Some(Instant::now());
            shutdown.request();
        })
    };

    let found = coordinator.probe(&backend(), "/hangs").unwrap();
    let returned_at = Instant::now();
    signaller.join().unwrap();

    assert!(found.is_empty());
    assert!(!coordinator.has_worker());
    assert_eq!(state.terminated(), 1);
    let signalled_at = signalled_at.lock().expect("shutdown was signalled");
    assert!(returned_at.duration_since(signalled_at) <= Duration::from_millis(100));
}

#[test]
fn shutdown_before_probe_skips_the_worker() {
    let (mut coordinator, state, _settings, shutdown) = coordinator(ScanPolicy::OutOfProcess);
    shutdown.request();
    assert!(coordinator.probe(&backend(), "/a").unwrap().is_empty());
    assert_eq!(state.spawned(), 0);
}

#[test]
fn serialized_callers_share_one_worker() {
    let (coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Document(document(&["A"])));
    state.push(Reply::Document(document(&["B"])));
    let coordinator = Arc::new(Mutex::new(coordinator));

    let handles: Vec<_> = ["/a", "/b"]
        .into_iter()
        .map(|locator| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.lock().probe(&backend(), locator).unwrap().len())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1);
    }
    assert_eq!(state.spawned(), 1);
}

#[test]
fn switching_to_in_process_discards_the_worker() {
    let (mut coordinator, state, settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Document(document(&["A"])));
    let local = backend();
    coordinator.probe(&local, "/a").unwrap();
    assert!(coordinator.has_worker());

    settings
        .set_value(SCAN_MODE_KEY, ScanPolicy::InProcess.as_setting())
        .unwrap();
    assert_eq!(coordinator.policy(), ScanPolicy::InProcess);

    let found = coordinator.probe(&local, "/b").unwrap();
    assert_eq!(found[0].name, "Local");
    assert!(!coordinator.has_worker());
    assert_eq!(state.dropped(), 1);
    assert_eq!(state.spawned(), 1);
}

#[test]
fn worker_lost_while_idle_is_replaced() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Document(document(&["A"])));
    coordinator.probe(&backend(), "/a").unwrap();

    state.kill_current();
    state.push(Reply::Document(document(&["B"])));
    let found = coordinator.probe(&backend(), "/b").unwrap();
    assert_eq!(found[0].name, "B");
    assert_eq!(state.spawned(), 2);
}

#[test]
fn scan_finished_releases_worker() {
    let (mut coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    state.push(Reply::Document(document(&["A"])));
    coordinator.probe(&backend(), "/a").unwrap();
    coordinator.scan_finished();
    assert!(!coordinator.has_worker());
    assert_eq!(state.dropped(), 1);
    assert_eq!(state.terminated(), 0);
}

#[test]
fn dropping_coordinator_unsubscribes_from_settings() {
    let (coordinator, _state, settings, _shutdown) = coordinator(ScanPolicy::InProcess);
    assert_eq!(settings.listener_count(), 1);
    drop(coordinator);
    assert_eq!(settings.listener_count(), 0);
}

#[test]
fn known_list_blacklists_plugins_that_kill_the_worker() {
    let (coordinator, state, _settings, _shutdown) = coordinator(ScanPolicy::OutOfProcess);
    let mut list = KnownPluginList::new();
    list.set_custom_scanner(Box::new(coordinator));
    let local = backend();

    state.push(Reply::ConnectionLost);
    state.push(Reply::Document(document(&["Good"])));
    assert!(list.scan_and_add_file(&local, "/crashy.vst", false).is_err());
    assert_eq!(list.scan_and_add_file(&local, "/good.vst", false).unwrap().len(), 1);

    assert!(list.is_blacklisted("/crashy.vst"));
    assert_eq!(list.types().len(), 1);
    assert_eq!(state.spawned(), 2);
    list.scan_finished();
}
