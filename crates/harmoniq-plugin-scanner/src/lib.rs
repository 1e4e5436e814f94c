//! Out-of-process plugin scanning for Harmoniq Studio.
//!
//! Probing third party plugins can crash or hang. The [`ScanCoordinator`]
//! can move that work into a worker process (a re-exec of the host binary
//! started with [`WORKER_FLAG`]) so a misbehaving plugin only takes the
//! worker down. Whether it does is decided per request by the scan policy
//! held in the [`SettingsStore`].

pub mod channel;
pub mod coordinator;
pub mod policy;
pub mod protocol;
pub mod settings;
pub mod worker;

pub use channel::{
    ChannelListener, ProcessLauncher, ProcessWorker, WorkerLauncher, WorkerLink, WORKER_FLAG,
};
pub use coordinator::{ScanCoordinator, POLL_INTERVAL};
pub use policy::{ScanPolicy, SCAN_MODE_KEY};
pub use protocol::{ProtocolError, ScanRequest};
pub use settings::{SettingsError, SettingsStore, Subscription};
pub use worker::run_worker;
