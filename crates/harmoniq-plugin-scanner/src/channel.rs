use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{read_frame, write_frame, ProtocolError};

/// Argument that turns the host executable into a scan worker. It is
/// followed by the session token.
pub const WORKER_FLAG: &str = "--scan-worker";

const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Receives traffic from a worker. Called on the channel's reader thread.
pub trait ChannelListener: Send + Sync {
    fn on_message(&self, message: Vec<u8>);

    /// Called at most once per worker, after which no more messages arrive.
    fn on_connection_lost(&self);
}

/// Host side of a running worker. Dropping it tears the worker down.
pub trait WorkerLink: Send {
    /// Queues one message for the worker; `false` if it is not connected.
    fn send(&self, message: &[u8]) -> bool;

    fn is_connected(&self) -> bool;

    /// Stops the worker at once instead of letting it exit on its own.
    /// Called before dropping a worker that is hung, dead or being abandoned.
    fn terminate(&mut self) {}
}

pub trait WorkerLauncher: Send {
    fn launch(&mut self, listener: Arc<dyn ChannelListener>) -> io::Result<Box<dyn WorkerLink>>;
}

/// Launches workers by re-executing a binary with [`WORKER_FLAG`].
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, listener: Arc<dyn ChannelListener>) -> io::Result<Box<dyn WorkerLink>> {
        let worker = ProcessWorker::spawn(&self.executable, listener)?;
        Ok(Box::new(worker))
    }
}

/// A worker child process talking over its stdin/stdout.
#[derive(Debug)]
pub struct ProcessWorker {
    child: Child,
    writer: Mutex<Option<BufWriter<ChildStdin>>>,
    connected: Arc<AtomicBool>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl ProcessWorker {
    pub fn spawn(executable: &Path, listener: Arc<dyn ChannelListener>) -> io::Result<Self> {
        let token = Uuid::new_v4().to_string();
        let mut child = Command::new(executable)
            .arg(WORKER_FLAG)
            .arg(&token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker pipes not captured",
                ));
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = Arc::clone(&connected);
        let pid = child.id();
        let reader_thread = thread::Builder::new()
            .name("scan-worker-reader".into())
            .spawn(move || {
                let result = pump_messages(stdout, &token, listener.as_ref());
                match result {
                    Ok(()) => debug!(pid, "scan worker closed its output"),
                    Err(err) => warn!(pid, %err, "scan worker connection failed"),
                }
                reader_connected.store(false, Ordering::SeqCst);
                listener.on_connection_lost();
            });
        let reader_thread = match reader_thread {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        debug!(pid, executable = %executable.display(), "launched scan worker");
        Ok(Self {
            child,
            writer: Mutex::new(Some(BufWriter::new(stdin))),
            connected,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn kill(&mut self) {
        self.writer.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        if let Err(err) = self.child.kill() {
            debug!(pid = self.child.id(), %err, "scan worker already gone");
        }
        let _ = self.child.wait();
        // Processes the worker started may still hold its stdout open, so the
        // reader is left to finish on its own.
        self.reader_thread.take();
    }

    fn shutdown(&mut self) {
        // Closing stdin asks the worker to exit on its own.
        self.writer.lock().take();
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                _ => {
                    debug!(pid = self.child.id(), "killing scan worker");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl WorkerLink for ProcessWorker {
    fn send(&self, message: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            return false;
        };
        match write_frame(writer, message) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to send message to scan worker");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        debug!(pid = self.child.id(), "terminating scan worker");
        self.kill();
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Checks the worker's handshake, then forwards messages until the stream
/// ends or breaks.
fn pump_messages(
    stdout: ChildStdout,
    token: &str,
    listener: &dyn ChannelListener,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(stdout);
    expect_handshake(&mut reader, token)?;
    while let Some(message) = read_frame(&mut reader)? {
        listener.on_message(message);
    }
    Ok(())
}

pub(crate) fn expect_handshake<R: Read>(reader: &mut R, token: &str) -> Result<(), ProtocolError> {
    let hello = read_frame(reader)?.ok_or(ProtocolError::MissingHandshake)?;
    if hello != token.as_bytes() {
        return Err(ProtocolError::TokenMismatch);
    }
    Ok(())
}
