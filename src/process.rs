//! Launching `eye-worker` child processes and pumping their stdio.
//!
//! Each child gets two named pump threads. The stdout pump parses worker
//! lines, raises the host-side signals for `signal` lines and forwards the
//! rest to the eye's response channel. The stdin pump writes queued commands
//! as JSON lines until the child goes away.

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::message::Eye;
use crate::signal::{Signal, SharedSignal};
use crate::worker_message::{decode_line, encode_line, WorkerCommand, WorkerMessage, WorkerSignal};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const PUMP_POLL: Duration = Duration::from_millis(100);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Host-side flags for one eye's worker.
#[derive(Debug, Clone, Default)]
pub struct EyeSignals {
    /// The worker finished a frame and wants the next one.
    pub ready: SharedSignal,
    /// The worker released its shared frame.
    pub shm_closed: SharedSignal,
    /// The worker's main loop is running.
    pub running: SharedSignal,
    /// The first telemetry half of this session was paired.
    pub first_frame: SharedSignal,
}

impl EyeSignals {
    fn raise(&self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Ready => self.ready.set(),
            WorkerSignal::Running => self.running.set(),
            WorkerSignal::ShmClosed => self.shm_closed.set(),
        }
    }
}

/// Command and response channels plus signals for one eye. Cloning shares
/// the same channels.
#[derive(Debug, Clone)]
pub struct EyeChannels {
    pub command_tx: Sender<WorkerCommand>,
    pub command_rx: Receiver<WorkerCommand>,
    pub response_tx: Sender<WorkerMessage>,
    pub response_rx: Receiver<WorkerMessage>,
    pub signals: EyeSignals,
}

impl EyeChannels {
    pub fn new() -> Self {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (response_tx, response_rx) = crossbeam_channel::unbounded();
        Self {
            command_tx,
            command_rx,
            response_tx,
            response_rx,
            signals: EyeSignals::default(),
        }
    }

    /// Discards commands nobody has picked up yet. Returns how many.
    pub fn drain_commands(&self) -> usize {
        self.command_rx.try_iter().count()
    }
}

impl Default for EyeChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub eye: Eye,
    pub importer_name: String,
    pub sharedmem_name: String,
    pub calibration_path: String,
    /// (height, width) of the shared frame.
    pub memory_shape: (u32, u32),
    pub test_mode: bool,
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec, channels: &EyeChannels) -> Result<Box<dyn WorkerProcess>>;
}

/// A handle on one running worker.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn is_alive(&mut self) -> bool;
    /// Asks the worker to exit (SIGTERM).
    fn terminate(&mut self);
    /// Waits up to `timeout` for the worker to exit. Returns whether it did.
    fn join(&mut self, timeout: Duration) -> bool;
    /// Forces the worker down (SIGKILL).
    fn kill(&mut self);
}

/// Launches the `eye-worker` executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
    fps: Option<u32>,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            fps: None,
        }
    }

    /// Uses the configured worker binary, or `eye-worker` beside this one.
    pub fn from_config(tracker: &TrackerConfig) -> Self {
        Self::new(tracker.worker_path())
    }

    /// Caps the frame rate of test-mode workers.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg(spec.eye.to_string())
            .arg(&spec.importer_name)
            .arg(&spec.sharedmem_name)
            .arg(&spec.calibration_path)
            .arg("--height")
            .arg(spec.memory_shape.0.to_string())
            .arg("--width")
            .arg(spec.memory_shape.1.to_string());
        if spec.test_mode {
            command.arg("--test-mode");
        }
        if let Some(fps) = self.fps {
            command.arg("--fps").arg(fps.to_string());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec, channels: &EyeChannels) -> Result<Box<dyn WorkerProcess>> {
        let mut child = self.command(spec).spawn()?;
        let pump_stop = Signal::shared();

        // Both pipes were requested above.
        if let Some(stdout) = child.stdout.take() {
            let responses = channels.response_tx.clone();
            let signals = channels.signals.clone();
            let eye = spec.eye;
            thread::Builder::new()
                .name(format!("eye-worker-{eye}-stdout"))
                .spawn(move || pump_stdout(eye, stdout, responses, signals))?;
        }
        if let Some(stdin) = child.stdin.take() {
            let commands = channels.command_rx.clone();
            let stop = SharedSignal::clone(&pump_stop);
            let eye = spec.eye;
            thread::Builder::new()
                .name(format!("eye-worker-{eye}-stdin"))
                .spawn(move || pump_stdin(eye, stdin, commands, stop))?;
        }

        info!("WorkerLauncher : {} worker started (pid={}).", spec.eye, child.id());
        Ok(Box::new(ChildProcess { child, pump_stop }))
    }
}

fn pump_stdout(eye: Eye, stdout: ChildStdout, responses: Sender<WorkerMessage>, signals: EyeSignals) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("{eye} worker stdout : read error {e}.");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(WorkerMessage::Signal { signal }) => signals.raise(signal),
            Ok(message) => {
                if responses.send(message).is_err() {
                    debug!("{eye} worker stdout : response channel closed.");
                    break;
                }
            }
            Err(e) => warn!("{eye} worker stdout : dropping malformed line : {e}."),
        }
    }
    debug!("{eye} worker stdout : terminated.");
}

fn pump_stdin(eye: Eye, mut stdin: ChildStdin, commands: Receiver<WorkerCommand>, stop: SharedSignal) {
    while !stop.is_set() {
        let command = match commands.recv_timeout(PUMP_POLL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let written = encode_line(&command).and_then(|line| {
            stdin.write_all(line.as_bytes())?;
            stdin.flush()?;
            Ok(())
        });
        if let Err(e) = written {
            debug!("{eye} worker stdin : {e}, stopping.");
            break;
        }
    }
    debug!("{eye} worker stdin : terminated.");
}

/// A spawned `eye-worker`.
pub struct ChildProcess {
    child: Child,
    pump_stop: SharedSignal,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            return;
        };
        // SAFETY: plain syscall on our own child's pid, which is not reaped
        // until try_wait/wait observes the exit.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            debug!(
                "ChildProcess : SIGTERM to {pid} ignored : {}.",
                std::io::Error::last_os_error()
            );
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) | Err(_) => {
                    self.pump_stop.set();
                    return true;
                }
                Ok(None) if Instant::now() >= deadline => return false,
                Ok(None) => thread::sleep(EXIT_POLL),
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("ChildProcess : kill ignored : {e}.");
        }
        let _ = self.child.wait();
        self.pump_stop.set();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
        self.pump_stop.set();
    }
}
