//! Launches and monitors the pair of per-eye tracking workers.
//!
//! The pair moves through one state machine:
//!
//! ```text
//! idle -> starting -> running -> stopping -> idle
//!            \           \
//!             `-> error <-'
//! ```
//!
//! A worker dying while the pair is running demotes it to `error`. Nothing is
//! restarted automatically; the next `start_tracker` is a fresh start.

use crate::config::ConfigStore;
use crate::error::Result;
use crate::message::Eye;
use crate::process::{EyeChannels, WorkerLauncher, WorkerProcess, WorkerSpec};
use crate::service::{Service, ServiceContext};
use crate::worker_message::{HealthEvent, WorkerCommand};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often queued health events are drained between liveness checks.
const HEALTH_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the worker pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Starting and stopping the tracker, as seen by the control handler.
pub trait TrackerService: Send + Sync {
    fn start_tracker(&self);
    fn stop_tracker(&self);
    /// Anything other than idle, including a pair stuck starting.
    fn is_active(&self) -> bool;
}

#[derive(Default)]
struct Side {
    process: Option<Box<dyn WorkerProcess>>,
    running: bool,
}

struct Inner {
    state: WorkerState,
    last_error: Option<String>,
    left: Side,
    right: Side,
}

impl Inner {
    fn side(&mut self, eye: Eye) -> &mut Side {
        match eye {
            Eye::Left => &mut self.left,
            Eye::Right => &mut self.right,
        }
    }
}

/// Owns the two worker processes and their channels.
pub struct WorkerSupervisor {
    launcher: Box<dyn WorkerLauncher>,
    config: Arc<ConfigStore>,
    left: EyeChannels,
    right: EyeChannels,
    health_rx: Receiver<HealthEvent>,
    inner: Mutex<Inner>,
    // Serializes start_tracker/stop_tracker; `inner` is only held briefly.
    transitions: Mutex<()>,
}

impl WorkerSupervisor {
    pub fn new(
        launcher: Box<dyn WorkerLauncher>,
        config: Arc<ConfigStore>,
        left: EyeChannels,
        right: EyeChannels,
        health_rx: Receiver<HealthEvent>,
    ) -> Self {
        Self {
            launcher,
            config,
            left,
            right,
            health_rx,
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                last_error: None,
                left: Side::default(),
                right: Side::default(),
            }),
            transitions: Mutex::new(()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Whether the supervisor believes `eye`'s worker is up.
    pub fn is_running(&self, eye: Eye) -> bool {
        self.inner.lock().side(eye).running
    }

    fn channels(&self, eye: Eye) -> &EyeChannels {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }

    fn spec(&self, eye: Eye) -> WorkerSpec {
        self.config.read(|cfg| {
            let tracker = &cfg.tracker;
            let (sharedmem_name, calibration_path, memory_shape) = match eye {
                Eye::Left => (
                    &tracker.sharedmem_name_left,
                    &tracker.blink_calibration_left,
                    tracker.memory_shape_left,
                ),
                Eye::Right => (
                    &tracker.sharedmem_name_right,
                    &tracker.blink_calibration_right,
                    tracker.memory_shape_right,
                ),
            };
            WorkerSpec {
                eye,
                importer_name: tracker.importer_name.clone(),
                sharedmem_name: sharedmem_name.clone(),
                calibration_path: calibration_path.clone(),
                memory_shape,
                test_mode: tracker.test_mode,
            }
        })
    }

    fn fail(&self, reason: String) {
        error!("WorkerSupervisor : {reason}.");
        let mut inner = self.inner.lock();
        inner.state = WorkerState::Error;
        inner.last_error = Some(reason);
    }

    fn launch(&self, eye: Eye) -> bool {
        let spec = self.spec(eye);
        match self.launcher.launch(&spec, self.channels(eye)) {
            Ok(process) => {
                let mut inner = self.inner.lock();
                let side = inner.side(eye);
                side.process = Some(process);
                side.running = true;
                true
            }
            Err(e) => {
                self.fail(format!("start {eye} failed: {e}"));
                false
            }
        }
    }

    /// Terminates `eye`'s worker: SIGTERM, bounded join, SIGKILL, then give
    /// up. Clears that eye's per-session signals.
    fn terminate_side(&self, eye: Eye) {
        let process = {
            let mut inner = self.inner.lock();
            let side = inner.side(eye);
            side.running = false;
            side.process.take()
        };
        let join_timeout = self.config.read(|cfg| cfg.tracker.process_join_timeout());

        if let Some(mut process) = process {
            let pid = process.pid().map_or_else(|| "?".to_string(), |p| p.to_string());
            if process.is_alive() {
                process.terminate();
                if process.join(join_timeout) {
                    info!("WorkerSupervisor : {eye} worker (pid={pid}) terminated.");
                } else {
                    warn!("WorkerSupervisor : {eye} worker (pid={pid}) ignored SIGTERM, killing.");
                    process.kill();
                    if !process.join(join_timeout) {
                        error!("WorkerSupervisor : {eye} worker (pid={pid}) could not be reaped, abandoning.");
                    }
                }
            } else {
                info!("WorkerSupervisor : {eye} worker (pid={pid}) had already exited.");
            }
        }

        let signals = &self.channels(eye).signals;
        signals.ready.clear();
        signals.first_frame.clear();
        signals.running.clear();
    }

    /// Starts both workers. No-op while starting or running.
    pub fn start_tracker(&self) {
        let _transition = self.transitions.lock();
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, WorkerState::Starting | WorkerState::Running) {
                warn!("WorkerSupervisor : start requested but already {}.", inner.state);
                return;
            }
            inner.state = WorkerState::Starting;
            inner.last_error = None;
        }

        for eye in Eye::BOTH {
            let channels = self.channels(eye);
            channels.signals.running.clear();
            channels.signals.shm_closed.clear();
            channels.drain_commands();
        }

        if !self.launch(Eye::Left) {
            return;
        }
        if !self.launch(Eye::Right) {
            self.terminate_side(Eye::Left);
            return;
        }

        let timeout = self.config.read(|cfg| cfg.tracker.eyeloop_start_timeout());
        let deadline = Instant::now() + timeout;
        for eye in Eye::BOTH {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.channels(eye).signals.running.wait(remaining) {
                error!("WorkerSupervisor : {eye} worker did not report running within {timeout:?}.");
                return;
            }
        }

        let mut inner = self.inner.lock();
        if inner.state == WorkerState::Starting {
            inner.state = WorkerState::Running;
            info!("WorkerSupervisor : both workers running.");
        }
    }

    /// Stops both workers. No-op when idle or already stopping.
    pub fn stop_tracker(&self) {
        let _transition = self.transitions.lock();
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, WorkerState::Idle | WorkerState::Stopping) {
                warn!("WorkerSupervisor : stop requested but already {}.", inner.state);
                return;
            }
            inner.state = WorkerState::Stopping;
        }

        for eye in Eye::BOTH {
            let channels = self.channels(eye);
            if channels.command_tx.try_send(WorkerCommand::Close).is_err() {
                warn!("WorkerSupervisor : could not queue close for {eye} worker.");
            }
            self.terminate_side(eye);
            // Nothing queued for this worker may reach the next one.
            channels.drain_commands();
        }

        let mut inner = self.inner.lock();
        inner.state = WorkerState::Idle;
        inner.left.running = false;
        inner.right.running = false;
        info!("WorkerSupervisor : workers stopped.");
    }

    /// Marks workers that died on their own and demotes a running pair.
    fn monitor_children(&self) {
        let mut inner = self.inner.lock();
        for eye in Eye::BOTH {
            let side = inner.side(eye);
            let died = side.running && side.process.as_mut().is_some_and(|p| !p.is_alive());
            if died {
                side.running = false;
                self.channels(eye).signals.running.clear();
                inner.last_error = Some(format!("{eye} process died"));
                error!("WorkerSupervisor : {eye} worker process died.");
            }
        }
        if inner.state == WorkerState::Running && !(inner.left.running && inner.right.running) {
            inner.state = WorkerState::Error;
        }
    }

    fn drain_health(&self) {
        for event in self.health_rx.try_iter() {
            info!("WorkerSupervisor : {} worker health {}.", event.eye, event.payload);
        }
    }
}

impl Service for WorkerSupervisor {
    fn name(&self) -> &str {
        "WorkerSupervisor"
    }

    fn run(&self, ctx: &ServiceContext) -> Result<()> {
        let mut next_check = Instant::now();
        while !ctx.stop_requested() {
            if Instant::now() >= next_check {
                self.monitor_children();
                next_check = Instant::now() + self.config.read(|cfg| cfg.tracker.health_check_interval());
            }
            self.drain_health();
            ctx.wait_stop(HEALTH_DRAIN_INTERVAL);
        }
        Ok(())
    }

    fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        if !matches!(self.state(), WorkerState::Idle) {
            self.stop_tracker();
        }
        Ok(())
    }
}

impl TrackerService for WorkerSupervisor {
    fn start_tracker(&self) {
        WorkerSupervisor::start_tracker(self);
    }

    fn stop_tracker(&self) {
        WorkerSupervisor::stop_tracker(self);
    }

    fn is_active(&self) -> bool {
        self.state() != WorkerState::Idle
    }
}
