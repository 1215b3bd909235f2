//! Operating modes of the tracker, switched by `TrackerControl` messages.
//!
//! | mode              | workers | frames | preview to client | telemetry downstream | camera stream |
//! |-------------------|---------|--------|-------------------|----------------------|---------------|
//! | `offline`         | stopped | off    | off               | off                  | off           |
//! | `camera_preview`  | stopped | on     | off               | off                  | on            |
//! | `tracker_preview` | running | on     | on                | off                  | off           |
//! | `online`          | running | on     | off               | on                   | off           |

use crate::config::{ConfigStore, SubscriptionId};
use crate::error::Result;
use crate::message::Eye;
use crate::process::EyeChannels;
use crate::router::RouterSignals;
use crate::routing::TrackerControlService;
use crate::service::{Service, ServiceContext, POLL_INTERVAL};
use crate::signal::{Signal, SharedSignal};
use crate::supervisor::TrackerService;
use crate::sync::SyncSignals;
use crate::worker_message::WorkerCommand;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pause after stopping workers before the command queues are emptied.
const SETTLE: Duration = Duration::from_millis(210);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerMode {
    Offline,
    CameraPreview,
    TrackerPreview,
    Online,
}

/// Flags shared with the external frame provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSignals {
    /// The provider should write frames into the shared regions.
    pub provide_frames: SharedSignal,
    /// The provider has released its shared regions.
    pub shm_cleared: SharedSignal,
}

/// Sends an eye-tracker field to the eye(s) it belongs to. `left_`/`right_`
/// fields go to that eye with the prefix stripped, anything else to both.
fn route_field(field: &str) -> (Vec<Eye>, &str) {
    if let Some(param) = field.strip_prefix("left_") {
        (vec![Eye::Left], param)
    } else if let Some(param) = field.strip_prefix("right_") {
        (vec![Eye::Right], param)
    } else {
        (Eye::BOTH.to_vec(), field)
    }
}

fn send_field(left: &EyeChannels, right: &EyeChannels, field: &str, value: &Value) {
    let (eyes, param) = route_field(field);
    for eye in eyes {
        let channels = match eye {
            Eye::Left => left,
            Eye::Right => right,
        };
        if channels
            .command_tx
            .send(WorkerCommand::config(param, value.clone()))
            .is_err()
        {
            warn!("TrackerControl : {eye} command channel closed.");
        }
    }
}

/// Applies mode changes to the workers and the signal fabric.
pub struct TrackerControl {
    tracker: Arc<dyn TrackerService>,
    config: Arc<ConfigStore>,
    left: EyeChannels,
    right: EyeChannels,
    provider: ProviderSignals,
    sync: SyncSignals,
    router: RouterSignals,
    halt: SharedSignal,
    mode: Mutex<TrackerMode>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl TrackerControl {
    pub fn new(
        tracker: Arc<dyn TrackerService>,
        config: Arc<ConfigStore>,
        left: EyeChannels,
        right: EyeChannels,
        provider: ProviderSignals,
        sync: SyncSignals,
        router: RouterSignals,
    ) -> Self {
        Self {
            tracker,
            config,
            left,
            right,
            provider,
            sync,
            router,
            halt: Signal::shared(),
            mode: Mutex::new(TrackerMode::Offline),
            subscription: Mutex::new(None),
        }
    }

    /// The last mode that was fully applied.
    pub fn mode(&self) -> TrackerMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: TrackerMode) {
        let mut current = self.mode.lock();
        info!("TrackerControl : switching to {mode:?}.");
        let applied = match mode {
            TrackerMode::Offline => {
                self.stop_all();
                self.sync.preview_to_transport.clear();
                self.sync.downstream_enabled.clear();
                self.router.sync_frames.clear();
                self.router.enabled.clear();
                true
            }
            TrackerMode::CameraPreview => {
                self.stop_all();
                self.provider.provide_frames.set();
                self.router.sync_frames.set();
                self.sync.preview_to_transport.clear();
                self.sync.downstream_enabled.clear();
                self.router.enabled.set();
                true
            }
            TrackerMode::TrackerPreview => self.start_tracking(true),
            TrackerMode::Online => self.start_tracking(false),
        };
        if applied {
            *current = mode;
        }
    }

    fn start_tracking(&self, preview: bool) -> bool {
        self.stop_all();
        self.tracker.start_tracker();

        let timeout = self.config.read(|cfg| cfg.tracker.eyeloop_start_timeout());
        let deadline = Instant::now() + timeout;
        for eye in Eye::BOTH {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.channels(eye).signals.running.wait(remaining) {
                error!("TrackerControl : {eye} worker has not started running.");
                self.tracker.stop_tracker();
                return false;
            }
        }

        self.provider.provide_frames.set();
        if preview {
            self.sync.frame_drawn.set();
            self.sync.preview_to_transport.set();
            self.sync.downstream_enabled.clear();
        } else {
            self.sync.preview_to_transport.clear();
            self.sync.downstream_enabled.set();
        }
        self.router.sync_frames.clear();
        self.router.enabled.clear();

        self.set_eyeloop_config();
        self.prompt_preview(preview);
        true
    }

    /// Stops frames and workers and forgets anything queued for them.
    fn stop_all(&self) {
        self.provider.provide_frames.clear();
        let timeout = self.config.read(|cfg| cfg.tracker.shm_closed_timeout());
        if !self.provider.shm_cleared.wait(timeout) {
            error!("TrackerControl : shared memory was not released within {timeout:?}.");
        }

        if self.tracker.is_active()
            || Eye::BOTH.iter().any(|&eye| self.channels(eye).signals.running.is_set())
        {
            self.tracker.stop_tracker();
        }
        for eye in Eye::BOTH {
            self.channels(eye).signals.first_frame.clear();
        }

        self.halt.wait(SETTLE);
        let dropped = self.left.drain_commands() + self.right.drain_commands();
        if dropped > 0 {
            debug!("TrackerControl : dropped {dropped} queued worker commands.");
        }
    }

    /// Pushes every eye-tracker setting to the workers.
    pub fn set_eyeloop_config(&self) {
        for (field, value) in self.config.read(|cfg| cfg.eyeloop.fields()) {
            send_field(&self.left, &self.right, &field, &value);
        }
    }

    /// Turns the workers' mask previews on or off.
    pub fn prompt_preview(&self, preview: bool) {
        for eye in Eye::BOTH {
            if self
                .channels(eye)
                .command_tx
                .send(WorkerCommand::config("preview", preview))
                .is_err()
            {
                warn!("TrackerControl : {eye} command channel closed.");
            }
        }
    }

    fn channels(&self, eye: Eye) -> &EyeChannels {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }
}

impl TrackerControlService for TrackerControl {
    fn tracker_control(&self, msg: &Value) {
        match msg.get("mode").cloned().map(serde_json::from_value::<TrackerMode>) {
            Some(Ok(mode)) => self.set_mode(mode),
            Some(Err(_)) => warn!("TrackerControl : unknown mode in {msg}."),
            None => warn!("TrackerControl : message without mode : {msg}."),
        }
    }
}

impl Service for TrackerControl {
    fn name(&self) -> &str {
        "TrackerControl"
    }

    fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        let left = self.left.clone();
        let right = self.right.clone();
        let id = self.config.subscribe(
            "eyeloop",
            Box::new(move |path, _, value| {
                if !(left.signals.running.is_set() || right.signals.running.is_set()) {
                    return;
                }
                if let Some((_, field)) = path.split_once('.') {
                    send_field(&left, &right, field, value);
                }
            }),
        );
        *self.subscription.lock() = Some(id);
        ctx.mark_ready();
        Ok(())
    }

    fn run(&self, ctx: &ServiceContext) -> Result<()> {
        while !ctx.wait_stop(POLL_INTERVAL) {}
        Ok(())
    }

    fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        self.halt.set();
        if let Some(id) = self.subscription.lock().take() {
            self.config.unsubscribe(id);
        }
        Ok(())
    }
}
