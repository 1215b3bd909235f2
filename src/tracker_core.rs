//! Wires the tracker services together and runs them as one unit.
//!
//! Every component gets its channels and signals here; nothing is looked up
//! globally. Services start in dependency order and stop in reverse.

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::message::{MessageType, OutboundQueue};
use crate::process::{EyeChannels, WorkerLauncher};
use crate::router::{MessageRouter, NetworkTransport, RouterSignals};
use crate::routing::{build_routing_table, Collaborators, GazeService, Inbound, MotionSensorService};
use crate::service::{Service, ServiceRunner};
use crate::supervisor::WorkerSupervisor;
use crate::sync::{FrameSynchronizer, SyncOutputs, SyncSignals, TrackerPair};
use crate::tracker_control::{ProviderSignals, TrackerControl};
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What the embedding application provides.
pub struct CoreInputs {
    pub config: Arc<ConfigStore>,
    pub launcher: Box<dyn WorkerLauncher>,
    pub transport: Arc<dyn NetworkTransport>,
    /// (body, type) pairs received by the transport.
    pub inbound: Receiver<(Vec<u8>, MessageType)>,
    pub motion: Arc<dyn MotionSensorService>,
    pub gaze: Arc<dyn GazeService>,
    pub actuator_tx: Sender<Inbound>,
}

/// Paired telemetry handed back to the embedding application.
pub struct CoreOutputs {
    pub telemetry_rx: Receiver<TrackerPair>,
    pub draw_rx: Receiver<TrackerPair>,
}

pub struct TrackerCore {
    pub left: EyeChannels,
    pub right: EyeChannels,
    pub provider: ProviderSignals,
    pub sync_signals: SyncSignals,
    pub router_signals: RouterSignals,
    pub outbound: Arc<OutboundQueue>,
    supervisor: ServiceRunner<WorkerSupervisor>,
    sync: ServiceRunner<FrameSynchronizer>,
    control: ServiceRunner<TrackerControl>,
    router: ServiceRunner<MessageRouter>,
}

impl TrackerCore {
    pub fn new(inputs: CoreInputs) -> (Self, CoreOutputs) {
        let CoreInputs {
            config,
            launcher,
            transport,
            inbound,
            motion,
            gaze,
            actuator_tx,
        } = inputs;

        let left = EyeChannels::new();
        let right = EyeChannels::new();
        let (health_tx, health_rx) = crossbeam_channel::unbounded();
        let (telemetry_tx, telemetry_rx) = crossbeam_channel::unbounded();
        let (draw_tx, draw_rx) = crossbeam_channel::unbounded();
        let outbound = Arc::new(OutboundQueue::new());

        let provider = ProviderSignals::default();
        let sync_signals = SyncSignals::default();
        let router_signals = RouterSignals {
            eye_ready_left: Arc::clone(&left.signals.ready),
            eye_ready_right: Arc::clone(&right.signals.ready),
            ..RouterSignals::default()
        };

        let supervisor = Arc::new(WorkerSupervisor::new(
            launcher,
            Arc::clone(&config),
            left.clone(),
            right.clone(),
            health_rx,
        ));

        let sync = FrameSynchronizer::new(
            Arc::clone(&config),
            &left,
            &right,
            SyncOutputs {
                telemetry_tx,
                draw_tx,
                outbound: Arc::clone(&outbound),
                health_tx,
            },
            sync_signals.clone(),
        );

        let control = Arc::new(TrackerControl::new(
            supervisor.clone(),
            Arc::clone(&config),
            left.clone(),
            right.clone(),
            provider.clone(),
            sync_signals.clone(),
            router_signals.clone(),
        ));

        let routing = build_routing_table(Collaborators {
            motion,
            gaze,
            tracker: control.clone(),
            actuator_tx,
            config: Arc::clone(&config),
        });
        let router = MessageRouter::new(
            config,
            transport,
            inbound,
            Arc::clone(&outbound),
            routing,
            router_signals.clone(),
        );

        let core = Self {
            left,
            right,
            provider,
            sync_signals,
            router_signals,
            outbound,
            supervisor: ServiceRunner::from_arc(supervisor),
            sync: ServiceRunner::new(sync),
            control: ServiceRunner::from_arc(control),
            router: ServiceRunner::new(router),
        };
        (core, CoreOutputs { telemetry_rx, draw_rx })
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        self.supervisor.service()
    }

    pub fn control(&self) -> &Arc<TrackerControl> {
        self.control.service()
    }

    /// Starts every service, waiting up to `timeout` for each to be ready.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        start_one(&self.supervisor, timeout)?;
        start_one(&self.sync, timeout)?;
        start_one(&self.control, timeout)?;
        start_one(&self.router, timeout)?;
        info!("TrackerCore : online.");
        Ok(())
    }

    /// Stops every service in reverse order. Returns whether all of them
    /// finished within `timeout` each.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut clean = true;
        clean &= stop_one(&self.router, timeout);
        clean &= stop_one(&self.control, timeout);
        clean &= stop_one(&self.sync, timeout);
        clean &= stop_one(&self.supervisor, timeout);
        info!("TrackerCore : terminated.");
        clean
    }

    pub fn is_online(&self) -> bool {
        self.supervisor.is_online() && self.sync.is_online() && self.control.is_online() && self.router.is_online()
    }
}

fn start_one<S: Service>(runner: &ServiceRunner<S>, timeout: Duration) -> Result<()> {
    runner.start()?;
    if runner.ready(timeout) {
        Ok(())
    } else {
        Err(Error::Service(format!(
            "{} not ready within {timeout:?}",
            runner.service().name()
        )))
    }
}

fn stop_one<S: Service>(runner: &ServiceRunner<S>, timeout: Duration) -> bool {
    runner.stop();
    let joined = runner.join(timeout);
    if !joined {
        warn!("TrackerCore : {} did not stop within {timeout:?}.", runner.service().name());
    }
    joined
}
