//! Inbound dispatch: which collaborator handles which message type.

use crate::config::{apply_or_warn, ConfigStore};
use crate::message::MessageType;
use crossbeam_channel::Sender;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Motion sensor commands from the client.
pub trait MotionSensorService: Send + Sync {
    fn motion_command(&self, msg: &Value);
}

/// Gaze calibration and scene control. The calibration math lives behind this.
pub trait GazeService: Send + Sync {
    fn gaze_control(&self, msg: &Value);
    fn scene_control(&self, msg: &Value);
}

/// Tracker operating mode changes.
pub trait TrackerControlService: Send + Sync {
    fn tracker_control(&self, msg: &Value);
}

/// An inbound message body: JSON when it parses, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Json(Value),
    Raw(Vec<u8>),
}

impl Inbound {
    /// Tries JSON first and falls back to the bytes as received.
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => Inbound::Json(value),
            Err(e) => {
                debug!("MessageRouter : inbound body is not JSON ({e}), passing raw bytes.");
                Inbound::Raw(bytes.to_vec())
            }
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Inbound::Json(value) => Some(value),
            Inbound::Raw(_) => None,
        }
    }
}

pub type Handler = Box<dyn Fn(&Inbound) + Send + Sync>;
pub type RoutingTable = HashMap<MessageType, Handler>;

/// Everything the inbound handlers talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub motion: Arc<dyn MotionSensorService>,
    pub gaze: Arc<dyn GazeService>,
    pub tracker: Arc<dyn TrackerControlService>,
    /// Commands for the serial actuator link.
    pub actuator_tx: Sender<Inbound>,
    pub config: Arc<ConfigStore>,
}

/// Wraps `f` so it only sees JSON bodies.
fn json_handler(message_type: MessageType, f: impl Fn(&Value) + Send + Sync + 'static) -> Handler {
    Box::new(move |inbound| match inbound.as_json() {
        Some(value) => f(value),
        None => warn!("MessageRouter : {message_type:?} expects JSON, ignoring raw body."),
    })
}

/// Builds the dispatch table once, closing over the collaborators.
pub fn build_routing_table(collaborators: Collaborators) -> RoutingTable {
    let Collaborators {
        motion,
        gaze,
        tracker,
        actuator_tx,
        config,
    } = collaborators;

    let mut table: RoutingTable = HashMap::new();

    table.insert(
        MessageType::MotionSensorCommand,
        json_handler(MessageType::MotionSensorCommand, move |msg| motion.motion_command(msg)),
    );

    let scene = Arc::clone(&gaze);
    table.insert(
        MessageType::GazeCalcControl,
        json_handler(MessageType::GazeCalcControl, move |msg| gaze.gaze_control(msg)),
    );
    table.insert(
        MessageType::GazeSceneControl,
        json_handler(MessageType::GazeSceneControl, move |msg| scene.scene_control(msg)),
    );

    table.insert(
        MessageType::TrackerControl,
        json_handler(MessageType::TrackerControl, move |msg| tracker.tracker_control(msg)),
    );

    table.insert(
        MessageType::ActuatorConfig,
        Box::new(move |inbound: &Inbound| {
            if actuator_tx.send(inbound.clone()).is_err() {
                warn!("MessageRouter : actuator channel closed, dropping command.");
            }
        }),
    );

    table.insert(
        MessageType::Config,
        json_handler(MessageType::Config, move |msg| match msg.as_object() {
            Some(entries) => {
                for (path, value) in entries {
                    apply_or_warn(&config, path, value);
                }
            }
            None => warn!("MessageRouter : config message must be an object, got {msg}."),
        }),
    );

    table
}
