//! Wire message types and the outbound priority queue.
//!
//! Everything leaving the device goes through one [`OutboundQueue`]. Items are
//! delivered by ascending priority, then by the order they were submitted in:
//! each push is stamped with a sequence number from a counter that is never
//! reset, so two items in the same tier can never be reordered.

use crate::error::{Error, Result};
use crate::image_packet::Image;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

/// Priority tiers seen on the outbound queue. Lower is more urgent.
pub mod priority {
    /// Motion-sensor telemetry.
    pub const MOTION: u8 = 1;
    /// IPD and gaze previews.
    pub const PREVIEW: u8 = 6;
    /// Images, status and calibration results.
    pub const STATUS: u8 = 8;
}

/// Message types shared with the client application. The discriminants are
/// the bytes used on the wire and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    MotionSensorData = 0,
    MotionSensorCommand = 1,
    GazeData = 2,
    GazeCalcControl = 3,
    GazeSceneControl = 4,
    TrackerControl = 5,
    Config = 6,
    ActuatorConfig = 7,
    Log = 8,
    ActuatorLog = 9,
    TrackerPreview = 10,
    EyePreview = 11,
    EyeImage = 12,
    ConfigReady = 13,
    TrackerData = 14,
    IpdPreview = 15,
    SceneMarker = 16,
    CalibrationData = 17,
    EyeVectors = 18,
}

impl MessageType {
    /// Every message type, in wire order.
    pub const ALL: [MessageType; 19] = [
        MessageType::MotionSensorData,
        MessageType::MotionSensorCommand,
        MessageType::GazeData,
        MessageType::GazeCalcControl,
        MessageType::GazeSceneControl,
        MessageType::TrackerControl,
        MessageType::Config,
        MessageType::ActuatorConfig,
        MessageType::Log,
        MessageType::ActuatorLog,
        MessageType::TrackerPreview,
        MessageType::EyePreview,
        MessageType::EyeImage,
        MessageType::ConfigReady,
        MessageType::TrackerData,
        MessageType::IpdPreview,
        MessageType::SceneMarker,
        MessageType::CalibrationData,
        MessageType::EyeVectors,
    ];

    /// Whether the payload for this type is a packed multi-image packet.
    pub fn is_image_packet(self) -> bool {
        matches!(self, MessageType::TrackerPreview | MessageType::EyePreview)
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        MessageType::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::UnknownMessageType(value))
    }
}

/// Which eye a worker, frame half or shared region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    /// Both eyes, left first.
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    /// The eye id used in binary image packets.
    pub fn id(self) -> u8 {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

impl fmt::Display for Eye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eye::Left => write!(f, "left"),
            Eye::Right => write!(f, "right"),
        }
    }
}

/// What an outbound message carries. The router picks the encoding from the
/// variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured data, sent as JSON.
    Json(serde_json::Value),
    /// Already-encoded bytes, sent as-is.
    Raw(Vec<u8>),
    /// Images to be packed into one binary image packet.
    Images(Vec<(u8, Image)>),
}

/// One unit on the outbound queue.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub priority: u8,
    pub sequence: u64,
    pub message_type: MessageType,
    pub payload: Payload,
}

impl RoutedMessage {
    fn key(&self) -> (u8, u64) {
        (self.priority, self.sequence)
    }
}

// Ordering only looks at (priority, sequence); sequence numbers are unique,
// so this is a total order over queued items.
impl PartialEq for RoutedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RoutedMessage {}

impl PartialOrd for RoutedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoutedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<RoutedMessage>>,
    next_sequence: u64,
}

/// A priority queue safe for concurrent pushes from any thread and a single
/// popping consumer.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl OutboundQueue {
    /// Instantiates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message and returns the sequence number it was stamped with.
    pub fn push(&self, priority: u8, message_type: MessageType, payload: Payload) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(Reverse(RoutedMessage {
            priority,
            sequence,
            message_type,
            payload,
        }));
        self.available.notify_one();
        sequence
    }

    /// Removes the most urgent message, waiting up to `timeout` for one to
    /// arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<RoutedMessage> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(Reverse(message)) = state.heap.pop() {
                return Some(message);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.heap.pop().map(|Reverse(message)| message);
            }
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
