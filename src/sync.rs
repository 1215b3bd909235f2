//! Pairs the left and right workers' results by frame id.
//!
//! Each worker reports every frame on its own response channel, and the two
//! streams drift relative to each other. A [`PairingBuffer`] holds the first
//! half of each frame until its partner arrives; halves whose partner never
//! comes are evicted oldest-first once the buffer grows past its capacity.
//! Telemetry and preview masks are paired in separate buffers behind separate
//! locks.

use crate::config::ConfigStore;
use crate::error::Result;
use crate::image_packet::Image;
use crate::message::{priority, Eye, MessageType, OutboundQueue, Payload};
use crate::process::EyeChannels;
use crate::service::{Service, ServiceContext, POLL_INTERVAL};
use crate::signal::SharedSignal;
use crate::worker_message::{unpack_mask, HealthEvent, WorkerMessage};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug)]
struct Bucket<T> {
    left: Option<T>,
    right: Option<T>,
}

/// Half-frames waiting for their partner, ordered by frame id.
#[derive(Debug)]
pub struct PairingBuffer<T> {
    buckets: BTreeMap<u64, Bucket<T>>,
}

impl<T> Default for PairingBuffer<T> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<T> PairingBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `half` for `eye`. When that completes the frame, the bucket is
    /// removed and the (left, right) pair returned.
    pub fn insert(&mut self, frame_id: u64, eye: Eye, half: T) -> Option<(T, T)> {
        let bucket = self.buckets.entry(frame_id).or_insert(Bucket {
            left: None,
            right: None,
        });
        match eye {
            Eye::Left => bucket.left = Some(half),
            Eye::Right => bucket.right = Some(half),
        }
        if bucket.left.is_some() && bucket.right.is_some() {
            let bucket = self.buckets.remove(&frame_id)?;
            return bucket.left.zip(bucket.right);
        }
        None
    }

    /// Evicts the oldest frame ids until at most `capacity` remain. Returns
    /// how many were dropped.
    pub fn trim(&mut self, capacity: usize) -> usize {
        let excess = self.buckets.len().saturating_sub(capacity);
        for _ in 0..excess {
            self.buckets.pop_first();
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.buckets.contains_key(&frame_id)
    }

    pub fn frame_ids(&self) -> Vec<u64> {
        self.buckets.keys().copied().collect()
    }
}

/// Both eyes' telemetry for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerPair {
    pub frame_id: u64,
    pub left: Value,
    pub right: Value,
}

/// Where paired results go.
#[derive(Debug, Clone)]
pub struct SyncOutputs {
    /// Paired telemetry for the gaze side.
    pub telemetry_tx: Sender<TrackerPair>,
    /// Paired telemetry to be drawn as a live preview.
    pub draw_tx: Sender<TrackerPair>,
    /// Paired preview masks are queued here for the client.
    pub outbound: Arc<OutboundQueue>,
    pub health_tx: Sender<HealthEvent>,
}

/// Switches deciding where paired telemetry is sent.
#[derive(Debug, Clone, Default)]
pub struct SyncSignals {
    pub downstream_enabled: SharedSignal,
    pub preview_to_transport: SharedSignal,
    /// The last preview frame handed out has been drawn.
    pub frame_drawn: SharedSignal,
}

struct SyncCore {
    config: Arc<ConfigStore>,
    outputs: SyncOutputs,
    signals: SyncSignals,
    first_frame_left: SharedSignal,
    first_frame_right: SharedSignal,
    telemetry: Mutex<PairingBuffer<Value>>,
    images: Mutex<PairingBuffer<Image>>,
}

impl SyncCore {
    fn capacity(&self) -> usize {
        self.config.read(|cfg| cfg.tracker.sync_buffer_size)
    }

    fn dispatch(&self, eye: Eye, message: WorkerMessage) {
        match message {
            WorkerMessage::EyeData { frame_id, data } => match (frame_id, data) {
                (Some(frame_id), Some(data)) => self.pair_telemetry(eye, frame_id, data),
                (None, _) => warn!("FrameSynchronizer : dropping eye_data from {eye} eye without frame_id."),
                (Some(frame_id), None) => {
                    warn!("FrameSynchronizer : dropping eye_data {frame_id} from {eye} eye without payload.")
                }
            },
            WorkerMessage::ImagePreview {
                frame_id,
                width,
                height,
                bitmap,
            } => {
                let Some(frame_id) = frame_id else {
                    warn!("FrameSynchronizer : dropping image_preview from {eye} eye without frame_id.");
                    return;
                };
                let width = width.unwrap_or(0);
                let height = height.unwrap_or(0);
                let mask = bitmap.and_then(|bits| unpack_mask(&bits, width, height));
                match mask {
                    Some(mask) => self.pair_image(eye, frame_id, Image::gray(width, height, mask)),
                    None => warn!(
                        "FrameSynchronizer : dropping image_preview {frame_id} from {eye} eye without a usable bitmap."
                    ),
                }
            }
            WorkerMessage::Health { payload } => {
                if self.outputs.health_tx.send(HealthEvent { eye, payload }).is_err() {
                    debug!("FrameSynchronizer : health channel closed.");
                }
            }
            WorkerMessage::Signal { signal } => {
                debug!("FrameSynchronizer : ignoring stray {signal:?} signal from {eye} eye.")
            }
            WorkerMessage::Unknown => info!("FrameSynchronizer : dropping unknown message from {eye} eye."),
        }
    }

    fn pair_telemetry(&self, eye: Eye, frame_id: u64, data: Value) {
        match eye {
            Eye::Left => self.first_frame_left.set(),
            Eye::Right => self.first_frame_right.set(),
        }

        let mut buffer = self.telemetry.lock();
        if let Some((left, right)) = buffer.insert(frame_id, eye, data) {
            let pair = TrackerPair {
                frame_id,
                left,
                right,
            };
            if self.signals.preview_to_transport.is_set() && self.signals.frame_drawn.is_set() {
                self.signals.frame_drawn.clear();
                if self.outputs.draw_tx.send(pair.clone()).is_err() {
                    debug!("FrameSynchronizer : draw channel closed.");
                }
            }
            if self.signals.downstream_enabled.is_set() && self.outputs.telemetry_tx.send(pair).is_err() {
                debug!("FrameSynchronizer : telemetry channel closed.");
            }
        }
        let dropped = buffer.trim(self.capacity());
        if dropped > 0 {
            warn!("FrameSynchronizer : trimmed telemetry buffer by {dropped} entries.");
        }
    }

    fn pair_image(&self, eye: Eye, frame_id: u64, mask: Image) {
        let mut buffer = self.images.lock();
        if let Some((left, right)) = buffer.insert(frame_id, eye, mask) {
            self.outputs.outbound.push(
                priority::STATUS,
                MessageType::TrackerPreview,
                Payload::Images(vec![(Eye::Left.id(), left), (Eye::Right.id(), right)]),
            );
        }
        let dropped = buffer.trim(self.capacity());
        if dropped > 0 {
            warn!("FrameSynchronizer : trimmed preview buffer by {dropped} entries.");
        }
    }

    fn response_loop(&self, eye: Eye, responses: Receiver<WorkerMessage>, stop: SharedSignal) {
        while !stop.is_set() {
            let timeout = self.config.read(|cfg| cfg.tracker.resp_q_timeout()).min(POLL_INTERVAL);
            match responses.recv_timeout(timeout) {
                Ok(message) => self.dispatch(eye, message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    stop.wait(POLL_INTERVAL);
                }
            }
        }
        debug!("FrameSynchronizer : {eye} receive loop terminated.");
    }
}

/// Receives both workers' messages and emits matched pairs.
pub struct FrameSynchronizer {
    core: Arc<SyncCore>,
    left_rx: Receiver<WorkerMessage>,
    right_rx: Receiver<WorkerMessage>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameSynchronizer {
    pub fn new(
        config: Arc<ConfigStore>,
        left: &EyeChannels,
        right: &EyeChannels,
        outputs: SyncOutputs,
        signals: SyncSignals,
    ) -> Self {
        Self {
            core: Arc::new(SyncCore {
                config,
                outputs,
                signals,
                first_frame_left: Arc::clone(&left.signals.first_frame),
                first_frame_right: Arc::clone(&right.signals.first_frame),
                telemetry: Mutex::new(PairingBuffer::new()),
                images: Mutex::new(PairingBuffer::new()),
            }),
            left_rx: left.response_rx.clone(),
            right_rx: right.response_rx.clone(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Handles one worker message as the receive loops would.
    pub fn dispatch(&self, eye: Eye, message: WorkerMessage) {
        self.core.dispatch(eye, message);
    }

    /// Frame ids currently waiting for a partner, (telemetry, preview).
    pub fn pending(&self) -> (Vec<u64>, Vec<u64>) {
        (
            self.core.telemetry.lock().frame_ids(),
            self.core.images.lock().frame_ids(),
        )
    }
}

impl Service for FrameSynchronizer {
    fn name(&self) -> &str {
        "FrameSynchronizer"
    }

    fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        let mut threads = self.threads.lock();
        for (eye, rx) in [(Eye::Left, &self.left_rx), (Eye::Right, &self.right_rx)] {
            let core = Arc::clone(&self.core);
            let rx = rx.clone();
            let stop = ctx.stop_signal();
            threads.push(
                thread::Builder::new()
                    .name(format!("eye-{eye}-rx"))
                    .spawn(move || core.response_loop(eye, rx, stop))?,
            );
        }
        ctx.mark_ready();
        Ok(())
    }

    fn run(&self, ctx: &ServiceContext) -> Result<()> {
        while !ctx.wait_stop(POLL_INTERVAL) {}
        Ok(())
    }

    fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("FrameSynchronizer : receive loop panicked.");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::ServiceRunner;
    use crate::worker_message::pack_mask;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use serde_json::json;
    use std::time::{Duration, Instant};

    struct Harness {
        sync: FrameSynchronizer,
        left: EyeChannels,
        right: EyeChannels,
        telemetry_rx: Receiver<TrackerPair>,
        draw_rx: Receiver<TrackerPair>,
        health_rx: Receiver<HealthEvent>,
        outbound: Arc<OutboundQueue>,
        signals: SyncSignals,
    }

    fn harness(capacity: usize) -> Harness {
        let mut config = Config::default();
        config.tracker.sync_buffer_size = capacity;
        config.tracker.resp_q_timeout_ms = 10;
        let (telemetry_tx, telemetry_rx) = crossbeam_channel::unbounded();
        let (draw_tx, draw_rx) = crossbeam_channel::unbounded();
        let (health_tx, health_rx) = crossbeam_channel::unbounded();
        let outbound = Arc::new(OutboundQueue::new());
        let signals = SyncSignals::default();
        let left = EyeChannels::new();
        let right = EyeChannels::new();
        let sync = FrameSynchronizer::new(
            Arc::new(ConfigStore::new(config)),
            &left,
            &right,
            SyncOutputs {
                telemetry_tx,
                draw_tx,
                outbound: Arc::clone(&outbound),
                health_tx,
            },
            signals.clone(),
        );
        Harness {
            sync,
            left,
            right,
            telemetry_rx,
            draw_rx,
            health_rx,
            outbound,
            signals,
        }
    }

    fn eye_data(frame_id: u64, x: f64) -> WorkerMessage {
        WorkerMessage::EyeData {
            frame_id: Some(frame_id),
            data: Some(json!({ "x": x })),
        }
    }

    #[test]
    fn buffer_pairs_in_any_order() {
        for first in Eye::BOTH {
            let second = if first == Eye::Left { Eye::Right } else { Eye::Left };
            let mut buffer = PairingBuffer::new();
            assert_eq!(buffer.insert(7, first, first.id()), None);
            assert!(buffer.contains(7));
            assert_eq!(buffer.insert(7, second, second.id()), Some((0, 1)));
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn trim_keeps_the_newest_ids() {
        let mut buffer = PairingBuffer::new();
        for id in [9, 3, 12, 5, 1, 10] {
            buffer.insert(id, Eye::Left, ());
        }
        assert_eq!(buffer.trim(4), 2);
        assert_eq!(buffer.frame_ids(), vec![5, 9, 10, 12]);
        assert_eq!(buffer.trim(4), 0);
    }

    #[test]
    fn paired_telemetry_goes_downstream_once() {
        let h = harness(8);
        h.signals.downstream_enabled.set();

        h.sync.dispatch(Eye::Right, eye_data(1, 2.0));
        assert!(h.telemetry_rx.is_empty());
        assert!(h.right.signals.first_frame.is_set());
        assert!(!h.left.signals.first_frame.is_set());

        h.sync.dispatch(Eye::Left, eye_data(1, 1.0));
        let pair = h.telemetry_rx.try_recv().unwrap();
        assert_eq!(
            pair,
            TrackerPair {
                frame_id: 1,
                left: json!({"x": 1.0}),
                right: json!({"x": 2.0}),
            }
        );
        assert!(h.telemetry_rx.is_empty());
        assert_eq!(h.sync.pending(), (vec![], vec![]));

        // A late duplicate starts a new bucket instead of re-emitting.
        h.sync.dispatch(Eye::Left, eye_data(1, 1.0));
        assert!(h.telemetry_rx.is_empty());
    }

    #[test]
    fn nothing_is_emitted_when_disabled() {
        let h = harness(8);
        h.sync.dispatch(Eye::Left, eye_data(1, 1.0));
        h.sync.dispatch(Eye::Right, eye_data(1, 1.0));
        assert!(h.telemetry_rx.is_empty());
        assert!(h.draw_rx.is_empty());
    }

    /// Only one preview frame is in flight until the consumer marks it drawn.
    #[test]
    fn draw_channel_waits_for_drawn() {
        let h = harness(8);
        h.signals.preview_to_transport.set();
        h.signals.frame_drawn.set();

        for id in 1..=3 {
            h.sync.dispatch(Eye::Left, eye_data(id, 0.0));
            h.sync.dispatch(Eye::Right, eye_data(id, 0.0));
        }
        assert_eq!(h.draw_rx.try_recv().unwrap().frame_id, 1);
        assert!(h.draw_rx.is_empty());
        assert!(!h.signals.frame_drawn.is_set());

        h.signals.frame_drawn.set();
        h.sync.dispatch(Eye::Left, eye_data(4, 0.0));
        h.sync.dispatch(Eye::Right, eye_data(4, 0.0));
        assert_eq!(h.draw_rx.try_recv().unwrap().frame_id, 4);
    }

    #[test]
    fn orphaned_half_is_evicted_and_never_emitted() {
        let h = harness(4);
        h.signals.downstream_enabled.set();

        h.sync.dispatch(Eye::Right, eye_data(42, 0.0));
        for id in 43..=47 {
            h.sync.dispatch(Eye::Left, eye_data(id, 0.0));
        }
        let (telemetry, _) = h.sync.pending();
        assert_eq!(telemetry, vec![44, 45, 46, 47]);

        h.sync.dispatch(Eye::Left, eye_data(42, 0.0));
        assert!(h.telemetry_rx.is_empty());
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let h = harness(8);
        h.signals.downstream_enabled.set();
        h.sync.dispatch(
            Eye::Left,
            WorkerMessage::EyeData {
                frame_id: None,
                data: Some(json!({})),
            },
        );
        h.sync.dispatch(
            Eye::Left,
            WorkerMessage::EyeData {
                frame_id: Some(1),
                data: None,
            },
        );
        h.sync.dispatch(
            Eye::Left,
            WorkerMessage::ImagePreview {
                frame_id: Some(1),
                width: Some(8),
                height: Some(8),
                bitmap: Some(vec![0]),
            },
        );
        h.sync.dispatch(Eye::Left, WorkerMessage::Unknown);
        assert_eq!(h.sync.pending(), (vec![], vec![]));
        assert!(!h.left.signals.first_frame.is_set());
    }

    #[test]
    fn paired_masks_are_queued_as_tracker_preview() {
        let h = harness(8);
        let mask = pack_mask(&[1, 0, 0, 1]);
        for eye in Eye::BOTH {
            h.sync.dispatch(
                eye,
                WorkerMessage::ImagePreview {
                    frame_id: Some(5),
                    width: Some(2),
                    height: Some(2),
                    bitmap: Some(mask.clone()),
                },
            );
        }

        let message = h.outbound.pop_timeout(Duration::ZERO).unwrap();
        assert_eq!(message.priority, priority::STATUS);
        assert_eq!(message.message_type, MessageType::TrackerPreview);
        match message.payload {
            Payload::Images(images) => {
                assert_eq!(images.len(), 2);
                assert_eq!(images[0].0, 0);
                assert_eq!(images[1].0, 1);
                assert_eq!(images[0].1, Image::gray(2, 2, vec![1, 0, 0, 1]));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn health_is_forwarded_with_eye() {
        let h = harness(8);
        h.sync.dispatch(
            Eye::Right,
            WorkerMessage::Health {
                payload: json!({"fps": 29}),
            },
        );
        assert_eq!(
            h.health_rx.try_recv().unwrap(),
            HealthEvent {
                eye: Eye::Right,
                payload: json!({"fps": 29})
            }
        );
    }

    /// Messages written to the eyes' response channels are paired by the
    /// service's own receive threads.
    #[test]
    fn receive_loops_pair_channel_traffic() {
        let h = harness(8);
        h.signals.downstream_enabled.set();
        let left_tx = h.left.response_tx.clone();
        let right_tx = h.right.response_tx.clone();
        let telemetry_rx = h.telemetry_rx.clone();

        let runner = ServiceRunner::new(h.sync);
        runner.start().unwrap();
        assert!(runner.ready(Duration::from_secs(5)));

        left_tx.send(eye_data(3, 1.0)).unwrap();
        right_tx.send(eye_data(3, 2.0)).unwrap();
        let pair = telemetry_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pair.frame_id, 3);

        let started = Instant::now();
        runner.stop();
        assert!(runner.join(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Halves racing in from both receive threads in shuffled order still
    /// produce exactly one pair per frame.
    #[test]
    fn racing_halves_pair_exactly_once() {
        const FRAMES: u64 = 200;
        let h = harness(FRAMES as usize * 2);
        h.signals.downstream_enabled.set();
        let telemetry_rx = h.telemetry_rx.clone();
        let senders = [
            (Eye::Left, h.left.response_tx.clone(), 1),
            (Eye::Right, h.right.response_tx.clone(), 2),
        ];

        let runner = ServiceRunner::new(h.sync);
        runner.start().unwrap();
        assert!(runner.ready(Duration::from_secs(5)));

        let producers: Vec<_> = senders
            .into_iter()
            .map(|(eye, tx, seed)| {
                std::thread::spawn(move || {
                    let mut ids: Vec<u64> = (0..FRAMES).collect();
                    ids.shuffle(&mut StdRng::seed_from_u64(seed));
                    for id in ids {
                        tx.send(eye_data(id, f64::from(eye.id()))).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..FRAMES {
            let pair = telemetry_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(pair.left, json!({ "x": 0.0 }));
            assert_eq!(pair.right, json!({ "x": 1.0 }));
            seen.push(pair.frame_id);
        }
        assert!(telemetry_rx.recv_timeout(Duration::from_millis(100)).is_err());
        seen.sort_unstable();
        assert_eq!(seen, (0..FRAMES).collect::<Vec<_>>());
        assert_eq!(runner.service().pending(), (vec![], vec![]));

        runner.stop();
        assert!(runner.join(Duration::from_secs(5)));
    }
}
