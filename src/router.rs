//! The client-facing side of the core.
//!
//! [`MessageRouter`] runs three independent loops:
//!
//! * receive: inbound (bytes, type) pairs from the transport are decoded and
//!   handed to the routing table.
//! * send: the outbound priority queue is drained, each payload encoded by
//!   its variant and submitted to the transport.
//! * shared-memory pump: whenever the frame provider flags a new frame, both
//!   eye regions are copied, packed as JPEG and sent straight to the
//!   transport as `EyePreview`.

use crate::config::{ConfigStore, SubscriptionId};
use crate::error::{Error, Result};
use crate::image_packet::{pack, Image, PackOptions};
use crate::message::{MessageType, OutboundQueue, Payload, RoutedMessage};
use crate::routing::{Inbound, RoutingTable};
use crate::service::{panic_message, Service, ServiceContext, POLL_INTERVAL};
use crate::shm::SharedFrame;
use crate::signal::SharedSignal;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const PUMP_IDLE: Duration = Duration::from_millis(100);
const FRAME_WAIT: Duration = Duration::from_millis(50);

/// The network side. Implementations own framing and connection handling.
pub trait NetworkTransport: Send + Sync {
    fn tcp_send(&self, payload: &[u8], message_type: MessageType) -> Result<()>;
}

/// Flags shared with TrackerControl and the external frame provider.
#[derive(Debug, Clone, Default)]
pub struct RouterSignals {
    /// Gates the shared-memory pump.
    pub enabled: SharedSignal,
    /// The provider wrote a new frame into both regions.
    pub frame_ready: SharedSignal,
    /// Region names or dimensions changed; reconnect before the next frame.
    pub reconfigure: SharedSignal,
    /// Set while the pump has no regions mapped.
    pub shm_closed: SharedSignal,
    /// Camera preview mode: hand the provider a ready signal after each send.
    pub sync_frames: SharedSignal,
    pub eye_ready_left: SharedSignal,
    pub eye_ready_right: SharedSignal,
}

/// Encodes one outbound message for the wire.
pub fn encode_payload(message: &RoutedMessage, png_compression: u8) -> Result<Vec<u8>> {
    match &message.payload {
        Payload::Images(images) if message.message_type.is_image_packet() => {
            let mut options = PackOptions::png(png_compression);
            options.color_is_bgr = true;
            pack(images, &options)
        }
        Payload::Raw(bytes) => Ok(bytes.clone()),
        Payload::Json(value) if !message.message_type.is_image_packet() => Ok(serde_json::to_vec(value)?),
        _ => Err(Error::PayloadMismatch(message.message_type)),
    }
}

struct Regions {
    left: SharedFrame,
    right: SharedFrame,
    left_shape: (u32, u32),
    right_shape: (u32, u32),
}

/// Streams the provider's frames to the client. One call to [`step`] is one
/// iteration of the pump loop.
///
/// [`step`]: PreviewPump::step
pub struct PreviewPump {
    config: Arc<ConfigStore>,
    transport: Arc<dyn NetworkTransport>,
    signals: RouterSignals,
    regions: Option<Regions>,
}

impl PreviewPump {
    pub fn new(config: Arc<ConfigStore>, transport: Arc<dyn NetworkTransport>, signals: RouterSignals) -> Self {
        signals.shm_closed.set();
        Self {
            config,
            transport,
            signals,
            regions: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.regions.is_some()
    }

    /// Runs one iteration and returns how long to idle before the next.
    pub fn step(&mut self) -> Duration {
        if !self.signals.enabled.is_set() {
            self.disconnect();
            return PUMP_IDLE;
        }
        if self.signals.reconfigure.is_set() {
            self.signals.reconfigure.clear();
            info!("PreviewPump : reconfiguring shared memory.");
            self.disconnect();
        }
        if !self.is_connected() && !self.connect() {
            return PUMP_IDLE;
        }
        if !self.signals.frame_ready.wait(FRAME_WAIT) {
            return Duration::ZERO;
        }
        self.signals.frame_ready.clear();
        if let Err(e) = self.send_frame() {
            warn!("PreviewPump : dropping frame : {e}.");
        }
        if self.signals.sync_frames.is_set() {
            self.signals.eye_ready_left.set();
            self.signals.eye_ready_right.set();
        }
        Duration::ZERO
    }

    fn connect(&mut self) -> bool {
        let (left_name, right_name, left_shape, right_shape) = self.config.read(|cfg| {
            (
                cfg.tracker.sharedmem_name_left.clone(),
                cfg.tracker.sharedmem_name_right.clone(),
                cfg.tracker.memory_shape_left,
                cfg.tracker.memory_shape_right,
            )
        });
        let open = |name: &str, (h, w): (u32, u32)| SharedFrame::open(name, h as usize * w as usize);
        match open(&left_name, left_shape).and_then(|left| Ok((left, open(&right_name, right_shape)?))) {
            Ok((left, right)) => {
                info!("PreviewPump : connected to {left_name} and {right_name}.");
                self.regions = Some(Regions {
                    left,
                    right,
                    left_shape,
                    right_shape,
                });
                self.signals.shm_closed.clear();
                true
            }
            Err(Error::SharedMemoryMissing(name)) => {
                debug!("PreviewPump : {name} not there yet.");
                false
            }
            Err(e) => {
                warn!("PreviewPump : cannot map frames : {e}.");
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if self.regions.take().is_some() {
            info!("PreviewPump : disconnected.");
        }
        self.signals.shm_closed.set();
    }

    fn send_frame(&self) -> Result<()> {
        let Some(regions) = &self.regions else {
            return Ok(());
        };
        let quality = self.config.read(|cfg| cfg.tracker.jpeg_quality);
        let frame = |region: &SharedFrame, (h, w): (u32, u32)| Image::gray(w, h, region.copy_frame());
        let images = [
            (0, frame(&regions.left, regions.left_shape)),
            (1, frame(&regions.right, regions.right_shape)),
        ];
        let mut options = PackOptions::jpeg(quality);
        options.color_is_bgr = true;
        let packet = pack(&images, &options)?;
        self.transport.tcp_send(&packet, MessageType::EyePreview)
    }
}

struct RouterCore {
    config: Arc<ConfigStore>,
    transport: Arc<dyn NetworkTransport>,
    outbound: Arc<OutboundQueue>,
    routing: RoutingTable,
}

impl RouterCore {
    fn route(&self, bytes: &[u8], message_type: MessageType) {
        let Some(handler) = self.routing.get(&message_type) else {
            warn!("MessageRouter : no handler for {message_type:?}, dropping.");
            return;
        };
        let inbound = Inbound::decode(bytes);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&inbound))) {
            error!(
                "MessageRouter : {message_type:?} handler panicked : {}.",
                panic_message(&*panic)
            );
        }
    }

    fn send(&self, message: RoutedMessage) {
        let compression = self.config.read(|cfg| cfg.tracker.png_compression);
        let sent = catch_unwind(AssertUnwindSafe(|| {
            encode_payload(&message, compression)
                .and_then(|bytes| self.transport.tcp_send(&bytes, message.message_type))
        }));
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "MessageRouter : dropping {:?} (seq {}) : {e}.",
                message.message_type, message.sequence
            ),
            Err(panic) => error!(
                "MessageRouter : sending {:?} (seq {}) panicked : {}.",
                message.message_type,
                message.sequence,
                panic_message(&*panic)
            ),
        }
    }

    fn receive_loop(&self, inbound: Receiver<(Vec<u8>, MessageType)>, stop: SharedSignal) {
        while !stop.is_set() {
            match inbound.recv_timeout(RECV_TIMEOUT) {
                Ok((bytes, message_type)) => self.route(&bytes, message_type),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    stop.wait(POLL_INTERVAL);
                }
            }
        }
        debug!("MessageRouter : receive loop terminated.");
    }

    fn send_loop(&self, stop: SharedSignal) {
        while !stop.is_set() {
            if let Some(message) = self.outbound.pop_timeout(RECV_TIMEOUT) {
                self.send(message);
            }
        }
        debug!("MessageRouter : send loop terminated.");
    }
}

fn pump_loop(mut pump: PreviewPump, stop: SharedSignal) {
    while !stop.is_set() {
        let idle = pump.step();
        if !idle.is_zero() {
            stop.wait(idle);
        }
    }
    pump.disconnect();
    debug!("MessageRouter : shared memory loop terminated.");
}

/// Moves messages between the transport, the routing table and the outbound
/// queue, and streams camera frames when enabled.
pub struct MessageRouter {
    core: Arc<RouterCore>,
    inbound: Receiver<(Vec<u8>, MessageType)>,
    signals: RouterSignals,
    subscription: Mutex<Option<SubscriptionId>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(
        config: Arc<ConfigStore>,
        transport: Arc<dyn NetworkTransport>,
        inbound: Receiver<(Vec<u8>, MessageType)>,
        outbound: Arc<OutboundQueue>,
        routing: RoutingTable,
        signals: RouterSignals,
    ) -> Self {
        Self {
            core: Arc::new(RouterCore {
                config,
                transport,
                outbound,
                routing,
            }),
            inbound,
            signals,
            subscription: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn signals(&self) -> &RouterSignals {
        &self.signals
    }

    fn spawn(&self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
        self.threads.lock().push(handle);
        Ok(())
    }
}

impl Service for MessageRouter {
    fn name(&self) -> &str {
        "MessageRouter"
    }

    fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        let reconfigure = SharedSignal::clone(&self.signals.reconfigure);
        let id = self.core.config.subscribe(
            "tracker",
            Box::new(move |path, _, _| {
                if path.contains("sharedmem_name") || path.contains("memory_shape") {
                    reconfigure.set();
                }
            }),
        );
        *self.subscription.lock() = Some(id);

        let core = Arc::clone(&self.core);
        let inbound = self.inbound.clone();
        let stop = ctx.stop_signal();
        self.spawn("router-recv", move || core.receive_loop(inbound, stop))?;

        let core = Arc::clone(&self.core);
        let stop = ctx.stop_signal();
        self.spawn("router-send", move || core.send_loop(stop))?;

        let pump = PreviewPump::new(
            Arc::clone(&self.core.config),
            Arc::clone(&self.core.transport),
            self.signals.clone(),
        );
        let stop = ctx.stop_signal();
        self.spawn("router-shm", move || pump_loop(pump, stop))?;

        ctx.mark_ready();
        Ok(())
    }

    fn run(&self, ctx: &ServiceContext) -> Result<()> {
        while !ctx.wait_stop(POLL_INTERVAL) {}
        Ok(())
    }

    fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        if let Some(id) = self.subscription.lock().take() {
            self.core.config.unsubscribe(id);
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("MessageRouter : a loop panicked.");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::image_packet::unpack;
    use crate::message::priority;
    use crate::routing::build_routing_table;
    use crate::routing::tests::{collaborators, Recorder};
    use crate::service::ServiceRunner;
    use serde_json::{json, Value};
    use std::time::Instant;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(MessageType, Vec<u8>)>>,
    }

    impl NetworkTransport for FakeTransport {
        fn tcp_send(&self, payload: &[u8], message_type: MessageType) -> Result<()> {
            self.sent.lock().push((message_type, payload.to_vec()));
            Ok(())
        }
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    fn routed(message_type: MessageType, payload: Payload) -> RoutedMessage {
        RoutedMessage {
            priority: priority::STATUS,
            sequence: 0,
            message_type,
            payload,
        }
    }

    #[test]
    fn payload_encoding_follows_variant() {
        let json = routed(MessageType::GazeData, Payload::Json(json!({"x": 1})));
        assert_eq!(encode_payload(&json, 3).unwrap(), br#"{"x":1}"#.to_vec());

        let raw = routed(MessageType::Log, Payload::Raw(vec![9, 8, 7]));
        assert_eq!(encode_payload(&raw, 3).unwrap(), vec![9, 8, 7]);

        let mask = Image::gray(4, 2, vec![0, 255, 0, 255, 255, 0, 255, 0]);
        let images = routed(
            MessageType::TrackerPreview,
            Payload::Images(vec![(0, mask.clone()), (1, mask)]),
        );
        let packet = encode_payload(&images, 9).unwrap();
        let records = unpack(&packet).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!((records[1].eye_id, records[1].width, records[1].height), (1, 4, 2));
    }

    #[test]
    fn mismatched_payloads_are_rejected() {
        let images = routed(MessageType::GazeData, Payload::Images(vec![]));
        assert!(matches!(
            encode_payload(&images, 3),
            Err(Error::PayloadMismatch(MessageType::GazeData))
        ));
        let json = routed(MessageType::EyePreview, Payload::Json(Value::Null));
        assert!(matches!(
            encode_payload(&json, 3),
            Err(Error::PayloadMismatch(MessageType::EyePreview))
        ));
    }

    #[test]
    fn routes_inbound_and_drains_outbound() {
        let recorder = Arc::new(Recorder::default());
        let (collab, _actuator_rx, config) = collaborators(&recorder);
        let transport = Arc::new(FakeTransport::default());
        let outbound = Arc::new(OutboundQueue::new());
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let router = ServiceRunner::new(MessageRouter::new(
            config,
            transport.clone(),
            inbound_rx,
            Arc::clone(&outbound),
            build_routing_table(collab),
            RouterSignals::default(),
        ));
        router.start().unwrap();
        assert!(router.ready(Duration::from_secs(1)));
        assert!(router.is_online());

        inbound_tx
            .send((br#"{"mode":"offline"}"#.to_vec(), MessageType::TrackerControl))
            .unwrap();
        // No handler for this one; it is dropped without killing the loop.
        inbound_tx.send((b"{}".to_vec(), MessageType::GazeData)).unwrap();
        inbound_tx
            .send((br#"{"cmd":"reset"}"#.to_vec(), MessageType::MotionSensorCommand))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || recorder.calls.lock().len() == 2));
        assert_eq!(recorder.calls.lock()[1], ("motion_command", json!({"cmd": "reset"})));

        outbound.push(priority::STATUS, MessageType::Log, Payload::Json(json!("late")));
        outbound.push(priority::MOTION, MessageType::MotionSensorData, Payload::Raw(vec![1]));
        assert!(wait_until(Duration::from_secs(2), || transport.sent.lock().len() == 2));

        router.stop();
        assert!(router.join(Duration::from_secs(2)));
        assert!(!router.is_fatal());
    }

    /// Fails the first send by panicking, then records like `FakeTransport`.
    #[derive(Default)]
    struct PanickyTransport {
        calls: Mutex<usize>,
        sent: Mutex<Vec<MessageType>>,
    }

    impl NetworkTransport for PanickyTransport {
        fn tcp_send(&self, _payload: &[u8], message_type: MessageType) -> Result<()> {
            let first = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls == 1
            };
            if first {
                panic!("socket exploded");
            }
            self.sent.lock().push(message_type);
            Ok(())
        }
    }

    #[test]
    fn send_loop_survives_a_panicking_transport() {
        let recorder = Arc::new(Recorder::default());
        let (collab, _actuator_rx, config) = collaborators(&recorder);
        let transport = Arc::new(PanickyTransport::default());
        let outbound = Arc::new(OutboundQueue::new());
        let (_inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let router = ServiceRunner::new(MessageRouter::new(
            config,
            transport.clone(),
            inbound_rx,
            Arc::clone(&outbound),
            build_routing_table(collab),
            RouterSignals::default(),
        ));
        router.start().unwrap();
        assert!(router.ready(Duration::from_secs(1)));

        outbound.push(priority::STATUS, MessageType::Log, Payload::Json(json!("boom")));
        assert!(wait_until(Duration::from_secs(2), || *transport.calls.lock() == 1));
        outbound.push(priority::STATUS, MessageType::Log, Payload::Json(json!("after")));
        assert!(wait_until(Duration::from_secs(2), || transport.sent.lock().len() == 1));
        assert!(router.is_online());

        router.stop();
        assert!(router.join(Duration::from_secs(2)));
    }

    #[test]
    fn pump_streams_frames_while_enabled() {
        let mut config = Config::default();
        let tag = std::process::id();
        config.tracker.sharedmem_name_left = format!("vrcore-test-pump-l-{tag}");
        config.tracker.sharedmem_name_right = format!("vrcore-test-pump-r-{tag}");
        config.tracker.memory_shape_left = (8, 16);
        config.tracker.memory_shape_right = (8, 16);
        let config = Arc::new(ConfigStore::new(config));
        let transport = Arc::new(FakeTransport::default());
        let signals = RouterSignals::default();
        let mut pump = PreviewPump::new(Arc::clone(&config), transport.clone(), signals.clone());
        assert!(signals.shm_closed.is_set());

        // Enabled but nothing to map yet.
        signals.enabled.set();
        assert_eq!(pump.step(), PUMP_IDLE);
        assert!(!pump.is_connected());

        let (left_name, right_name) = config.read(|cfg| {
            (
                cfg.tracker.sharedmem_name_left.clone(),
                cfg.tracker.sharedmem_name_right.clone(),
            )
        });
        let mut left = SharedFrame::create(&left_name, 128).unwrap();
        let mut right = SharedFrame::create(&right_name, 128).unwrap();
        left.write(&[40; 128]).unwrap();
        right.write(&[200; 128]).unwrap();

        // Connects, then waits for a frame.
        assert_eq!(pump.step(), Duration::ZERO);
        assert!(pump.is_connected());
        assert!(!signals.shm_closed.is_set());
        assert!(transport.sent.lock().is_empty());

        signals.sync_frames.set();
        signals.frame_ready.set();
        pump.step();
        assert!(!signals.frame_ready.is_set());
        assert!(signals.eye_ready_left.is_set() && signals.eye_ready_right.is_set());
        {
            let sent = transport.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, MessageType::EyePreview);
            let records = unpack(&sent[0].1).unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!((records[0].eye_id, records[0].width, records[0].height), (0, 16, 8));
        }

        signals.enabled.clear();
        assert_eq!(pump.step(), PUMP_IDLE);
        assert!(!pump.is_connected());
        assert!(signals.shm_closed.is_set());
    }

    #[test]
    fn reconfigure_forces_a_reconnect() {
        let mut config = Config::default();
        let tag = std::process::id();
        config.tracker.sharedmem_name_left = format!("vrcore-test-reconf-l-{tag}");
        config.tracker.sharedmem_name_right = format!("vrcore-test-reconf-r-{tag}");
        config.tracker.memory_shape_left = (4, 4);
        config.tracker.memory_shape_right = (4, 4);
        let names = (
            config.tracker.sharedmem_name_left.clone(),
            config.tracker.sharedmem_name_right.clone(),
        );
        let config = Arc::new(ConfigStore::new(config));
        let _left = SharedFrame::create(&names.0, 64).unwrap();
        let _right = SharedFrame::create(&names.1, 64).unwrap();

        let signals = RouterSignals::default();
        let mut pump = PreviewPump::new(Arc::clone(&config), Arc::new(FakeTransport::default()), signals.clone());
        signals.enabled.set();
        pump.step();
        assert!(pump.is_connected());

        // Larger than the regions: the reconnect fails until they grow.
        config.set("tracker.memory_shape_left", &json!([16, 16])).unwrap();
        signals.reconfigure.set();
        assert_eq!(pump.step(), PUMP_IDLE);
        assert!(!signals.reconfigure.is_set());
        assert!(!pump.is_connected());
        assert!(signals.shm_closed.is_set());
    }
}
