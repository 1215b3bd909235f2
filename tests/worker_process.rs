//! Drives real `eye-worker` processes through the whole core.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vrcore::config::{Config, ConfigStore};
use vrcore::error::Result;
use vrcore::image_packet::unpack;
use vrcore::message::MessageType;
use vrcore::process::ProcessLauncher;
use vrcore::router::NetworkTransport;
use vrcore::routing::{GazeService, MotionSensorService};
use vrcore::supervisor::WorkerState;
use vrcore::tracker_core::{CoreInputs, TrackerCore};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(MessageType, Vec<u8>)>>,
}

impl NetworkTransport for RecordingTransport {
    fn tcp_send(&self, payload: &[u8], message_type: MessageType) -> Result<()> {
        self.sent.lock().push((message_type, payload.to_vec()));
        Ok(())
    }
}

struct Quiet;

impl MotionSensorService for Quiet {
    fn motion_command(&self, _msg: &Value) {}
}

impl GazeService for Quiet {
    fn gaze_control(&self, _msg: &Value) {}
    fn scene_control(&self, _msg: &Value) {}
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    f()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.tracker.test_mode = true;
    config.tracker.importer_name = "synthetic".into();
    config.tracker.memory_shape_left = (48, 64);
    config.tracker.memory_shape_right = (48, 64);
    config.tracker.health_check_interval_ms = 100;
    config.tracker.shm_closed_timeout_ms = 50;
    config.tracker.blink_calibration_left = "does-not-exist-left.ron".into();
    config.tracker.blink_calibration_right = "does-not-exist-right.ron".into();
    config
}

#[test]
fn workers_track_preview_and_stop() {
    let transport = Arc::new(RecordingTransport::default());
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let (actuator_tx, _actuator_rx) = crossbeam_channel::unbounded();
    let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_eye-worker")).with_fps(30);

    let (core, outputs) = TrackerCore::new(CoreInputs {
        config: Arc::new(ConfigStore::new(test_config())),
        launcher: Box::new(launcher),
        transport: transport.clone(),
        inbound: inbound_rx,
        motion: Arc::new(Quiet),
        gaze: Arc::new(Quiet),
        actuator_tx,
    });
    // No frame provider in this test; nothing holds shared memory.
    core.provider.shm_cleared.set();
    core.start(Duration::from_secs(2)).unwrap();
    assert!(core.is_online());

    let control = |mode: &str| {
        let body = serde_json::to_vec(&serde_json::json!({ "mode": mode })).unwrap();
        inbound_tx.send((body, MessageType::TrackerControl)).unwrap();
    };

    control("online");
    assert!(wait_until(Duration::from_secs(15), || core.supervisor().state()
        == WorkerState::Running));
    let pair = outputs
        .telemetry_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert!(pair.left.get("area").is_some());
    assert!(pair.right.get("blink").is_some());

    control("tracker_preview");
    let previewed = wait_until(Duration::from_secs(15), || {
        transport
            .sent
            .lock()
            .iter()
            .any(|(message_type, _)| *message_type == MessageType::TrackerPreview)
    });
    assert!(previewed);
    let packet = transport
        .sent
        .lock()
        .iter()
        .find(|(message_type, _)| *message_type == MessageType::TrackerPreview)
        .map(|(_, bytes)| bytes.clone())
        .unwrap();
    let records = unpack(&packet).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!((records[0].eye_id, records[1].eye_id), (0, 1));
    assert_eq!((records[0].width, records[0].height), (64, 48));

    control("offline");
    assert!(wait_until(Duration::from_secs(10), || core.supervisor().state()
        == WorkerState::Idle));
    assert!(!core.left.signals.running.is_set());

    assert!(core.stop(Duration::from_secs(5)));
}
