//! The per-eye tracking loop run by the `eye-worker` binary.
//!
//! A worker pulls greyscale frames from a [`FrameSource`], thresholds them
//! into a pupil mask and writes one `eye_data` line per frame to stdout, plus
//! an `image_preview` line when previews are on. Shared-memory workers
//! process a frame each time the provider sends a `frame` command;
//! synthetic workers pace themselves.

use crate::args::Importer;
use crate::error::{Error, Result};
use crate::message::Eye;
use crate::shm::SharedFrame;
use crate::worker_message::{encode_line, pack_mask, WorkerCommand, WorkerMessage, WorkerSignal};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Mean brightness change, in grey levels, that counts as a blink.
pub const BLINK_DELTA: f64 = 10.0;
/// Frames averaged when no calibration file is available.
pub const CALIBRATION_SAMPLES: usize = 100;

const DEFAULT_FPS: u32 = 30;
const COMMAND_POLL: Duration = Duration::from_millis(100);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Mean frame brightness with the eye open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlinkCalibration {
    pub samples: Vec<f64>,
}

impl BlinkCalibration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(ron::de::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= CALIBRATION_SAMPLES
    }

    /// Average of the non-zero samples.
    pub fn reference(&self) -> Option<f64> {
        let samples: Vec<f64> = self.samples.iter().copied().filter(|&s| s != 0.0).collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        }
    }
}

/// Settings the host can change at runtime through `config` commands.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub threshold: u8,
    pub min_area: u32,
    pub auto_search: bool,
    pub preview: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            threshold: 60,
            min_area: 40,
            auto_search: false,
            preview: false,
        }
    }
}

impl TrackerSettings {
    pub fn apply(&mut self, param: &str, value: &Value) -> Result<()> {
        let invalid = || Error::InvalidConfigValue {
            path: param.to_string(),
            reason: format!("unexpected value {value}"),
        };
        match param {
            "threshold" => {
                self.threshold = value
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(invalid)?
            }
            "min_area" => {
                self.min_area = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(invalid)?
            }
            "auto_search" => self.auto_search = value.as_bool().ok_or_else(invalid)?,
            "preview" => self.preview = value.as_bool().ok_or_else(invalid)?,
            _ => return Err(Error::UnknownConfigPath(param.to_string())),
        }
        Ok(())
    }
}

/// Per-frame tracking result, the `data` of an `eye_data` line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PupilSample {
    /// Pupil centre in pixels, absent when blinking or too small.
    pub pupil: Option<[f64; 2]>,
    pub area: u32,
    pub blink: bool,
    pub brightness: f64,
    pub threshold: u8,
}

/// Thresholds frames into pupil masks.
pub struct FrameTracker {
    width: u32,
    height: u32,
    pub settings: TrackerSettings,
    calibration: BlinkCalibration,
    armed: bool,
}

impl FrameTracker {
    pub fn new(width: u32, height: u32, calibration: BlinkCalibration) -> Self {
        Self {
            width,
            height,
            settings: TrackerSettings::default(),
            calibration,
            armed: true,
        }
    }

    pub fn calibration(&self) -> &BlinkCalibration {
        &self.calibration
    }

    pub fn apply(&mut self, param: &str, value: &Value) -> Result<()> {
        self.settings.apply(param, value)?;
        if param == "auto_search" {
            self.armed = true;
        }
        Ok(())
    }

    /// Picks a threshold just above the darkest usable pixels.
    fn search_threshold(&mut self, frame: &[u8]) {
        let mut usable: Vec<u8> = frame.iter().copied().filter(|&p| p > 30 && p < 220).collect();
        if usable.is_empty() {
            return;
        }
        usable.sort_unstable();
        let min = usable[0] as f64;
        let median = usable[usable.len() / 2] as f64;
        self.settings.threshold = (min + median * 0.1).clamp(0.0, 255.0) as u8;
        debug!("FrameTracker : threshold set to {}.", self.settings.threshold);
    }

    /// Tracks one frame. Returns the sample and the mask (1 = pupil).
    pub fn track(&mut self, frame: &[u8]) -> Result<(PupilSample, Vec<u8>)> {
        let pixels = self.width as usize * self.height as usize;
        if frame.len() < pixels || pixels == 0 {
            return Err(Error::UnsupportedImage(format!(
                "frame of {} bytes for {}x{}",
                frame.len(),
                self.width,
                self.height
            )));
        }
        let frame = &frame[..pixels];
        let brightness = frame.iter().map(|&p| p as f64).sum::<f64>() / pixels as f64;

        if !self.calibration.is_complete() {
            self.calibration.samples.push(brightness);
            if self.calibration.is_complete() {
                info!("FrameTracker : blink detection calibrated.");
            }
        }
        let blink = self
            .calibration
            .reference()
            .is_some_and(|reference| (brightness - reference).abs() > BLINK_DELTA);

        if blink {
            let sample = PupilSample {
                pupil: None,
                area: 0,
                blink,
                brightness,
                threshold: self.settings.threshold,
            };
            return Ok((sample, vec![0; pixels]));
        }

        if self.settings.auto_search && self.armed {
            self.search_threshold(frame);
            self.armed = false;
        }

        let threshold = self.settings.threshold;
        let mask: Vec<u8> = frame.iter().map(|&p| u8::from(p < threshold)).collect();
        let (mut area, mut sum_x, mut sum_y) = (0u32, 0f64, 0f64);
        for (i, _) in mask.iter().enumerate().filter(|&(_, &m)| m != 0) {
            area += 1;
            sum_x += (i % self.width as usize) as f64;
            sum_y += (i / self.width as usize) as f64;
        }
        let pupil = (area > 0 && area >= self.settings.min_area).then(|| [sum_x / area as f64, sum_y / area as f64]);

        let sample = PupilSample {
            pupil,
            area,
            blink,
            brightness,
            threshold,
        };
        Ok((sample, mask))
    }
}

/// Where a worker's frames come from.
pub trait FrameSource: Send {
    fn frame(&mut self) -> Result<Vec<u8>>;
}

/// Reads frames out of the provider's shared region, mapping it on first use.
pub struct SharedMemorySource {
    name: String,
    len: usize,
    region: Option<SharedFrame>,
}

impl SharedMemorySource {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
            region: None,
        }
    }
}

impl FrameSource for SharedMemorySource {
    fn frame(&mut self) -> Result<Vec<u8>> {
        if self.region.is_none() {
            self.region = Some(SharedFrame::open(&self.name, self.len)?);
            info!("SharedMemorySource : mapped {}.", self.name);
        }
        Ok(self.region.as_ref().map(SharedFrame::copy_frame).unwrap_or_default())
    }
}

/// A dark disc drifting on a noisy background, with a bright frame every
/// `BLINK_PERIOD` frames to exercise blink detection.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u64,
    rng: StdRng,
}

impl SyntheticSource {
    const BLINK_PERIOD: u64 = 150;

    pub fn new(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width,
            height,
            tick: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn frame(&mut self) -> Result<Vec<u8>> {
        self.tick += 1;
        let (w, h) = (self.width as f64, self.height as f64);
        let blinking = self.tick % Self::BLINK_PERIOD == 0;

        let angle = self.tick as f64 * 2.0 * PI / 90.0;
        let drift = w.min(h) / 8.0;
        let (cx, cy) = (w / 2.0 + angle.cos() * drift, h / 2.0 + angle.sin() * drift);
        let radius = w.min(h) / 6.0;

        let mut frame = Vec::with_capacity(self.width as usize * self.height as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let base: i16 = if blinking {
                    220
                } else if (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) <= radius * radius {
                    20
                } else {
                    150
                };
                let noise = self.rng.gen_range(-8i16..=8);
                frame.push((base + noise).clamp(0, 255) as u8);
            }
        }
        Ok(frame)
    }
}

/// Whether the worker should keep going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Everything the worker needs to know about its frames.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub eye: Eye,
    pub importer: Importer,
    pub sharedmem: String,
    pub width: u32,
    pub height: u32,
    pub fps: Option<u32>,
}

/// One eye's tracking loop, writing protocol lines to `out`.
pub struct EyeWorker<W: Write> {
    eye: Eye,
    tracker: FrameTracker,
    source: Box<dyn FrameSource>,
    self_paced: bool,
    period: Duration,
    out: W,
    frame_id: u64,
    frames: u64,
    last_health: Instant,
}

impl<W: Write> EyeWorker<W> {
    pub fn new(options: &WorkerOptions, calibration: BlinkCalibration, out: W) -> Self {
        let self_paced = options.importer == Importer::Synthetic;
        let source: Box<dyn FrameSource> = match options.importer {
            Importer::Synthetic => Box::new(SyntheticSource::new(
                options.width,
                options.height,
                options.eye.id() as u64,
            )),
            Importer::SharedMemory => Box::new(SharedMemorySource::new(
                options.sharedmem.clone(),
                options.width as usize * options.height as usize,
            )),
        };
        let fps = options.fps.unwrap_or(DEFAULT_FPS).max(1);
        Self {
            eye: options.eye,
            tracker: FrameTracker::new(options.width, options.height, calibration),
            source,
            self_paced,
            period: Duration::from_secs_f64(1.0 / fps as f64),
            out,
            frame_id: 0,
            frames: 0,
            last_health: Instant::now(),
        }
    }

    pub fn tracker(&self) -> &FrameTracker {
        &self.tracker
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn emit(&mut self, message: &WorkerMessage) -> Result<()> {
        self.out.write_all(encode_line(message)?.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn signal(&mut self, signal: WorkerSignal) -> Result<()> {
        self.emit(&WorkerMessage::Signal { signal })
    }

    pub fn handle(&mut self, command: WorkerCommand) -> Result<Flow> {
        match command {
            WorkerCommand::Config { param, value } => {
                match self.tracker.apply(&param, &value) {
                    Ok(()) => info!("{} worker : {param} set to {value}.", self.eye),
                    Err(e) => warn!("{} worker : ignoring config : {e}.", self.eye),
                }
                Ok(Flow::Continue)
            }
            WorkerCommand::Frame { frame_id } => {
                self.process(frame_id)?;
                Ok(Flow::Continue)
            }
            WorkerCommand::Close => Ok(Flow::Close),
        }
    }

    /// Tracks the current frame as `frame_id` and reports it. A frame that
    /// cannot be read is skipped, but `ready` is always raised.
    pub fn process(&mut self, frame_id: u64) -> Result<()> {
        match self.source.frame().and_then(|frame| self.tracker.track(&frame)) {
            Ok((sample, mask)) => {
                self.frames += 1;
                self.emit(&WorkerMessage::EyeData {
                    frame_id: Some(frame_id),
                    data: Some(serde_json::to_value(&sample)?),
                })?;
                if self.tracker.settings.preview {
                    let (width, height) = (self.tracker.width, self.tracker.height);
                    self.emit(&WorkerMessage::ImagePreview {
                        frame_id: Some(frame_id),
                        width: Some(width),
                        height: Some(height),
                        bitmap: Some(pack_mask(&mask)),
                    })?;
                }
            }
            Err(e) => warn!("{} worker : skipping frame {frame_id} : {e}.", self.eye),
        }
        self.signal(WorkerSignal::Ready)?;

        if self.last_health.elapsed() >= HEALTH_INTERVAL {
            let elapsed = self.last_health.elapsed().as_secs_f64();
            let payload = json!({
                "frames": self.frames,
                "fps": self.frames as f64 / elapsed,
                "threshold": self.tracker.settings.threshold,
            });
            self.emit(&WorkerMessage::Health { payload })?;
            self.frames = 0;
            self.last_health = Instant::now();
        }
        Ok(())
    }

    /// Runs until `close`, a closed command stream or `stop`.
    pub fn run(&mut self, commands: &Receiver<WorkerCommand>, stop: &AtomicBool) -> Result<()> {
        self.signal(WorkerSignal::Running)?;
        info!("{} worker : running.", self.eye);
        let mut next_frame = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            let command = if self.self_paced {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv_timeout(COMMAND_POLL) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };
            if let Some(command) = command {
                if self.handle(command)? == Flow::Close {
                    break;
                }
            }

            if self.self_paced {
                let now = Instant::now();
                if now >= next_frame {
                    self.frame_id += 1;
                    self.process(self.frame_id)?;
                    next_frame += self.period;
                    if next_frame < now {
                        next_frame = now + self.period;
                    }
                } else {
                    spin_sleep::sleep((next_frame - now).min(COMMAND_POLL));
                }
            }
        }

        info!("{} worker : closing.", self.eye);
        self.signal(WorkerSignal::ShmClosed)
    }
}

/// Reads command lines from `input` on a named thread. The channel closes
/// when the input does.
pub fn spawn_command_reader(input: impl BufRead + Send + 'static) -> Result<Receiver<WorkerCommand>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("eye-worker-stdin".to_string())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let command = serde_json::from_str::<WorkerCommand>(line.trim());
                match command {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("eye-worker stdin : dropping malformed line : {e}."),
                }
            }
            debug!("eye-worker stdin : terminated.");
        })?;
    Ok(rx)
}

/// Loads the calibration, falling back to calibrating from live frames.
pub fn load_calibration(path: impl AsRef<Path>) -> BlinkCalibration {
    let path = path.as_ref();
    match BlinkCalibration::load(path) {
        Ok(calibration) => {
            info!("eye-worker : blink calibration loaded from {}.", path.display());
            calibration
        }
        Err(e) => {
            warn!(
                "eye-worker : no blink calibration at {} ({e}), calibrating from frames.",
                path.display()
            );
            BlinkCalibration::default()
        }
    }
}
