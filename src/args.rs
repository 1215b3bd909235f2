// Commandline argument parser using clap for eye-worker

use crate::message::Eye;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct WorkerArgs {
    /// Which eye this worker tracks, left or right
    #[arg(value_parser = parse_eye)]
    pub eye: Eye,

    /// Where frames come from
    #[arg(value_enum)]
    pub importer: Importer,

    /// Name of the shared memory region holding this eye's frames
    pub sharedmem: String,

    /// Blink calibration file (RON). Calibrates from live frames if missing
    pub calibration: PathBuf,

    /// Frame height in pixels
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Frame width in pixels
    #[arg(long, default_value_t = 960)]
    pub width: u32,

    /// Generate frames instead of reading shared memory
    #[arg(long)]
    pub test_mode: bool,

    /// Frame rate of self-paced (synthetic) workers
    #[arg(long)]
    pub fps: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Importer {
    /// Frames written by the camera provider into shared memory
    #[value(name = "shared_memory")]
    SharedMemory,

    /// Generated frames, no camera needed
    Synthetic,
}

fn parse_eye(s: &str) -> Result<Eye, String> {
    match s.to_ascii_lowercase().as_str() {
        "left" | "l" => Ok(Eye::Left),
        "right" | "r" => Ok(Eye::Right),
        _ => Err(format!("expected left or right, got '{s}'")),
    }
}
