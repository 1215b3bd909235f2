//! The line protocol spoken between the supervisor and each `eye-worker`
//! process. Every line is one JSON object tagged by `"type"`.
//!
//! Worker to host (stdout):
//!
//! ```text
//! {"type":"eye_data","frame_id":12,"data":{...}}
//! {"type":"image_preview","frame_id":12,"width":96,"height":108,"bitmap":[...]}
//! {"type":"health","payload":{...}}
//! {"type":"signal","signal":"running"}
//! ```
//!
//! Host to worker (stdin):
//!
//! ```text
//! {"type":"config","param":"preview","value":true}
//! {"type":"frame","frame_id":13}
//! {"type":"close"}
//! ```

use crate::error::Result;
use crate::message::Eye;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Per-frame tracking result.
    EyeData {
        #[serde(default)]
        frame_id: Option<u64>,
        #[serde(default)]
        data: Option<Value>,
    },
    /// Thresholded pupil mask, packed one bit per pixel, MSB first.
    ImagePreview {
        #[serde(default)]
        frame_id: Option<u64>,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        bitmap: Option<Vec<u8>>,
    },
    /// Free-form worker status.
    Health {
        #[serde(default)]
        payload: Value,
    },
    /// Lifecycle notification, consumed by the supervisor's pump.
    Signal { signal: WorkerSignal },
    /// Any kind this build does not know.
    #[serde(other)]
    Unknown,
}

/// Lifecycle notifications a worker raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSignal {
    /// Done with the current frame; the provider may write the next one.
    Ready,
    /// The main loop has started.
    Running,
    /// The worker has released its shared frame.
    ShmClosed,
}

/// A command sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Config { param: String, value: Value },
    /// A new frame is in shared memory.
    Frame { frame_id: u64 },
    Close,
}

impl WorkerCommand {
    pub fn config(param: impl Into<String>, value: impl Into<Value>) -> Self {
        WorkerCommand::Config {
            param: param.into(),
            value: value.into(),
        }
    }
}

/// A worker health report, tagged with the eye it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub eye: Eye,
    pub payload: Value,
}

/// Parses one stdout line.
pub fn decode_line(line: &str) -> Result<WorkerMessage> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Serializes one message or command as a line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Packs a mask one bit per pixel, MSB first. Non-zero pixels become 1.
pub fn pack_mask(mask: &[u8]) -> Vec<u8> {
    mask.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .filter(|&(_, &px)| px != 0)
                .fold(0u8, |byte, (i, _)| byte | (0x80 >> i))
        })
        .collect()
}

/// Expands the first `width * height` bits of `bitmap` into one byte per
/// pixel, 1 for set bits and 0 otherwise. Returns `None` when the bitmap is
/// too short.
pub fn unpack_mask(bitmap: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if bitmap.len() * 8 < pixels {
        return None;
    }
    Some(
        (0..pixels)
            .map(|i| (bitmap[i / 8] >> (7 - i % 8)) & 1)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_kind() {
        assert_eq!(
            decode_line(r#"{"type":"eye_data","frame_id":3,"data":{"blink":false}}"#).unwrap(),
            WorkerMessage::EyeData {
                frame_id: Some(3),
                data: Some(json!({"blink": false})),
            }
        );
        assert_eq!(
            decode_line(r#"{"type":"signal","signal":"shm_closed"}"#).unwrap(),
            WorkerMessage::Signal {
                signal: WorkerSignal::ShmClosed
            }
        );
        assert_eq!(
            decode_line(r#"{"type":"health","payload":{"fps":30}}"#).unwrap(),
            WorkerMessage::Health {
                payload: json!({"fps": 30})
            }
        );
        assert_eq!(
            decode_line(r#"{"type":"fancy_new_thing","x":1}"#).unwrap(),
            WorkerMessage::Unknown
        );
    }

    #[test]
    fn missing_fields_decode_as_none() {
        assert_eq!(
            decode_line(r#"{"type":"eye_data","data":{}}"#).unwrap(),
            WorkerMessage::EyeData {
                frame_id: None,
                data: Some(json!({})),
            }
        );
        assert!(matches!(
            decode_line(r#"{"type":"image_preview","frame_id":1}"#).unwrap(),
            WorkerMessage::ImagePreview { bitmap: None, .. }
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"frame_id":1}"#).is_err());
    }

    #[test]
    fn commands_use_the_documented_shape() {
        let line = encode_line(&WorkerCommand::config("preview", true)).unwrap();
        assert_eq!(line, "{\"type\":\"config\",\"param\":\"preview\",\"value\":true}\n");
        assert_eq!(
            encode_line(&WorkerCommand::Close).unwrap(),
            "{\"type\":\"close\"}\n"
        );
        assert_eq!(
            serde_json::from_str::<WorkerCommand>(r#"{"type":"frame","frame_id":13}"#).unwrap(),
            WorkerCommand::Frame { frame_id: 13 }
        );
    }

    #[test]
    fn mask_bits_are_msb_first() {
        let mask = [1, 0, 0, 0, 0, 0, 0, 1, 0, 7];
        let packed = pack_mask(&mask);
        assert_eq!(packed, vec![0b1000_0001, 0b0100_0000]);

        let unpacked = unpack_mask(&packed, 5, 2).unwrap();
        assert_eq!(unpacked, vec![1, 0, 0, 0, 0, 0, 0, 1, 0, 1]);
        assert!(unpack_mask(&packed, 17, 1).is_none());
    }
}
