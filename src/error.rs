//! The one error type shared by every VRCore module.

use crate::message::MessageType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the controller core. Loops never
/// propagate these past a single message; they log and carry on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when io fails on pipes, files or child processes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when a JSON value cannot be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Returned when a RON config file cannot be parsed.
    #[error("ron spanning error: {0}")]
    RonSpanned(#[from] ron::error::SpannedError),

    /// Returned when a config cannot be written as RON.
    #[error("ron error: {0}")]
    Ron(#[from] ron::Error),

    /// Returned when the image codec rejects a frame.
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// The pixel buffer does not describe a supported 8-bit image.
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    /// A single encoded image is over the per-image packet limit.
    #[error("encoded image size {size} exceeds limit {limit}")]
    ImageTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },

    /// The codec produced no bytes.
    #[error("encoded image is empty")]
    EmptyImage,

    /// An image packet cannot carry more than 255 images.
    #[error("image count must fit in one byte, got {0}")]
    TooManyImages(usize),

    /// An image packet ended before its declared contents.
    #[error("truncated image packet")]
    TruncatedPacket,

    /// The named shared memory region does not exist (yet).
    #[error("shared memory region {0} not found")]
    SharedMemoryMissing(String),

    /// The named shared memory region is smaller than the configured frame.
    #[error("shared memory region {name} holds {actual} bytes, expected {expected}")]
    SharedMemorySize {
        /// Region name.
        name: String,
        /// Bytes required by the configured frame shape.
        expected: usize,
        /// Bytes actually mapped.
        actual: usize,
    },

    /// A dotted config path that names no field.
    #[error("unknown config path: {0}")]
    UnknownConfigPath(String),

    /// A config value that cannot be converted to the field's type.
    #[error("invalid value for {path}: {reason}")]
    InvalidConfigValue {
        /// Dotted config path.
        path: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A wire byte outside the message type table.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// The outbound payload variant cannot be sent as this message type.
    #[error("payload does not match message type {0:?}")]
    PayloadMismatch(MessageType),

    /// The network transport refused a send.
    #[error("transport error: {0}")]
    Transport(String),

    /// A service hook failed or panicked.
    #[error("service error: {0}")]
    Service(String),
}
