//! This module packs several compressed images into one binary payload and
//! parses such payloads back. A packet has the following layout, all integers
//! little-endian:
//!
//! ```text
//! [count:1] then, for each image, [eye-id:1][width:2][height:2][size:4][bytes:size]
//! ```
//!
//! Each image is compressed on its own, as JPEG or PNG. Packing is all or
//! nothing: every image is encoded and checked before the first byte of the
//! packet is written, so a failure never yields a partial packet.

use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};

/// Largest encoded size accepted for a single image.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Bytes of per-image header: eye id, width, height, size.
const IMAGE_HEADER_LEN: usize = 1 + 2 + 2 + 4;

/// An uncompressed 8-bit image, stored row-major with interleaved channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// 1 (grey), 3 (colour) or 4 (colour + alpha).
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Image {
    /// Wraps a single channel buffer.
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels: 1,
            data,
        }
    }

    /// Wraps an interleaved buffer with the given channel count.
    pub fn with_channels(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Compression applied to each image of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// JPEG with quality 1-100.
    Jpeg { quality: u8 },
    /// PNG with a zlib-style compression level 0-9.
    Png { compression: u8 },
}

/// Options for [`pack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackOptions {
    pub codec: Codec,
    /// Three channel images are stored blue first and must be swapped.
    pub color_is_bgr: bool,
}

impl PackOptions {
    pub fn jpeg(quality: u8) -> Self {
        Self {
            codec: Codec::Jpeg { quality },
            color_is_bgr: false,
        }
    }

    pub fn png(compression: u8) -> Self {
        Self {
            codec: Codec::Png { compression },
            color_is_bgr: false,
        }
    }
}

/// One image parsed back out of a packet. The bytes stay compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedImage {
    pub eye_id: u8,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

/// Packs `images` into one packet.
pub fn pack(images: &[(u8, Image)], options: &PackOptions) -> Result<Vec<u8>> {
    let count = u8::try_from(images.len()).map_err(|_| Error::TooManyImages(images.len()))?;

    let mut encoded = Vec::with_capacity(images.len());
    for (eye_id, image) in images {
        let width = dimension(image.width, "width")?;
        let height = dimension(image.height, "height")?;
        let bytes = encode(image, options)?;
        check_encoded_size(bytes.len())?;
        encoded.push((*eye_id, width, height, bytes));
    }

    let total: usize = encoded
        .iter()
        .map(|(_, _, _, bytes)| IMAGE_HEADER_LEN + bytes.len())
        .sum();
    let mut packet = Vec::with_capacity(1 + total);
    packet.push(count);
    for (eye_id, width, height, bytes) in encoded {
        packet.push(eye_id);
        packet.extend_from_slice(&width.to_le_bytes());
        packet.extend_from_slice(&height.to_le_bytes());
        // Bounded by MAX_IMAGE_BYTES, so it fits.
        packet.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        packet.extend_from_slice(&bytes);
    }
    Ok(packet)
}

/// Parses a packet produced by [`pack`].
pub fn unpack(packet: &[u8]) -> Result<Vec<PackedImage>> {
    let (&count, mut rest) = packet.split_first().ok_or(Error::TruncatedPacket)?;

    let mut images = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < IMAGE_HEADER_LEN {
            return Err(Error::TruncatedPacket);
        }
        let (header, body) = rest.split_at(IMAGE_HEADER_LEN);
        let eye_id = header[0];
        let width = u16::from_le_bytes([header[1], header[2]]);
        let height = u16::from_le_bytes([header[3], header[4]]);
        let size = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if body.len() < size {
            return Err(Error::TruncatedPacket);
        }
        let (data, tail) = body.split_at(size);
        images.push(PackedImage {
            eye_id,
            width,
            height,
            data: data.to_vec(),
        });
        rest = tail;
    }
    Ok(images)
}

/// Rejects encoded images that are empty or over [`MAX_IMAGE_BYTES`].
pub fn check_encoded_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::EmptyImage);
    }
    if size > MAX_IMAGE_BYTES {
        return Err(Error::ImageTooLarge {
            size,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}

fn dimension(value: u32, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| Error::UnsupportedImage(format!("{what} {value} does not fit in 16 bits")))
}

/// Converts to a grey or RGB buffer the codecs accept, then compresses it.
fn encode(image: &Image, options: &PackOptions) -> Result<Vec<u8>> {
    if image.data.len() != image.expected_len() {
        return Err(Error::UnsupportedImage(format!(
            "{}x{}x{} image has {} bytes",
            image.width,
            image.height,
            image.channels,
            image.data.len()
        )));
    }

    let (pixels, color) = match image.channels {
        1 => (image.data.clone(), ExtendedColorType::L8),
        3 | 4 => (
            to_rgb(&image.data, image.channels as usize, options.color_is_bgr),
            ExtendedColorType::Rgb8,
        ),
        other => {
            return Err(Error::UnsupportedImage(format!("{other} channels")));
        }
    };

    let mut buffer = Vec::new();
    match options.codec {
        Codec::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).write_image(
                &pixels,
                image.width,
                image.height,
                color,
            )?;
        }
        Codec::Png { compression } => {
            PngEncoder::new_with_quality(&mut buffer, png_compression(compression), FilterType::Adaptive)
                .write_image(&pixels, image.width, image.height, color)?;
        }
    }
    Ok(buffer)
}

/// Drops any alpha channel and swaps blue/red when the source is BGR.
fn to_rgb(data: &[u8], channels: usize, bgr: bool) -> Vec<u8> {
    data.chunks_exact(channels)
        .flat_map(|px| {
            if bgr {
                [px[2], px[1], px[0]]
            } else {
                [px[0], px[1], px[2]]
            }
        })
        .collect()
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}
